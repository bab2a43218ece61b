use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use rudder_apply::{ManifestConfiguration, ManifestDeployer, DEPLOYER_TYPE};
use rudder_engine::{Controller, EngineConfig, Runner, TargetSelector};
use rudder_kubehub::{KubeConnector, KubeEventRecorder, KubeStore};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "rudderd", version, about = "Rudder deploy item controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile deploy items until interrupted
    Run(RunArgs),
    /// Validate a manifest deployer configuration file offline
    CheckConfig {
        /// YAML file holding the `spec.configuration` of a manifest deploy item
        file: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Deploy item type to reconcile
    #[arg(long, env = "RUDDER_DEPLOYER_TYPE", default_value = DEPLOYER_TYPE)]
    deployer_type: String,
    /// Identity of this replica (default: hostname)
    #[arg(long, env = "RUDDER_IDENTITY")]
    identity: Option<String>,
    /// Concurrent reconciles
    #[arg(long, env = "RUDDER_WORKERS")]
    workers: Option<usize>,
    /// Watch a single namespace instead of all
    #[arg(long = "ns", env = "RUDDER_NAMESPACE")]
    namespace: Option<String>,
    /// Run without cluster-wide locks (single replica only)
    #[arg(long = "no-locking", action = ArgAction::SetTrue)]
    no_locking: bool,
    /// YAML list of target selectors; every selector must match
    #[arg(long, env = "RUDDER_TARGET_SELECTORS")]
    target_selectors: Option<PathBuf>,
    /// Readiness and teardown poll interval in seconds
    #[arg(long, env = "RUDDER_POLL_SECS", default_value_t = 5)]
    poll_secs: u64,
}

impl RunArgs {
    /// Interval for readiness polls and teardown rounds; at least one second.
    fn poll_interval(&self) -> Duration { Duration::from_secs(self.poll_secs.max(1)) }
}

fn init_tracing() {
    let env = std::env::var("RUDDER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RUDDER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid RUDDER_METRICS_ADDR; expected host:port");
        }
    }
}

fn engine_config(args: &RunArgs) -> Result<EngineConfig> {
    let mut cfg = EngineConfig::from_env();
    cfg.deployer_type = args.deployer_type.clone();
    if let Some(id) = args.identity.clone() { cfg.identity = id; }
    if let Some(n) = args.workers { cfg.workers = n; }
    if args.namespace.is_some() { cfg.namespace = args.namespace.clone(); }
    if args.no_locking { cfg.locking = false; }
    if let Some(path) = &args.target_selectors {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        cfg.target_selectors = serde_yaml::from_str::<Vec<TargetSelector>>(&raw).with_context(|| format!("parsing {}", path.display()))?;
    }
    cfg.validate().context("invalid engine configuration")?;
    Ok(cfg)
}

async fn run(args: RunArgs) -> Result<()> {
    let config = engine_config(&args)?;
    let home = Arc::new(KubeStore::try_default().await?);
    let events = Arc::new(KubeEventRecorder::new(home.client().clone(), &config.name, Some(config.identity.clone())));
    let deployer = ManifestDeployer::new(Arc::new(KubeConnector::new(home.clone()))).with_poll_interval(args.poll_interval());
    let controller = Arc::new(Controller::new(config, home, Arc::new(deployer)).with_events(events));
    let runner = Runner::new(controller);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "listening for ctrl-c failed");
            }
            info!("shutdown requested");
            cancel.cancel();
        }
    });
    runner.run(cancel).await;
    Ok(())
}

fn check_config(file: &Path, output: Output) -> Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let cfg = ManifestConfiguration::from_yaml(&raw)?;
    let verdict = cfg.validate();
    match output {
        Output::Human => match &verdict {
            Ok(()) => {
                println!("{}: ok", file.display());
                for m in &cfg.manifests {
                    let ns = m.namespace().unwrap_or("-");
                    println!("  {} • {} • {}/{} • {:?}", m.api_version().unwrap_or("?"), m.kind().unwrap_or("?"), ns, m.name().unwrap_or("?"), m.policy);
                }
            }
            Err(errs) => {
                for e in &errs.0 { eprintln!("{}: {}", file.display(), e); }
            }
        },
        Output::Json => {
            let errors: Vec<String> = verdict.as_ref().err().map(|e| e.0.iter().map(ToString::to_string).collect()).unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({"file": file, "manifests": cfg.manifests.len(), "errors": errors}))?);
        }
    }
    if verdict.is_err() { bail!("{} is invalid", file.display()); }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::CheckConfig { file } => check_config(&file, cli.output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["rudderd", "run"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Commands::Run(a) => a,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn flags_override_engine_defaults() {
        let cfg = engine_config(&args(&["--identity", "replica-1", "--workers", "3", "--ns", "team-a", "--no-locking"])).unwrap();
        assert_eq!(cfg.identity, "replica-1");
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.namespace.as_deref(), Some("team-a"));
        assert!(!cfg.locking);
    }

    #[test]
    fn poll_interval_comes_from_the_command_line() {
        assert_eq!(args(&["--poll-secs", "2"]).poll_interval(), Duration::from_secs(2));
        assert_eq!(args(&["--poll-secs", "0"]).poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn check_config_reports_invalid_manifests() {
        let dir = std::env::temp_dir().join(format!("rudderd-check-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let good = dir.join("good.yaml");
        std::fs::write(&good, "manifests:\n- manifest:\n    apiVersion: v1\n    kind: ConfigMap\n    metadata:\n      name: a\n").unwrap();
        let bad = dir.join("bad.yaml");
        std::fs::write(&bad, "manifests:\n- manifest:\n    kind: ConfigMap\n").unwrap();
        assert!(check_config(&good, Output::Json).is_ok());
        assert!(check_config(&bad, Output::Json).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
