use std::time::Duration;

use rudder_core::ValidationErrors;

use crate::responsibility::TargetSelector;

pub const DEFAULT_NAME: &str = "rudder";

/// Knobs of one controller process. Every field has an `RUDDER_*` override, see [`EngineConfig::from_env`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deploy item type this controller is responsible for.
    pub deployer_type: String,
    /// Identity of this replica; written into locks and `status.deployer`.
    pub identity: String,
    pub name: String,
    pub version: String,
    pub workers: usize,
    pub locking: bool,
    /// A lock not refreshed for this long is considered abandoned.
    pub lock_stale_after: Duration,
    pub lock_retry_after: Duration,
    pub default_timeout: Duration,
    /// Safety-net requeue for items that are not final yet.
    pub requeue_after: Duration,
    pub resync_every: Duration,
    /// How long a recoverable error may persist before the item is failed.
    pub escalation_after: Duration,
    pub lock_cleanup_every: Duration,
    /// Watch scope; `None` watches every namespace.
    pub namespace: Option<String>,
    pub target_selectors: Vec<TargetSelector>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deployer_type: String::new(),
            identity: default_identity(),
            name: DEFAULT_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            workers: 5,
            locking: true,
            lock_stale_after: Duration::from_secs(900),
            lock_retry_after: Duration::from_secs(10),
            default_timeout: rudder_core::timeout::DEFAULT_TIMEOUT,
            requeue_after: Duration::from_secs(5),
            resync_every: Duration::from_secs(300),
            escalation_after: Duration::from_secs(300),
            lock_cleanup_every: Duration::from_secs(120),
            namespace: None,
            target_selectors: Vec::new(),
        }
    }
}

fn default_identity() -> String {
    std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()).unwrap_or_else(|| format!("{}-{}", DEFAULT_NAME, uuid::Uuid::new_v4()))
}

fn env_secs(key: &str) -> Option<Duration> { std::env::var(key).ok().and_then(|s| s.parse().ok()).map(Duration::from_secs) }

impl EngineConfig {
    pub fn new(deployer_type: impl Into<String>) -> Self { Self { deployer_type: deployer_type.into(), ..Default::default() } }

    /// Defaults overlaid with whatever `RUDDER_*` variables are set.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(t) = std::env::var("RUDDER_DEPLOYER_TYPE") { cfg.deployer_type = t; }
        if let Some(id) = std::env::var("RUDDER_IDENTITY").ok().filter(|s| !s.is_empty()) { cfg.identity = id; }
        if let Some(n) = std::env::var("RUDDER_WORKERS").ok().and_then(|s| s.parse().ok()) { cfg.workers = n; }
        if let Some(b) = std::env::var("RUDDER_LOCKING").ok().and_then(|s| s.parse().ok()) { cfg.locking = b; }
        if let Some(d) = env_secs("RUDDER_LOCK_STALE_SECS") { cfg.lock_stale_after = d; }
        if let Some(d) = env_secs("RUDDER_LOCK_RETRY_SECS") { cfg.lock_retry_after = d; }
        if let Some(d) = env_secs("RUDDER_DEFAULT_TIMEOUT_SECS") { cfg.default_timeout = d; }
        if let Some(d) = env_secs("RUDDER_REQUEUE_SECS") { cfg.requeue_after = d; }
        if let Some(d) = env_secs("RUDDER_RESYNC_SECS") { cfg.resync_every = d; }
        if let Some(d) = env_secs("RUDDER_ESCALATION_SECS") { cfg.escalation_after = d; }
        if let Some(ns) = std::env::var("RUDDER_NAMESPACE").ok().filter(|s| !s.is_empty()) { cfg.namespace = Some(ns); }
        cfg
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::default();
        if self.deployer_type.is_empty() { errs.push("deployerType", "a deployer type must be provided"); }
        if self.identity.is_empty() { errs.push("identity", "must not be empty"); }
        if self.workers == 0 { errs.push("workers", "at least one worker is required"); }
        if self.requeue_after.is_zero() { errs.push("requeueAfter", "must be positive"); }
        for (i, s) in self.target_selectors.iter().enumerate() {
            if let Err(e) = s.validate(&format!("targetSelectors[{i}]")) { errs.extend(e); }
        }
        errs.into_result()
    }
}
