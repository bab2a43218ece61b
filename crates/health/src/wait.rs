use std::future::Future;
use std::time::Duration as StdDuration;

use rudder_core::interruption::InterruptionChecker;
use rudder_core::{Duration, ErrorCode, LsError};
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL: StdDuration = StdDuration::from_secs(5);

pub const REASON_NOT_READY: &str = "ResourcesNotReady";

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub operation: String,
    pub interval: StdDuration,
    pub timeout: StdDuration,
}

impl WaitOptions {
    pub fn new(operation: impl Into<String>, timeout: StdDuration) -> Self {
        Self { operation: operation.into(), interval: DEFAULT_POLL_INTERVAL, timeout }
    }

    pub fn with_interval(mut self, interval: StdDuration) -> Self {
        self.interval = interval;
        self
    }
}

/// Poll until `poll` reports no pending objects.
///
/// `poll` yields the reasons objects are not ready yet (empty means done) or a hard error,
/// which ends the wait at once. The first poll runs immediately. On timeout every pending
/// reason of the last round is reported in one `HealthCheckTimeout` error.
pub async fn wait_for_objects_healthy<F, Fut>(opts: &WaitOptions, interruption: &dyn InterruptionChecker, mut poll: F) -> Result<(), LsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<String>, LsError>>,
{
    let deadline = Instant::now() + opts.timeout;
    let mut attempt = 1u32;
    loop {
        interruption.check().await?;
        metrics::counter!("rudder_health_polls_total", 1u64);
        let pending = poll().await?;
        if pending.is_empty() {
            debug!(op = %opts.operation, attempt, "resources ready");
            return Ok(());
        }
        debug!(op = %opts.operation, attempt, pending = pending.len(), "resources not ready yet");
        if Instant::now() + opts.interval > deadline {
            return Err(LsError::new(
                opts.operation.clone(),
                REASON_NOT_READY,
                format!("resources not ready after {}: {}", Duration(opts.timeout), pending.join("; ")),
            )
            .with_code(ErrorCode::HealthCheckTimeout));
        }
        attempt += 1;
        tokio::time::sleep(opts.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::interruption::NoInterruption;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn opts(timeout_ms: u64) -> WaitOptions {
        WaitOptions::new("Wait", StdDuration::from_millis(timeout_ms)).with_interval(StdDuration::from_millis(5))
    }

    #[tokio::test]
    async fn keeps_polling_until_ready() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res = wait_for_objects_healthy(&opts(1000), &NoInterruption, || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok(if n < 2 { vec!["pod a not ready".to_string()] } else { vec![] })
        })
        .await;
        assert!(res.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeout_aggregates_reasons() {
        let err = wait_for_objects_healthy(&opts(20), &NoInterruption, || async { Ok(vec!["a: slow".to_string(), "b: slow".to_string()]) })
            .await
            .unwrap_err();
        assert!(err.has_code(ErrorCode::HealthCheckTimeout));
        assert!(err.message.contains("a: slow; b: slow"), "{}", err.message);
    }

    #[tokio::test]
    async fn hard_errors_stop_polling() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = wait_for_objects_healthy(&opts(1000), &NoInterruption, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LsError::new("Wait", "GetObject", "forbidden"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.reason, "GetObject");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct Interrupted;

    #[async_trait::async_trait]
    impl InterruptionChecker for Interrupted {
        async fn check(&self) -> Result<(), LsError> { Err(LsError::new("InterruptionCheck", "Interrupted", "abort requested")) }
    }

    #[tokio::test]
    async fn interruption_aborts_wait() {
        let err = wait_for_objects_healthy(&opts(1000), &Interrupted, || async { Ok(vec!["x".to_string()]) }).await.unwrap_err();
        assert_eq!(err.reason, "Interrupted");
    }
}
