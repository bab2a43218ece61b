//! Cooperative progressing-timeout checks at named checkpoints.
//!
//! The budget spans the whole operation: it is measured from the time the item entered
//! its current processing phase (`transitionTimes.initTime`), not from the previous check.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::clock::{Clock, SystemClock};
use crate::error::{ErrorCode, LsError};
use crate::item::DeployItem;

pub const CHECKPOINT_PROCESS_MANIFESTS: &str = "deployer: process manifests";
pub const CHECKPOINT_APPLY_MANIFESTS: &str = "deployer: apply manifests";
pub const CHECKPOINT_CLEANUP_ORPHANED: &str = "deployer: cleanup orphaned";
pub const CHECKPOINT_BEFORE_READINESS_CHECK: &str = "deployer: before readiness check";
pub const CHECKPOINT_DELETE_RESOURCES: &str = "deployer: delete resources";

pub const DEFAULT_TIMEOUT: StdDuration = StdDuration::from_secs(10 * 60);

pub const REASON_PROGRESSING_TIMEOUT: &str = "ProgressingTimeout";

pub trait TimeoutChecker: Send + Sync {
    /// Remaining budget, or a `Timeout` error naming the checkpoint that overran.
    fn timeout_exceeded(&self, item: &DeployItem, checkpoint: &str) -> Result<StdDuration, LsError>;
}

pub fn timeout_error(item: &DeployItem, checkpoint: &str, budget: StdDuration) -> LsError {
    LsError::new(
        "TimeoutExceeded",
        REASON_PROGRESSING_TIMEOUT,
        format!("deploy item {} exceeded its timeout of {} at checkpoint {:?}", item.key(), crate::Duration(budget), checkpoint),
    )
    .with_code(ErrorCode::Timeout)
}

pub struct StandardTimeoutChecker {
    default_timeout: StdDuration,
    clock: Arc<dyn Clock>,
}

impl StandardTimeoutChecker {
    pub fn new(default_timeout: StdDuration, clock: Arc<dyn Clock>) -> Self { Self { default_timeout, clock } }

    pub fn budget(&self, item: &DeployItem) -> StdDuration {
        item.spec.timeout.map(|d| d.as_std()).unwrap_or(self.default_timeout)
    }
}

impl Default for StandardTimeoutChecker {
    fn default() -> Self { Self::new(DEFAULT_TIMEOUT, Arc::new(SystemClock)) }
}

impl TimeoutChecker for StandardTimeoutChecker {
    fn timeout_exceeded(&self, item: &DeployItem, checkpoint: &str) -> Result<StdDuration, LsError> {
        let budget = self.budget(item);
        let Some(init) = item.init_time() else {
            return Err(LsError::internal(
                "TimeoutExceeded",
                "MissingInitTime",
                format!("deploy item {} has no init transition time (checkpoint {:?})", item.key(), checkpoint),
            ));
        };
        let elapsed = (self.clock.now() - init).to_std().unwrap_or_default();
        if elapsed >= budget {
            tracing::info!(item = %item.key(), checkpoint, budget_s = budget.as_secs(), "timeout exceeded");
            return Err(timeout_error(item, checkpoint, budget));
        }
        Ok(budget - elapsed)
    }
}

/// Never times out.
#[derive(Debug, Clone)]
pub struct IgnoreTimeoutChecker {
    pub remaining: StdDuration,
}

impl Default for IgnoreTimeoutChecker {
    fn default() -> Self { Self { remaining: DEFAULT_TIMEOUT } }
}

impl TimeoutChecker for IgnoreTimeoutChecker {
    fn timeout_exceeded(&self, _item: &DeployItem, _checkpoint: &str) -> Result<StdDuration, LsError> { Ok(self.remaining) }
}

/// Times out exactly at one named checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointTimeoutChecker {
    pub checkpoint: String,
    pub remaining: StdDuration,
}

impl CheckpointTimeoutChecker {
    pub fn new(checkpoint: impl Into<String>) -> Self { Self { checkpoint: checkpoint.into(), remaining: DEFAULT_TIMEOUT } }
}

impl TimeoutChecker for CheckpointTimeoutChecker {
    fn timeout_exceeded(&self, item: &DeployItem, checkpoint: &str) -> Result<StdDuration, LsError> {
        if checkpoint == self.checkpoint { Err(timeout_error(item, checkpoint, StdDuration::ZERO)) } else { Ok(self.remaining) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::item::TransitionTimes;
    use chrono::Utc;

    fn item_started(at: chrono::DateTime<Utc>) -> DeployItem {
        let mut di = DeployItem::new("ns", "a", "manifest");
        di.status.transition_times = Some(TransitionTimes { init_time: Some(at), ..Default::default() });
        di
    }

    #[test]
    fn budget_spans_from_init_time() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let checker = StandardTimeoutChecker::new(StdDuration::from_secs(60), clock.clone());
        let di = item_started(start);

        clock.advance(StdDuration::from_secs(20));
        assert_eq!(checker.timeout_exceeded(&di, CHECKPOINT_APPLY_MANIFESTS).unwrap(), StdDuration::from_secs(40));

        clock.advance(StdDuration::from_secs(40));
        let err = checker.timeout_exceeded(&di, CHECKPOINT_BEFORE_READINESS_CHECK).unwrap_err();
        assert!(err.has_code(ErrorCode::Timeout));
        assert!(err.message.contains(CHECKPOINT_BEFORE_READINESS_CHECK));
    }

    #[test]
    fn item_timeout_overrides_default() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let checker = StandardTimeoutChecker::new(StdDuration::from_secs(60), clock.clone());
        let mut di = item_started(start);
        di.spec.timeout = Some(crate::Duration::from_secs(3600));
        clock.advance(StdDuration::from_secs(120));
        assert!(checker.timeout_exceeded(&di, CHECKPOINT_APPLY_MANIFESTS).is_ok());
    }

    #[test]
    fn missing_init_time_is_an_error() {
        let checker = StandardTimeoutChecker::default();
        let di = DeployItem::new("ns", "a", "manifest");
        let err = checker.timeout_exceeded(&di, CHECKPOINT_APPLY_MANIFESTS).unwrap_err();
        assert!(err.has_code(ErrorCode::InternalProblem));
    }

    #[test]
    fn test_strategies() {
        let di = DeployItem::new("ns", "a", "manifest");
        assert!(IgnoreTimeoutChecker::default().timeout_exceeded(&di, "anything").is_ok());
        let cp = CheckpointTimeoutChecker::new(CHECKPOINT_DELETE_RESOURCES);
        assert!(cp.timeout_exceeded(&di, CHECKPOINT_APPLY_MANIFESTS).is_ok());
        assert!(cp.timeout_exceeded(&di, CHECKPOINT_DELETE_RESOURCES).is_err());
    }
}
