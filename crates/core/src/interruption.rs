use std::sync::Arc;

use crate::error::LsError;
use crate::item::{DeployItem, Operation};
use crate::store::{get_typed, ClusterStore};

pub const REASON_INTERRUPTED: &str = "Interrupted";

/// Polled by long waits (readiness, teardown) to abort early when the item changed under them.
#[async_trait::async_trait]
pub trait InterruptionChecker: Send + Sync {
    async fn check(&self) -> Result<(), LsError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoInterruption;

#[async_trait::async_trait]
impl InterruptionChecker for NoInterruption {
    async fn check(&self) -> Result<(), LsError> { Ok(()) }
}

/// Re-reads the deploy item being processed.
///
/// Interrupted when the item is gone or recreated, when another job was started, when it was
/// moved to a final phase out of band, or when an abort was requested.
pub struct StoreInterruptionChecker {
    store: Arc<dyn ClusterStore>,
    namespace: String,
    name: String,
    uid: String,
    job_id: String,
}

impl StoreInterruptionChecker {
    pub fn new(store: Arc<dyn ClusterStore>, item: &DeployItem) -> Self {
        Self {
            store,
            namespace: item.namespace().to_string(),
            name: item.name().to_string(),
            uid: item.uid().to_string(),
            job_id: item.status.job_id.clone(),
        }
    }

    fn interrupted(&self, why: &str) -> LsError {
        LsError::new("InterruptionCheck", REASON_INTERRUPTED, format!("deploy item {}/{} interrupted: {}", self.namespace, self.name, why))
    }
}

#[async_trait::async_trait]
impl InterruptionChecker for StoreInterruptionChecker {
    async fn check(&self) -> Result<(), LsError> {
        let current: DeployItem = match get_typed(self.store.as_ref(), &self.namespace, &self.name).await {
            Ok(di) => di,
            Err(e) if e.is_not_found() => return Err(self.interrupted("item no longer exists")),
            Err(e) => {
                // A failed read is not an interruption; the next poll re-checks.
                tracing::debug!(item = %format!("{}/{}", self.namespace, self.name), error = %e, "interruption check read failed");
                return Ok(());
            }
        };
        if current.uid() != self.uid { return Err(self.interrupted("item was recreated")); }
        if current.status.job_id != self.job_id { return Err(self.interrupted("a new job was started")); }
        if current.status.phase.is_some_and(|p| p.is_final()) { return Err(self.interrupted("item reached a final phase")); }
        if current.operation() == Some(Operation::Abort) { return Err(self.interrupted("abort requested")); }
        Ok(())
    }
}
