//! Rudder core: deploy item model, error taxonomy and the cluster store contract.

#![forbid(unsafe_code)]

pub mod clock;
pub mod duration;
pub mod error;
pub mod events;
pub mod interruption;
pub mod item;
pub mod managed;
pub mod meta;
pub mod selector;
pub mod store;
pub mod timeout;

pub use clock::{Clock, ManualClock, SystemClock};
pub use duration::Duration;
pub use error::{phase_for_last_error, ErrorCode, LsError, StoreError, ValidationError, ValidationErrors};
pub use events::{EventRecorder, EventType};
pub use item::{
    DeployItem, DeployItemSpec, DeployItemStatus, DeployerInformation, Operation, Phase, ResolvedTarget, SyncObject,
    SyncObjectSpec, Target, TargetRef, TargetSpec, TransitionTimes,
};
pub use managed::{DeletionGroupDefinition, ManagedResource, ManagedResourcePolicy, PredefinedGroup};
pub use selector::Operator;
pub use store::{ClusterConnector, ClusterStore, Labels, ObjectRef, StoreObject, TypeRef, WatchEvent};

/// API group/version of every record this controller owns.
pub const API_VERSION: &str = "rudder.dev/v1alpha1";

/// Finalizer protecting a deploy item until its managed resources are gone.
pub const FINALIZER: &str = "rudder.dev/finalizer";

/// Label stamped on every resource applied on behalf of a deploy item.
pub const MANAGED_BY_LABEL: &str = "rudder.dev/managed-by";

pub mod annotations {
    /// Operation requested by an upstream orchestrator.
    pub const OPERATION: &str = "rudder.dev/operation";
    /// Skip uninstalling managed resources on deletion.
    pub const DELETE_WITHOUT_UNINSTALL: &str = "rudder.dev/delete-without-uninstall";
    /// Deployer type mirrored onto metadata for cheap responsibility checks.
    pub const DEPLOYER_TYPE: &str = "rudder.dev/deployer-type";
    /// Target name mirrored onto metadata for cheap responsibility checks.
    pub const TARGET_NAME: &str = "rudder.dev/target-name";
    /// Manifest last applied to a managed resource, as compact JSON.
    pub const LAST_APPLIED: &str = "rudder.dev/last-applied-configuration";
}

pub mod prelude {
    pub use super::{
        ClusterConnector, ClusterStore, DeployItem, ErrorCode, LsError, ObjectRef, Phase, StoreError, StoreObject, TypeRef,
    };
}
