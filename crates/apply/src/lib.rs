//! Rudder apply: the manifest deployer.
//!
//! Applies raw manifests (CRDs first, then cluster-scoped, then namespaced kinds), records what it
//! manages in `status.providerStatus`, removes resources that dropped out of the list, and waits
//! for readiness. Uninstall tears the recorded resources down group by group.

#![forbid(unsafe_code)]

pub mod applier;
pub mod config;
pub mod deployer;
pub mod diff;

pub use applier::Applier;
pub use config::{Manifest, ManifestConfiguration, ProviderStatus, UpdateStrategy};
pub use deployer::{ManifestDeployer, DEPLOYER_TYPE};
pub use diff::{diff_summary, strip_noisy, DiffSummary};
