//! Rudder engine: deploy item state machine, exclusive-execution locker, extension hooks and the worker runner.

#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod controller;
pub mod deployer;
pub mod hooks;
pub mod lock;
pub mod responsibility;
pub mod runner;

pub use cache::FinishedObjectCache;
pub use config::EngineConfig;
pub use controller::{Controller, ItemKey, ReconcileResult};
pub use deployer::{DeployContext, Deployer, StoreTargetResolver, TargetResolver};
pub use hooks::{aggregate, ExtensionHook, FnHook, HookRegistry, HookResult, HookType, HookTypeError};
pub use lock::Locker;
pub use responsibility::{Requirement, TargetSelector};
pub use runner::Runner;
