//! Reconcile engine: reconciler routing, the worker pool, and the manager
//! that ties watches, workers and leader election together.

pub mod control;
pub mod manager;
pub mod registry;

pub use control::{EngineConfig, ReconcileEngine};
pub use manager::{Manager, ManagerBuilder, ManagerConfig};
pub use registry::{ReconcileContext, Reconciler, ReconcilerRegistry};
