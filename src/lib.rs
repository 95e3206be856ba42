//! # addon-controller
//!
//! Cluster-state reconciliation controller. Watches objects through a
//! [`store::StateStore`], queues their identities in a deduplicating,
//! rate-limited [`queue::WorkQueue`], and drives each one toward its desired
//! state with a registered [`engine::Reconciler`]. Lease-based leader
//! election keeps a single active replica.
//!
//! Postgres (sqlx) backs the production store and leases; structured logs
//! and traces go through `tracing`, metrics through `prometheus-client`.

pub mod config;
pub mod controllers;
pub mod db;
pub mod engine;
pub mod error;
pub mod health;
pub mod leader;
pub mod model;
pub mod queue;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod watch;
