//! Built-in reconcilers.

pub mod namespace;
pub mod node;

use std::sync::Arc;

use crate::config::Config;
use crate::engine::Reconciler;

pub use namespace::{NAMESPACE_KIND, NamespaceReconciler};
pub use node::{NODE_KIND, NodeReconciler};

/// The namespace and node reconcilers, configured from `config`.
pub fn from_config(config: &Config) -> Vec<Arc<dyn Reconciler>> {
    vec![
        Arc::new(NamespaceReconciler::new(
            config.owner_label_key.clone(),
            config.owner_label_value.clone(),
        )),
        Arc::new(NodeReconciler::new(
            config.gpu_node_label_key.clone(),
            config.gpu_node_label_value.clone(),
            config.gpu_taint.clone(),
        )),
    ]
}
