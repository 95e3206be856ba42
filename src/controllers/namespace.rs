//! Ensures every namespace carries the platform owner label.

use async_trait::async_trait;
use tracing::info;

use crate::engine::{ReconcileContext, Reconciler};
use crate::error::Result;
use crate::model::{ObjectSnapshot, ReconcileResult};

pub const NAMESPACE_KIND: &str = "Namespace";

pub struct NamespaceReconciler {
    owner_key: String,
    owner_value: String,
}

impl NamespaceReconciler {
    pub fn new(owner_key: impl Into<String>, owner_value: impl Into<String>) -> Self {
        Self {
            owner_key: owner_key.into(),
            owner_value: owner_value.into(),
        }
    }

    /// The snapshot with the owner label applied, or `None` if it already
    /// has it.
    pub fn desired(&self, snapshot: &ObjectSnapshot) -> Option<ObjectSnapshot> {
        if snapshot.label_value(&self.owner_key) == Some(self.owner_value.as_str()) {
            return None;
        }
        let mut desired = snapshot.clone();
        desired
            .labels
            .insert(self.owner_key.clone(), self.owner_value.clone());
        Some(desired)
    }

    async fn apply(&self, snapshot: ObjectSnapshot, ctx: &ReconcileContext) -> Result<ReconcileResult> {
        let Some(desired) = self.desired(&snapshot) else {
            return Ok(ReconcileResult::Done);
        };
        let version = ctx.update(&desired).await?;
        info!(
            object = %desired.id,
            label = %self.owner_key,
            value = %self.owner_value,
            version,
            "owner label set"
        );
        Ok(ReconcileResult::Done)
    }
}

#[async_trait]
impl Reconciler for NamespaceReconciler {
    fn kind(&self) -> &str {
        NAMESPACE_KIND
    }

    async fn reconcile(&self, snapshot: ObjectSnapshot, ctx: &ReconcileContext) -> ReconcileResult {
        self.apply(snapshot, ctx).await.into()
    }
}
