//! Taints GPU nodes so only workloads that tolerate the taint land there.
//!
//! A taint counts as present only when key, value and effect all match.
//! Other taints with the same key are left untouched.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::engine::{ReconcileContext, Reconciler};
use crate::error::{Error, Result};
use crate::model::{ObjectSnapshot, ReconcileResult, Taint};

pub const NODE_KIND: &str = "Node";

pub struct NodeReconciler {
    gpu_label_key: String,
    gpu_label_value: String,
    taint: Taint,
}

impl NodeReconciler {
    pub fn new(
        gpu_label_key: impl Into<String>,
        gpu_label_value: impl Into<String>,
        taint: Taint,
    ) -> Self {
        Self {
            gpu_label_key: gpu_label_key.into(),
            gpu_label_value: gpu_label_value.into(),
            taint,
        }
    }

    fn is_gpu_node(&self, snapshot: &ObjectSnapshot) -> bool {
        snapshot.label_value(&self.gpu_label_key) == Some(self.gpu_label_value.as_str())
    }

    /// The snapshot with the GPU taint appended, or `None` when no change is
    /// needed.
    pub fn desired(&self, snapshot: &ObjectSnapshot) -> Result<Option<ObjectSnapshot>> {
        if !self.is_gpu_node(snapshot) {
            return Ok(None);
        }
        let taints = node_taints(snapshot)?;
        if taints.contains(&self.taint) {
            return Ok(None);
        }

        let mut desired = snapshot.clone();
        let wanted = serde_json::to_value(&self.taint)?;
        match &mut desired.spec {
            Value::Object(spec) => match spec.get_mut("taints") {
                Some(Value::Array(list)) => list.push(wanted),
                _ => {
                    spec.insert("taints".to_string(), Value::Array(vec![wanted]));
                }
            },
            spec => *spec = serde_json::json!({ "taints": [wanted] }),
        }
        Ok(Some(desired))
    }

    async fn apply(&self, snapshot: ObjectSnapshot, ctx: &ReconcileContext) -> Result<ReconcileResult> {
        let Some(desired) = self.desired(&snapshot)? else {
            return Ok(ReconcileResult::Done);
        };
        let version = ctx.update(&desired).await?;
        info!(object = %desired.id, taint = %self.taint, version, "gpu taint applied");
        Ok(ReconcileResult::Done)
    }
}

/// Parse `spec.taints`. A missing spec or list means no taints.
fn node_taints(snapshot: &ObjectSnapshot) -> Result<Vec<Taint>> {
    let taints = match &snapshot.spec {
        Value::Null => return Ok(Vec::new()),
        Value::Object(spec) => match spec.get("taints") {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(taints) => taints,
        },
        _ => {
            return Err(Error::Permanent(format!(
                "{}: spec is not an object",
                snapshot.id
            )));
        }
    };
    serde_json::from_value(taints.clone())
        .map_err(|e| Error::Permanent(format!("{}: malformed spec.taints: {e}", snapshot.id)))
}

#[async_trait]
impl Reconciler for NodeReconciler {
    fn kind(&self) -> &str {
        NODE_KIND
    }

    async fn reconcile(&self, snapshot: ObjectSnapshot, ctx: &ReconcileContext) -> ReconcileResult {
        self.apply(snapshot, ctx).await.into()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::{ObjectIdentity, TaintEffect};

    fn reconciler() -> NodeReconciler {
        NodeReconciler::new(
            "gpu",
            "true",
            Taint::new("nvidia.com/gpu", "true", TaintEffect::NoSchedule),
        )
    }

    fn node(name: &str) -> ObjectSnapshot {
        ObjectSnapshot::new(ObjectIdentity::cluster(NODE_KIND, name))
    }

    #[test]
    fn gpu_node_without_taint_gets_one() {
        let desired = reconciler()
            .desired(&node("gpu-1").label("gpu", "true"))
            .unwrap()
            .unwrap();
        assert_eq!(
            desired.spec,
            json!({"taints": [{"key": "nvidia.com/gpu", "value": "true", "effect": "NoSchedule"}]})
        );
    }

    #[test]
    fn existing_taints_and_spec_fields_are_preserved() {
        let n = node("gpu-1").label("gpu", "true").spec(json!({
            "unschedulable": false,
            "taints": [{"key": "dedicated", "value": "infra", "effect": "NoExecute"}]
        }));
        let desired = reconciler().desired(&n).unwrap().unwrap();
        assert_eq!(desired.spec["unschedulable"], json!(false));
        assert_eq!(desired.spec["taints"].as_array().unwrap().len(), 2);
        assert_eq!(desired.spec["taints"][0]["key"], json!("dedicated"));
    }

    #[test]
    fn non_gpu_node_is_left_alone() {
        assert!(reconciler().desired(&node("cpu-1")).unwrap().is_none());
        let wrong_value = node("cpu-2").label("gpu", "false");
        assert!(reconciler().desired(&wrong_value).unwrap().is_none());
    }

    #[test]
    fn reconciling_twice_changes_nothing_the_second_time() {
        let r = reconciler();
        let first = r.desired(&node("gpu-1").label("gpu", "true")).unwrap().unwrap();
        assert!(r.desired(&first).unwrap().is_none());
    }

    #[test]
    fn same_key_with_other_effect_still_gets_exact_taint() {
        let n = node("gpu-1").label("gpu", "true").spec(json!({
            "taints": [{"key": "nvidia.com/gpu", "value": "true", "effect": "PreferNoSchedule"}]
        }));
        let desired = reconciler().desired(&n).unwrap().unwrap();
        let taints = desired.spec["taints"].as_array().unwrap();
        assert_eq!(taints.len(), 2);
        assert_eq!(taints[0]["effect"], json!("PreferNoSchedule"));
        assert_eq!(taints[1]["effect"], json!("NoSchedule"));
    }

    #[test]
    fn malformed_taints_are_permanent_errors() {
        let n = node("gpu-1")
            .label("gpu", "true")
            .spec(json!({"taints": "nvidia.com/gpu"}));
        let err = reconciler().desired(&n).unwrap_err();
        assert!(err.is_permanent());

        let n = node("gpu-2").label("gpu", "true").spec(json!([1, 2]));
        assert!(reconciler().desired(&n).unwrap_err().is_permanent());
    }
}
