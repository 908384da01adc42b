//! RFC 6902 patch generation for admission responses
//!
//! The mutators work on a deserialized copy of the admitted object; the
//! patch returned to the API server is the diff between the raw object the
//! request carried and the mutated copy.

use json_patch::Patch;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Diff the raw admitted object against its mutated form
///
/// Returns `None` when the mutation turned out to be a no-op, so callers
/// can allow the request without a patch.
pub fn diff_patch<T: Serialize>(original: &Value, mutated: &T) -> Result<Option<Patch>> {
    let mutated = serde_json::to_value(mutated)?;
    let patch = json_patch::diff(original, &mutated);
    if patch.0.is_empty() {
        Ok(None)
    } else {
        Ok(Some(patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_objects_yield_no_patch() {
        let value = json!({"metadata": {"name": "demo"}});
        assert!(diff_patch(&value, &value).unwrap().is_none());
    }

    #[test]
    fn patch_applies_back_to_the_original() {
        let original = json!({
            "metadata": {"name": "demo", "annotations": {}},
            "spec": {"replicas": 1}
        });
        let mutated = json!({
            "metadata": {
                "name": "demo-dev",
                "annotations": {"dev.studio.dev/containers": "3,7"}
            },
            "spec": {"replicas": 1}
        });

        let patch = diff_patch(&original, &mutated).unwrap().expect("patch");
        let mut doc = original.clone();
        json_patch::patch(&mut doc, &patch).unwrap();
        assert_eq!(doc, mutated);
    }

    #[test]
    fn added_containers_show_up_as_add_ops() {
        let original = json!({"spec": {"containers": [{"name": "web"}]}});
        let mutated = json!({
            "spec": {"containers": [{"name": "web"}, {"name": "studio-envoy-sidecar"}]}
        });
        let patch = diff_patch(&original, &mutated).unwrap().expect("patch");
        let rendered = serde_json::to_string(&patch).unwrap();
        assert!(rendered.contains("\"op\":\"add\""));
        assert!(rendered.contains("/spec/containers/1"));
    }
}
