//! Pure functions that compute the target object for a sync step.
//!
//! The spec direction copies identity, labels, annotations and `spec` from
//! the upstream object onto the downstream one; the status direction copies
//! `status` (whole or a single subtree) and finalizers back. Output-only
//! metadata (resourceVersion, uid, generation, timestamps, managedFields)
//! is never copied; the receiving API server owns it.

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::warn;

use crate::annotations::{
    delete_annotation, get_annotation, set_annotation, OWNED_BY_UPSTREAM, REMOTE_RESOURCE_VERSION,
};
use crate::error::SyncError;

/// Build a fresh downstream object from an upstream object that has no
/// downstream counterpart yet.
///
/// The initial `status` is seeded from upstream as well; afterwards status
/// only flows the other way.
pub fn new_downstream_object(source: &DynamicObject) -> DynamicObject {
    let mut obj = DynamicObject {
        types: source.types.clone(),
        metadata: kube::api::ObjectMeta {
            name: source.metadata.name.clone(),
            labels: source.metadata.labels.clone(),
            annotations: source.metadata.annotations.clone(),
            ..Default::default()
        },
        data: json!({}),
    };
    set_annotation(&mut obj, OWNED_BY_UPSTREAM, "true");
    obj.data["spec"] = source.data.get("spec").cloned().unwrap_or(Value::Null);
    obj.data["status"] = source.data.get("status").cloned().unwrap_or(Value::Null);
    obj
}

/// Merge the upstream object's identity, labels, annotations and `spec`
/// onto an existing downstream object.
///
/// Everything the downstream server owns, including `status`, is kept.
/// The remote-resource-version annotation is dropped since it is only
/// meaningful on the upstream object.
pub fn merge_downstream_spec(source: &DynamicObject, existing: &DynamicObject) -> DynamicObject {
    let mut obj = existing.clone();
    obj.metadata.annotations = source.metadata.annotations.clone();
    delete_annotation(&mut obj, REMOTE_RESOURCE_VERSION);
    set_annotation(&mut obj, OWNED_BY_UPSTREAM, "true");
    obj.metadata.labels = source.metadata.labels.clone();
    obj.data["spec"] = source.data.get("spec").cloned().unwrap_or(Value::Null);
    obj
}

/// Merge the downstream object's `status` and finalizers onto the upstream
/// object.
///
/// Without a subtree the whole status and the finalizers are copied, so
/// the upstream cluster can block deletion until downstream cleanup
/// completed. With a subtree only `status[subtree]` is projected and
/// finalizers are left alone: subtree resources have controllers in
/// multiple clusters and finalizers cannot be reliably synchronized
/// between them.
pub fn merge_upstream_status(
    existing: &DynamicObject,
    source: &DynamicObject,
    subtree: Option<&str>,
) -> Result<DynamicObject, SyncError> {
    let mut obj = existing.clone();
    match subtree {
        None => {
            obj.data["status"] = source.data.get("status").cloned().unwrap_or(Value::Null);
            obj.metadata.finalizers = source.metadata.finalizers.clone();
        }
        Some(subtree) => {
            let source_status = source.data.get("status").filter(|v| !v.is_null());
            if let Some(source_status) = source_status {
                let source_map = source_status.as_object().ok_or_else(|| {
                    SyncError::malformed(
                        source.name_any(),
                        "expected downstream status to be an object",
                    )
                })?;
                if obj.data.get("status").map_or(true, Value::is_null) {
                    obj.data["status"] = json!({});
                }
                let target_map = obj.data["status"].as_object_mut().ok_or_else(|| {
                    SyncError::malformed(
                        source.name_any(),
                        "expected upstream status to be an object",
                    )
                })?;
                match source_map.get(subtree) {
                    Some(value) if !value.is_null() => {
                        target_map.insert(subtree.to_string(), value.clone());
                    }
                    _ => {
                        target_map.remove(subtree);
                    }
                }
            }
        }
    }
    set_annotation(
        &mut obj,
        REMOTE_RESOURCE_VERSION,
        source.metadata.resource_version.as_deref().unwrap_or(""),
    );
    Ok(obj)
}

/// Detect another writer racing on the same upstream object.
///
/// If the existing object's remote-resource-version annotation matches the
/// source's current resourceVersion, their status payloads must be equal
/// as well; a mismatch means some other instance overwrote the status in
/// between, which is logged as a warning.
pub fn warn_on_conflicting_writer(existing: Option<&DynamicObject>, source: &DynamicObject) {
    let Some(existing) = existing else {
        return;
    };
    let Some(recorded) = get_annotation(existing, REMOTE_RESOURCE_VERSION) else {
        return;
    };
    let source_version = source.metadata.resource_version.as_deref().unwrap_or("");
    let existing_status = existing.data.get("status").cloned().unwrap_or(Value::Null);
    let source_status = source.data.get("status").cloned().unwrap_or(Value::Null);
    if recorded == source_version && existing_status != source_status {
        warn!(
            name = %source.name_any(),
            resource_version = source_version,
            "status mismatch at identical resource versions, another syncer instance may be writing this object"
        );
    }
}
