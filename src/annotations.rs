//! Well-known annotation and label keys, and small metadata helpers.

use std::collections::BTreeMap;

use kube::api::DynamicObject;

/// Set on every downstream object to mark that it is owned by the syncer.
pub const OWNED_BY_UPSTREAM: &str = "cr-syncer.cloudrobotics.com/owned-by-upstream";

/// Set on the upstream object during status propagation, recording which
/// downstream resourceVersion produced the status now visible upstream.
pub const REMOTE_RESOURCE_VERSION: &str = "cr-syncer.cloudrobotics.com/remote-resource-version";

/// Label identifying which robot a CR belongs to.
pub const ROBOT_NAME_LABEL: &str = "cloudrobotics.com/robot-name";

/// Set the annotation `key` to `value`, creating the annotation map if the
/// object has none.
pub fn set_annotation(obj: &mut DynamicObject, key: &str, value: &str) {
    obj.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// Remove the annotation `key`. An annotation map left empty is normalized
/// to an absent map so the serialized object does not grow an empty
/// `annotations: {}` field.
pub fn delete_annotation(obj: &mut DynamicObject, key: &str) {
    if let Some(annotations) = obj.metadata.annotations.as_mut() {
        annotations.remove(key);
        if annotations.is_empty() {
            obj.metadata.annotations = None;
        }
    }
}

/// Read the annotation `key`, if present.
pub fn get_annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use kube::api::{ApiResource, GroupVersionKind};

    use super::*;

    fn test_object() -> DynamicObject {
        let gvk = GroupVersionKind::gvk("example.com", "v1", "Foo");
        DynamicObject::new("foo", &ApiResource::from_gvk(&gvk))
    }

    #[test]
    fn test_set_annotation_creates_map() {
        let mut obj = test_object();
        assert!(obj.metadata.annotations.is_none());

        set_annotation(&mut obj, "a", "1");
        assert_eq!(get_annotation(&obj, "a"), Some("1"));
    }

    #[test]
    fn test_set_annotation_overwrites() {
        let mut obj = test_object();
        set_annotation(&mut obj, "a", "1");
        set_annotation(&mut obj, "a", "2");
        assert_eq!(get_annotation(&obj, "a"), Some("2"));
    }

    #[test]
    fn test_delete_annotation_keeps_others() {
        let mut obj = test_object();
        set_annotation(&mut obj, "a", "1");
        set_annotation(&mut obj, "b", "2");

        delete_annotation(&mut obj, "a");
        assert_eq!(get_annotation(&obj, "a"), None);
        assert_eq!(get_annotation(&obj, "b"), Some("2"));
    }

    #[test]
    fn test_delete_last_annotation_normalizes_to_none() {
        let mut obj = test_object();
        set_annotation(&mut obj, "a", "1");

        delete_annotation(&mut obj, "a");
        assert!(obj.metadata.annotations.is_none());
    }

    #[test]
    fn test_delete_annotation_without_map_is_noop() {
        let mut obj = test_object();
        delete_annotation(&mut obj, "a");
        assert!(obj.metadata.annotations.is_none());
    }
}
