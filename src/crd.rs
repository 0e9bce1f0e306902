//! Per-kind sync configuration, derived from CRD metadata.
//!
//! A [`SyncedKind`] is parsed from a CRD when its syncer is (re)started and
//! lives exactly as long as that syncer. Re-parsing on every CRD change is
//! what makes annotation edits (direction, subtree, filtering) take effect
//! without restarting the process.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;

use crate::annotations::ROBOT_NAME_LABEL;
use crate::error::SyncError;

/// CRD annotation: sync only objects labelled for this robot.
pub const FILTER_BY_ROBOT_NAME: &str = "cr-syncer.cloudrobotics.com/filter-by-robot-name";
/// CRD annotation: project only this top-level key of `status`.
pub const STATUS_SUBTREE: &str = "cr-syncer.cloudrobotics.com/status-subtree";
/// CRD annotation: which cluster owns object existence and specs.
pub const SPEC_SOURCE: &str = "cr-syncer.cloudrobotics.com/spec-source";

/// Which cluster is the source of truth for object existence and specs.
///
/// The other cluster is always the source of truth for status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecSource {
    /// Specs come from the remote cluster, status from the local one.
    Cloud,
    /// Specs come from the local cluster, status from the remote one.
    Robot,
}

/// Everything the syncer needs to know about one custom resource kind.
#[derive(Clone, Debug)]
pub struct SyncedKind {
    /// Name of the CRD this configuration was parsed from.
    pub crd_name: String,
    /// API group of the managed objects.
    pub group: String,
    /// Storage version of the managed objects.
    pub version: String,
    /// Kind of the managed objects.
    pub kind: String,
    /// Plural resource name of the managed objects.
    pub plural: String,
    /// Whether the kind is namespaced (as opposed to cluster-scoped).
    pub namespaced: bool,
    /// Whether `status` is declared as a subresource.
    pub status_is_subresource: bool,
    /// Drop objects not labelled for this robot.
    pub filter_by_robot_name: bool,
    /// Project only this top-level key of `status`.
    pub status_subtree: Option<String>,
    /// Which cluster owns object existence and specs.
    pub spec_source: SpecSource,
}

impl SyncedKind {
    /// Parse the sync configuration from a CRD.
    ///
    /// Fails on malformed annotations or when the CRD has no served
    /// storage version; the caller skips such CRDs.
    pub fn from_crd(crd: &CustomResourceDefinition) -> Result<Self, SyncError> {
        let crd_name = crd.name_any();
        let annotations = crd.annotations();

        let filter_by_robot_name = match annotations.get(FILTER_BY_ROBOT_NAME) {
            None => false,
            Some(raw) => parse_bool(raw).ok_or_else(|| {
                SyncError::config(
                    &crd_name,
                    format!("annotation {FILTER_BY_ROBOT_NAME} has invalid boolean {raw:?}"),
                )
            })?,
        };
        let status_subtree = annotations
            .get(STATUS_SUBTREE)
            .filter(|s| !s.is_empty())
            .cloned();
        let spec_source = match annotations.get(SPEC_SOURCE).map(String::as_str) {
            None | Some("cloud") => SpecSource::Cloud,
            Some("robot") => SpecSource::Robot,
            Some(other) => {
                return Err(SyncError::config(
                    &crd_name,
                    format!("annotation {SPEC_SOURCE} has unknown value {other:?}"),
                ));
            }
        };

        let version = crd
            .spec
            .versions
            .iter()
            .find(|v| v.storage && v.served)
            .ok_or_else(|| SyncError::config(&crd_name, "no served storage version"))?;
        let status_is_subresource = version
            .subresources
            .as_ref()
            .is_some_and(|s| s.status.is_some());

        Ok(SyncedKind {
            crd_name,
            group: crd.spec.group.clone(),
            version: version.name.clone(),
            kind: crd.spec.names.kind.clone(),
            plural: crd.spec.names.plural.clone(),
            namespaced: crd.spec.scope == "Namespaced",
            status_is_subresource,
            filter_by_robot_name,
            status_subtree,
            spec_source,
        })
    }

    /// The dynamic API resource for the managed objects.
    pub fn api_resource(&self) -> ApiResource {
        let api_version = if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        };
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version,
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }

    /// Whether an object passes the robot-name filter.
    ///
    /// Kinds that do not opt in to filtering accept every object.
    pub fn matches_robot(&self, obj: &DynamicObject, robot_name: &str) -> bool {
        if !self.filter_by_robot_name {
            return true;
        }
        obj.labels().get(ROBOT_NAME_LABEL).map(String::as_str) == Some(robot_name)
    }
}

/// Parse a boolean annotation the way Go's `strconv.ParseBool` does.
fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
        CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
        CustomResourceDefinitionVersion, CustomResourceSubresourceStatus,
        CustomResourceSubresources,
    };
    use kube::api::GroupVersionKind;

    use super::*;

    fn crd(annotations: &[(&str, &str)]) -> CustomResourceDefinition {
        CustomResourceDefinition {
            metadata: kube::api::ObjectMeta {
                name: Some("foos.example.com".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: CustomResourceDefinitionSpec {
                group: "example.com".to_string(),
                names: CustomResourceDefinitionNames {
                    kind: "Foo".to_string(),
                    plural: "foos".to_string(),
                    ..Default::default()
                },
                scope: "Namespaced".to_string(),
                versions: vec![
                    CustomResourceDefinitionVersion {
                        name: "v1alpha1".to_string(),
                        served: true,
                        storage: false,
                        ..Default::default()
                    },
                    CustomResourceDefinitionVersion {
                        name: "v1".to_string(),
                        served: true,
                        storage: true,
                        subresources: Some(CustomResourceSubresources {
                            status: Some(CustomResourceSubresourceStatus(
                                serde_json::Value::Object(Default::default()),
                            )),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_from_crd_defaults() {
        let kind = SyncedKind::from_crd(&crd(&[])).unwrap();
        assert_eq!(kind.crd_name, "foos.example.com");
        assert_eq!(kind.group, "example.com");
        assert_eq!(kind.version, "v1");
        assert_eq!(kind.plural, "foos");
        assert!(kind.namespaced);
        assert!(kind.status_is_subresource);
        assert!(!kind.filter_by_robot_name);
        assert_eq!(kind.status_subtree, None);
        assert_eq!(kind.spec_source, SpecSource::Cloud);
    }

    #[test]
    fn test_from_crd_picks_storage_version() {
        let kind = SyncedKind::from_crd(&crd(&[])).unwrap();
        assert_eq!(kind.version, "v1");
    }

    #[test]
    fn test_from_crd_no_storage_version() {
        let mut crd = crd(&[]);
        for v in &mut crd.spec.versions {
            v.storage = false;
        }
        let err = SyncedKind::from_crd(&crd).unwrap_err();
        assert!(matches!(err, SyncError::Config { .. }));
    }

    #[test]
    fn test_from_crd_parses_annotations() {
        let kind = SyncedKind::from_crd(&crd(&[
            (FILTER_BY_ROBOT_NAME, "true"),
            (STATUS_SUBTREE, "robot"),
            (SPEC_SOURCE, "robot"),
        ]))
        .unwrap();
        assert!(kind.filter_by_robot_name);
        assert_eq!(kind.status_subtree.as_deref(), Some("robot"));
        assert_eq!(kind.spec_source, SpecSource::Robot);
    }

    #[test]
    fn test_from_crd_bool_spellings() {
        for raw in ["1", "t", "T", "true", "TRUE", "True"] {
            let kind = SyncedKind::from_crd(&crd(&[(FILTER_BY_ROBOT_NAME, raw)])).unwrap();
            assert!(kind.filter_by_robot_name, "{raw} should parse as true");
        }
        for raw in ["0", "f", "false", "False"] {
            let kind = SyncedKind::from_crd(&crd(&[(FILTER_BY_ROBOT_NAME, raw)])).unwrap();
            assert!(!kind.filter_by_robot_name, "{raw} should parse as false");
        }
    }

    #[test]
    fn test_from_crd_invalid_bool() {
        let err = SyncedKind::from_crd(&crd(&[(FILTER_BY_ROBOT_NAME, "yes")])).unwrap_err();
        assert!(matches!(err, SyncError::Config { .. }));
    }

    #[test]
    fn test_from_crd_unknown_spec_source() {
        let err = SyncedKind::from_crd(&crd(&[(SPEC_SOURCE, "mars")])).unwrap_err();
        assert!(matches!(err, SyncError::Config { .. }));
        assert!(err.to_string().contains("mars"));
    }

    #[test]
    fn test_from_crd_empty_subtree_is_none() {
        let kind = SyncedKind::from_crd(&crd(&[(STATUS_SUBTREE, "")])).unwrap();
        assert_eq!(kind.status_subtree, None);
    }

    #[test]
    fn test_api_resource() {
        let kind = SyncedKind::from_crd(&crd(&[])).unwrap();
        let ar = kind.api_resource();
        assert_eq!(ar.api_version, "example.com/v1");
        assert_eq!(ar.plural, "foos");
        assert_eq!(ar.kind, "Foo");
    }

    #[test]
    fn test_matches_robot() {
        let mut kind = SyncedKind::from_crd(&crd(&[])).unwrap();
        let gvk = GroupVersionKind::gvk("example.com", "v1", "Foo");
        let mut obj = DynamicObject::new("foo", &ApiResource::from_gvk(&gvk));

        // No filtering: everything matches.
        assert!(kind.matches_robot(&obj, "r1"));

        kind.filter_by_robot_name = true;
        assert!(!kind.matches_robot(&obj, "r1"));

        obj.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(ROBOT_NAME_LABEL.to_string(), "r2".to_string());
        assert!(!kind.matches_robot(&obj, "r1"));
        assert!(kind.matches_robot(&obj, "r2"));
    }
}
