//! Per-kind client facade over a cluster.
//!
//! The sync steps talk to either cluster through [`ClusterClient`], which
//! keeps them free of kube-rs plumbing and testable against mocks and
//! in-memory fakes. Not-found is part of the signature rather than an
//! error, since the sync steps treat it as a regular outcome.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::{Client, ResourceExt};

use crate::crd::SyncedKind;
use crate::error::SyncError;

/// Namespace that namespaced custom resources are synced in.
pub const SYNC_NAMESPACE: &str = "default";

/// Generic create/read/update/delete access to one kind on one cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch an object by name; `None` if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<DynamicObject>, SyncError>;

    /// Create a new object.
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, SyncError>;

    /// Replace an existing object.
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, SyncError>;

    /// Replace the status subresource of an existing object.
    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, SyncError>;

    /// Delete an object by name; `false` if it was already gone.
    async fn delete(&self, name: &str) -> Result<bool, SyncError>;
}

/// [`ClusterClient`] backed by a dynamic kube API.
pub struct KubeCluster {
    api: Api<DynamicObject>,
}

impl KubeCluster {
    /// Build a handle for the given kind on the given cluster.
    ///
    /// Namespaced kinds bind to [`SYNC_NAMESPACE`]; cluster-scoped kinds
    /// use cluster scope.
    pub fn new(client: Client, kind: &SyncedKind) -> Self {
        Self {
            api: make_api(client, kind),
        }
    }
}

/// Build the dynamic API for a kind, honoring its scope.
pub fn make_api(client: Client, kind: &SyncedKind) -> Api<DynamicObject> {
    let resource = kind.api_resource();
    if kind.namespaced {
        Api::namespaced_with(client, SYNC_NAMESPACE, &resource)
    } else {
        Api::all_with(client, &resource)
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, name: &str) -> Result<Option<DynamicObject>, SyncError> {
        match self.api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, SyncError> {
        Ok(self.api.create(&PostParams::default(), obj).await?)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, SyncError> {
        Ok(self
            .api
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, SyncError> {
        let data = serde_json::to_vec(obj)
            .map_err(|e| SyncError::serialization(format!("encoding status update: {e}")))?;
        Ok(self
            .api
            .replace_status(&obj.name_any(), &PostParams::default(), data)
            .await?)
    }

    async fn delete(&self, name: &str) -> Result<bool, SyncError> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
