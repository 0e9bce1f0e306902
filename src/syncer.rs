//! Per-kind synchronization worker.
//!
//! Each syncer owns two informers for a single custom resource kind, one
//! per cluster, and a single worker draining a coalescing queue. Events on
//! the spec-source cluster enqueue a spec step, events on the
//! status-source cluster enqueue a status step. Running one worker per
//! syncer keeps the two directions serialized per object, so a spec write
//! never interleaves with a status write for the same name.
//!
//! The status step works from the observed downstream object rather than
//! re-reading it: when removing the last finalizer completes a pending
//! downstream deletion, the final state is only ever visible in the
//! deletion event, and it is exactly that state whose empty finalizer list
//! must reach the upstream object to let its own deletion complete.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DynamicObject};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{make_api, ClusterClient, KubeCluster};
use crate::crd::{SpecSource, SyncedKind};
use crate::error::SyncError;
use crate::informer::{self, WatchEvent};
use crate::merge;
use crate::queue::WorkQueue;

/// Resync informers every 5 minutes. This causes all current resources to
/// be delivered as updates once more, which re-runs the sync steps and
/// fixes any drift that slipped past the watch.
pub const RESYNC_PERIOD: Duration = Duration::from_secs(300);

/// How long queued work may keep running after a stop signal.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Capacity of the informer event channels. A slow worker applies
/// backpressure to the informers instead of dropping events.
const EVENT_BUFFER: usize = 64;

/// Which half of the bidirectional sync a work item belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncDirection {
    /// Copy existence, metadata and spec to the status-source cluster.
    Spec,
    /// Copy status and finalizers back to the spec-source cluster.
    Status,
}

/// One unit of work: sync one object in one direction. The queue carries
/// the most recently observed object alongside.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub direction: SyncDirection,
    pub name: String,
}

type SyncQueue = WorkQueue<WorkItem, DynamicObject>;

/// Synchronization worker for one custom resource kind.
pub struct ResourceSyncer {
    kind: Arc<SyncedKind>,
    robot_name: String,
    /// Source of truth for existence and spec.
    upstream: Arc<dyn ClusterClient>,
    /// Source of truth for status (and finalizers).
    downstream: Arc<dyn ClusterClient>,
    upstream_api: Api<DynamicObject>,
    downstream_api: Api<DynamicObject>,
    token: CancellationToken,
}

impl ResourceSyncer {
    /// Build a syncer from a CRD, assigning cluster roles from its
    /// spec-source annotation.
    pub fn new(
        crd: &CustomResourceDefinition,
        local: &Client,
        remote: &Client,
        robot_name: &str,
        token: CancellationToken,
    ) -> Result<Self, SyncError> {
        let kind = SyncedKind::from_crd(crd)?;
        let (upstream_client, downstream_client) = match kind.spec_source {
            SpecSource::Cloud => (remote, local),
            SpecSource::Robot => (local, remote),
        };
        let upstream_api = make_api(upstream_client.clone(), &kind);
        let downstream_api = make_api(downstream_client.clone(), &kind);
        Ok(Self {
            upstream: Arc::new(KubeCluster::new(upstream_client.clone(), &kind)),
            downstream: Arc::new(KubeCluster::new(downstream_client.clone(), &kind)),
            kind: Arc::new(kind),
            robot_name: robot_name.to_string(),
            upstream_api,
            downstream_api,
            token,
        })
    }

    /// The parsed sync configuration this syncer runs with.
    pub fn descriptor(&self) -> Arc<SyncedKind> {
        Arc::clone(&self.kind)
    }

    /// Run informers and the worker until the stop token fires, then drain
    /// remaining work within [`SHUTDOWN_GRACE`].
    pub async fn run(self) {
        let Self {
            kind,
            robot_name,
            upstream,
            downstream,
            upstream_api,
            downstream_api,
            token,
        } = self;

        let queue: Arc<SyncQueue> = Arc::new(WorkQueue::new());
        let (upstream_tx, upstream_rx) = mpsc::channel(EVENT_BUFFER);
        let (downstream_tx, downstream_rx) = mpsc::channel(EVENT_BUFFER);

        let upstream_informer = informer::spawn(
            format!("{}-upstream", kind.plural),
            upstream_api,
            Some(RESYNC_PERIOD),
            upstream_tx,
            token.child_token(),
        );
        let downstream_informer = informer::spawn(
            format!("{}-downstream", kind.plural),
            downstream_api,
            Some(RESYNC_PERIOD),
            downstream_tx,
            token.child_token(),
        );

        let route_upstream = tokio::spawn(route_events(
            upstream_rx,
            SyncDirection::Spec,
            Arc::clone(&kind),
            robot_name.clone(),
            Arc::clone(&queue),
        ));
        let route_downstream = tokio::spawn(route_events(
            downstream_rx,
            SyncDirection::Status,
            Arc::clone(&kind),
            robot_name,
            Arc::clone(&queue),
        ));

        info!(kind = %kind.plural, source = ?kind.spec_source, "syncer started");

        loop {
            let (item, observed) = tokio::select! {
                _ = token.cancelled() => break,
                item = queue.next() => item,
            };
            process_item(
                &kind,
                upstream.as_ref(),
                downstream.as_ref(),
                &queue,
                item,
                observed,
            )
            .await;
        }

        // Let already-queued work finish, but only briefly; a stop usually
        // means the CRD changed and a replacement syncer is on its way.
        let drain = async {
            while let Some((item, observed)) = queue.try_next() {
                process_item(
                    &kind,
                    upstream.as_ref(),
                    downstream.as_ref(),
                    &queue,
                    item,
                    observed,
                )
                .await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(kind = %kind.plural, "shutdown grace period elapsed with work left in the queue");
        }

        let _ = upstream_informer.handle.await;
        let _ = downstream_informer.handle.await;
        let _ = route_upstream.await;
        let _ = route_downstream.await;
        info!(kind = %kind.plural, "syncer stopped");
    }
}

/// Turn informer events into queued work items, applying the robot-name
/// filter before anything is enqueued.
async fn route_events(
    mut rx: mpsc::Receiver<WatchEvent<DynamicObject>>,
    direction: SyncDirection,
    kind: Arc<SyncedKind>,
    robot_name: String,
    queue: Arc<SyncQueue>,
) {
    while let Some(event) = rx.recv().await {
        let obj = event.object();
        if !kind.matches_robot(obj, &robot_name) {
            debug!(
                kind = %kind.plural,
                name = %obj.name_any(),
                "ignoring object for another robot"
            );
            continue;
        }
        let name = obj.name_any();
        let (WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj)) = event;
        queue.add(WorkItem { direction, name }, obj);
    }
}

/// Run one work item and decide its fate: success clears the backoff,
/// retryable failures re-enqueue with backoff, anything else is dropped
/// with a warning since retrying cannot fix it.
async fn process_item(
    kind: &SyncedKind,
    upstream: &dyn ClusterClient,
    downstream: &dyn ClusterClient,
    queue: &Arc<SyncQueue>,
    item: WorkItem,
    observed: DynamicObject,
) {
    let result = match item.direction {
        SyncDirection::Spec => sync_spec(upstream, downstream, &item.name).await,
        SyncDirection::Status => sync_status(upstream, kind, &observed).await,
    };
    match result {
        Ok(()) => queue.done(&item),
        Err(e) if e.is_retryable() => {
            let delay = queue.failed(&item);
            warn!(
                kind = %kind.plural,
                name = %item.name,
                direction = ?item.direction,
                error = %e,
                retry_in = ?delay,
                "sync step failed, will retry"
            );
            queue.add_after(item, observed, delay);
        }
        Err(e) => {
            warn!(
                kind = %kind.plural,
                name = %item.name,
                direction = ?item.direction,
                error = %e,
                "skipping object after unrecoverable sync failure"
            );
            queue.done(&item);
        }
    }
}

/// Make the downstream object match the upstream one in metadata and spec,
/// keeping any downstream status. An upstream deletion in progress is
/// propagated with an explicit delete, since the deletion timestamp itself
/// is immutable.
pub async fn sync_spec(
    upstream: &dyn ClusterClient,
    downstream: &dyn ClusterClient,
    name: &str,
) -> Result<(), SyncError> {
    let Some(source) = upstream.get(name).await? else {
        if downstream.delete(name).await? {
            info!(name, "deleted downstream object after upstream deletion");
        }
        return Ok(());
    };

    match downstream.get(name).await? {
        None => {
            merge::warn_on_conflicting_writer(None, &source);
            downstream
                .create(&merge::new_downstream_object(&source))
                .await?;
            debug!(name, "created downstream object");
        }
        Some(existing) => {
            downstream
                .update(&merge::merge_downstream_spec(&source, &existing))
                .await?;
            if source.metadata.deletion_timestamp.is_some()
                && existing.metadata.deletion_timestamp.is_none()
            {
                if downstream.delete(name).await? {
                    debug!(name, "propagated upstream deletion downstream");
                } else {
                    info!(name, "downstream object already deleted");
                }
            }
        }
    }
    Ok(())
}

/// Copy the observed downstream object's status (and, without a subtree,
/// its finalizers) onto the upstream object.
///
/// When status is a subresource the dedicated status endpoint is written
/// first; the full update afterwards is needed in any case to carry the
/// finalizers and the remote-resource-version annotation, which live in
/// the main resource.
pub async fn sync_status(
    upstream: &dyn ClusterClient,
    kind: &SyncedKind,
    source: &DynamicObject,
) -> Result<(), SyncError> {
    let name = source.name_any();
    let Some(existing) = upstream.get(&name).await? else {
        info!(name = %name, "upstream object already deleted");
        return Ok(());
    };

    let mut target =
        merge::merge_upstream_status(&existing, source, kind.status_subtree.as_deref())?;
    if kind.status_is_subresource {
        // The API server rejects a null status payload on the status
        // endpoint.
        if target.data.get("status").map_or(true, Value::is_null) {
            target.data["status"] = json!({});
        }
        let updated = upstream.update_status(&target).await?;
        target.metadata.resource_version = updated.metadata.resource_version;
    }
    upstream.update(&target).await?;
    Ok(())
}
