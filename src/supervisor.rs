//! CRD supervision: one syncer per managed custom resource kind.
//!
//! The supervisor watches CRDs on the local cluster and keeps a map of
//! running syncers, owned solely by its serial event consumer. A modified
//! CRD is handled the heavyweight way: the old syncer, including all its
//! informer caches, is thrown away and a fresh one is started from the
//! re-parsed annotations. That trades memory churn for correctness of
//! direction and subtree changes, which is a good trade at CRD-change
//! frequency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::Api;
use kube::{Client, ResourceExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crd::SyncedKind;
use crate::error::SyncError;
use crate::informer::{self, WatchEvent};
use crate::syncer::{ResourceSyncer, SHUTDOWN_GRACE};

/// Capacity of the CRD event channel.
const CRD_EVENT_BUFFER: usize = 16;

/// Extra time on top of the syncer's own drain grace before its task is
/// aborted.
const STOP_SLACK: Duration = Duration::from_secs(2);

/// Watches CRDs and starts/stops one [`ResourceSyncer`] per kind.
pub struct Supervisor {
    local: Client,
    remote: Client,
    robot_name: String,
}

struct RunningSyncer {
    kind: Arc<SyncedKind>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Supervisor {
    pub fn new(local: Client, remote: Client, robot_name: String) -> Self {
        Self {
            local,
            remote,
            robot_name,
        }
    }

    /// Run until the token fires. Returns an error if the CRD watch stops
    /// delivering events, since without it no syncer lifecycle can be
    /// managed.
    pub async fn run(self, token: CancellationToken) -> Result<(), SyncError> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.local.clone());
        let (tx, mut rx) = mpsc::channel(CRD_EVENT_BUFFER);
        // No resync: a periodic replay would pointlessly restart every
        // syncer every few minutes.
        let crd_informer = informer::spawn(
            "customresourcedefinitions".to_string(),
            crds,
            None,
            tx,
            token.child_token(),
        );

        info!("waiting for CRDs from the local cluster");
        let mut syncers: HashMap<String, RunningSyncer> = HashMap::new();
        let result = loop {
            let event = tokio::select! {
                _ = token.cancelled() => break Ok(()),
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break Err(SyncError::internal("CRD watch stopped delivering events")),
                },
            };
            self.handle_crd_event(&mut syncers, event).await;
        };

        info!(count = syncers.len(), "stopping all syncers");
        for (name, syncer) in syncers.drain() {
            stop_syncer(&name, syncer).await;
        }
        let _ = crd_informer.handle.await;
        result
    }

    async fn handle_crd_event(
        &self,
        syncers: &mut HashMap<String, RunningSyncer>,
        event: WatchEvent<CustomResourceDefinition>,
    ) {
        let crd = event.object();
        let name = crd.name_any();

        if let Some(previous) = syncers.remove(&name) {
            if matches!(event, WatchEvent::Added(_)) {
                warn!(crd = %name, "syncer already running for freshly added CRD, replacing it");
            }
            stop_syncer(&name, previous).await;
        }

        match event {
            WatchEvent::Added(crd) | WatchEvent::Modified(crd) => {
                let syncer_token = CancellationToken::new();
                match ResourceSyncer::new(
                    &crd,
                    &self.local,
                    &self.remote,
                    &self.robot_name,
                    syncer_token.clone(),
                ) {
                    Ok(syncer) => {
                        let kind = syncer.descriptor();
                        info!(
                            crd = %name,
                            kind = %kind.plural,
                            source = ?kind.spec_source,
                            "starting syncer"
                        );
                        syncers.insert(
                            name,
                            RunningSyncer {
                                kind,
                                token: syncer_token,
                                handle: tokio::spawn(syncer.run()),
                            },
                        );
                    }
                    Err(e) => {
                        warn!(crd = %name, error = %e, "skipping custom resource");
                    }
                }
            }
            WatchEvent::Deleted(_) => {
                info!(crd = %name, "CRD deleted, its syncer is stopped");
            }
        }
    }
}

/// Signal a syncer to stop and wait for it to drain; abort if it overruns
/// its grace period.
async fn stop_syncer(name: &str, syncer: RunningSyncer) {
    syncer.token.cancel();
    let mut handle = syncer.handle;
    match tokio::time::timeout(SHUTDOWN_GRACE + STOP_SLACK, &mut handle).await {
        Ok(_) => info!(crd = %name, kind = %syncer.kind.plural, "syncer stopped"),
        Err(_) => {
            warn!(crd = %name, "syncer did not stop within its grace period, aborting");
            handle.abort();
        }
    }
}
