//! List/watch informer with client-go event semantics.
//!
//! kube's watcher delivers a flat stream of apply/delete events plus
//! relist markers, and has no periodic resync. This module layers a local
//! name-keyed cache on top to recover the semantics the sync loops need:
//!
//! - the initial list is delivered as Added events,
//! - later events are classified as Added or Modified against the cache,
//! - objects that vanished while the watch was down are synthesized as
//!   Deleted events when the relist completes,
//! - an optional resync interval replays every cached object as Modified,
//!   which is what corrects silent drift between the clusters.
//!
//! Events are delivered over a bounded channel; a slow consumer blocks the
//! informer rather than dropping events.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::time::Duration;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A classified watch event, in the style of the Kubernetes watch API.
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    /// The object the event is about.
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

/// Handle to a running informer task.
pub struct Informer {
    /// The informer task itself.
    pub handle: JoinHandle<()>,
}

/// Start an informer for `api`, delivering classified events to `tx` until
/// the token is cancelled or the receiver is dropped.
///
/// `resync` replays the cache periodically; pass `None` to disable.
pub fn spawn<K>(
    label: String,
    api: Api<K>,
    resync: Option<Duration>,
    tx: mpsc::Sender<WatchEvent<K>>,
    token: CancellationToken,
) -> Informer
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    Informer {
        handle: tokio::spawn(run(label, api, resync, tx, token)),
    }
}

async fn run<K>(
    label: String,
    api: Api<K>,
    resync: Option<Duration>,
    tx: mpsc::Sender<WatchEvent<K>>,
    token: CancellationToken,
) where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let stream = watcher(api, watcher::Config::default().any_semantic()).default_backoff();
    tokio::pin!(stream);

    let mut cache = Cache::new();
    let mut synced = false;
    let mut resync_tick = resync.map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(informer = %label, "informer stopped");
                return;
            }
            Some(_) = tick(&mut resync_tick) => {
                debug!(informer = %label, objects = cache.len(), "resyncing cached objects");
                for event in cache.resync() {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    let list_complete = matches!(event, watcher::Event::InitDone);
                    for out in cache.observe(event) {
                        if tx.send(out).await.is_err() {
                            return;
                        }
                    }
                    if list_complete && !synced {
                        synced = true;
                        debug!(informer = %label, objects = cache.len(), "initial list complete");
                    }
                }
                Some(Err(e)) => {
                    warn!(informer = %label, error = %e, "watch error, backing off");
                }
                None => {
                    warn!(informer = %label, "watch stream ended");
                    return;
                }
            }
        }
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) -> Option<tokio::time::Instant> {
    match interval {
        Some(interval) => Some(interval.tick().await),
        None => None,
    }
}

/// Name-keyed object cache that classifies raw watcher events.
struct Cache<K> {
    objects: HashMap<String, K>,
    /// Names seen during an in-progress relist, used to synthesize Deleted
    /// events for objects that vanished while the watch was down.
    relist: Option<HashSet<String>>,
}

impl<K: kube::Resource + Clone> Cache<K> {
    fn new() -> Self {
        Self {
            objects: HashMap::new(),
            relist: None,
        }
    }

    fn len(&self) -> usize {
        self.objects.len()
    }

    fn observe(&mut self, event: watcher::Event<K>) -> Vec<WatchEvent<K>> {
        match event {
            watcher::Event::Init => {
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                let name = obj.name_any();
                if let Some(relist) = self.relist.as_mut() {
                    relist.insert(name.clone());
                }
                let known = self.objects.insert(name, obj.clone()).is_some();
                if known {
                    vec![WatchEvent::Modified(obj)]
                } else {
                    vec![WatchEvent::Added(obj)]
                }
            }
            watcher::Event::InitDone => {
                let Some(relist) = self.relist.take() else {
                    return Vec::new();
                };
                let vanished: Vec<String> = self
                    .objects
                    .keys()
                    .filter(|name| !relist.contains(*name))
                    .cloned()
                    .collect();
                vanished
                    .into_iter()
                    .filter_map(|name| self.objects.remove(&name))
                    .map(WatchEvent::Deleted)
                    .collect()
            }
            watcher::Event::Delete(obj) => {
                self.objects.remove(&obj.name_any());
                vec![WatchEvent::Deleted(obj)]
            }
        }
    }

    fn resync(&self) -> Vec<WatchEvent<K>> {
        self.objects
            .values()
            .cloned()
            .map(WatchEvent::Modified)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use kube::api::{ApiResource, DynamicObject, GroupVersionKind};

    use super::*;

    fn object(name: &str, rv: &str) -> DynamicObject {
        let gvk = GroupVersionKind::gvk("example.com", "v1", "Foo");
        let mut obj = DynamicObject::new(name, &ApiResource::from_gvk(&gvk));
        obj.metadata.resource_version = Some(rv.to_string());
        obj
    }

    fn names(events: &[WatchEvent<DynamicObject>]) -> Vec<(&'static str, String)> {
        events
            .iter()
            .map(|e| match e {
                WatchEvent::Added(o) => ("added", o.name_any()),
                WatchEvent::Modified(o) => ("modified", o.name_any()),
                WatchEvent::Deleted(o) => ("deleted", o.name_any()),
            })
            .collect()
    }

    #[test]
    fn test_initial_list_is_added() {
        let mut cache = Cache::new();
        assert!(cache.observe(watcher::Event::Init).is_empty());

        let events = cache.observe(watcher::Event::InitApply(object("a", "1")));
        assert_eq!(names(&events), vec![("added", "a".to_string())]);

        let events = cache.observe(watcher::Event::InitDone);
        assert!(events.is_empty());
    }

    #[test]
    fn test_apply_classified_against_cache() {
        let mut cache = Cache::new();
        cache.observe(watcher::Event::Init);
        cache.observe(watcher::Event::InitApply(object("a", "1")));
        cache.observe(watcher::Event::InitDone);

        let events = cache.observe(watcher::Event::Apply(object("a", "2")));
        assert_eq!(names(&events), vec![("modified", "a".to_string())]);

        let events = cache.observe(watcher::Event::Apply(object("b", "1")));
        assert_eq!(names(&events), vec![("added", "b".to_string())]);
    }

    #[test]
    fn test_delete_removes_from_cache() {
        let mut cache = Cache::new();
        cache.observe(watcher::Event::Apply(object("a", "1")));

        let events = cache.observe(watcher::Event::Delete(object("a", "1")));
        assert_eq!(names(&events), vec![("deleted", "a".to_string())]);

        // Coming back later is an add again.
        let events = cache.observe(watcher::Event::Apply(object("a", "2")));
        assert_eq!(names(&events), vec![("added", "a".to_string())]);
    }

    #[test]
    fn test_relist_synthesizes_deletes_for_vanished_objects() {
        let mut cache = Cache::new();
        cache.observe(watcher::Event::Init);
        cache.observe(watcher::Event::InitApply(object("a", "1")));
        cache.observe(watcher::Event::InitApply(object("b", "1")));
        cache.observe(watcher::Event::InitDone);

        // The watch drops; on reconnect only "b" still exists.
        cache.observe(watcher::Event::Init);
        let events = cache.observe(watcher::Event::InitApply(object("b", "2")));
        assert_eq!(names(&events), vec![("modified", "b".to_string())]);

        let events = cache.observe(watcher::Event::InitDone);
        assert_eq!(names(&events), vec![("deleted", "a".to_string())]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_resync_replays_cache_as_modified() {
        let mut cache = Cache::new();
        cache.observe(watcher::Event::Apply(object("a", "1")));
        cache.observe(watcher::Event::Apply(object("b", "1")));

        let mut events = names(&cache.resync());
        events.sort();
        assert_eq!(
            events,
            vec![
                ("modified", "a".to_string()),
                ("modified", "b".to_string())
            ]
        );
    }

    #[test]
    fn test_resync_of_empty_cache_is_empty() {
        let cache: Cache<DynamicObject> = Cache::new();
        assert!(cache.resync().is_empty());
    }
}
