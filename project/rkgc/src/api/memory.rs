//! An in-process object store. It keeps only object metadata, versions every
//! write with a store-wide revision, and serves watches from a bounded event
//! history so callers that fall too far behind must relist, like they would
//! against etcd after a compaction.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use common::{
    ApiResource, DeleteOptions, DeleteOutcome, GroupVersionKind, GroupVersionResource,
    MetadataPatch, ObjectMeta, PartialObjectMeta, PreconditionFailed,
};
use futures::{StreamExt, stream};
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use super::{ApiError, ClusterClient, ObjectList, ResourceClient, WatchEvent, WatchStream};

const HISTORY_LIMIT: usize = 1024;
const WATCH_BUFFER: usize = 1024;

struct Collection {
    resource: ApiResource,
    objects: BTreeMap<(String, String), PartialObjectMeta>,
    history: VecDeque<(i64, WatchEvent)>,
    /// Watches starting before this revision cannot be served.
    compacted: i64,
    events: broadcast::Sender<(i64, WatchEvent)>,
}

impl Collection {
    fn new(resource: ApiResource) -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            resource,
            objects: BTreeMap::new(),
            history: VecDeque::new(),
            compacted: 0,
            events,
        }
    }

    fn key(&self, namespace: &str, name: &str) -> (String, String) {
        let namespace = if self.resource.namespaced {
            namespace
        } else {
            ""
        };
        (namespace.to_string(), name.to_string())
    }

    fn record(&mut self, revision: &mut i64, event: WatchEvent) {
        *revision += 1;
        self.history.push_back((*revision, event.clone()));
        while self.history.len() > HISTORY_LIMIT {
            if let Some((rev, _)) = self.history.pop_front() {
                self.compacted = rev;
            }
        }
        // No receivers just means nobody is watching yet.
        let _ = self.events.send((*revision, event));
    }
}

#[derive(Default)]
struct State {
    revision: i64,
    collections: HashMap<GroupVersionResource, Collection>,
}

impl State {
    fn collection(&mut self, gvr: &GroupVersionResource) -> Result<&mut Collection, ApiError> {
        self.collections
            .get_mut(gvr)
            .ok_or_else(|| ApiError::UnknownResource(gvr.clone()))
    }

    fn collection_for_kind(&mut self, gvk: &GroupVersionKind) -> Result<&mut Collection, ApiError> {
        self.collections
            .values_mut()
            .find(|c| c.resource.gvk() == *gvk)
            .ok_or_else(|| ApiError::UnknownKind(gvk.clone()))
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    resources: Arc<Vec<ApiResource>>,
    injected_failures: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new(resources: Vec<ApiResource>) -> Self {
        let mut state = State::default();
        for resource in &resources {
            state
                .collections
                .insert(resource.gvr(), Collection::new(resource.clone()));
        }
        Self {
            state: Arc::new(Mutex::new(state)),
            resources: Arc::new(resources),
            injected_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes the next `count` patch or delete calls fail with a transport
    /// error before touching any object.
    pub fn fail_next_writes(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> Result<(), ApiError> {
        let taken = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(ApiError::transport(anyhow::anyhow!("injected write failure"))),
            Err(_) => Ok(()),
        }
    }

    /// Stores a new object. A nil UID is replaced by a fresh one.
    pub async fn create(&self, mut obj: PartialObjectMeta) -> Result<PartialObjectMeta, ApiError> {
        if obj.metadata.uid.is_nil() {
            obj.metadata.uid = Uuid::new_v4();
        }
        let mut state = self.state.lock().await;
        let State {
            revision,
            collections,
        } = &mut *state;
        let gvk = obj.group_version_kind();
        let collection = collections
            .values_mut()
            .find(|c| c.resource.gvk() == gvk)
            .ok_or(ApiError::UnknownKind(gvk))?;
        let key = collection.key(&obj.metadata.namespace, &obj.metadata.name);
        if collection.objects.contains_key(&key) {
            return Err(ApiError::conflict(
                &collection.resource,
                &key.0,
                &key.1,
                "already exists",
            ));
        }
        collection.objects.insert(key, obj.clone());
        collection.record(revision, WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    /// Replaces the metadata of an existing object, keyed by namespace/name.
    pub async fn update(&self, obj: PartialObjectMeta) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        let State {
            revision,
            collections,
        } = &mut *state;
        let gvk = obj.group_version_kind();
        let collection = collections
            .values_mut()
            .find(|c| c.resource.gvk() == gvk)
            .ok_or(ApiError::UnknownKind(gvk))?;
        let key = collection.key(&obj.metadata.namespace, &obj.metadata.name);
        if !collection.objects.contains_key(&key) {
            return Err(ApiError::not_found(&collection.resource, &key.0, &key.1));
        }
        collection.objects.insert(key, obj.clone());
        collection.record(revision, WatchEvent::Modified(obj));
        Ok(())
    }

    pub async fn get_object(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Option<PartialObjectMeta> {
        let gvk = GroupVersionKind::from_api_version(api_version, kind);
        let mut state = self.state.lock().await;
        let collection = state.collection_for_kind(&gvk).ok()?;
        let key = collection.key(namespace, name);
        collection.objects.get(&key).cloned()
    }

    /// Deletes an object the way an API server would handle a client request.
    pub async fn delete_object(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), ApiError> {
        let gvk = GroupVersionKind::from_api_version(api_version, kind);
        let gvr = {
            let mut state = self.state.lock().await;
            state.collection_for_kind(&gvk)?.resource.gvr()
        };
        let now = chrono::Utc::now();
        self.mutate(&gvr, namespace, name, |meta| meta.apply_delete(options, now))
            .await
    }

    /// Drops all retained watch history, so only watches from the current
    /// revision onwards can be served.
    pub async fn compact(&self) {
        let mut state = self.state.lock().await;
        let revision = state.revision;
        for collection in state.collections.values_mut() {
            collection.history.clear();
            collection.compacted = revision;
        }
    }

    async fn mutate<F>(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
        apply: F,
    ) -> Result<(), ApiError>
    where
        F: FnOnce(&mut ObjectMeta) -> Result<DeleteOutcome, PreconditionFailed>,
    {
        let mut state = self.state.lock().await;
        let State {
            revision,
            collections,
        } = &mut *state;
        let collection = collections
            .get_mut(gvr)
            .ok_or_else(|| ApiError::UnknownResource(gvr.clone()))?;
        let key = collection.key(namespace, name);
        let Some(current) = collection.objects.get(&key) else {
            return Err(ApiError::not_found(&collection.resource, &key.0, &key.1));
        };

        let mut updated = current.clone();
        let outcome = apply(&mut updated.metadata)
            .map_err(|e| ApiError::precondition(&collection.resource, &key.0, &key.1, e))?;
        match outcome {
            DeleteOutcome::Remove => {
                collection.objects.remove(&key);
                collection.record(revision, WatchEvent::Deleted(updated));
            }
            DeleteOutcome::Update => {
                collection.objects.insert(key, updated.clone());
                collection.record(revision, WatchEvent::Modified(updated));
            }
            DeleteOutcome::Unchanged => {}
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for MemoryStore {
    async fn discover(&self) -> Result<Vec<ApiResource>, ApiError> {
        Ok(self.resources.as_ref().clone())
    }

    fn resource_client(&self, resource: &ApiResource) -> Arc<dyn ResourceClient> {
        Arc::new(MemoryResourceClient {
            store: self.clone(),
            resource: resource.clone(),
        })
    }
}

struct MemoryResourceClient {
    store: MemoryStore,
    resource: ApiResource,
}

#[async_trait]
impl ResourceClient for MemoryResourceClient {
    async fn list(&self) -> Result<ObjectList, ApiError> {
        let mut state = self.store.state.lock().await;
        let revision = state.revision;
        let collection = state.collection(&self.resource.gvr())?;
        Ok(ObjectList {
            items: collection.objects.values().cloned().collect(),
            revision,
        })
    }

    async fn watch(&self, revision: i64) -> Result<WatchStream, ApiError> {
        let mut state = self.store.state.lock().await;
        let collection = state.collection(&self.resource.gvr())?;
        if revision < collection.compacted {
            return Err(ApiError::Gone(revision));
        }
        let replay: Vec<_> = collection
            .history
            .iter()
            .filter(|(rev, _)| *rev > revision)
            .map(|(_, event)| Ok(event.clone()))
            .collect();
        // Subscribing under the lock means live events start right after the replay.
        let rx = collection.events.subscribe();
        drop(state);

        let live = stream::unfold(rx, move |mut rx| async move {
            match rx.recv().await {
                Ok((_, event)) => Some((Ok(event), rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => Some((Err(ApiError::Gone(revision)), rx)),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(stream::iter(replay).chain(live).boxed())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<PartialObjectMeta, ApiError> {
        let mut state = self.store.state.lock().await;
        let collection = state.collection(&self.resource.gvr())?;
        let key = collection.key(namespace, name);
        collection
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::not_found(&self.resource, namespace, name))
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &MetadataPatch,
    ) -> Result<(), ApiError> {
        self.store.take_injected_failure()?;
        self.store
            .mutate(&self.resource.gvr(), namespace, name, |meta| patch.apply(meta))
            .await
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), ApiError> {
        self.store.take_injected_failure()?;
        let now = chrono::Utc::now();
        self.store
            .mutate(&self.resource.gvr(), namespace, name, |meta| {
                meta.apply_delete(options, now)
            })
            .await
    }
}
