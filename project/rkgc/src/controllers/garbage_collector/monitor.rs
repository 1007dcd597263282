use std::{collections::HashMap, sync::Arc, time::Duration};

use common::{ApiResource, GroupVersionKind, PartialObjectMeta};
use futures::StreamExt;
use tokio::sync::{mpsc::UnboundedSender, watch};
use uuid::Uuid;

use super::graph_builder::GraphEvent;
use crate::{
    api::{ApiError, ResourceClient, WatchEvent},
    controllers::wait_for_stop,
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_millis(30_000);

enum WatchExit {
    Stopped,
    Closed,
}

/// Feeds one resource type into the graph: lists it, then follows its watch
/// stream, relisting whenever the stream breaks.
pub struct Monitor {
    resource: ApiResource,
    kind: GroupVersionKind,
    client: Arc<dyn ResourceClient>,
    graph_changes: UnboundedSender<GraphEvent>,
    resync_period: Duration,
    synced_tx: watch::Sender<bool>,
}

impl Monitor {
    pub fn new(
        resource: ApiResource,
        kind: GroupVersionKind,
        client: Arc<dyn ResourceClient>,
        graph_changes: UnboundedSender<GraphEvent>,
        resync_period: Duration,
    ) -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self {
            resource,
            kind,
            client,
            graph_changes,
            resync_period,
            synced_tx,
        }
    }

    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    /// True once the first listing has been turned into graph events.
    pub fn has_synced(&self) -> bool {
        *self.synced_tx.borrow()
    }

    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced_tx.subscribe()
    }

    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let gvr = self.resource.gvr();
        log::info!("[Monitor] Starting monitor for {gvr}");

        // uid -> last seen object
        let mut known: HashMap<Uuid, PartialObjectMeta> = HashMap::new();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match self.list_and_watch(&mut known, &mut stop, &mut backoff).await {
                Ok(WatchExit::Stopped) => break,
                Ok(WatchExit::Closed) => {
                    log::info!("[Monitor] Watch for {gvr} closed, will relist");
                }
                Err(e) => {
                    log::warn!("[Monitor] List/watch for {gvr} failed: {e}, retrying in {backoff:?}");
                }
            }
            tokio::select! {
                _ = wait_for_stop(&mut stop) => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        log::info!("[Monitor] Stopped monitor for {gvr}");
    }

    async fn list_and_watch(
        &self,
        known: &mut HashMap<Uuid, PartialObjectMeta>,
        stop: &mut watch::Receiver<bool>,
        backoff: &mut Duration,
    ) -> Result<WatchExit, ApiError> {
        let list = self.client.list().await?;
        self.replace(known, list.items);
        self.synced_tx.send_replace(true);

        let mut stream = self.client.watch(list.revision).await?;
        *backoff = INITIAL_BACKOFF;

        let mut resync = (!self.resync_period.is_zero())
            .then(|| tokio::time::interval_at(
                tokio::time::Instant::now() + self.resync_period,
                self.resync_period,
            ));

        loop {
            tokio::select! {
                _ = wait_for_stop(stop) => return Ok(WatchExit::Stopped),
                _ = async {
                    match resync.as_mut() {
                        Some(interval) => { interval.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => self.resync(known),
                event = stream.next() => match event {
                    Some(Ok(event)) => self.apply(known, event),
                    Some(Err(e)) => return Err(e),
                    None => return Ok(WatchExit::Closed),
                },
            }
        }
    }

    fn emit(&self, event: GraphEvent) {
        // The builder only goes away during shutdown.
        let _ = self.graph_changes.send(event);
    }

    fn with_type(&self, mut obj: PartialObjectMeta) -> PartialObjectMeta {
        obj.api_version = self.kind.api_version();
        obj.kind = self.kind.kind.clone();
        obj
    }

    /// Reconciles the local view with a fresh listing. Objects that vanished
    /// while the watch was down are reported as deleted.
    fn replace(&self, known: &mut HashMap<Uuid, PartialObjectMeta>, items: Vec<PartialObjectMeta>) {
        let mut fresh = HashMap::with_capacity(items.len());
        for item in items {
            let item = self.with_type(item);
            match known.remove(&item.uid()) {
                Some(old) if old == item => {}
                Some(old) => self.emit(GraphEvent::new_update(old, item.clone())),
                None => self.emit(GraphEvent::new_add(item.clone())),
            }
            fresh.insert(item.uid(), item);
        }
        for (_, gone) in known.drain() {
            self.emit(GraphEvent::new_delete(gone));
        }
        *known = fresh;
    }

    fn apply(&self, known: &mut HashMap<Uuid, PartialObjectMeta>, event: WatchEvent) {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let obj = self.with_type(obj);
                match known.insert(obj.uid(), obj.clone()) {
                    Some(old) => self.emit(GraphEvent::new_update(old, obj)),
                    None => self.emit(GraphEvent::new_add(obj)),
                }
            }
            WatchEvent::Deleted(obj) => {
                let obj = self.with_type(obj);
                known.remove(&obj.uid());
                self.emit(GraphEvent::new_delete(obj));
            }
        }
    }

    fn resync(&self, known: &HashMap<Uuid, PartialObjectMeta>) {
        log::debug!(
            "[Monitor] Resyncing {} objects of {}",
            known.len(),
            self.resource.gvr()
        );
        for obj in known.values() {
            self.emit(GraphEvent::new_update(obj.clone(), obj.clone()));
        }
    }
}
