use std::sync::{Arc, Mutex};

use common::{DeleteOptions, DeletePropagationPolicy, Finalizer, MetadataPatch, PartialObjectMeta};
use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
        watch,
    },
    task::JoinSet,
};
use uuid::Uuid;

use self::{
    classifier::ReferenceClassifier,
    graph::{Node, UidToNodeTable},
    graph_builder::{GraphBuilder, GraphEvent},
    monitor::Monitor,
    types::ObjectReference,
    uid_cache::UidCache,
};
use crate::{
    api::{ApiError, ClusterClient, registry::ResourceRegistry},
    controllers::{
        wait_for_stop,
        workqueue::{ExponentialBackoff, RateLimitingQueue},
    },
    protocol::config::{GarbageCollectorConfig, UnknownOwnerKindPolicy},
};

pub mod classifier;
pub mod graph;
pub mod graph_builder;
pub mod monitor;
pub mod types;
pub mod uid_cache;

/// GarbageCollector implements cascading deletion driven by `OwnerReference`s.
///
/// # Overview
///
/// Every watched object may name the objects that own it in
/// `metadata.ownerReferences`. When all owners of an object are gone, the
/// collector deletes it. When an owner is deleted, the propagation policy
/// chosen by the client decides what happens to its dependents:
///
/// 1. **Background**: the owner disappears at once and its dependents are
///    deleted afterwards, once the collector notices their owner is missing.
/// 2. **Foreground**: the owner gets a deletion timestamp and the
///    `DeletingDependents` finalizer. Dependents are deleted first; the
///    finalizer is removed (and the owner with it) once no dependent with
///    `blockOwnerDeletion: true` is left.
/// 3. **Orphan**: the owner gets the `OrphanDependents` finalizer. The
///    collector strips the owner reference from every dependent, then
///    removes the finalizer.
///
/// # Architecture
///
/// - One [`Monitor`] per resource type lists and watches objects and turns
///   changes into [`GraphEvent`]s.
/// - A single [`GraphBuilder`] applies those events to the dependency graph
///   and schedules nodes that need attention.
/// - Delete workers re-check scheduled nodes against the store, classify
///   their owners and delete or patch them.
/// - Orphan workers strip owner references for owners deleted with the
///   orphan policy.
///
/// Both worker pools pull from [`RateLimitingQueue`]s, so a node is never
/// processed by two workers at once and failures are retried with backoff.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example(store: std::sync::Arc<rkgc::api::memory::MemoryStore>) -> anyhow::Result<()> {
/// use rkgc::controllers::GarbageCollector;
/// use rkgc::protocol::config::GarbageCollectorConfig;
///
/// let gc = GarbageCollector::new(store.as_ref(), GarbageCollectorConfig::default()).await?;
/// let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     let _ = stop_tx.send(true);
/// });
/// gc.run(4, stop_rx).await?;
/// # Ok(())
/// # }
/// ```
pub struct GarbageCollector {
    ctx: GcContext,
    dependency_graph_builder: GraphBuilder,
    graph_changes_rx: Mutex<Option<UnboundedReceiver<GraphEvent>>>,
    monitors: Vec<Arc<Monitor>>,
}

/// Result of one pass over a node, besides plain success.
#[derive(Debug, thiserror::Error)]
pub enum ProcessItemError {
    /// The object is gone; a virtual delete was handed to the graph builder
    /// and the node must not be retried.
    #[error("sent virtual delete event")]
    VirtualDeleteSent,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("failed to orphan dependents of {owner}: {}", .failures.join("; "))]
    Orphan {
        owner: ObjectReference,
        failures: Vec<String>,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GarbageCollector {
    /// Discovers the servable resources, builds one monitor per resource and
    /// wires the graph builder to the work queues. Nothing runs until
    /// [`run`](Self::run).
    pub async fn new(
        cluster: &dyn ClusterClient,
        config: GarbageCollectorConfig,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(ResourceRegistry::discover(cluster).await?);
        let backoff = ExponentialBackoff::new(config.base_retry_delay, config.max_retry_delay);
        let attempt_to_delete = RateLimitingQueue::new("attempt_to_delete", backoff);
        let attempt_to_orphan = RateLimitingQueue::new("attempt_to_orphan", backoff);
        let uid_to_node = Arc::new(UidToNodeTable::default());
        let absent_owner_cache = Arc::new(UidCache::new(config.absent_owner_cache_size));
        let (graph_changes_tx, graph_changes_rx) = unbounded_channel();

        let mut monitors = Vec::new();
        for resource in registry.monitored_resources() {
            let gvr = resource.gvr();
            let kind = registry.kind_for(&gvr)?;
            monitors.push(Arc::new(Monitor::new(
                resource.clone(),
                kind,
                registry.client(&gvr)?,
                graph_changes_tx.clone(),
                config.resync_period,
            )));
        }
        log::info!(
            "[GarbageCollector] Monitoring {} resources: {}",
            monitors.len(),
            monitors
                .iter()
                .map(|m| m.resource().gvr().to_string())
                .collect::<Vec<_>>()
                .join("; ")
        );

        let classifier = Arc::new(ReferenceClassifier::new(
            registry.clone(),
            absent_owner_cache.clone(),
            config.unknown_owner_kind_policy,
        ));
        let dependency_graph_builder = GraphBuilder::new(
            uid_to_node.clone(),
            absent_owner_cache,
            attempt_to_delete.clone(),
            attempt_to_orphan.clone(),
        );

        Ok(Self {
            ctx: GcContext {
                registry,
                classifier,
                uid_to_node,
                attempt_to_delete,
                attempt_to_orphan,
                graph_changes: graph_changes_tx,
                unknown_kind_policy: config.unknown_owner_kind_policy,
            },
            dependency_graph_builder,
            graph_changes_rx: Mutex::new(Some(graph_changes_rx)),
            monitors,
        })
    }

    /// Runs until `stop` is raised: starts the monitors, waits for their
    /// first listing, then processes the graph with `workers` delete workers
    /// and as many orphan workers. Returns after every worker has finished
    /// its current item.
    pub async fn run(&self, workers: usize, mut stop: watch::Receiver<bool>) -> anyhow::Result<()> {
        let events = self
            .graph_changes_rx
            .lock()
            .map_err(|_| anyhow::anyhow!("[GarbageCollector] Graph change receiver is poisoned"))?
            .take()
            .ok_or_else(|| anyhow::anyhow!("[GarbageCollector] Already running"))?;

        log::info!("[GarbageCollector] Starting garbage collector");
        let mut background = JoinSet::new();
        for monitor in &self.monitors {
            background.spawn(monitor.clone().run(stop.clone()));
        }

        if self.wait_for_cache_sync(&mut stop).await {
            log::info!("[GarbageCollector] All resource monitors have synced, proceeding to collect garbage");
            background.spawn(
                self.dependency_graph_builder
                    .clone()
                    .run(events, stop.clone()),
            );

            let mut pool = JoinSet::new();
            for i in 0..workers {
                pool.spawn(self.ctx.clone().run_attempt_to_delete_worker(i));
                pool.spawn(self.ctx.clone().run_attempt_to_orphan_worker(i));
            }

            wait_for_stop(&mut stop).await;
            log::info!("[GarbageCollector] Shutting down garbage collector");
            self.ctx.attempt_to_delete.shut_down();
            self.ctx.attempt_to_orphan.shut_down();
            while let Some(res) = pool.join_next().await {
                if let Err(e) = res {
                    log::error!("[GarbageCollector] Worker terminated abnormally: {e}");
                }
            }
        } else {
            self.ctx.attempt_to_delete.shut_down();
            self.ctx.attempt_to_orphan.shut_down();
        }

        while let Some(res) = background.join_next().await {
            if let Err(e) = res {
                log::error!("[GarbageCollector] Background task terminated abnormally: {e}");
            }
        }
        log::info!("[GarbageCollector] Garbage collector stopped");
        Ok(())
    }

    /// Returns false if the stop signal fired first.
    async fn wait_for_cache_sync(&self, stop: &mut watch::Receiver<bool>) -> bool {
        for monitor in &self.monitors {
            let mut synced = monitor.subscribe_synced();
            let ready = async { synced.wait_for(|s| *s).await.is_ok() };
            tokio::select! {
                ok = ready => if !ok { return false },
                _ = wait_for_stop(stop) => return false,
            }
        }
        true
    }

    pub fn graph(&self) -> Arc<UidToNodeTable> {
        self.ctx.uid_to_node.clone()
    }

    /// Whether any of the UIDs is present in the dependency graph.
    pub async fn graph_has_uid(&self, uids: &[Uuid]) -> bool {
        for uid in uids {
            if self.ctx.uid_to_node.contains_key(uid).await {
                return true;
            }
        }
        false
    }
}

/// State shared by the worker tasks.
#[derive(Clone)]
struct GcContext {
    registry: Arc<ResourceRegistry>,
    classifier: Arc<ReferenceClassifier>,
    uid_to_node: Arc<UidToNodeTable>,
    attempt_to_delete: RateLimitingQueue<Arc<Node>>,
    attempt_to_orphan: RateLimitingQueue<Arc<Node>>,
    graph_changes: UnboundedSender<GraphEvent>,
    unknown_kind_policy: UnknownOwnerKindPolicy,
}

impl GcContext {
    async fn run_attempt_to_delete_worker(self, id: usize) {
        let queue = self.attempt_to_delete.name().to_string();
        log::debug!("[GarbageCollector] Starting {queue} worker [#{id}]");
        while let Some(node) = self.attempt_to_delete.get().await {
            self.attempt_to_delete_worker_item(&node).await;
            self.attempt_to_delete.done(&node);
        }
        log::debug!("[GarbageCollector] {queue} worker [#{id}] exited");
    }

    async fn attempt_to_delete_worker_item(&self, node: &Arc<Node>) {
        if !node.is_observed() {
            match self.uid_to_node.get(&node.uid()).await {
                Some(current) if Arc::ptr_eq(&current, node) => {}
                // Removed from the graph, or superseded by a node with
                // another identity; that one is scheduled on its own.
                _ => {
                    self.attempt_to_delete.forget(node);
                    return;
                }
            }
        }

        match self.attempt_to_delete_item(node).await {
            Ok(()) => {
                if node.is_observed() {
                    self.attempt_to_delete.forget(node);
                } else {
                    // Keep checking until a watch event confirms the object.
                    self.attempt_to_delete.add_rate_limited(node.clone());
                }
            }
            Err(ProcessItemError::VirtualDeleteSent) => self.attempt_to_delete.forget(node),
            Err(e) => {
                log::error!(
                    "[GarbageCollector] Error syncing item {}: {e}",
                    node.identity()
                );
                self.attempt_to_delete.add_rate_limited(node.clone());
            }
        }
    }

    /// Decides what to do with one node of the graph.
    async fn attempt_to_delete_item(&self, node: &Arc<Node>) -> Result<(), ProcessItemError> {
        let identity = node.identity();
        log::debug!("[GarbageCollector] Processing item {identity}");

        if node.is_being_deleted() && !node.is_deleting_dependents() {
            log::debug!(
                "[GarbageCollector] Item {identity} is being deleted without a cascade, skipping"
            );
            return Ok(());
        }

        let latest = match self.get_object(identity).await {
            Ok(latest) => latest,
            Err(e) if e.is_not_found() => return Err(self.send_virtual_delete(identity)),
            Err(e)
                if e.is_unknown_kind()
                    && node.is_virtual()
                    && self.unknown_kind_policy != UnknownOwnerKindPolicy::Retry =>
            {
                return Err(self.send_virtual_delete(identity));
            }
            Err(e) => return Err(e.into()),
        };
        if latest.uid() != identity.uid {
            log::debug!(
                "[GarbageCollector] UID of {identity} does not match the stored object ({}), it was recreated",
                latest.uid()
            );
            return Err(self.send_virtual_delete(identity));
        }

        if node.is_deleting_dependents() {
            return self.process_deleting_dependents_item(node).await;
        }

        let owners = latest.metadata.owner_references();
        if owners.is_empty() {
            log::debug!("[GarbageCollector] Item {identity} has no owners, nothing to do");
            return Ok(());
        }

        let classified = self.classifier.classify(identity, owners).await?;
        log::debug!(
            "[GarbageCollector] Classified owners of {identity}: solid {}, dangling {}, waiting {}",
            classified.solid.len(),
            classified.dangling.len(),
            classified.waiting_for_dependents_deletion.len()
        );

        if !classified.solid.is_empty() {
            let stale: Vec<Uuid> = classified
                .dangling
                .iter()
                .chain(&classified.waiting_for_dependents_deletion)
                .map(|o| o.uid)
                .collect();
            if stale.is_empty() {
                return Ok(());
            }
            log::info!(
                "[GarbageCollector] Item {identity} has solid owners, removing {} stale owner references",
                stale.len()
            );
            // Waiting owners must lose the reference too, or they would stay
            // stuck on their DeletingDependents finalizer.
            self.patch_object(identity, &MetadataPatch::remove_owner_references(identity.uid, stale))
                .await?;
            return Ok(());
        }

        if !classified.waiting_for_dependents_deletion.is_empty()
            && node.dependents_len().await > 0
        {
            for dependent in self.uid_to_node.dependents_of(node).await {
                if dependent.is_deleting_dependents() {
                    // Two foreground deletions waiting on each other would
                    // never finish; let this dependent go first.
                    log::info!(
                        "[GarbageCollector] Owners of {identity} and its dependent {} are both deleting dependents, unblocking the dependent's owner references",
                        dependent.identity()
                    );
                    self.patch_object(
                        dependent.identity(),
                        &MetadataPatch::unblock_owner_references(dependent.uid()),
                    )
                    .await?;
                    break;
                }
            }
            log::info!(
                "[GarbageCollector] At least one owner of {identity} is deleting dependents and the item has dependents, deleting it in the foreground"
            );
            return self
                .delete_object(identity, Some(DeletePropagationPolicy::Foreground))
                .await;
        }

        log::info!("[GarbageCollector] Deleting {identity} with the default propagation policy");
        self.delete_object(identity, None).await
    }

    /// Foreground deletion of `node` is waiting for its blocking dependents.
    async fn process_deleting_dependents_item(&self, node: &Arc<Node>) -> Result<(), ProcessItemError> {
        let blocking = self.uid_to_node.blocking_dependents(node).await;
        if blocking.is_empty() {
            log::info!(
                "[GarbageCollector] No more blocking dependents, removing DeletingDependents finalizer from {}",
                node.identity()
            );
            return self.remove_finalizer(node, Finalizer::DeletingDependents).await;
        }

        for dependent in blocking {
            if !dependent.is_deleting_dependents() {
                log::debug!(
                    "[GarbageCollector] Adding {} to attempt_to_delete, its owner {} is deleting dependents",
                    dependent.identity(),
                    node.identity()
                );
                self.attempt_to_delete.add(dependent);
            }
        }
        Ok(())
    }

    async fn run_attempt_to_orphan_worker(self, id: usize) {
        let queue = self.attempt_to_orphan.name().to_string();
        log::debug!("[GarbageCollector] Starting {queue} worker [#{id}]");
        while let Some(owner) = self.attempt_to_orphan.get().await {
            match self.attempt_to_orphan_item(&owner).await {
                Ok(()) => self.attempt_to_orphan.forget(&owner),
                Err(e) => {
                    log::error!(
                        "[GarbageCollector] Error orphaning dependents of {}: {e}",
                        owner.identity()
                    );
                    self.attempt_to_orphan.add_rate_limited(owner.clone());
                }
            }
            self.attempt_to_orphan.done(&owner);
        }
        log::debug!("[GarbageCollector] {queue} worker [#{id}] exited");
    }

    async fn attempt_to_orphan_item(&self, owner: &Arc<Node>) -> Result<(), ProcessItemError> {
        let dependents = self.uid_to_node.dependents_of(owner).await;
        log::info!(
            "[GarbageCollector] Orphaning {} dependents of {}",
            dependents.len(),
            owner.identity()
        );
        self.orphan_dependents(owner.identity(), &dependents).await?;
        self.remove_finalizer(owner, Finalizer::OrphanDependents).await
    }

    /// Strips the reference to `owner` from every dependent. All failures
    /// are collected so one bad dependent does not hide the others.
    async fn orphan_dependents(
        &self,
        owner: &ObjectReference,
        dependents: &[Arc<Node>],
    ) -> Result<(), ProcessItemError> {
        let mut failures = Vec::new();
        for dependent in dependents {
            let patch = MetadataPatch::remove_owner_references(dependent.uid(), vec![owner.uid]);
            match self.patch_object(dependent.identity(), &patch).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => failures.push(format!("orphaning {} failed: {e}", dependent.identity())),
            }
        }
        if !failures.is_empty() {
            return Err(ProcessItemError::Orphan {
                owner: owner.clone(),
                failures,
            });
        }
        log::debug!("[GarbageCollector] Updated all dependents of {owner}");
        Ok(())
    }

    async fn remove_finalizer(&self, node: &Node, finalizer: Finalizer) -> Result<(), ProcessItemError> {
        log::debug!(
            "[GarbageCollector] Removing finalizer {finalizer} from {}",
            node.identity()
        );
        let patch = MetadataPatch::remove_finalizer(node.uid(), finalizer);
        match self.patch_object(node.identity(), &patch).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                log::debug!(
                    "[GarbageCollector] {} is already gone, skipping finalizer removal",
                    node.identity()
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send_virtual_delete(&self, identity: &ObjectReference) -> ProcessItemError {
        log::debug!(
            "[GarbageCollector] {identity} does not exist in the store, sending virtual delete event to GraphBuilder"
        );
        // The builder only goes away during shutdown.
        let _ = self.graph_changes.send(GraphEvent::new_virtual_delete(identity));
        ProcessItemError::VirtualDeleteSent
    }

    fn scoped_namespace<'a>(resource: &common::ApiResource, identity: &'a ObjectReference) -> &'a str {
        if resource.namespaced {
            identity.namespace.as_str()
        } else {
            ""
        }
    }

    async fn get_object(&self, identity: &ObjectReference) -> Result<PartialObjectMeta, ApiError> {
        let (resource, client) = self.registry.client_for(&identity.api_version, &identity.kind)?;
        client
            .get(Self::scoped_namespace(&resource, identity), &identity.name)
            .await
    }

    async fn patch_object(
        &self,
        identity: &ObjectReference,
        patch: &MetadataPatch,
    ) -> Result<(), ApiError> {
        let (resource, client) = self.registry.client_for(&identity.api_version, &identity.kind)?;
        client
            .patch(Self::scoped_namespace(&resource, identity), &identity.name, patch)
            .await
    }

    async fn delete_object(
        &self,
        identity: &ObjectReference,
        policy: Option<DeletePropagationPolicy>,
    ) -> Result<(), ProcessItemError> {
        let (resource, client) = self.registry.client_for(&identity.api_version, &identity.kind)?;
        let options = DeleteOptions {
            propagation_policy: policy,
            preconditions: None,
        }
        .with_uid_precondition(identity.uid);
        client
            .delete(Self::scoped_namespace(&resource, identity), &identity.name, &options)
            .await?;
        Ok(())
    }
}
