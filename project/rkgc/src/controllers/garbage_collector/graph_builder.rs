use std::sync::Arc;

use common::{Finalizer, ObjectMeta, OwnerReference, PartialObjectMeta};
use tokio::sync::{mpsc::UnboundedReceiver, watch};

use super::{
    graph::{Node, UidToNodeTable},
    types::ObjectReference,
    uid_cache::UidCache,
};
use crate::controllers::{wait_for_stop, workqueue::RateLimitingQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphChangeEventKind {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct GraphEvent {
    pub kind: GraphChangeEventKind,
    pub new: PartialObjectMeta,
    pub old: Option<PartialObjectMeta>,
    /// Set on deletes synthesized by the collector after a lookup proved the
    /// object absent.
    pub is_virtual: bool,
}

impl GraphEvent {
    pub fn new_add(new: PartialObjectMeta) -> Self {
        Self {
            kind: GraphChangeEventKind::Add,
            new,
            old: None,
            is_virtual: false,
        }
    }

    pub fn new_update(old: PartialObjectMeta, new: PartialObjectMeta) -> Self {
        Self {
            kind: GraphChangeEventKind::Update,
            new,
            old: Some(old),
            is_virtual: false,
        }
    }

    pub fn new_delete(obj: PartialObjectMeta) -> Self {
        Self {
            kind: GraphChangeEventKind::Delete,
            new: obj,
            old: None,
            is_virtual: false,
        }
    }

    pub fn new_virtual_delete(identity: &ObjectReference) -> Self {
        Self {
            kind: GraphChangeEventKind::Delete,
            new: identity.to_partial_object(),
            old: None,
            is_virtual: true,
        }
    }
}

/// Owner references that differ between two versions of an object.
#[derive(Debug, Default)]
pub struct ReferenceDifference {
    pub added: Vec<OwnerReference>,
    pub removed: Vec<OwnerReference>,
    /// Same owner UID, different `blockOwnerDeletion`: (old, new).
    pub changed: Vec<(OwnerReference, OwnerReference)>,
}

impl ReferenceDifference {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// GraphBuilder is the only writer of the dependency graph. It consumes graph
/// change events one at a time and hands follow-up work to the delete and
/// orphan queues. It never talks to the store.
#[derive(Clone)]
pub struct GraphBuilder {
    pub uid_to_node: Arc<UidToNodeTable>,
    pub absent_owner_cache: Arc<UidCache>,
    attempt_to_delete: RateLimitingQueue<Arc<Node>>,
    attempt_to_orphan: RateLimitingQueue<Arc<Node>>,
}

impl GraphBuilder {
    pub fn new(
        uid_to_node: Arc<UidToNodeTable>,
        absent_owner_cache: Arc<UidCache>,
        attempt_to_delete: RateLimitingQueue<Arc<Node>>,
        attempt_to_orphan: RateLimitingQueue<Arc<Node>>,
    ) -> Self {
        Self {
            uid_to_node,
            absent_owner_cache,
            attempt_to_delete,
            attempt_to_orphan,
        }
    }

    /// Drains graph change events until the stop signal fires or every
    /// producer is gone.
    pub async fn run(
        self,
        mut events: UnboundedReceiver<GraphEvent>,
        mut stop: watch::Receiver<bool>,
    ) {
        log::info!("[GraphBuilder] Processing graph changes");
        loop {
            tokio::select! {
                biased;
                _ = wait_for_stop(&mut stop) => break,
                event = events.recv() => match event {
                    Some(event) => self.process_graph_change(event).await,
                    None => break,
                },
            }
        }
        log::info!("[GraphBuilder] Stopped processing graph changes");
    }

    pub async fn process_graph_change(&self, event: GraphEvent) {
        let uid = event.new.uid();
        log::debug!(
            "[GraphBuilder] Processing {:?} event for {} (virtual: {})",
            event.kind,
            ObjectReference::from_object(&event.new),
            event.is_virtual
        );

        let mut existing = self.uid_to_node.get(&uid).await;
        if let Some(node) = &existing
            && !event.is_virtual
            && node.is_virtual()
        {
            existing = Some(self.observe_virtual_node(node.clone(), &event.new).await);
        }

        match event.kind {
            GraphChangeEventKind::Add | GraphChangeEventKind::Update => match existing {
                Some(node) => self.update_node(&node, &event).await,
                None => self.insert_node(&event).await,
            },
            GraphChangeEventKind::Delete => match existing {
                Some(node) => self.delete_node(node, &event).await,
                None => log::debug!("[GraphBuilder] Delete event for unknown UID {uid}, ignoring"),
            },
        }
    }

    /// A real event arrived for an object known only through references.
    /// Returns the node that now stands for it.
    async fn observe_virtual_node(&self, node: Arc<Node>, obj: &PartialObjectMeta) -> Arc<Node> {
        let observed = ObjectReference::from_object(obj);
        if &observed == node.identity() {
            node.mark_observed();
            return node;
        }

        // Dependents whose reference disagrees with the real object need to be
        // re-checked; their owner may effectively not exist.
        let (_, unmatched) = self.partition_dependents_by_identity(&node, &observed).await;
        for dependent in unmatched {
            if dependent.identity().namespace != observed.namespace {
                log::info!(
                    "[GraphBuilder] Item {} references owner {} in another namespace",
                    dependent.identity(),
                    observed
                );
            }
            self.attempt_to_delete.add(dependent);
        }

        log::info!(
            "[GraphBuilder] Replacing virtual item {} with observed item {}",
            node.identity(),
            observed
        );
        let replacement = Arc::new(node.with_identity(observed, false).await);
        self.uid_to_node.insert(replacement.clone()).await;
        replacement
    }

    async fn insert_node(&self, event: &GraphEvent) {
        let meta = &event.new.metadata;
        let node = Arc::new(Node::new(ObjectReference::from_object(&event.new), false));
        let owners = meta.owner_references().to_vec();
        node.set_owners(owners.clone()).await;
        if being_deleted(meta) {
            node.mark_being_deleted();
        }
        self.uid_to_node.insert(node.clone()).await;
        self.add_dependent_to_owners(&node, &owners).await;
        self.process_transitions(&node, None, meta).await;
    }

    async fn update_node(&self, node: &Arc<Node>, event: &GraphEvent) {
        let meta = &event.new.metadata;
        let new_owners = meta.owner_references();
        let diff = get_reference_difference(&node.owners().await, new_owners);

        if !diff.is_empty() {
            // Owners that were waiting on this dependent may be free to go now.
            for removed in &diff.removed {
                if removed.blocks_owner_deletion() {
                    self.enqueue_owner(&removed.uid).await;
                }
            }
            for (old, new) in &diff.changed {
                if old.blocks_owner_deletion() && !new.blocks_owner_deletion() {
                    self.enqueue_owner(&new.uid).await;
                }
            }

            node.set_owners(new_owners.to_vec()).await;
            self.add_dependent_to_owners(node, &diff.added).await;
            self.remove_dependent_from_owners(node, &diff.removed).await;
        }

        if being_deleted(meta) {
            node.mark_being_deleted();
        }
        let old = event.old.as_ref().map(|o| &o.metadata);
        self.process_transitions(node, old, meta).await;
    }

    async fn delete_node(&self, node: Arc<Node>, event: &GraphEvent) {
        if event.is_virtual && !self.accept_virtual_delete(&node, &event.new).await {
            return;
        }

        node.mark_being_deleted();
        self.uid_to_node.remove(&node.uid()).await;

        let owners = node.owners().await;
        self.remove_dependent_from_owners(&node, &owners).await;

        let dependents = self.uid_to_node.dependents_of(&node).await;
        if !dependents.is_empty() {
            self.absent_owner_cache.add(node.uid()).await;
        }
        for dependent in dependents {
            self.attempt_to_delete.add(dependent);
        }

        // One of the blocking dependents of these owners just went away.
        for owner in &owners {
            if let Some(owner_node) = self.uid_to_node.get(&owner.uid).await
                && owner_node.is_deleting_dependents()
            {
                self.attempt_to_delete.add(owner_node);
            }
        }
        log::debug!("[GraphBuilder] Removed {} from the graph", node.identity());
    }

    /// Decides whether a delete synthesized by the collector may remove the
    /// indexed node. The lookup only proved that the object under the queried
    /// identity is absent; dependents referring to the UID under another
    /// identity keep the node alive.
    async fn accept_virtual_delete(&self, node: &Arc<Node>, deleted: &PartialObjectMeta) -> bool {
        let deleted_identity = ObjectReference::from_object(deleted);

        if node.is_virtual() {
            let (matching, unmatching) = self
                .partition_dependents_by_identity(node, &deleted_identity)
                .await;
            if unmatching.is_empty() {
                return true;
            }

            for dependent in matching {
                self.attempt_to_delete.add(dependent);
            }

            if node.identity() == &deleted_identity {
                // The node's own identity was disproved; verify the next one.
                let alternative = {
                    let owners = unmatching[0].owners().await;
                    owners
                        .iter()
                        .find(|o| o.uid == deleted_identity.uid)
                        .map(|o| {
                            ObjectReference::from_owner_reference(
                                o,
                                &unmatching[0].identity().namespace,
                            )
                        })
                };
                if let Some(alternative) = alternative {
                    log::info!(
                        "[GraphBuilder] Virtual item {} is absent, checking alternative identity {}",
                        node.identity(),
                        alternative
                    );
                    let replacement = Arc::new(node.with_identity(alternative, true).await);
                    self.uid_to_node.insert(replacement.clone()).await;
                    self.attempt_to_delete.add(replacement);
                }
            }
            return false;
        }

        if node.identity() != &deleted_identity {
            // The real object exists under another identity; only the
            // dependents using the disproved one need a second look.
            let (matching, _) = self
                .partition_dependents_by_identity(node, &deleted_identity)
                .await;
            for dependent in matching {
                self.attempt_to_delete.add(dependent);
            }
            return false;
        }

        true
    }

    /// Links `node` under each owner, creating virtual owners for UIDs never
    /// seen before. New virtual owners are queued so their existence gets
    /// verified.
    pub async fn add_dependent_to_owners(&self, node: &Arc<Node>, owners: &[OwnerReference]) {
        for owner in owners {
            let owner_node = match self.uid_to_node.get(&owner.uid).await {
                Some(n) => n,
                None => {
                    let identity =
                        ObjectReference::from_owner_reference(owner, &node.identity().namespace);
                    let virtual_node = Arc::new(Node::new(identity, true));
                    self.uid_to_node.insert(virtual_node.clone()).await;
                    log::debug!(
                        "[GraphBuilder] Added virtual owner {} for {}",
                        virtual_node.identity(),
                        node.identity()
                    );
                    self.attempt_to_delete.add(virtual_node.clone());
                    virtual_node
                }
            };
            owner_node.add_dependent(node.uid()).await;
        }
    }

    pub async fn remove_dependent_from_owners(&self, node: &Node, owners: &[OwnerReference]) {
        for owner in owners {
            if let Some(owner_node) = self.uid_to_node.get(&owner.uid).await {
                owner_node.remove_dependent(&node.uid()).await;
            }
        }
    }

    async fn enqueue_owner(&self, uid: &uuid::Uuid) {
        if let Some(owner_node) = self.uid_to_node.get(uid).await {
            self.attempt_to_delete.add(owner_node);
        }
    }

    async fn partition_dependents_by_identity(
        &self,
        node: &Node,
        identity: &ObjectReference,
    ) -> (Vec<Arc<Node>>, Vec<Arc<Node>>) {
        let mut matched = Vec::new();
        let mut unmatched = Vec::new();
        for dependent in self.uid_to_node.dependents_of(node).await {
            let matches = dependent
                .owners()
                .await
                .iter()
                .any(|owner| identity.matches_owner_reference(owner));
            if matches {
                matched.push(dependent);
            } else {
                unmatched.push(dependent);
            }
        }
        (matched, unmatched)
    }

    async fn process_transitions(
        &self,
        node: &Arc<Node>,
        old: Option<&ObjectMeta>,
        new: &ObjectMeta,
    ) {
        if deletion_starts_with_finalizer(old, new, &Finalizer::OrphanDependents) {
            log::debug!(
                "[GraphBuilder] {} is being deleted with orphan policy",
                node.identity()
            );
            self.attempt_to_orphan.add(node.clone());
            return;
        }

        if being_deleted(new)
            && has_delete_dependents_finalizer(new)
            && !node.is_deleting_dependents()
        {
            log::debug!(
                "[GraphBuilder] {} is being deleted in the foreground",
                node.identity()
            );
            node.mark_deleting_dependents();
            for dependent in self.uid_to_node.dependents_of(node).await {
                self.attempt_to_delete.add(dependent);
            }
            self.attempt_to_delete.add(node.clone());
        }
    }
}

/// Compares owner references by UID.
pub fn get_reference_difference(
    old_owners: &[OwnerReference],
    new_owners: &[OwnerReference],
) -> ReferenceDifference {
    let mut diff = ReferenceDifference::default();

    for new_owner in new_owners {
        match old_owners.iter().find(|o| o.uid == new_owner.uid) {
            None => diff.added.push(new_owner.clone()),
            Some(old_owner) => {
                if old_owner.block_owner_deletion != new_owner.block_owner_deletion {
                    diff.changed.push((old_owner.clone(), new_owner.clone()));
                }
            }
        }
    }

    for old_owner in old_owners {
        if !new_owners.iter().any(|o| o.uid == old_owner.uid) {
            diff.removed.push(old_owner.clone());
        }
    }

    diff
}

pub fn being_deleted(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

pub fn has_delete_dependents_finalizer(meta: &ObjectMeta) -> bool {
    meta.has_finalizer(&Finalizer::DeletingDependents)
}

/// True when `new` is being deleted with `finalizer` and `old` was not.
fn deletion_starts_with_finalizer(
    old: Option<&ObjectMeta>,
    new: &ObjectMeta,
    finalizer: &Finalizer,
) -> bool {
    if !being_deleted(new) || !new.has_finalizer(finalizer) {
        return false;
    }
    match old {
        None => true,
        Some(old) => !being_deleted(old) || !old.has_finalizer(finalizer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::workqueue::ExponentialBackoff;
    use chrono::Utc;
    use uuid::Uuid;

    struct Fixture {
        builder: GraphBuilder,
        deletes: RateLimitingQueue<Arc<Node>>,
        orphans: RateLimitingQueue<Arc<Node>>,
    }

    fn fixture() -> Fixture {
        let deletes = RateLimitingQueue::new("attempt_to_delete", ExponentialBackoff::default());
        let orphans = RateLimitingQueue::new("attempt_to_orphan", ExponentialBackoff::default());
        let builder = GraphBuilder::new(
            Arc::new(UidToNodeTable::default()),
            Arc::new(UidCache::new(16)),
            deletes.clone(),
            orphans.clone(),
        );
        Fixture {
            builder,
            deletes,
            orphans,
        }
    }

    fn owner_ref(name: &str, uid: Uuid, block: Option<bool>) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "ReplicaSet".to_string(),
            name: name.to_string(),
            uid,
            controller: true,
            block_owner_deletion: block,
        }
    }

    fn object(kind: &str, name: &str, uid: Uuid, owners: Vec<OwnerReference>) -> PartialObjectMeta {
        let api_version = if kind == "ReplicaSet" { "apps/v1" } else { "v1" };
        PartialObjectMeta::new(
            api_version,
            kind,
            ObjectMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                uid,
                owner_references: (!owners.is_empty()).then_some(owners),
                ..Default::default()
            },
        )
    }

    async fn drain(queue: &RateLimitingQueue<Arc<Node>>) -> Vec<String> {
        let mut names = Vec::new();
        while !queue.is_empty() {
            if let Some(node) = queue.get().await {
                names.push(node.identity().name.clone());
                queue.done(&node);
            }
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_add_dependent_to_owners() {
        let f = fixture();
        let known = Arc::new(Node::new(
            ObjectReference::from_object(&object("ReplicaSet", "rs1", Uuid::new_v4(), vec![])),
            false,
        ));
        f.builder.uid_to_node.insert(known.clone()).await;

        let unseen = owner_ref("rs2", Uuid::new_v4(), Some(false));
        let pod = Arc::new(Node::new(
            ObjectReference::from_object(&object("Pod", "pod1", Uuid::new_v4(), vec![])),
            false,
        ));
        f.builder
            .add_dependent_to_owners(
                &pod,
                &[owner_ref("rs1", known.uid(), Some(false)), unseen.clone()],
            )
            .await;

        assert_eq!(known.dependents().await, vec![pod.uid()]);
        let virtual_owner = f.builder.uid_to_node.get(&unseen.uid).await.unwrap();
        assert!(virtual_owner.is_virtual());
        assert_eq!(virtual_owner.identity().namespace, "default");
        // Only the new virtual owner needs verification.
        assert_eq!(drain(&f.deletes).await, vec!["rs2"]);
    }

    #[test]
    fn test_get_reference_difference() {
        let kept = Uuid::new_v4();
        let old_owners = vec![
            owner_ref("deploy1", kept, Some(true)),
            owner_ref("svc1", Uuid::new_v4(), Some(false)),
        ];
        let new_owners = vec![
            owner_ref("deploy1", kept, Some(false)),
            owner_ref("svc2", Uuid::new_v4(), Some(true)),
        ];
        let diff = get_reference_difference(&old_owners, &new_owners);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.changed.len(), 1);

        assert_eq!(diff.added[0].name, "svc2");
        assert_eq!(diff.removed[0].name, "svc1");
        assert_eq!(diff.changed[0].0.block_owner_deletion, Some(true));
        assert_eq!(diff.changed[0].1.block_owner_deletion, Some(false));
        assert!(get_reference_difference(&new_owners, &new_owners).is_empty());
    }

    #[tokio::test]
    async fn test_remove_dependent_from_owners() {
        let f = fixture();
        let rs = object("ReplicaSet", "rs1", Uuid::new_v4(), vec![]);
        f.builder.process_graph_change(GraphEvent::new_add(rs.clone())).await;
        let owner = owner_ref("rs1", rs.uid(), None);
        let pod = object("Pod", "pod1", Uuid::new_v4(), vec![owner.clone()]);
        f.builder.process_graph_change(GraphEvent::new_add(pod.clone())).await;

        let pod_node = f.builder.uid_to_node.get(&pod.uid()).await.unwrap();
        f.builder
            .remove_dependent_from_owners(&pod_node, std::slice::from_ref(&owner))
            .await;
        let rs_node = f.builder.uid_to_node.get(&rs.uid()).await.unwrap();
        assert_eq!(rs_node.dependents_len().await, 0);
    }

    #[tokio::test]
    async fn repeated_events_leave_the_same_graph() {
        let f = fixture();
        let rs = object("ReplicaSet", "rs1", Uuid::new_v4(), vec![]);
        let pod = object(
            "Pod",
            "pod1",
            Uuid::new_v4(),
            vec![owner_ref("rs1", rs.uid(), Some(true))],
        );
        for _ in 0..2 {
            f.builder.process_graph_change(GraphEvent::new_add(rs.clone())).await;
            f.builder.process_graph_change(GraphEvent::new_add(pod.clone())).await;
            f.builder
                .process_graph_change(GraphEvent::new_update(pod.clone(), pod.clone()))
                .await;
        }

        assert_eq!(f.builder.uid_to_node.len().await, 2);
        let rs_node = f.builder.uid_to_node.get(&rs.uid()).await.unwrap();
        assert_eq!(rs_node.dependents().await, vec![pod.uid()]);
        let pod_node = f.builder.uid_to_node.get(&pod.uid()).await.unwrap();
        assert_eq!(pod_node.owners().await.len(), 1);
        assert!(f.deletes.is_empty());
    }

    #[tokio::test]
    async fn unseen_owner_becomes_virtual_then_observed() {
        let f = fixture();
        let rs_uid = Uuid::new_v4();
        let pod = object(
            "Pod",
            "pod1",
            Uuid::new_v4(),
            vec![owner_ref("rs1", rs_uid, None)],
        );
        f.builder.process_graph_change(GraphEvent::new_add(pod)).await;

        let virtual_owner = f.builder.uid_to_node.get(&rs_uid).await.unwrap();
        assert!(virtual_owner.is_virtual());
        assert_eq!(drain(&f.deletes).await, vec!["rs1"]);

        let rs = object("ReplicaSet", "rs1", rs_uid, vec![]);
        f.builder.process_graph_change(GraphEvent::new_add(rs)).await;
        let observed = f.builder.uid_to_node.get(&rs_uid).await.unwrap();
        assert!(Arc::ptr_eq(&observed, &virtual_owner));
        assert!(observed.is_observed());
        assert_eq!(observed.dependents_len().await, 1);
    }

    #[tokio::test]
    async fn observed_identity_mismatch_replaces_virtual_node() {
        let f = fixture();
        let rs_uid = Uuid::new_v4();
        let pod = object(
            "Pod",
            "pod1",
            Uuid::new_v4(),
            vec![owner_ref("wrong-name", rs_uid, None)],
        );
        f.builder.process_graph_change(GraphEvent::new_add(pod)).await;
        drain(&f.deletes).await;

        let rs = object("ReplicaSet", "rs1", rs_uid, vec![]);
        f.builder.process_graph_change(GraphEvent::new_add(rs)).await;

        let node = f.builder.uid_to_node.get(&rs_uid).await.unwrap();
        assert!(node.is_observed());
        assert_eq!(node.identity().name, "rs1");
        assert_eq!(node.dependents_len().await, 1);
        // The pod's reference names another object, so it gets re-checked.
        assert_eq!(drain(&f.deletes).await, vec!["pod1"]);
    }

    #[tokio::test]
    async fn owner_delete_enqueues_dependents_and_marks_absent() {
        let f = fixture();
        let rs = object("ReplicaSet", "rs1", Uuid::new_v4(), vec![]);
        let pod = object(
            "Pod",
            "pod1",
            Uuid::new_v4(),
            vec![owner_ref("rs1", rs.uid(), None)],
        );
        f.builder.process_graph_change(GraphEvent::new_add(rs.clone())).await;
        f.builder.process_graph_change(GraphEvent::new_add(pod.clone())).await;

        f.builder.process_graph_change(GraphEvent::new_delete(rs.clone())).await;

        assert!(!f.builder.uid_to_node.contains_key(&rs.uid()).await);
        assert!(f.builder.absent_owner_cache.has(&rs.uid()).await);
        assert_eq!(drain(&f.deletes).await, vec!["pod1"]);
    }

    #[tokio::test]
    async fn dependent_delete_wakes_foreground_owner() {
        let f = fixture();
        let mut rs = object("ReplicaSet", "rs1", Uuid::new_v4(), vec![]);
        let pod = object(
            "Pod",
            "pod1",
            Uuid::new_v4(),
            vec![owner_ref("rs1", rs.uid(), Some(true))],
        );
        f.builder.process_graph_change(GraphEvent::new_add(rs.clone())).await;
        f.builder.process_graph_change(GraphEvent::new_add(pod.clone())).await;

        let old = rs.clone();
        rs.metadata.deletion_timestamp = Some(Utc::now());
        rs.metadata.finalizers = Some(vec![Finalizer::DeletingDependents]);
        f.builder
            .process_graph_change(GraphEvent::new_update(old, rs.clone()))
            .await;

        let rs_node = f.builder.uid_to_node.get(&rs.uid()).await.unwrap();
        assert!(rs_node.is_deleting_dependents());
        assert!(rs_node.is_being_deleted());
        assert_eq!(drain(&f.deletes).await, vec!["pod1", "rs1"]);

        f.builder.process_graph_change(GraphEvent::new_delete(pod)).await;
        assert_eq!(rs_node.dependents_len().await, 0);
        assert_eq!(drain(&f.deletes).await, vec!["rs1"]);
    }

    #[tokio::test]
    async fn unblocking_reference_enqueues_owner() {
        let f = fixture();
        let rs = object("ReplicaSet", "rs1", Uuid::new_v4(), vec![]);
        let pod = object(
            "Pod",
            "pod1",
            Uuid::new_v4(),
            vec![owner_ref("rs1", rs.uid(), Some(true))],
        );
        f.builder.process_graph_change(GraphEvent::new_add(rs.clone())).await;
        f.builder.process_graph_change(GraphEvent::new_add(pod.clone())).await;

        let mut unblocked = pod.clone();
        unblocked.metadata.owner_references = Some(vec![owner_ref("rs1", rs.uid(), Some(false))]);
        f.builder
            .process_graph_change(GraphEvent::new_update(pod, unblocked))
            .await;
        assert_eq!(drain(&f.deletes).await, vec!["rs1"]);
    }

    #[tokio::test]
    async fn orphan_finalizer_enqueues_once() {
        let f = fixture();
        let mut rs = object("ReplicaSet", "rs1", Uuid::new_v4(), vec![]);
        f.builder.process_graph_change(GraphEvent::new_add(rs.clone())).await;

        let old = rs.clone();
        rs.metadata.deletion_timestamp = Some(Utc::now());
        rs.metadata.finalizers = Some(vec![Finalizer::OrphanDependents]);
        f.builder
            .process_graph_change(GraphEvent::new_update(old, rs.clone()))
            .await;
        f.builder
            .process_graph_change(GraphEvent::new_update(rs.clone(), rs.clone()))
            .await;

        assert_eq!(drain(&f.orphans).await, vec!["rs1"]);
        assert!(f.orphans.is_empty());
    }

    #[tokio::test]
    async fn virtual_delete_of_virtual_owner_removes_it() {
        let f = fixture();
        let rs_uid = Uuid::new_v4();
        let pod = object(
            "Pod",
            "pod1",
            Uuid::new_v4(),
            vec![owner_ref("rs1", rs_uid, None)],
        );
        f.builder.process_graph_change(GraphEvent::new_add(pod)).await;
        let virtual_owner = f.builder.uid_to_node.get(&rs_uid).await.unwrap();
        drain(&f.deletes).await;

        f.builder
            .process_graph_change(GraphEvent::new_virtual_delete(virtual_owner.identity()))
            .await;

        assert!(!f.builder.uid_to_node.contains_key(&rs_uid).await);
        assert!(f.builder.absent_owner_cache.has(&rs_uid).await);
        assert_eq!(drain(&f.deletes).await, vec!["pod1"]);
    }

    #[tokio::test]
    async fn virtual_delete_with_conflicting_references_keeps_node() {
        let f = fixture();
        let rs_uid = Uuid::new_v4();
        let pod1 = object("Pod", "pod1", Uuid::new_v4(), vec![owner_ref("rs1", rs_uid, None)]);
        let pod2 = object("Pod", "pod2", Uuid::new_v4(), vec![owner_ref("rs-other", rs_uid, None)]);
        f.builder.process_graph_change(GraphEvent::new_add(pod1)).await;
        f.builder.process_graph_change(GraphEvent::new_add(pod2)).await;
        let virtual_owner = f.builder.uid_to_node.get(&rs_uid).await.unwrap();
        assert_eq!(virtual_owner.identity().name, "rs1");
        drain(&f.deletes).await;

        f.builder
            .process_graph_change(GraphEvent::new_virtual_delete(virtual_owner.identity()))
            .await;

        let replacement = f.builder.uid_to_node.get(&rs_uid).await.unwrap();
        assert!(replacement.is_virtual());
        assert_eq!(replacement.identity().name, "rs-other");
        assert_eq!(replacement.dependents_len().await, 2);
        assert!(!f.builder.absent_owner_cache.has(&rs_uid).await);
        assert_eq!(drain(&f.deletes).await, vec!["pod1", "rs-other"]);
    }
}
