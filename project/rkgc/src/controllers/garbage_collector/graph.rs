use std::{
    collections::{HashMap, HashSet},
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use common::OwnerReference;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::types::ObjectReference;

/// A vertex of the dependency graph.
///
/// Only the graph builder mutates owners, dependents and the flags; workers
/// read them concurrently. Dependents are stored as UIDs and resolved through
/// the [`UidToNodeTable`], so a node never keeps another one alive.
#[derive(Debug)]
pub struct Node {
    identity: ObjectReference,
    owners: RwLock<Vec<OwnerReference>>,
    dependents: RwLock<HashSet<Uuid>>,
    is_virtual: AtomicBool,
    being_deleted: AtomicBool,
    deleting_dependents: AtomicBool,
}

impl Node {
    pub fn new(identity: ObjectReference, is_virtual: bool) -> Self {
        Self {
            identity,
            owners: RwLock::new(Vec::new()),
            dependents: RwLock::new(HashSet::new()),
            is_virtual: AtomicBool::new(is_virtual),
            being_deleted: AtomicBool::new(false),
            deleting_dependents: AtomicBool::new(false),
        }
    }

    /// A copy of this node under a corrected identity, keeping every edge
    /// and flag.
    pub async fn with_identity(&self, identity: ObjectReference, is_virtual: bool) -> Self {
        let node = Self::new(identity, is_virtual);
        *node.owners.write().await = self.owners().await;
        *node.dependents.write().await = self.dependents.read().await.clone();
        node.being_deleted
            .store(self.is_being_deleted(), Ordering::SeqCst);
        node.deleting_dependents
            .store(self.is_deleting_dependents(), Ordering::SeqCst);
        node
    }

    pub fn identity(&self) -> &ObjectReference {
        &self.identity
    }

    pub fn uid(&self) -> Uuid {
        self.identity.uid
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual.load(Ordering::SeqCst)
    }

    pub fn is_observed(&self) -> bool {
        !self.is_virtual()
    }

    pub fn mark_observed(&self) {
        self.is_virtual.store(false, Ordering::SeqCst);
    }

    pub fn is_being_deleted(&self) -> bool {
        self.being_deleted.load(Ordering::SeqCst)
    }

    pub fn mark_being_deleted(&self) {
        self.being_deleted.store(true, Ordering::SeqCst);
    }

    pub fn is_deleting_dependents(&self) -> bool {
        self.deleting_dependents.load(Ordering::SeqCst)
    }

    pub fn mark_deleting_dependents(&self) {
        self.deleting_dependents.store(true, Ordering::SeqCst);
    }

    pub async fn owners(&self) -> Vec<OwnerReference> {
        self.owners.read().await.clone()
    }

    pub async fn set_owners(&self, owners: Vec<OwnerReference>) {
        *self.owners.write().await = owners;
    }

    pub async fn add_dependent(&self, uid: Uuid) {
        self.dependents.write().await.insert(uid);
    }

    pub async fn remove_dependent(&self, uid: &Uuid) {
        self.dependents.write().await.remove(uid);
    }

    /// Snapshot of the dependents' UIDs.
    pub async fn dependents(&self) -> Vec<Uuid> {
        self.dependents.read().await.iter().copied().collect()
    }

    pub async fn dependents_len(&self) -> usize {
        self.dependents.read().await.len()
    }

    /// Whether any of this node's owner references to `owner` asks to block
    /// the owner's deletion.
    pub async fn blocks_owner(&self, owner: &Uuid) -> bool {
        self.owners
            .read()
            .await
            .iter()
            .any(|o| o.uid == *owner && o.blocks_owner_deletion())
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

#[derive(Debug, Default)]
pub struct UidToNodeTable {
    table: RwLock<HashMap<Uuid, Arc<Node>>>,
}

impl UidToNodeTable {
    pub async fn insert(&self, node: Arc<Node>) {
        let mut table = self.table.write().await;
        table.insert(node.uid(), node);
    }

    pub async fn get(&self, uid: &Uuid) -> Option<Arc<Node>> {
        let table = self.table.read().await;
        table.get(uid).cloned()
    }

    pub async fn remove(&self, uid: &Uuid) -> Option<Arc<Node>> {
        let mut table = self.table.write().await;
        table.remove(uid)
    }

    pub async fn contains_key(&self, uid: &Uuid) -> bool {
        let table = self.table.read().await;
        table.contains_key(uid)
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Looks up every UID, skipping the ones no longer indexed.
    pub async fn resolve(&self, uids: &[Uuid]) -> Vec<Arc<Node>> {
        let table = self.table.read().await;
        uids.iter().filter_map(|uid| table.get(uid).cloned()).collect()
    }

    pub async fn dependents_of(&self, node: &Node) -> Vec<Arc<Node>> {
        self.resolve(&node.dependents().await).await
    }

    /// Dependents that hold up a foreground deletion of `owner`: their
    /// reference to it is blocking and they are not being deleted yet.
    /// A dependent already on its way out no longer holds the owner, which
    /// also lets two foreground deletions that block each other finish.
    pub async fn blocking_dependents(&self, owner: &Node) -> Vec<Arc<Node>> {
        let mut result = Vec::new();
        for dependent in self.dependents_of(owner).await {
            if dependent.is_being_deleted() {
                continue;
            }
            if dependent.blocks_owner(&owner.uid()).await {
                result.push(dependent);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> ObjectReference {
        ObjectReference {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            namespace: "default".to_string(),
            name: name.to_string(),
            uid: Uuid::new_v4(),
        }
    }

    fn owner_ref(owner: &Node, block: Option<bool>) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "ReplicaSet".to_string(),
            name: owner.identity().name.clone(),
            uid: owner.uid(),
            controller: true,
            block_owner_deletion: block,
        }
    }

    async fn attach(table: &UidToNodeTable, owner: &Arc<Node>, name: &str, block: Option<bool>) -> Arc<Node> {
        let dependent = Arc::new(Node::new(identity(name), false));
        dependent.set_owners(vec![owner_ref(owner, block)]).await;
        owner.add_dependent(dependent.uid()).await;
        table.insert(dependent.clone()).await;
        dependent
    }

    #[tokio::test]
    async fn blocking_dependents_follow_the_block_flag() {
        let table = UidToNodeTable::default();
        let owner = Arc::new(Node::new(identity("rs"), false));
        table.insert(owner.clone()).await;

        let d1 = attach(&table, &owner, "d1", Some(true)).await;
        attach(&table, &owner, "d2", Some(false)).await;
        attach(&table, &owner, "d3", None).await;

        let blocking = table.blocking_dependents(&owner).await;
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].uid(), d1.uid());
    }

    #[tokio::test]
    async fn dependents_being_deleted_do_not_block() {
        let table = UidToNodeTable::default();
        let owner = Arc::new(Node::new(identity("rs"), false));
        let d1 = attach(&table, &owner, "d1", Some(true)).await;
        let d2 = attach(&table, &owner, "d2", Some(true)).await;
        let d3 = attach(&table, &owner, "d3", Some(true)).await;

        d1.mark_being_deleted();
        d2.mark_being_deleted();
        d2.mark_deleting_dependents();

        let blocking = table.blocking_dependents(&owner).await;
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].uid(), d3.uid());
    }

    #[tokio::test]
    async fn mutual_foreground_deletions_do_not_block_each_other() {
        let table = UidToNodeTable::default();
        let a = Arc::new(Node::new(identity("a"), false));
        table.insert(a.clone()).await;
        let b = attach(&table, &a, "b", Some(true)).await;
        b.set_owners(vec![owner_ref(&a, Some(true))]).await;
        a.set_owners(vec![owner_ref(&b, Some(true))]).await;
        b.add_dependent(a.uid()).await;
        for node in [&a, &b] {
            node.mark_being_deleted();
            node.mark_deleting_dependents();
        }

        assert!(table.blocking_dependents(&a).await.is_empty());
        assert!(table.blocking_dependents(&b).await.is_empty());
    }

    #[tokio::test]
    async fn unindexed_dependents_are_skipped() {
        let table = UidToNodeTable::default();
        let owner = Arc::new(Node::new(identity("rs"), false));
        let d1 = attach(&table, &owner, "d1", Some(true)).await;
        table.remove(&d1.uid()).await;

        assert!(table.dependents_of(&owner).await.is_empty());
        assert_eq!(owner.dependents_len().await, 1);
    }

    #[tokio::test]
    async fn replacement_keeps_edges_and_flags() {
        let owner = Node::new(identity("rs"), true);
        let dependent = Uuid::new_v4();
        owner.add_dependent(dependent).await;
        owner.mark_deleting_dependents();

        let mut observed = owner.identity().clone();
        observed.namespace = String::new();
        let replacement = owner.with_identity(observed.clone(), false).await;

        assert_eq!(replacement.identity(), &observed);
        assert!(replacement.is_observed());
        assert!(replacement.is_deleting_dependents());
        assert_eq!(replacement.dependents().await, vec![dependent]);
        assert_ne!(replacement, owner);
    }
}
