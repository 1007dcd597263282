use std::fmt;

use common::{GroupVersionKind, ObjectMeta, OwnerReference, PartialObjectMeta};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of an object in the dependency graph. The UID is the key; the
/// other fields may lag behind the live object.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReference {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: Uuid,
}

impl ObjectReference {
    pub fn from_object(obj: &PartialObjectMeta) -> Self {
        Self {
            api_version: obj.api_version.clone(),
            kind: obj.kind.clone(),
            namespace: obj.metadata.namespace.clone(),
            name: obj.metadata.name.clone(),
            uid: obj.metadata.uid,
        }
    }

    /// Identity of an owner as seen from a dependent living in `namespace`.
    pub fn from_owner_reference(owner: &OwnerReference, namespace: &str) -> Self {
        Self {
            api_version: owner.api_version.clone(),
            kind: owner.kind.clone(),
            namespace: namespace.to_string(),
            name: owner.name.clone(),
            uid: owner.uid,
        }
    }

    pub fn group_version_kind(&self) -> GroupVersionKind {
        GroupVersionKind::from_api_version(&self.api_version, &self.kind)
    }

    /// A metadata-only object carrying just this identity, used for
    /// synthesized delete events.
    pub fn to_partial_object(&self) -> PartialObjectMeta {
        PartialObjectMeta::new(
            &self.api_version,
            &self.kind,
            ObjectMeta {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
                uid: self.uid,
                ..Default::default()
            },
        )
    }

    /// Whether an owner reference points at this object under the same
    /// group, kind and name.
    pub fn matches_owner_reference(&self, owner: &OwnerReference) -> bool {
        let ours = self.group_version_kind();
        let theirs = GroupVersionKind::from_api_version(&owner.api_version, &owner.kind);
        owner.uid == self.uid
            && owner.name == self.name
            && ours.group == theirs.group
            && ours.kind == theirs.kind
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}, namespace: {}, name: {}, uid: {}]",
            self.api_version, self.kind, self.namespace, self.name, self.uid
        )
    }
}
