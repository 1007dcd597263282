//! Delete options and metadata patches, plus the state transitions a store
//! applies when it executes them. Every store backend goes through these so
//! finalizer handling stays identical regardless of where objects live.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Finalizer, ObjectMeta};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum DeletePropagationPolicy {
    /// Remove the owner now and let the collector delete dependents later.
    Background,
    /// Keep the owner until every blocking dependent is gone.
    Foreground,
    /// Strip owner references from dependents before removing the owner.
    Orphan,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// `None` leaves the choice to the store, which deletes in the background.
    #[serde(
        rename = "propagationPolicy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub propagation_policy: Option<DeletePropagationPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<Preconditions>,
}

impl DeleteOptions {
    pub fn with_policy(policy: DeletePropagationPolicy) -> Self {
        Self {
            propagation_policy: Some(policy),
            preconditions: None,
        }
    }

    pub fn with_uid_precondition(mut self, uid: Uuid) -> Self {
        self.preconditions = Some(Preconditions { uid: Some(uid) });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("precondition failed: expected uid {expected}, found {actual}")]
pub struct PreconditionFailed {
    pub expected: Uuid,
    pub actual: Uuid,
}

fn check_uid(expected: Option<Uuid>, meta: &ObjectMeta) -> Result<(), PreconditionFailed> {
    match expected {
        Some(expected) if expected != meta.uid => Err(PreconditionFailed {
            expected,
            actual: meta.uid,
        }),
        _ => Ok(()),
    }
}

/// What a store must do with an object after a delete request or a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Drop the object from storage.
    Remove,
    /// Persist the modified metadata.
    Update,
    /// Nothing changed.
    Unchanged,
}

impl ObjectMeta {
    /// Applies a delete request to this object's metadata.
    pub fn apply_delete(
        &mut self,
        options: &DeleteOptions,
        now: DateTime<Utc>,
    ) -> Result<DeleteOutcome, PreconditionFailed> {
        check_uid(
            options.preconditions.as_ref().and_then(|p| p.uid),
            self,
        )?;

        let before = self.clone();
        match options.propagation_policy {
            Some(DeletePropagationPolicy::Foreground) => {
                self.add_finalizer(Finalizer::DeletingDependents);
            }
            Some(DeletePropagationPolicy::Orphan) => {
                self.add_finalizer(Finalizer::OrphanDependents);
            }
            Some(DeletePropagationPolicy::Background) | None => {
                if self.finalizers.as_ref().is_none_or(|f| f.is_empty()) {
                    return Ok(DeleteOutcome::Remove);
                }
            }
        }
        if self.deletion_timestamp.is_none() {
            self.deletion_timestamp = Some(now);
        }

        if *self == before {
            Ok(DeleteOutcome::Unchanged)
        } else {
            Ok(DeleteOutcome::Update)
        }
    }
}

/// The only metadata edits the collector makes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOperation {
    /// Drop owner references pointing at any of these UIDs.
    RemoveOwnerReferences(Vec<Uuid>),
    /// Set `blockOwnerDeletion: false` on every owner reference.
    UnblockOwnerReferences,
    RemoveFinalizer(Finalizer),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPatch {
    /// The patch is rejected unless the stored object still has this UID.
    pub uid: Option<Uuid>,
    pub operation: PatchOperation,
}

impl MetadataPatch {
    pub fn remove_owner_references(uid: Uuid, owners: Vec<Uuid>) -> Self {
        Self {
            uid: Some(uid),
            operation: PatchOperation::RemoveOwnerReferences(owners),
        }
    }

    pub fn unblock_owner_references(uid: Uuid) -> Self {
        Self {
            uid: Some(uid),
            operation: PatchOperation::UnblockOwnerReferences,
        }
    }

    pub fn remove_finalizer(uid: Uuid, finalizer: Finalizer) -> Self {
        Self {
            uid: Some(uid),
            operation: PatchOperation::RemoveFinalizer(finalizer),
        }
    }

    /// Applies the patch. The returned outcome tells the store whether the
    /// object must now be removed.
    pub fn apply(&self, meta: &mut ObjectMeta) -> Result<DeleteOutcome, PreconditionFailed> {
        check_uid(self.uid, meta)?;

        let before = meta.clone();
        match &self.operation {
            PatchOperation::RemoveOwnerReferences(uids) => {
                if let Some(owners) = meta.owner_references.as_mut() {
                    owners.retain(|owner| !uids.contains(&owner.uid));
                    if owners.is_empty() {
                        meta.owner_references = None;
                    }
                }
            }
            PatchOperation::UnblockOwnerReferences => {
                for owner in meta.owner_references.iter_mut().flatten() {
                    if owner.block_owner_deletion.is_some() {
                        owner.block_owner_deletion = Some(false);
                    }
                }
            }
            PatchOperation::RemoveFinalizer(finalizer) => meta.remove_finalizer(finalizer),
        }

        if meta.ready_for_removal() {
            Ok(DeleteOutcome::Remove)
        } else if *meta == before {
            Ok(DeleteOutcome::Unchanged)
        } else {
            Ok(DeleteOutcome::Update)
        }
    }
}
