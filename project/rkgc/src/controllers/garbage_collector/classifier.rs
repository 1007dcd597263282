use std::sync::Arc;

use common::{Finalizer, OwnerReference};

use super::{types::ObjectReference, uid_cache::UidCache};
use crate::{
    api::{ApiError, registry::ResourceRegistry},
    protocol::config::UnknownOwnerKindPolicy,
};

/// Owner references of one object, sorted by what the store says about each
/// owner.
#[derive(Debug, Default)]
pub struct ClassifiedReferences {
    /// The owner exists and is not deleting its dependents.
    pub solid: Vec<OwnerReference>,
    /// The owner is gone, or its name now belongs to another object.
    pub dangling: Vec<OwnerReference>,
    /// The owner is being deleted in the foreground.
    pub waiting_for_dependents_deletion: Vec<OwnerReference>,
}

pub struct ReferenceClassifier {
    registry: Arc<ResourceRegistry>,
    absent_owner_cache: Arc<UidCache>,
    unknown_kind_policy: UnknownOwnerKindPolicy,
}

impl ReferenceClassifier {
    pub fn new(
        registry: Arc<ResourceRegistry>,
        absent_owner_cache: Arc<UidCache>,
        unknown_kind_policy: UnknownOwnerKindPolicy,
    ) -> Self {
        Self {
            registry,
            absent_owner_cache,
            unknown_kind_policy,
        }
    }

    /// Classifies every owner reference of `item`. Any lookup error other
    /// than not-found aborts the whole classification.
    pub async fn classify(
        &self,
        item: &ObjectReference,
        owners: &[OwnerReference],
    ) -> Result<ClassifiedReferences, ApiError> {
        let mut classified = ClassifiedReferences::default();

        for owner in owners {
            if self.absent_owner_cache.has(&owner.uid).await {
                log::debug!(
                    "[GarbageCollector] According to the absent owner cache, owner {} of {} does not exist",
                    owner.uid,
                    item
                );
                classified.dangling.push(owner.clone());
                continue;
            }

            let (resource, client) = match self.registry.client_for(&owner.api_version, &owner.kind)
            {
                Ok(found) => found,
                Err(e) if e.is_unknown_kind() => {
                    match self.unknown_kind_policy {
                        UnknownOwnerKindPolicy::Retry => return Err(e),
                        UnknownOwnerKindPolicy::TreatAsDangling => {
                            classified.dangling.push(owner.clone());
                        }
                        UnknownOwnerKindPolicy::TreatAsSolid => {
                            classified.solid.push(owner.clone());
                        }
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Owners of namespaced dependents live in the dependent's namespace.
            let namespace = if resource.namespaced {
                item.namespace.as_str()
            } else {
                ""
            };
            let live = match client.get(namespace, &owner.name).await {
                Ok(live) => live,
                Err(e) if e.is_not_found() => {
                    self.absent_owner_cache.add(owner.uid).await;
                    log::debug!(
                        "[GarbageCollector] Owner {}/{} of {} is not found",
                        owner.kind,
                        owner.name,
                        item
                    );
                    classified.dangling.push(owner.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };

            if live.metadata.uid != owner.uid {
                self.absent_owner_cache.add(owner.uid).await;
                log::debug!(
                    "[GarbageCollector] Owner {}/{} of {} was replaced (uid {} -> {})",
                    owner.kind,
                    owner.name,
                    item,
                    owner.uid,
                    live.metadata.uid
                );
                classified.dangling.push(owner.clone());
                continue;
            }

            if live.metadata.is_being_deleted()
                && live.metadata.has_finalizer(&Finalizer::DeletingDependents)
            {
                classified.waiting_for_dependents_deletion.push(owner.clone());
            } else {
                classified.solid.push(owner.clone());
            }
        }

        Ok(classified)
    }
}
