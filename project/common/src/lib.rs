use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};
use uuid::Uuid;

pub mod deletion;

pub use deletion::{
    DeleteOptions, DeleteOutcome, DeletePropagationPolicy, MetadataPatch, PatchOperation,
    PreconditionFailed, Preconditions,
};

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct TypeMeta {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(rename = "kind")]
    pub kind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: Uuid,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(
        rename = "ownerReferences",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub owner_references: Option<Vec<OwnerReference>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizers: Option<Vec<Finalizer>>,
    #[serde(
        rename = "deletionTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn owner_references(&self) -> &[OwnerReference] {
        self.owner_references.as_deref().unwrap_or_default()
    }

    pub fn has_finalizer(&self, finalizer: &Finalizer) -> bool {
        self.finalizers
            .as_ref()
            .is_some_and(|finalizers| finalizers.contains(finalizer))
    }

    pub fn add_finalizer(&mut self, finalizer: Finalizer) {
        let finalizers = self.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.contains(&finalizer) {
            finalizers.push(finalizer);
        }
    }

    pub fn remove_finalizer(&mut self, finalizer: &Finalizer) {
        if let Some(finalizers) = self.finalizers.as_mut() {
            finalizers.retain(|f| f != finalizer);
            if finalizers.is_empty() {
                self.finalizers = None;
            }
        }
    }

    pub fn is_being_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// An object marked for deletion whose last finalizer is gone must be
    /// removed from storage.
    pub fn ready_for_removal(&self) -> bool {
        self.is_being_deleted() && self.finalizers.as_ref().is_none_or(|f| f.is_empty())
    }
}

/// A reference from a dependent object to the object that owns it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct OwnerReference {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: Uuid,
    #[serde(default)]
    pub controller: bool,
    #[serde(
        rename = "blockOwnerDeletion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub block_owner_deletion: Option<bool>,
}

impl OwnerReference {
    pub fn blocks_owner_deletion(&self) -> bool {
        self.block_owner_deletion.unwrap_or(false)
    }
}

/// Finalizers understood by the garbage collector. Any other string is kept
/// verbatim so objects written by other controllers survive a round trip.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum Finalizer {
    DeletingDependents,
    OrphanDependents,
    Custom(String),
}

impl From<String> for Finalizer {
    fn from(value: String) -> Self {
        match value.as_str() {
            "DeletingDependents" => Finalizer::DeletingDependents,
            "OrphanDependents" => Finalizer::OrphanDependents,
            _ => Finalizer::Custom(value),
        }
    }
}

impl From<Finalizer> for String {
    fn from(value: Finalizer) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finalizer::DeletingDependents => write!(f, "DeletingDependents"),
            Finalizer::OrphanDependents => write!(f, "OrphanDependents"),
            Finalizer::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// The metadata-only view of an object. The garbage collector never needs
/// more than this, so stores hand it out instead of full bodies.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PartialObjectMeta {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
}

impl PartialObjectMeta {
    pub fn new(api_version: &str, kind: &str, metadata: ObjectMeta) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            metadata,
        }
    }

    pub fn uid(&self) -> Uuid {
        self.metadata.uid
    }

    pub fn group_version_kind(&self) -> GroupVersionKind {
        GroupVersionKind::from_api_version(&self.api_version, &self.kind)
    }
}

/// Splits `group/version` (or bare `version` for the core group).
fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

fn join_api_version(group: &str, version: &str) -> String {
    if group.is_empty() {
        version.to_string()
    } else {
        format!("{group}/{version}")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = split_api_version(api_version);
        Self {
            group,
            version,
            kind: kind.to_string(),
        }
    }

    pub fn api_version(&self) -> String {
        join_api_version(&self.group, &self.version)
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersionResource {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }

    pub fn api_version(&self) -> String {
        join_api_version(&self.group, &self.version)
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Resource={}", self.api_version(), self.resource)
    }
}

/// A servable resource type as reported by discovery.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ApiResource {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural lower-case name, e.g. `replicasets`.
    pub resource: String,
    #[serde(default = "default_namespaced")]
    pub namespaced: bool,
    /// Supported verbs. Empty means every verb.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verbs: Vec<String>,
}

fn default_namespaced() -> bool {
    true
}

impl ApiResource {
    pub fn new(group: &str, version: &str, kind: &str, resource: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            resource: resource.to_string(),
            namespaced,
            verbs: Vec::new(),
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::new(&self.group, &self.version, &self.kind)
    }

    pub fn gvr(&self) -> GroupVersionResource {
        GroupVersionResource::new(&self.group, &self.version, &self.resource)
    }

    pub fn api_version(&self) -> String {
        join_api_version(&self.group, &self.version)
    }

    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.is_empty() || self.verbs.iter().any(|v| v == verb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_splits_core_and_named_groups() {
        let core = GroupVersionKind::from_api_version("v1", "Pod");
        assert_eq!(core.group, "");
        assert_eq!(core.version, "v1");
        assert_eq!(core.api_version(), "v1");

        let apps = GroupVersionKind::from_api_version("apps/v1", "ReplicaSet");
        assert_eq!(apps.group, "apps");
        assert_eq!(apps.api_version(), "apps/v1");
        assert_eq!(apps.to_string(), "apps/v1, Kind=ReplicaSet");
    }

    #[test]
    fn unknown_finalizers_survive_yaml() {
        let yaml = r#"
name: web
namespace: default
uid: 6f0a1c4e-5c1e-4f3b-9a55-0d8c3d6c7e21
finalizers:
  - DeletingDependents
  - example.com/protect
"#;
        let meta: ObjectMeta = serde_yaml::from_str(yaml).unwrap();
        assert!(meta.has_finalizer(&Finalizer::DeletingDependents));
        assert!(meta.has_finalizer(&Finalizer::Custom("example.com/protect".to_string())));

        let out = serde_yaml::to_string(&meta).unwrap();
        assert!(out.contains("example.com/protect"));
        assert!(!out.contains("ownerReferences"));
    }

    #[test]
    fn removing_last_finalizer_clears_list() {
        let mut meta = ObjectMeta {
            finalizers: Some(vec![Finalizer::OrphanDependents]),
            deletion_timestamp: Some(Utc::now()),
            ..Default::default()
        };
        assert!(!meta.ready_for_removal());
        meta.remove_finalizer(&Finalizer::OrphanDependents);
        assert_eq!(meta.finalizers, None);
        assert!(meta.ready_for_removal());
    }
}
