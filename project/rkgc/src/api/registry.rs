use std::{collections::HashMap, sync::Arc};

use common::{ApiResource, GroupVersionKind, GroupVersionResource};

use super::{ApiError, ClusterClient, ResourceClient};

/// Resources the collector never watches even when discovery reports them:
/// they are either virtual, write-only, or too chatty to be worth tracking.
pub const IGNORED_RESOURCES: &[(&str, &str, &str)] = &[
    ("extensions", "v1beta1", "replicationcontrollers"),
    ("", "v1", "bindings"),
    ("", "v1", "componentstatuses"),
    ("", "v1", "events"),
    ("authentication.k8s.io", "v1beta1", "tokenreviews"),
    ("authorization.k8s.io", "v1beta1", "subjectaccessreviews"),
    ("authorization.k8s.io", "v1beta1", "selfsubjectaccessreviews"),
    ("authorization.k8s.io", "v1beta1", "localsubjectaccessreviews"),
];

pub const REQUIRED_VERBS: &[&str] = &["list", "watch", "get", "patch", "delete"];

pub fn is_ignored(gvr: &GroupVersionResource) -> bool {
    IGNORED_RESOURCES
        .iter()
        .any(|(g, v, r)| gvr.group == *g && gvr.version == *v && gvr.resource == *r)
}

/// Why a discovered resource is not watched, if it is not.
pub fn skip_reason(resource: &ApiResource) -> Option<String> {
    if is_ignored(&resource.gvr()) {
        return Some("ignored".to_string());
    }
    REQUIRED_VERBS
        .iter()
        .find(|v| !resource.supports(v))
        .map(|verb| format!("verb {verb} not supported"))
}

struct Entry {
    resource: ApiResource,
    client: Arc<dyn ResourceClient>,
    monitored: bool,
}

/// Maps resource descriptors to the clients that serve them, and kinds to
/// resources. Built once from discovery.
///
/// Every discovered resource can be resolved, so owners of any known kind
/// can be looked up. Only the resources passing [`skip_reason`] are
/// monitored.
#[derive(Default)]
pub struct ResourceRegistry {
    entries: HashMap<GroupVersionResource, Entry>,
    kinds: HashMap<GroupVersionKind, GroupVersionResource>,
}

impl ResourceRegistry {
    pub async fn discover(cluster: &dyn ClusterClient) -> Result<Self, ApiError> {
        let mut registry = Self::default();
        for resource in cluster.discover().await? {
            let client = cluster.resource_client(&resource);
            registry.register(resource, client);
        }
        Ok(registry)
    }

    pub fn register(&mut self, resource: ApiResource, client: Arc<dyn ResourceClient>) {
        let gvr = resource.gvr();
        let monitored = match skip_reason(&resource) {
            Some(reason) => {
                log::debug!("[ResourceRegistry] Not monitoring {gvr}: {reason}");
                false
            }
            None => true,
        };
        self.kinds.insert(resource.gvk(), gvr.clone());
        self.entries.insert(
            gvr,
            Entry {
                resource,
                client,
                monitored,
            },
        );
    }

    /// Resources that get a monitor.
    pub fn monitored_resources(&self) -> impl Iterator<Item = &ApiResource> {
        self.entries
            .values()
            .filter(|e| e.monitored)
            .map(|e| &e.resource)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn kind_for(&self, gvr: &GroupVersionResource) -> Result<GroupVersionKind, ApiError> {
        self.entries
            .get(gvr)
            .map(|e| e.resource.gvk())
            .ok_or_else(|| ApiError::UnknownResource(gvr.clone()))
    }

    pub fn resource_for(&self, gvk: &GroupVersionKind) -> Result<&ApiResource, ApiError> {
        self.kinds
            .get(gvk)
            .and_then(|gvr| self.entries.get(gvr))
            .map(|e| &e.resource)
            .ok_or_else(|| ApiError::UnknownKind(gvk.clone()))
    }

    /// Resolves `apiVersion`/`kind` as found in an owner reference.
    pub fn client_for(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<(ApiResource, Arc<dyn ResourceClient>), ApiError> {
        let gvk = GroupVersionKind::from_api_version(api_version, kind);
        let resource = self.resource_for(&gvk)?;
        let client = self.client(&resource.gvr())?;
        Ok((resource.clone(), client))
    }

    pub fn client(&self, gvr: &GroupVersionResource) -> Result<Arc<dyn ResourceClient>, ApiError> {
        self.entries
            .get(gvr)
            .map(|e| e.client.clone())
            .ok_or_else(|| ApiError::UnknownResource(gvr.clone()))
    }
}
