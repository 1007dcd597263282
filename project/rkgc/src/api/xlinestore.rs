use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use common::{
    ApiResource, DeleteOptions, DeleteOutcome, MetadataPatch, ObjectMeta, PartialObjectMeta,
    PreconditionFailed,
};
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, KeyValue, Txn, TxnOp,
    WatchOptions,
};
use futures::{StreamExt, stream};
use tokio::sync::RwLock;

use super::{ApiError, ClusterClient, ObjectList, ResourceClient, WatchEvent, WatchStream};
use crate::protocol::config::XlineConfig;

/// XlineStore keeps objects as YAML documents in Xline (or any etcd v3
/// endpoint) under `{prefix}/{group/}{resource}/{namespace}/{name}`.
/// Cluster-scoped objects drop the namespace segment.
#[derive(Clone)]
pub struct XlineStore {
    client: Arc<RwLock<Client>>,
    prefix: String,
    resources: Arc<Vec<ApiResource>>,
}

impl XlineStore {
    /// Connects to the configured endpoints. `resources` is what discovery
    /// reports; Xline itself has no notion of resource types.
    pub async fn new(config: &XlineConfig, resources: Vec<ApiResource>) -> anyhow::Result<Self> {
        let options = match (&config.username, &config.password) {
            (Some(user), Some(password)) => {
                Some(ConnectOptions::new().with_user(user.clone(), password.clone()))
            }
            _ => None,
        };
        let client = Client::connect(config.endpoints.clone(), options).await?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
            prefix: config.prefix.trim_end_matches('/').to_string(),
            resources: Arc::new(resources),
        })
    }

    fn collection_prefix(&self, resource: &ApiResource) -> String {
        if resource.group.is_empty() {
            format!("{}/{}/", self.prefix, resource.resource)
        } else {
            format!("{}/{}/{}/", self.prefix, resource.group, resource.resource)
        }
    }

    fn object_key(&self, resource: &ApiResource, namespace: &str, name: &str) -> String {
        if resource.namespaced {
            format!("{}{namespace}/{name}", self.collection_prefix(resource))
        } else {
            format!("{}{name}", self.collection_prefix(resource))
        }
    }

    /// Writes a full object document. Used to seed objects; the collector
    /// itself only patches metadata.
    pub async fn put_object_yaml(&self, resource: &ApiResource, yaml: &str) -> anyhow::Result<()> {
        let obj: PartialObjectMeta = serde_yaml::from_str(yaml)?;
        let key = self.object_key(resource, &obj.metadata.namespace, &obj.metadata.name);
        self.client.write().await.put(key, yaml, None).await?;
        Ok(())
    }

    pub async fn get_object_yaml(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<String>> {
        let key = self.object_key(resource, namespace, name);
        let resp = self.client.write().await.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| String::from_utf8_lossy(kv.value()).to_string()))
    }

    pub async fn delete_collection(&self, resource: &ApiResource) -> anyhow::Result<()> {
        let prefix = self.collection_prefix(resource);
        self.client
            .write()
            .await
            .delete(prefix, Some(etcd_client::DeleteOptions::new().with_prefix()))
            .await?;
        Ok(())
    }

    async fn get_with_revision(
        &self,
        key: &str,
    ) -> Result<Option<(String, i64)>, ApiError> {
        let resp = self
            .client
            .write()
            .await
            .get(key, None)
            .await
            .map_err(ApiError::transport)?;
        Ok(resp.kvs().first().map(|kv| {
            (
                String::from_utf8_lossy(kv.value()).to_string(),
                kv.mod_revision(),
            )
        }))
    }

    /// Read-modify-write of an object's metadata, guarded by its mod revision.
    async fn mutate_meta<F>(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        apply: F,
    ) -> Result<(), ApiError>
    where
        F: FnOnce(&mut ObjectMeta) -> Result<DeleteOutcome, PreconditionFailed>,
    {
        let key = self.object_key(resource, namespace, name);
        let Some((origin_yaml, mod_revision)) = self.get_with_revision(&key).await? else {
            return Err(ApiError::not_found(resource, namespace, name));
        };
        let mut meta = parse_meta_from_yaml(&origin_yaml)?.metadata;
        let outcome = apply(&mut meta)
            .map_err(|e| ApiError::precondition(resource, namespace, name, e))?;

        let op = match outcome {
            DeleteOutcome::Unchanged => return Ok(()),
            DeleteOutcome::Remove => TxnOp::delete(key.clone(), None),
            DeleteOutcome::Update => {
                TxnOp::put(key.clone(), replace_meta(&origin_yaml, &meta)?, None)
            }
        };
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key.clone(),
                CompareOp::Equal,
                mod_revision,
            )])
            .and_then(vec![op]);
        let resp = self
            .client
            .write()
            .await
            .txn(txn)
            .await
            .map_err(ApiError::transport)?;
        if !resp.succeeded() {
            return Err(ApiError::conflict(
                resource,
                namespace,
                name,
                format!("object modified since revision {mod_revision}"),
            ));
        }
        Ok(())
    }
}

/// Extracts type and object metadata from a stored document, ignoring the
/// rest of the body.
pub fn parse_meta_from_yaml(yaml: &str) -> Result<PartialObjectMeta, ApiError> {
    Ok(serde_yaml::from_str::<PartialObjectMeta>(yaml)?)
}

/// Swaps the `metadata` mapping of a stored document, leaving spec and status
/// exactly as they were.
fn replace_meta(origin_yaml: &str, meta: &ObjectMeta) -> Result<String, ApiError> {
    let mut value: serde_yaml::Value = serde_yaml::from_str(origin_yaml)?;
    let updated = serde_yaml::to_value(meta)?;
    let mapping = value
        .as_mapping_mut()
        .ok_or_else(|| ApiError::Invalid("object is not a mapping".to_string()))?;
    mapping.insert(serde_yaml::Value::String("metadata".to_string()), updated);
    Ok(serde_yaml::to_string(&value)?)
}

fn decode(kv: &KeyValue) -> Option<PartialObjectMeta> {
    match parse_meta_from_yaml(&String::from_utf8_lossy(kv.value())) {
        Ok(obj) => Some(obj),
        Err(e) => {
            log::warn!(
                "[XlineStore] Skipping undecodable object at {}: {e}",
                String::from_utf8_lossy(kv.key())
            );
            None
        }
    }
}

fn convert_event(event: &etcd_client::Event, revision: i64) -> Option<Result<WatchEvent, ApiError>> {
    match event.event_type() {
        EventType::Put => {
            let kv = event.kv()?;
            let obj = decode(kv)?;
            if kv.create_revision() == kv.mod_revision() {
                Some(Ok(WatchEvent::Added(obj)))
            } else {
                Some(Ok(WatchEvent::Modified(obj)))
            }
        }
        EventType::Delete => {
            let key = event
                .kv()
                .map(|kv| String::from_utf8_lossy(kv.key()).into_owned())
                .unwrap_or_default();
            let prev = event
                .prev_kv()
                .map(|kv| String::from_utf8_lossy(kv.value()).into_owned());
            Some(deleted_event(&key, prev.as_deref(), revision))
        }
    }
}

/// The body of a deleted key only survives in the previous KV. Without it
/// the deleted object is unknown, so the watcher has to relist.
fn deleted_event(key: &str, prev: Option<&str>, revision: i64) -> Result<WatchEvent, ApiError> {
    let Some(yaml) = prev else {
        log::warn!("[XlineStore] Delete of {key} at revision {revision} carries no previous value, forcing relist");
        return Err(ApiError::Gone(revision));
    };
    parse_meta_from_yaml(yaml)
        .map(WatchEvent::Deleted)
        .map_err(|e| {
            log::warn!("[XlineStore] Undecodable previous value for deleted {key}: {e}, forcing relist");
            ApiError::Gone(revision)
        })
}

#[async_trait]
impl ClusterClient for XlineStore {
    async fn discover(&self) -> Result<Vec<ApiResource>, ApiError> {
        Ok(self.resources.as_ref().clone())
    }

    fn resource_client(&self, resource: &ApiResource) -> Arc<dyn ResourceClient> {
        Arc::new(XlineResourceClient {
            store: self.clone(),
            resource: resource.clone(),
        })
    }
}

struct XlineResourceClient {
    store: XlineStore,
    resource: ApiResource,
}

#[async_trait]
impl ResourceClient for XlineResourceClient {
    async fn list(&self) -> Result<ObjectList, ApiError> {
        let prefix = self.store.collection_prefix(&self.resource);
        let resp = self
            .store
            .client
            .write()
            .await
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(ApiError::transport)?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        Ok(ObjectList {
            items: resp.kvs().iter().filter_map(decode).collect(),
            revision,
        })
    }

    async fn watch(&self, revision: i64) -> Result<WatchStream, ApiError> {
        let prefix = self.store.collection_prefix(&self.resource);
        let opts = WatchOptions::new()
            .with_prefix()
            .with_prev_key()
            .with_start_revision(revision + 1);
        let (watcher, stream) = self
            .store
            .client
            .write()
            .await
            .watch(prefix, Some(opts))
            .await
            .map_err(ApiError::transport)?;

        let events = stream::unfold(
            (watcher, stream, VecDeque::new()),
            move |(watcher, mut stream, mut pending)| async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((event, (watcher, stream, pending)));
                    }
                    match stream.message().await {
                        Ok(Some(resp)) => {
                            if resp.compact_revision() > 0 {
                                let err = ApiError::Gone(resp.compact_revision());
                                return Some((Err(err), (watcher, stream, pending)));
                            }
                            if resp.canceled() {
                                return None;
                            }
                            let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
                            pending.extend(
                                resp.events()
                                    .iter()
                                    .filter_map(|event| convert_event(event, revision)),
                            );
                        }
                        Ok(None) => return None,
                        Err(e) => {
                            return Some((
                                Err(ApiError::transport(e)),
                                (watcher, stream, pending),
                            ));
                        }
                    }
                }
            },
        );
        Ok(events.boxed())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<PartialObjectMeta, ApiError> {
        let key = self.store.object_key(&self.resource, namespace, name);
        match self.store.get_with_revision(&key).await? {
            Some((yaml, _)) => parse_meta_from_yaml(&yaml),
            None => Err(ApiError::not_found(&self.resource, namespace, name)),
        }
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &MetadataPatch,
    ) -> Result<(), ApiError> {
        self.store
            .mutate_meta(&self.resource, namespace, name, |meta| patch.apply(meta))
            .await
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), ApiError> {
        let now = chrono::Utc::now();
        self.store
            .mutate_meta(&self.resource, namespace, name, |meta| {
                meta.apply_delete(options, now)
            })
            .await
    }
}
