//! The narrow surface through which the collector talks to object storage.
//!
//! The collector never sees a concrete store: it enumerates resources through
//! [`ClusterClient::discover`], and for each resource gets a
//! [`ResourceClient`] able to list, watch, get, patch and delete objects as
//! [`PartialObjectMeta`] values.

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    ApiResource, DeleteOptions, GroupVersionKind, GroupVersionResource, MetadataPatch,
    PartialObjectMeta, PreconditionFailed,
};
use futures::stream::BoxStream;

pub mod memory;
pub mod registry;
pub mod xlinestore;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{resource} {namespace}/{name} not found")]
    NotFound {
        resource: String,
        namespace: String,
        name: String,
    },

    /// The write raced with another writer or a precondition did not hold.
    #[error("conflict on {resource} {namespace}/{name}: {message}")]
    Conflict {
        resource: String,
        namespace: String,
        name: String,
        message: String,
    },

    #[error("no resource serves {0}")]
    UnknownKind(GroupVersionKind),

    #[error("resource {0} is not registered")]
    UnknownResource(GroupVersionResource),

    /// The requested revision has been compacted away; the caller must relist.
    #[error("revision {0} is too old")]
    Gone(i64),

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

impl ApiError {
    pub fn not_found(resource: &ApiResource, namespace: &str, name: &str) -> Self {
        ApiError::NotFound {
            resource: resource.resource.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn conflict(
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        message: impl Into<String>,
    ) -> Self {
        ApiError::Conflict {
            resource: resource.resource.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub fn precondition(
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        err: PreconditionFailed,
    ) -> Self {
        Self::conflict(resource, namespace, name, err.to_string())
    }

    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        ApiError::Transport(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    pub fn is_unknown_kind(&self) -> bool {
        matches!(self, ApiError::UnknownKind(_))
    }
}

impl From<serde_yaml::Error> for ApiError {
    fn from(err: serde_yaml::Error) -> Self {
        ApiError::Invalid(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(PartialObjectMeta),
    Modified(PartialObjectMeta),
    Deleted(PartialObjectMeta),
}

/// A consistent listing and the revision to resume watching from.
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub items: Vec<PartialObjectMeta>,
    pub revision: i64,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, ApiError>>;

/// Object access for one resource type. Cluster-scoped resources ignore the
/// namespace argument.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn list(&self) -> Result<ObjectList, ApiError>;

    /// Streams every change made after `revision`.
    async fn watch(&self, revision: i64) -> Result<WatchStream, ApiError>;

    async fn get(&self, namespace: &str, name: &str) -> Result<PartialObjectMeta, ApiError>;

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &MetadataPatch,
    ) -> Result<(), ApiError>;

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), ApiError>;
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Every resource type the backend can serve.
    async fn discover(&self) -> Result<Vec<ApiResource>, ApiError>;

    fn resource_client(&self, resource: &ApiResource) -> Arc<dyn ResourceClient>;
}
