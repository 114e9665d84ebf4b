//! Kinship core types: object identity, ownership trees and the metadata capability

#![forbid(unsafe_code)]

use std::fmt;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod promise;
pub mod tree;

pub use promise::Promise;
pub use tree::OwnerTree;

/// Immutable identity of a cluster object.
///
/// `uid` is the only safe join key: names can be reused after deletion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// `v1`, `apps/v1`, ...
    pub api_version: String,
    pub kind: String,
    /// Empty for cluster-scoped objects.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl ObjectRef {
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str, uid: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
        }
    }

    pub fn gvk(&self) -> Gvk { Gvk::from_api_version(&self.api_version, &self.kind) }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Owner reference as declared in an object's metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    /// Set when the owner is the managing controller.
    #[serde(default)]
    pub controller: bool,
}

/// Lightweight object metadata: identity plus declared owners.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjMeta {
    pub reference: ObjectRef,
    pub owners: SmallVec<[OwnerRef; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl ObjMeta {
    /// References to the declared owners, in declaration order.
    ///
    /// Owners live in the dependent's namespace; the metadata source ignores
    /// it for cluster-scoped owner kinds.
    pub fn owner_refs(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.owners.iter().map(move |o| ObjectRef {
            api_version: o.api_version.clone(),
            kind: o.kind.clone(),
            namespace: self.reference.namespace.clone(),
            name: o.name.clone(),
            uid: o.uid.clone(),
        })
    }
}

/// Group/version/kind triple. The core group is the empty string.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Self { group, version, kind: kind.to_string() }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// A kind resolved to something the metadata source can list, watch and get.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    pub gvk: Gvk,
    /// Plural resource name, e.g. `replicasets`.
    pub plural: String,
    pub namespaced: bool,
}

/// Key of one resource-kind cache entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct KindKey {
    pub gvk: Gvk,
    /// Always empty for cluster-scoped kinds.
    pub namespace: String,
}

impl KindKey {
    pub fn new(handle: &ResourceHandle, namespace: &str) -> Self {
        let namespace = if handle.namespaced { namespace.to_string() } else { String::new() };
        Self { gvk: handle.gvk.clone(), namespace }
    }
}

impl fmt::Display for KindKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() { write!(f, "{}", self.gvk) } else { write!(f, "{}@{}", self.gvk, self.namespace) }
    }
}

/// Result of a bulk metadata listing.
#[derive(Debug, Clone, Default)]
pub struct MetaList {
    pub items: Vec<ObjMeta>,
    /// Version to start the follow-up watch from.
    pub resource_version: Option<String>,
}

/// Incremental change delivered by a metadata watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaEvent {
    /// Added or modified.
    Applied(ObjMeta),
    Deleted(ObjMeta),
    Bookmark(String),
}

impl MetaEvent {
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            MetaEvent::Applied(m) | MetaEvent::Deleted(m) => m.resource_version.as_deref(),
            MetaEvent::Bookmark(rv) => Some(rv.as_str()),
        }
    }
}

/// Errors surfaced by owner resolution and metadata sources.
///
/// `Clone` because a settled resolution hands the same error to every waiter.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("kind resolution failed for {kind}: {message}")]
    KindResolution { kind: String, message: String },
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("resolution cancelled before completion")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Remote access to lightweight object metadata.
///
/// Implementations ignore `namespace` for cluster-scoped handles.
#[async_trait::async_trait]
pub trait MetadataSource: Send + Sync {
    /// Map a kind to a queryable resource.
    async fn resolve_kind(&self, gvk: &Gvk) -> Result<ResourceHandle>;

    /// Bulk listing of every object of a kind in a namespace.
    async fn list(&self, handle: &ResourceHandle, namespace: &str) -> Result<MetaList>;

    /// Changes after `resource_version`. The stream ends when the server closes the watch.
    async fn watch(
        &self,
        handle: &ResourceHandle,
        namespace: &str,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<MetaEvent>>>;

    /// Point lookup; `Ok(None)` when the object does not exist.
    async fn get(&self, handle: &ResourceHandle, namespace: &str, name: &str) -> Result<Option<ObjMeta>>;
}

pub mod prelude {
    pub use super::{
        Gvk, KindKey, MetaEvent, MetaList, MetadataSource, ObjMeta, ObjectRef, OwnerRef, OwnerTree, Promise,
        ResolveError, ResourceHandle,
    };
}
