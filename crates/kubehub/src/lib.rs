//! Kinship kubehub – kind discovery and metadata list/watch/get over kube-rs

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{anyhow, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, ObjectMeta, PartialObjectMeta, WatchEvent, WatchParams},
    config::KubeConfigOptions,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client, Config, Resource,
};
use kinship_core::{Gvk, MetaEvent, MetaList, MetadataSource, ObjMeta, ObjectRef, OwnerRef, ResolveError, ResourceHandle};
use metrics::{counter, histogram};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Build a client from the default kubeconfig, or from a named context.
pub async fn connect(context: Option<&str>) -> Result<Client> {
    let config = match context {
        Some(ctx) => {
            let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
            Config::from_kubeconfig(&opts).await?
        }
        None => Config::infer().await?,
    };
    info!(cluster = %config.cluster_url, ns = %config.default_namespace, "kube config loaded");
    Ok(Client::try_from(config)?)
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<Gvk> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(Gvk { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(Gvk { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() })
        }
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Lightweight metadata of any typed object.
pub fn obj_meta<K: Resource>(obj: &K, dt: &K::DynamicType) -> ObjMeta {
    let api_version = K::api_version(dt);
    let kind = K::kind(dt);
    meta_from_parts(&api_version, &kind, obj.meta())
}

fn meta_from_parts(api_version: &str, kind: &str, meta: &ObjectMeta) -> ObjMeta {
    let owners = meta
        .owner_references
        .iter()
        .flatten()
        .map(|o| OwnerRef {
            api_version: o.api_version.clone(),
            kind: o.kind.clone(),
            name: o.name.clone(),
            uid: o.uid.clone(),
            controller: o.controller.unwrap_or(false),
        })
        .collect();
    ObjMeta {
        reference: ObjectRef {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            uid: meta.uid.clone().unwrap_or_default(),
        },
        owners,
        resource_version: meta.resource_version.clone(),
    }
}

/// Partial metadata carries no usable type info in list responses, so the kind comes from the handle.
fn meta_from_partial(handle: &ResourceHandle, pom: &PartialObjectMeta<DynamicObject>) -> ObjMeta {
    meta_from_parts(&handle.gvk.api_version(), &handle.gvk.kind, &pom.metadata)
}

fn api_resource(handle: &ResourceHandle) -> ApiResource {
    let gvk = GroupVersionKind::gvk(&handle.gvk.group, &handle.gvk.version, &handle.gvk.kind);
    ApiResource::from_gvk_with_plural(&gvk, &handle.plural)
}

fn fetch_err(op: &str, handle: &ResourceHandle, e: kube::Error) -> ResolveError {
    ResolveError::Fetch(format!("{} {}: {}", op, handle.gvk, e))
}

fn is_not_found(e: &kube::Error) -> bool { matches!(e, kube::Error::Api(ae) if ae.code == 404) }

/// `MetadataSource` backed by the cluster's metadata-only endpoints.
pub struct KubeMetadataSource {
    client: Client,
    kinds: RwLock<HashMap<Gvk, ResourceHandle>>,
}

impl KubeMetadataSource {
    pub fn new(client: Client) -> Self { Self { client, kinds: RwLock::new(HashMap::new()) } }

    pub fn client(&self) -> &Client { &self.client }

    fn api(&self, handle: &ResourceHandle, namespace: &str) -> Api<DynamicObject> {
        let ar = api_resource(handle);
        if handle.namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        }
    }
}

#[async_trait::async_trait]
impl MetadataSource for KubeMetadataSource {
    async fn resolve_kind(&self, gvk: &Gvk) -> kinship_core::Result<ResourceHandle> {
        if let Some(h) = self.kinds.read().await.get(gvk) {
            return Ok(h.clone());
        }
        let kube_gvk = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        let (ar, caps) = discovery::pinned_kind(&self.client, &kube_gvk)
            .await
            .map_err(|e| ResolveError::KindResolution { kind: gvk.to_string(), message: e.to_string() })?;
        let handle = ResourceHandle {
            gvk: gvk.clone(),
            plural: ar.plural,
            namespaced: matches!(caps.scope, Scope::Namespaced),
        };
        debug!(gvk = %gvk, plural = %handle.plural, namespaced = handle.namespaced, "kind resolved");
        self.kinds.write().await.insert(gvk.clone(), handle.clone());
        Ok(handle)
    }

    async fn list(&self, handle: &ResourceHandle, namespace: &str) -> kinship_core::Result<MetaList> {
        let started = Instant::now();
        let list = self
            .api(handle, namespace)
            .list_metadata(&ListParams::default())
            .await
            .map_err(|e| fetch_err("list", handle, e))?;
        histogram!("kinship_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        let items: Vec<_> = list.items.iter().map(|pom| meta_from_partial(handle, pom)).collect();
        debug!(gvk = %handle.gvk, ns = %namespace, count = items.len(), "metadata listed");
        Ok(MetaList { items, resource_version: list.metadata.resource_version })
    }

    async fn watch(
        &self,
        handle: &ResourceHandle,
        namespace: &str,
        resource_version: &str,
    ) -> kinship_core::Result<BoxStream<'static, kinship_core::Result<MetaEvent>>> {
        let stream = self
            .api(handle, namespace)
            .watch_metadata(&WatchParams::default(), resource_version)
            .await
            .map_err(|e| fetch_err("watch", handle, e))?;
        let handle = handle.clone();
        let events = stream.map(move |ev| match ev {
            Ok(WatchEvent::Added(pom)) | Ok(WatchEvent::Modified(pom)) => Ok(MetaEvent::Applied(meta_from_partial(&handle, &pom))),
            Ok(WatchEvent::Deleted(pom)) => Ok(MetaEvent::Deleted(meta_from_partial(&handle, &pom))),
            Ok(WatchEvent::Bookmark(bm)) => Ok(MetaEvent::Bookmark(bm.metadata.resource_version)),
            Ok(WatchEvent::Error(ae)) => Err(ResolveError::Fetch(format!("watch {}: {}", handle.gvk, ae))),
            Err(e) => Err(fetch_err("watch", &handle, e)),
        });
        Ok(events.boxed())
    }

    async fn get(&self, handle: &ResourceHandle, namespace: &str, name: &str) -> kinship_core::Result<Option<ObjMeta>> {
        counter!("kinship_direct_fetch_total", 1u64);
        match self.api(handle, namespace).get_metadata(name).await {
            Ok(pom) => Ok(Some(meta_from_partial(handle, &pom))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(fetch_err("get", handle, e)),
        }
    }
}
