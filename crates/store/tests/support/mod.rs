//! In-memory `MetadataSource` with call counters and a controllable watch.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use kinship_core::{Gvk, MetaEvent, MetaList, MetadataSource, ObjMeta, ObjectRef, OwnerRef, ResolveError, ResourceHandle, Result};
use tokio::sync::mpsc;

pub const NS: &str = "default";

pub fn pod_ref(name: &str, uid: &str) -> ObjectRef { ObjectRef::new("v1", "Pod", NS, name, uid) }
pub fn rs_ref(name: &str, uid: &str) -> ObjectRef { ObjectRef::new("apps/v1", "ReplicaSet", NS, name, uid) }
pub fn deploy_ref(name: &str, uid: &str) -> ObjectRef { ObjectRef::new("apps/v1", "Deployment", NS, name, uid) }

pub fn owner(r: &ObjectRef) -> OwnerRef {
    OwnerRef { api_version: r.api_version.clone(), kind: r.kind.clone(), name: r.name.clone(), uid: r.uid.clone(), controller: true }
}

pub fn meta(r: ObjectRef, owners: &[&ObjectRef]) -> ObjMeta {
    ObjMeta { reference: r, owners: owners.iter().map(|o| owner(o)).collect(), resource_version: Some("1".into()) }
}

#[derive(Default)]
pub struct Calls {
    pub resolve: AtomicUsize,
    pub list: AtomicUsize,
    pub watch: AtomicUsize,
    pub get: AtomicUsize,
}

impl Calls {
    pub fn resolve(&self) -> usize { self.resolve.load(Ordering::SeqCst) }
    pub fn list(&self) -> usize { self.list.load(Ordering::SeqCst) }
    pub fn watch(&self) -> usize { self.watch.load(Ordering::SeqCst) }
    pub fn get(&self) -> usize { self.get.load(Ordering::SeqCst) }
}

#[derive(Default)]
pub struct FakeSource {
    pub calls: Calls,
    objects: Mutex<Vec<ObjMeta>>,
    /// uids left out of list responses, as if created after the list.
    hidden: Mutex<HashSet<String>>,
    failing_lists: Mutex<HashSet<String>>,
    failing_gets: Mutex<HashSet<String>>,
    slow_gets: Mutex<HashMap<String, Duration>>,
    list_delay: Mutex<Option<Duration>>,
    watchers: Mutex<Vec<(String, mpsc::UnboundedSender<Result<MetaEvent>>)>>,
    /// Resource version passed to each watch call, in call order.
    watch_rvs: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn new() -> Self { Self::default() }

    pub fn with(objects: Vec<ObjMeta>) -> Self {
        let s = Self::default();
        *s.objects.lock().unwrap() = objects;
        s
    }

    pub fn insert(&self, m: ObjMeta) { self.objects.lock().unwrap().push(m); }

    pub fn hide(&self, uid: &str) { self.hidden.lock().unwrap().insert(uid.to_string()); }

    /// Fail lists of `kind`.
    pub fn fail_list(&self, kind: &str) { self.failing_lists.lock().unwrap().insert(kind.to_string()); }

    /// Fail direct gets of `name`.
    pub fn fail_get(&self, name: &str) { self.failing_gets.lock().unwrap().insert(name.to_string()); }

    pub fn slow_get(&self, name: &str, d: Duration) { self.slow_gets.lock().unwrap().insert(name.to_string(), d); }

    pub fn slow_list(&self, d: Duration) { *self.list_delay.lock().unwrap() = Some(d); }

    /// Push an event to every open watch of `kind`.
    pub fn emit(&self, kind: &str, ev: MetaEvent) {
        for (k, tx) in self.watchers.lock().unwrap().iter() {
            if k == kind {
                let _ = tx.send(Ok(ev.clone()));
            }
        }
    }

    /// Push a stream error to every open watch of `kind`.
    pub fn emit_err(&self, kind: &str, err: ResolveError) {
        for (k, tx) in self.watchers.lock().unwrap().iter() {
            if k == kind {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }

    /// End every open watch of `kind`, as a server timeout would.
    pub fn close_watches(&self, kind: &str) { self.watchers.lock().unwrap().retain(|(k, _)| k != kind); }

    pub fn watch_rvs(&self) -> Vec<String> { self.watch_rvs.lock().unwrap().clone() }

    /// Watches whose consumer is still alive.
    pub fn open_watches(&self) -> usize { self.watchers.lock().unwrap().iter().filter(|(_, tx)| !tx.is_closed()).count() }

    fn handle(gvk: &Gvk) -> Option<ResourceHandle> {
        let (plural, namespaced) = match gvk.kind.as_str() {
            "Pod" => ("pods", true),
            "ReplicaSet" => ("replicasets", true),
            "Deployment" => ("deployments", true),
            "Job" => ("jobs", true),
            "Node" => ("nodes", false),
            _ => return None,
        };
        Some(ResourceHandle { gvk: gvk.clone(), plural: plural.to_string(), namespaced })
    }

    fn matches(m: &ObjMeta, handle: &ResourceHandle, namespace: &str) -> bool {
        m.reference.kind == handle.gvk.kind && (!handle.namespaced || m.reference.namespace == namespace)
    }
}

#[async_trait::async_trait]
impl MetadataSource for FakeSource {
    async fn resolve_kind(&self, gvk: &Gvk) -> Result<ResourceHandle> {
        self.calls.resolve.fetch_add(1, Ordering::SeqCst);
        Self::handle(gvk).ok_or_else(|| ResolveError::KindResolution { kind: gvk.to_string(), message: "no such kind".into() })
    }

    async fn list(&self, handle: &ResourceHandle, namespace: &str) -> Result<MetaList> {
        self.calls.list.fetch_add(1, Ordering::SeqCst);
        let delay = *self.list_delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if self.failing_lists.lock().unwrap().contains(&handle.gvk.kind) {
            return Err(ResolveError::Fetch(format!("list {}: boom", handle.gvk)));
        }
        let hidden = self.hidden.lock().unwrap().clone();
        let items = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|m| Self::matches(m, handle, namespace) && !hidden.contains(&m.reference.uid))
            .cloned()
            .collect();
        Ok(MetaList { items, resource_version: Some("100".into()) })
    }

    async fn watch(&self, handle: &ResourceHandle, _namespace: &str, rv: &str) -> Result<BoxStream<'static, Result<MetaEvent>>> {
        self.calls.watch.fetch_add(1, Ordering::SeqCst);
        self.watch_rvs.lock().unwrap().push(rv.to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().unwrap().push((handle.gvk.kind.clone(), tx));
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) }).boxed())
    }

    async fn get(&self, handle: &ResourceHandle, namespace: &str, name: &str) -> Result<Option<ObjMeta>> {
        self.calls.get.fetch_add(1, Ordering::SeqCst);
        let delay = self.slow_gets.lock().unwrap().get(name).copied();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if self.failing_gets.lock().unwrap().contains(name) {
            return Err(ResolveError::Fetch(format!("get {}: connection refused", name)));
        }
        let found = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .find(|m| Self::matches(m, handle, namespace) && m.reference.name == name)
            .cloned();
        Ok(found)
    }
}

/// Pod p1 -> ReplicaSet rs1 (r1) -> Deployment d1 (d1).
pub fn pod_chain() -> (FakeSource, ObjMeta) {
    let deploy = deploy_ref("d1", "d1");
    let rs = rs_ref("rs1", "r1");
    let pod = meta(pod_ref("web-1", "p1"), &[&rs]);
    let source = FakeSource::with(vec![meta(rs.clone(), &[&deploy]), meta(deploy, &[]), pod.clone()]);
    (source, pod)
}
