//! Per (kind, namespace) metadata cache: one bulk list, then one long-lived watch.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use kinship_core::{Gvk, KindKey, MetaEvent, MetadataSource, ObjMeta, Promise, ResolveError, ResourceHandle, Result};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::lock;

/// A watch that closes this fast without delivering anything is treated as broken.
const MIN_WATCH_LIFETIME: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindState {
    /// Initial list in flight.
    Fetching,
    /// Listed; kept current by the watch.
    Ready,
    /// Initial list failed; the entry stays empty.
    Failed,
}

struct KindEntry {
    started: Promise<(), ResolveError>,
    metas: Mutex<FxHashMap<String, ObjMeta>>,
}

impl KindEntry {
    fn new() -> Self { Self { started: Promise::new(), metas: Mutex::new(FxHashMap::default()) } }

    fn apply(&self, ev: MetaEvent) {
        match ev {
            MetaEvent::Applied(m) => {
                counter!("kinship_watch_events_total", 1u64, "type" => "applied");
                lock(&self.metas).insert(m.reference.uid.clone(), m);
            }
            MetaEvent::Deleted(m) => {
                counter!("kinship_watch_events_total", 1u64, "type" => "deleted");
                lock(&self.metas).remove(&m.reference.uid);
            }
            MetaEvent::Bookmark(_) => {}
        }
    }
}

/// Near-real-time `uid -> metadata` maps, one per (kind, namespace) pair.
///
/// Entries are created on first use and live until `shutdown`.
pub struct KindCache {
    source: Arc<dyn MetadataSource>,
    entries: Mutex<FxHashMap<KindKey, Arc<KindEntry>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KindCache {
    pub fn new(source: Arc<dyn MetadataSource>) -> Self {
        Self { source, entries: Mutex::new(FxHashMap::default()), tasks: Mutex::new(Vec::new()) }
    }

    pub async fn resolve_kind(&self, gvk: &Gvk) -> Result<ResourceHandle> { self.source.resolve_kind(gvk).await }

    /// Start the list+watch for this pair if nobody has, then wait for the initial list.
    ///
    /// List failures are logged, never returned: the entry just stays empty.
    pub async fn ensure_started(&self, handle: &ResourceHandle, namespace: &str) -> KindKey {
        let key = KindKey::new(handle, namespace);
        let (entry, created) = {
            let mut entries = lock(&self.entries);
            match entries.get(&key) {
                Some(e) => (Arc::clone(e), false),
                None => {
                    let e = Arc::new(KindEntry::new());
                    entries.insert(key.clone(), Arc::clone(&e));
                    (e, true)
                }
            }
        };
        if created {
            let task = tokio::spawn(subscribe(Arc::clone(&self.source), handle.clone(), key.clone(), Arc::clone(&entry)));
            lock(&self.tasks).push(task);
        }
        let _ = entry.started.wait().await;
        key
    }

    pub fn state(&self, key: &KindKey) -> Option<KindState> {
        let entry = lock(&self.entries).get(key).cloned()?;
        let state = match entry.started.peek() {
            None => KindState::Fetching,
            Some(Ok(())) => KindState::Ready,
            Some(Err(_)) => KindState::Failed,
        };
        Some(state)
    }

    pub fn lookup(&self, key: &KindKey, uid: &str) -> Option<ObjMeta> {
        let entry = lock(&self.entries).get(key).cloned();
        let hit = entry.and_then(|e| lock(&e.metas).get(uid).cloned());
        counter!("kinship_cache_lookup_total", 1u64, "result" => if hit.is_some() { "hit" } else { "miss" });
        hit
    }

    /// Point lookup that bypasses the cache. `Ok(None)` means not found.
    pub async fn fetch_direct(&self, handle: &ResourceHandle, namespace: &str, name: &str) -> Result<Option<ObjMeta>> {
        self.source.get(handle, namespace, name).await
    }

    /// Number of (kind, namespace) pairs with a subscription.
    pub fn tracked_kinds(&self) -> usize { lock(&self.entries).len() }

    /// Number of cached objects for one pair.
    pub fn len(&self, key: &KindKey) -> usize {
        lock(&self.entries).get(key).map(|e| lock(&e.metas).len()).unwrap_or(0)
    }

    /// Abort every background subscription. Callers still waiting on an initial list get released.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for entry in lock(&self.entries).values() {
            entry.started.reject(ResolveError::Cancelled);
        }
        info!(subscriptions = tasks.len(), "kind cache shut down");
    }
}

async fn subscribe(source: Arc<dyn MetadataSource>, handle: ResourceHandle, key: KindKey, entry: Arc<KindEntry>) {
    let list = match source.list(&handle, &key.namespace).await {
        Ok(list) => list,
        Err(e) => {
            warn!(kind = %key, error = %e, "initial metadata list failed; lookups fall back to direct fetches");
            entry.started.reject(e);
            return;
        }
    };
    let count = list.items.len();
    {
        let mut metas = lock(&entry.metas);
        for m in list.items {
            metas.insert(m.reference.uid.clone(), m);
        }
    }
    entry.started.resolve(());
    info!(kind = %key, count, "kind cache ready");

    let Some(mut rv) = list.resource_version else {
        warn!(kind = %key, "list carried no resource version; not watching");
        return;
    };
    loop {
        let mut stream = match source.watch(&handle, &key.namespace, &rv).await {
            Ok(s) => s,
            Err(e) => {
                warn!(kind = %key, error = %e, "metadata watch failed; cache stops updating");
                return;
            }
        };
        let opened = Instant::now();
        let mut delivered = 0usize;
        while let Some(ev) = stream.next().await {
            match ev {
                Ok(ev) => {
                    if let Some(v) = ev.resource_version() {
                        rv = v.to_string();
                    }
                    delivered += 1;
                    entry.apply(ev);
                }
                Err(e) => {
                    warn!(kind = %key, error = %e, "metadata watch broke; cache stops updating");
                    return;
                }
            }
        }
        if delivered == 0 && opened.elapsed() < MIN_WATCH_LIFETIME {
            warn!(kind = %key, "metadata watch closed immediately; cache stops updating");
            return;
        }
        debug!(kind = %key, rv = %rv, delivered, "watch closed by server; resuming");
    }
}
