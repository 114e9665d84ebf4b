//! Deduplicating owner-tree resolver.
//!
//! Every uid gets one resolution record. The first caller computes the tree;
//! concurrent and later callers wait on the same record and observe the same
//! tree or error. Rejected records are never retried.

use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture, FutureExt};
use kinship_core::{MetadataSource, ObjMeta, ObjectRef, OwnerTree, Promise, ResolveError, Result};
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::cache::KindCache;
use crate::lock;

type Record = Promise<OwnerTree, ResolveError>;

/// Resolves objects to their ownership trees, sharing work across callers by uid.
///
/// Owns its [`KindCache`]; construct once and share behind an `Arc`.
pub struct OwnerResolver {
    cache: KindCache,
    records: Mutex<FxHashMap<String, Arc<Record>>>,
}

impl OwnerResolver {
    pub fn new(source: Arc<dyn MetadataSource>) -> Self {
        Self { cache: KindCache::new(source), records: Mutex::new(FxHashMap::default()) }
    }

    pub fn cache(&self) -> &KindCache { &self.cache }

    /// Tree of a live object whose metadata is already in hand.
    pub async fn owner_tree_of(&self, object: &ObjMeta) -> Result<OwnerTree> {
        if object.reference.uid.is_empty() {
            return Err(missing_uid());
        }
        self.resolve(object.reference.clone(), Some(object.clone())).await
    }

    /// Tree of the object behind a reference, fetching its metadata as needed.
    pub async fn owner_tree_of_ref(&self, reference: &ObjectRef) -> Result<OwnerTree> {
        self.resolve(reference.clone(), None).await
    }

    /// Number of resolution records, settled or not.
    pub fn records(&self) -> usize { lock(&self.records).len() }

    /// Number of resolutions still in flight.
    pub fn pending(&self) -> usize { lock(&self.records).values().filter(|r| !r.is_settled()).count() }

    pub fn shutdown(&self) { self.cache.shutdown() }

    fn resolve(&self, reference: ObjectRef, known: Option<ObjMeta>) -> BoxFuture<'_, Result<OwnerTree>> {
        async move {
            if reference.uid.is_empty() {
                return Err(missing_uid());
            }
            let (record, created) = self.record_for(&reference.uid);
            if !created {
                counter!("kinship_resolve_total", 1u64, "outcome" => "shared");
                return record.wait().await;
            }
            let guard = RecordGuard { resolver: self, uid: &reference.uid, record: &record, settled: false };
            let result = self.compute(&reference, known).await;
            counter!("kinship_resolve_total", 1u64, "outcome" => if result.is_ok() { "ok" } else { "error" });
            guard.settle(result.clone());
            result
        }
        .boxed()
    }

    /// Get or create the record for `uid`; `true` means the caller must settle it.
    fn record_for(&self, uid: &str) -> (Arc<Record>, bool) {
        let mut records = lock(&self.records);
        match records.get(uid) {
            Some(r) => (Arc::clone(r), false),
            None => {
                let r = Arc::new(Record::new());
                records.insert(uid.to_string(), Arc::clone(&r));
                (r, true)
            }
        }
    }

    async fn compute(&self, reference: &ObjectRef, known: Option<ObjMeta>) -> Result<OwnerTree> {
        let meta = match known {
            Some(m) => m,
            None => match self.fetch_meta(reference).await? {
                Some(m) => m,
                None => {
                    debug!(obj = %reference, uid = %reference.uid, "owner not found; leaf");
                    counter!("kinship_resolve_total", 1u64, "outcome" => "dangling");
                    return Ok(OwnerTree::leaf(reference.clone()));
                }
            },
        };
        let owners = join_all(meta.owner_refs().map(|o| self.resolve(o, None))).await;
        let owners = owners.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(OwnerTree { reference: reference.clone(), owners })
    }

    async fn fetch_meta(&self, reference: &ObjectRef) -> Result<Option<ObjMeta>> {
        let handle = self.cache.resolve_kind(&reference.gvk()).await?;
        let key = self.cache.ensure_started(&handle, &reference.namespace).await;
        if let Some(m) = self.cache.lookup(&key, &reference.uid) {
            return Ok(Some(m));
        }
        debug!(obj = %reference, uid = %reference.uid, "cache miss; fetching directly");
        match self.cache.fetch_direct(&handle, &reference.namespace, &reference.name).await? {
            Some(m) if m.reference.uid == reference.uid => Ok(Some(m)),
            Some(m) => {
                // Same name, different object: the referenced one is gone.
                debug!(obj = %reference, want = %reference.uid, found = %m.reference.uid, "uid mismatch; treating as not found");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

fn missing_uid() -> ResolveError {
    ResolveError::InvalidInput("can only resolve owners of objects that exist in the cluster".to_string())
}

/// Settles a record on every exit path. Dropped unsettled (the resolving
/// future was cancelled), it releases waiters with `Cancelled` and forgets
/// the record so a later call starts over.
struct RecordGuard<'a> {
    resolver: &'a OwnerResolver,
    uid: &'a str,
    record: &'a Arc<Record>,
    settled: bool,
}

impl RecordGuard<'_> {
    fn settle(mut self, result: Result<OwnerTree>) {
        self.record.settle(result);
        self.settled = true;
    }
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!(uid = %self.uid, "owner resolution dropped before completing");
        let mut records = lock(&self.resolver.records);
        if records.get(self.uid).is_some_and(|r| Arc::ptr_eq(r, self.record)) {
            records.remove(self.uid);
        }
        drop(records);
        self.record.reject(ResolveError::Cancelled);
    }
}
