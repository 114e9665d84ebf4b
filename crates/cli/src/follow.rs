//! Pod following: report status changes of the pods a target owns until one runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kinship_core::{ObjMeta, OwnerTree};
use kinship_store::OwnerResolver;
use kube::{
    runtime::watcher::{self, Event},
    Api, Client, ResourceExt,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::Output;

/// Label carrying the hash of the pod template a rollout stamped on its pods.
pub(crate) const DEFAULT_HASH_LABEL: &str = "tilt.dev/pod-template-hash";

pub(crate) fn pod_phase(pod: &Pod) -> String {
    if pod.metadata.deletion_timestamp.is_some() {
        return "Terminating".to_string();
    }
    pod.status.as_ref().and_then(|s| s.phase.clone()).unwrap_or_default()
}

/// State of the first container: waiting/terminated reason, or `Running`.
pub(crate) fn container_status(pod: &Pod) -> String {
    let state = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.first())
        .and_then(|c| c.state.as_ref());
    let Some(state) = state else { return String::new() };
    if let Some(w) = &state.waiting {
        w.reason.clone().unwrap_or_default()
    } else if state.running.is_some() {
        "Running".to_string()
    } else if let Some(t) = &state.terminated {
        t.reason.clone().unwrap_or_default()
    } else {
        String::new()
    }
}

pub(crate) fn age_secs(pod: &Pod, now: DateTime<Utc>) -> f64 {
    match &pod.metadata.creation_timestamp {
        Some(t) => (now - t.0).num_milliseconds() as f64 / 1000.0,
        None => 0.0,
    }
}

/// Last reported (phase, container status) per pod name.
#[derive(Default)]
struct Tracker {
    seen: HashMap<String, (String, String)>,
}

impl Tracker {
    /// Record a status; `false` when it matches the last one reported for this pod.
    fn observe(&mut self, pod: &str, phase: &str, container: &str) -> bool {
        let next = (phase.to_string(), container.to_string());
        if self.seen.get(pod) == Some(&next) {
            return false;
        }
        self.seen.insert(pod.to_string(), next);
        true
    }
}

/// Only pods stamped with this template hash count toward the rollout.
#[derive(Debug, Clone)]
pub(crate) struct TemplateFilter {
    pub label: String,
    pub hash: String,
}

impl TemplateFilter {
    fn matches(&self, pod: &Pod) -> bool { pod.labels().get(&self.label) == Some(&self.hash) }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Verdict {
    /// An owned pod whose status changed.
    Status { pod: String, phase: String, container: String, age: f64 },
    /// An owned pod from another rollout; reported once per pod.
    Ignored { pod: String },
}

impl Verdict {
    fn is_success(&self) -> bool {
        matches!(self, Verdict::Status { phase, container, .. } if phase == "Running" && container == "Running")
    }
}

#[derive(Debug)]
pub(crate) enum Step {
    /// First sighting of a pod: its tree must be resolved before anything is reported.
    Resolve(ObjMeta),
    Report(Option<Verdict>),
}

/// Pod bookkeeping for `follow`, fed in watch order.
///
/// Trees are resolved out of band, but reports are always built from the most
/// recent copy of a pod, so late trees never surface stale statuses.
pub(crate) struct Follower {
    target_uid: String,
    filter: Option<TemplateFilter>,
    latest: HashMap<String, Pod>,
    /// uid -> whether the pod's tree contains the target.
    owned: HashMap<String, bool>,
    requested: HashSet<String>,
    ignored: HashSet<String>,
    tracker: Tracker,
}

impl Follower {
    pub(crate) fn new(target_uid: &str, filter: Option<TemplateFilter>) -> Self {
        Self {
            target_uid: target_uid.to_string(),
            filter,
            latest: HashMap::new(),
            owned: HashMap::new(),
            requested: HashSet::new(),
            ignored: HashSet::new(),
            tracker: Tracker::default(),
        }
    }

    pub(crate) fn applied(&mut self, pod: Pod) -> Step {
        let meta = kinship_kubehub::obj_meta(&pod, &());
        let uid = meta.reference.uid.clone();
        self.latest.insert(uid.clone(), pod);
        if self.owned.contains_key(&uid) {
            return Step::Report(self.evaluate(&uid));
        }
        if self.requested.insert(uid) {
            Step::Resolve(meta)
        } else {
            Step::Report(None)
        }
    }

    pub(crate) fn resolved(&mut self, uid: &str, tree: &OwnerTree) -> Option<Verdict> {
        self.owned.insert(uid.to_string(), tree.contains_uid(&self.target_uid));
        self.evaluate(uid)
    }

    /// Final report for a deleted pod, then forget it.
    pub(crate) fn deleted(&mut self, pod: Pod) -> Option<Verdict> {
        let uid = pod.metadata.uid.clone().unwrap_or_default();
        let verdict = if self.owned.contains_key(&uid) {
            self.latest.insert(uid.clone(), pod);
            self.evaluate(&uid)
        } else {
            None
        };
        self.latest.remove(&uid);
        self.owned.remove(&uid);
        self.requested.remove(&uid);
        verdict
    }

    fn evaluate(&mut self, uid: &str) -> Option<Verdict> {
        if self.owned.get(uid) != Some(&true) {
            return None;
        }
        let pod = self.latest.get(uid)?;
        let name = pod.name_any();
        if let Some(filter) = &self.filter {
            if !filter.matches(pod) {
                return self.ignored.insert(name.clone()).then_some(Verdict::Ignored { pod: name });
            }
        }
        let (phase, container) = (pod_phase(pod), container_status(pod));
        let age = age_secs(pod, Utc::now());
        self.tracker
            .observe(&name, &phase, &container)
            .then_some(Verdict::Status { pod: name, phase, container, age })
    }
}

/// Print a verdict; `true` once the rollout succeeded.
fn emit(output: Output, verdict: Option<Verdict>) -> bool {
    let Some(verdict) = verdict else { return false };
    match (&verdict, output) {
        (Verdict::Status { pod, phase, container, age }, Output::Human) => {
            println!("Pod: {} | Phase: {} | Container: {} | Age: {:.3}s", pod, phase, container, age)
        }
        (Verdict::Status { pod, phase, container, age }, Output::Json) => println!(
            "{}",
            serde_json::json!({ "pod": pod, "phase": phase, "container": container, "age_secs": age })
        ),
        (Verdict::Ignored { pod }, Output::Human) => {
            println!("Pod: {} | Ignoring | (pod template hash doesn't match)", pod)
        }
        (Verdict::Ignored { pod }, Output::Json) => {
            println!("{}", serde_json::json!({ "pod": pod, "ignored": true }))
        }
    }
    if !verdict.is_success() {
        return false;
    }
    match output {
        Output::Human => println!("Success"),
        Output::Json => println!("{}", serde_json::json!({ "success": true })),
    }
    true
}

fn spawn_resolve(resolver: &Arc<OwnerResolver>, meta: ObjMeta, tx: &mpsc::UnboundedSender<(String, OwnerTree)>) {
    let (resolver, tx) = (Arc::clone(resolver), tx.clone());
    tokio::spawn(async move {
        match resolver.owner_tree_of(&meta).await {
            Ok(tree) => {
                let _ = tx.send((meta.reference.uid, tree));
            }
            Err(e) => warn!(pod = %meta.reference, error = %e, "resolving pod owners failed"),
        }
    });
}

/// Watch pods in `namespace` and report those whose ownership tree contains `target`.
///
/// Returns once a matching pod is running with a running first container, or on Ctrl-C.
pub(crate) async fn run(
    client: Client,
    resolver: Arc<OwnerResolver>,
    target: ObjMeta,
    namespace: &str,
    filter: Option<TemplateFilter>,
    timeout: Option<Duration>,
    output: Output,
) -> Result<()> {
    info!(target = %target.reference, uid = %target.reference.uid, ns = %namespace, filter = ?filter, "following owned pods");

    let api: Api<Pod> = Api::namespaced(client, namespace);
    let mut events = watcher::watcher(api, watcher::Config::default()).boxed();
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, OwnerTree)>();
    let deadline = async {
        match timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let mut follower = Follower::new(&target.reference.uid, filter);

    loop {
        let mut pods = Vec::new();
        tokio::select! {
            ev = events.next() => match ev {
                Some(Ok(Event::Applied(pod))) => pods.push(pod),
                Some(Ok(Event::Restarted(list))) => {
                    debug!(count = list.len(), "pod watch restart");
                    pods = list;
                }
                Some(Ok(Event::Deleted(pod))) => {
                    debug!(pod = %pod.name_any(), "pod deleted");
                    if emit(output, follower.deleted(pod)) {
                        return Ok(());
                    }
                }
                Some(Err(e)) => warn!(error = %e, "pod watch error"),
                None => bail!("pod watch ended"),
            },
            Some((uid, tree)) = rx.recv() => {
                if emit(output, follower.resolved(&uid, &tree)) {
                    return Ok(());
                }
            }
            _ = &mut deadline => {
                bail!(
                    "timed out after {}s waiting for a running pod owned by {}",
                    timeout.map(|d| d.as_secs()).unwrap_or_default(),
                    target.reference
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received; stopping");
                return Ok(());
            }
        }
        for pod in pods {
            match follower.applied(pod) {
                Step::Resolve(meta) => spawn_resolve(&resolver, meta, &tx),
                Step::Report(verdict) => {
                    if emit(output, verdict) {
                        return Ok(());
                    }
                }
            }
        }
    }
}
