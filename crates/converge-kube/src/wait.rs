//! Waiting on cluster state
//!
//! Each helper fetches through a [`ResourceClient`], classifies with a core
//! observer and hands the predicate to [`poll_with`] or [`await_all_with`].
//! Fetch errors never end a wait early; only the observer can declare a
//! fatal state.

use std::fmt;

use converge_core::observer::PatternInLog;
use converge_core::{
    await_all_with, observe, observe_absence, poll_with, Observer, ObserverState, PollContext,
    PollSpec, Snapshot,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactRecorder;
use crate::client::ResourceClient;
use crate::resource::ResourceKind;
use crate::Error;

/// A single named resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    /// Resource kind
    pub kind: ResourceKind,
    /// Namespace (empty for cluster-scoped kinds)
    pub namespace: String,
    /// Resource name
    pub name: String,
}

impl ObjectRef {
    /// Reference a namespaced resource
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Reference a cluster-scoped resource
    pub fn cluster(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::new(kind, "", name)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.kind, self.name)
        } else {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Wait until `observer` accepts the resource, returning the converged snapshot
pub async fn wait_for_object<O>(
    client: &dyn ResourceClient,
    spec: &PollSpec,
    ctx: &PollContext,
    target: &ObjectRef,
    observer: &O,
) -> Result<Snapshot, Error>
where
    O: Observer<Snapshot> + ?Sized,
{
    let last: Mutex<Option<Snapshot>> = Mutex::new(None);

    let result = poll_with(spec, ctx, || async {
        let fetched = client
            .get(&target.kind, &target.namespace, &target.name)
            .await;
        if let Ok(snapshot) = &fetched {
            *last.lock().await = Some(snapshot.clone());
        }
        observe(fetched, observer)
    })
    .await;

    result.into_result()?;
    info!(target = %target, "Resource converged");
    last.into_inner()
        .ok_or_else(|| Error::not_found(target.kind.kind, &target.name))
}

/// Wait until `observer` accepts the list of resources matching `label_selector`
pub async fn wait_for_list<O>(
    client: &dyn ResourceClient,
    spec: &PollSpec,
    ctx: &PollContext,
    kind: &ResourceKind,
    namespace: &str,
    label_selector: &str,
    observer: &O,
) -> Result<Vec<Snapshot>, Error>
where
    O: Observer<Vec<Snapshot>> + ?Sized,
{
    let last: Mutex<Vec<Snapshot>> = Mutex::new(Vec::new());

    let result = poll_with(spec, ctx, || async {
        let fetched = client.list(kind, namespace, label_selector).await;
        if let Ok(items) = &fetched {
            *last.lock().await = items.clone();
        }
        observe(fetched, observer)
    })
    .await;

    result.into_result()?;
    Ok(last.into_inner())
}

/// Wait for at least one resource to match `label_selector`
pub async fn wait_for_non_empty(
    client: &dyn ResourceClient,
    spec: &PollSpec,
    ctx: &PollContext,
    kind: &ResourceKind,
    namespace: &str,
    label_selector: &str,
) -> Result<Vec<Snapshot>, Error> {
    let non_empty = |items: &Vec<Snapshot>| {
        if items.is_empty() {
            ObserverState::Pending
        } else {
            ObserverState::Converged
        }
    };
    wait_for_list(client, spec, ctx, kind, namespace, label_selector, &non_empty).await
}

/// Wait until exactly one resource matches `label_selector` and `observer` accepts it
pub async fn wait_for_single<O>(
    client: &dyn ResourceClient,
    spec: &PollSpec,
    ctx: &PollContext,
    kind: &ResourceKind,
    namespace: &str,
    label_selector: &str,
    observer: &O,
) -> Result<Snapshot, Error>
where
    O: Observer<Snapshot> + ?Sized,
{
    let single = |items: &Vec<Snapshot>| match items.as_slice() {
        [only] => observer.classify(only),
        _ => ObserverState::Pending,
    };
    let mut items =
        wait_for_list(client, spec, ctx, kind, namespace, label_selector, &single).await?;
    items
        .pop()
        .ok_or_else(|| Error::not_found(kind.kind, label_selector))
}

/// Delete-side wait: converged once the resource reads as not found
pub async fn wait_for_absence(
    client: &dyn ResourceClient,
    spec: &PollSpec,
    ctx: &PollContext,
    target: &ObjectRef,
) -> Result<(), Error> {
    let result = poll_with(spec, ctx, || async {
        let fetched = client
            .get(&target.kind, &target.namespace, &target.name)
            .await;
        observe_absence(fetched, Error::is_not_found)
    })
    .await;

    result.into_result()?;
    info!(target = %target, "Resource is gone");
    Ok(())
}

/// Wait until every pod's log contains all of `observer`'s patterns
///
/// Each fetched log is recorded as `pod_<name>_output.log`. A pod whose log
/// matched is not fetched again. Recording failures are logged and ignored.
pub async fn wait_for_logs(
    client: &dyn ResourceClient,
    recorder: &dyn ArtifactRecorder,
    spec: &PollSpec,
    ctx: &PollContext,
    namespace: &str,
    pods: Vec<String>,
    observer: &PatternInLog,
) -> Result<(), Error> {
    let result = await_all_with(spec, ctx, pods, |pod: String| async move {
        let fetched = client.logs(namespace, &pod).await;
        if let Ok(text) = &fetched {
            let name = format!("pod_{}_output.log", pod);
            if let Err(e) = recorder.record_text(&name, text).await {
                warn!(pod = %pod, error = %e, "Failed to record pod log");
            }
            let missing = observer.missing(text);
            if !missing.is_empty() {
                debug!(pod = %pod, missing = ?missing, "Log patterns not seen yet");
            }
        }
        observe(fetched, observer)
    })
    .await;

    info!(
        label = %spec.label(),
        converged = result.converged.len(),
        rounds = result.rounds,
        "Log barrier finished"
    );
    result.into_result()?;
    Ok(())
}
