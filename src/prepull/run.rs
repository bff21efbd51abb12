//! Per-node workers and the coordinator holding the global deadline

use super::{
    cluster::{delete_pod, ClusterApi},
    pod::{phase_of, terminal_state, JobState, PullJob},
};
use crate::error::*;
use std::{
    collections::{BTreeMap, HashSet},
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{self, RecvTimeoutError, Sender},
        Arc, Condvar, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

/// Bounds of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Limits {
    pub poll_interval: Duration,
    pub max_tries: u32,
    pub timeout: Duration,
}

/// Stops sleeping workers as soon as it is raised
#[derive(Debug, Clone, Default)]
pub(crate) struct Cancel(Arc<(Mutex<bool>, Condvar)>);

impl Cancel {
    pub fn cancel(&self) {
        let (flag, cond) = &*self.0;
        *flag.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.0;
        *flag.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `duration`, returning `true` if cancelled meanwhile
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, cond) = &*self.0;
        let guard = flag.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = cond
            .wait_timeout_while(guard, duration, |cancelled| !*cancelled)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// Outcome of the jobs of one node
#[derive(Debug)]
pub struct NodeReport {
    pub node: String,
    /// Pod name and the last known state of each job, in pull order
    pub jobs: Vec<(String, JobState)>,
    /// Why the node stopped early
    pub error: Option<Error>,
}

impl NodeReport {
    fn new(node: &str, jobs: &[PullJob]) -> Self {
        NodeReport {
            node: node.to_string(),
            jobs: jobs
                .iter()
                .map(|j| (j.pod_name.clone(), JobState::Built))
                .collect(),
            error: None,
        }
    }

    fn set_state(&mut self, pod_name: &str, state: JobState) {
        if let Some(job) = self.jobs.iter_mut().find(|(name, _)| name == pod_name) {
            job.1 = state;
        }
    }

    /// Every job was pulled and its pod succeeded
    pub fn is_success(&self) -> bool {
        self.error.is_none()
            && self
                .jobs
                .iter()
                .all(|(_, state)| *state == JobState::Deleted)
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &str> {
        self.jobs
            .iter()
            .filter(|(_, state)| *state == JobState::Failed)
            .map(|(name, _)| name.as_str())
    }
}

/// Result of [super::Prepuller::run_pods]
#[derive(Debug, Default)]
pub struct PrepullReport {
    pub nodes: Vec<NodeReport>,
}

impl PrepullReport {
    pub fn node(&self, node: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.node == node)
    }

    /// Fail with the names of the nodes which did not pull everything
    pub fn ensure_success(&self) -> Result<()> {
        let failed: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| !n.is_success())
            .map(|n| n.node.clone())
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::NodeFailures(failed))
        }
    }
}

enum Event {
    State {
        node: String,
        pod_name: String,
        state: JobState,
    },
    NodeDone {
        node: String,
        error: Option<Error>,
    },
}

/// Poll a pod until it reaches a terminal phase
pub(crate) fn wait_for_pod<C: ClusterApi + ?Sized>(
    cluster: &C,
    namespace: &str,
    pod_name: &str,
    limits: &Limits,
    cancel: &Cancel,
) -> Result<JobState> {
    let mut tries = 1;
    loop {
        let pod = match cluster.read_pod(namespace, pod_name) {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                log::warn!("Pod '{}' vanished while waiting for it", pod_name);
                return Ok(JobState::Deleted);
            }
            Err(source) => {
                return Err(Error::PodLifecycle {
                    operation: "read",
                    pod: pod_name.to_string(),
                    namespace: namespace.to_string(),
                    source,
                })
            }
        };
        let phase = phase_of(&pod);
        if let Some(state) = terminal_state(phase) {
            if state == JobState::Failed {
                log::error!("Pod '{}' failed", pod_name);
            }
            return Ok(state);
        }
        if tries >= limits.max_tries {
            let err = Error::PollExhausted {
                pod: pod_name.to_string(),
                tries: limits.max_tries,
                delay: limits.poll_interval,
            };
            log::error!("{}", err);
            return Err(err);
        }
        log::debug!(
            "Wait {:?} [{}/{}] for pod '{}' [{}]",
            limits.poll_interval,
            tries,
            limits.max_tries,
            pod_name,
            phase.unwrap_or("Unknown")
        );
        if cancel.sleep(limits.poll_interval) {
            return Err(Error::Cancelled);
        }
        tries += 1;
    }
}

struct Worker<C: ?Sized> {
    cluster: Arc<C>,
    namespace: String,
    node: String,
    limits: Limits,
    cancel: Cancel,
    events: Sender<Event>,
}

impl<C: ClusterApi + ?Sized> Worker<C> {
    fn send(&self, pod_name: &str, state: JobState) {
        // The coordinator is gone after a timeout
        let _ = self.events.send(Event::State {
            node: self.node.clone(),
            pod_name: pod_name.to_string(),
            state,
        });
    }

    /// Pull images one at a time, stopping at the first fatal error
    fn run(&self, jobs: &[PullJob]) -> Result<()> {
        log::debug!("Running pods for node {}", self.node);
        for job in jobs {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            log::debug!("Running pod '{}' for node '{}'", job.pod_name, self.node);
            self.submit(job)?;
            if self.cancel.is_cancelled() {
                // Created after the coordinator swept the cluster
                self.discard(&job.pod_name);
                return Err(Error::Cancelled);
            }
            self.send(&job.pod_name, JobState::Submitted);

            let state = match wait_for_pod(
                &*self.cluster,
                &self.namespace,
                &job.pod_name,
                &self.limits,
                &self.cancel,
            ) {
                Ok(state) => state,
                Err(e @ (Error::PollExhausted { .. } | Error::Cancelled)) => {
                    // The stuck pod must not outlive the run
                    self.discard(&job.pod_name);
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            if state != JobState::Deleted {
                delete_pod(&*self.cluster, &self.namespace, &job.pod_name)?;
            }
            // A failed pull is reported, not retried
            let reported = if state == JobState::Failed {
                JobState::Failed
            } else {
                JobState::Deleted
            };
            self.send(&job.pod_name, reported);
        }
        Ok(())
    }

    /// Best-effort deletion of a pod this worker gives up on
    fn discard(&self, pod_name: &str) {
        if let Err(e) = delete_pod(&*self.cluster, &self.namespace, pod_name) {
            log::error!("{}", e);
        }
    }

    fn submit(&self, job: &PullJob) -> Result<()> {
        match self.cluster.create_pod(&self.namespace, &job.pod) {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                log::info!("Pod '{}' already exists", job.pod_name);
                Ok(())
            }
            Err(source) => Err(Error::PodLifecycle {
                operation: "create",
                pod: job.pod_name.clone(),
                namespace: self.namespace.clone(),
                source,
            }),
        }
    }
}

/// Run every node's jobs on its own thread, bounded by `limits.timeout`
///
/// On timeout every pod not confirmed deleted is deleted, whether or not it
/// was ever created, and the workers are left to notice the cancellation.
pub(crate) fn run_jobs<C>(
    cluster: Arc<C>,
    namespace: &str,
    jobs: &BTreeMap<String, Vec<PullJob>>,
    limits: Limits,
) -> Result<PrepullReport>
where
    C: ClusterApi + ?Sized + 'static,
{
    // No deadline when the timeout is beyond what `Instant` can represent
    let deadline = Instant::now().checked_add(limits.timeout);
    let cancel = Cancel::default();
    let (tx, rx) = mpsc::channel();

    let mut reports: BTreeMap<String, NodeReport> = BTreeMap::new();
    let mut handles = Vec::new();
    for (node, node_jobs) in jobs {
        reports.insert(node.clone(), NodeReport::new(node, node_jobs));
        let worker = Worker {
            cluster: Arc::clone(&cluster),
            namespace: namespace.to_string(),
            node: node.clone(),
            limits,
            cancel: cancel.clone(),
            events: tx.clone(),
        };
        let node_jobs = node_jobs.clone();
        let handle = thread::Builder::new()
            .name(format!("prepull-{}", node))
            .spawn(move || {
                let error = match panic::catch_unwind(AssertUnwindSafe(|| worker.run(&node_jobs))) {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(_) => Some(Error::NodeFailures(vec![worker.node.clone()])),
                };
                let _ = worker.events.send(Event::NodeDone {
                    node: worker.node.clone(),
                    error,
                });
            })?;
        handles.push(handle);
    }
    drop(tx);

    let mut pending: HashSet<String> = jobs.keys().cloned().collect();
    let mut deleted: HashSet<String> = HashSet::new();
    while !pending.is_empty() {
        let event = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    Err(RecvTimeoutError::Timeout)
                } else {
                    rx.recv_timeout(deadline - now)
                }
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match event {
            Ok(Event::State {
                node,
                pod_name,
                state,
            }) => {
                if matches!(state, JobState::Deleted | JobState::Failed) {
                    deleted.insert(pod_name.clone());
                }
                if let Some(report) = reports.get_mut(&node) {
                    report.set_state(&pod_name, state);
                }
            }
            Ok(Event::NodeDone { node, error }) => {
                match &error {
                    Some(e) => log::error!("Prepull on node '{}' failed: {}", node, e),
                    None => log::info!("Prepull on node '{}' complete", node),
                }
                pending.remove(&node);
                if let Some(report) = reports.get_mut(&node) {
                    report.error = error;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                log::error!("Did not complete in {:?}. Terminating.", limits.timeout);
                cancel.cancel();
                destroy_pods(&*cluster, namespace, jobs, &deleted);
                return Err(Error::PrepullTimeout(limits.timeout));
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for handle in handles {
        if handle.join().is_err() {
            log::error!("Prepull worker panicked");
        }
    }
    Ok(PrepullReport {
        nodes: reports.into_values().collect(),
    })
}

/// Best-effort deletion of every constructed pod not known to be gone
fn destroy_pods<C: ClusterApi + ?Sized>(
    cluster: &C,
    namespace: &str,
    jobs: &BTreeMap<String, Vec<PullJob>>,
    deleted: &HashSet<String>,
) {
    let remaining = jobs
        .values()
        .flatten()
        .filter(|job| !deleted.contains(&job.pod_name));
    for job in remaining {
        if let Err(e) = delete_pod(cluster, namespace, &job.pod_name) {
            log::error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_wakes_sleeper() {
        let cancel = Cancel::default();
        let sleeper = cancel.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || sleeper.sleep(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(30));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn uncancelled_sleep() {
        assert!(!Cancel::default().sleep(Duration::from_millis(1)));
    }
}
