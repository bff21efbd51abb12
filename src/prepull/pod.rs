use crate::ImageName;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use kube::api::ObjectMeta;
use std::fmt;

/// Longest Kubernetes container name (a DNS-1123 label)
const MAX_CONTAINER_NAME: usize = 63;

/// Lifecycle of one pull job
///
/// ```text
/// Built -> Submitted -> Succeeded | Failed -> Deleted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Built,
    Submitted,
    Succeeded,
    Failed,
    Deleted,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Built => "built",
            JobState::Submitted => "submitted",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Pull of one image on one node
#[derive(Debug, Clone, PartialEq)]
pub struct PullJob {
    pub image: ImageName,
    pub node: String,
    pub pod_name: String,
    pub pod: Pod,
}

impl PullJob {
    pub fn new(image: &ImageName, node: &str, command: &[String]) -> Self {
        PullJob {
            image: image.clone(),
            node: node.to_string(),
            pod_name: pod_name(image, node),
            pod: build_pod_spec(image, node, command),
        }
    }
}

/// `pp-<image>-<last component of the node name>`
///
/// Stays the same across runs so that pods left over by an earlier run are
/// found again.
pub fn pod_name(image: &ImageName, node: &str) -> String {
    let suffix = node.rsplit('-').next().unwrap_or(node);
    format!("pp-{}-{}", image.pod_component(), suffix)
}

fn container_name(image: &ImageName) -> String {
    let mut name = image.pod_component();
    name.truncate(MAX_CONTAINER_NAME);
    name.trim_end_matches('-').to_string()
}

/// A pod pinned to `node` which only forces `image` to be pulled
pub fn build_pod_spec(image: &ImageName, node: &str, command: &[String]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(image, node)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: container_name(image),
                image: Some(image.to_string()),
                image_pull_policy: Some("Always".to_string()),
                command: Some(command.to_vec()),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Name of a pod object
pub(crate) fn name_of(pod: &Pod) -> Option<&str> {
    pod.metadata.name.as_deref()
}

/// `status.phase` of a pod
pub(crate) fn phase_of(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// Whether a phase is `Succeeded` or `Failed`
pub(crate) fn terminal_state(phase: Option<&str>) -> Option<JobState> {
    match phase {
        Some("Succeeded") => Some(JobState::Succeeded),
        Some("Failed") => Some(JobState::Failed),
        _ => None,
    }
}
