//! Kubernetes prepuller
//!
//! Every schedulable node gets one throwaway pod per image, pinned to it
//! with `nodeName` and `imagePullPolicy: Always`, so that the node's image
//! cache is warm before users spawn Labs there. Nodes are worked on in
//! parallel; the images of one node are pulled one after another.

mod cluster;
mod pod;
mod run;

pub use cluster::{ClusterApi, KubeCluster};
pub use pod::{build_pod_spec, pod_name, JobState, PullJob};
pub use run::{NodeReport, PrepullReport};

use crate::{
    config::{NodePolicy, PrepullerConfig, DASK_NODE_LABEL, LAB_NODE_LABEL},
    error::*,
    registry::HttpClient,
    scan,
    tag::Bucket,
    ImageName,
};
use k8s_openapi::api::core::v1::Node;
use pod::{name_of, phase_of, terminal_state};
use run::{Cancel, Limits};
use std::{collections::BTreeMap, sync::Arc};

pub struct Prepuller<C: ?Sized> {
    cluster: Arc<C>,
    config: PrepullerConfig,
    namespace: String,
    images: Vec<ImageName>,
    nodes: Vec<String>,
    jobs: BTreeMap<String, Vec<PullJob>>,
}

impl<C> Prepuller<C>
where
    C: ClusterApi + ?Sized + 'static,
{
    /// Prepuller of the images listed in `config`
    pub fn new(cluster: Arc<C>, config: PrepullerConfig) -> Result<Self> {
        let namespace = match &config.namespace {
            Some(namespace) => namespace.clone(),
            None => cluster.default_namespace().to_string(),
        };
        let mut prepuller = Prepuller {
            cluster,
            config,
            namespace,
            images: Vec::new(),
            nodes: Vec::new(),
            jobs: BTreeMap::new(),
        };
        prepuller.limits()?;
        let images = prepuller.config.images.clone();
        prepuller.add_images(&images)?;
        Ok(prepuller)
    }

    pub fn config(&self) -> &PrepullerConfig {
        &self.config
    }

    /// Namespace the pull pods run in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Images to pull, deduplicated and sorted
    pub fn images(&self) -> &[ImageName] {
        &self.images
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn jobs(&self) -> &BTreeMap<String, Vec<PullJob>> {
        &self.jobs
    }

    /// Add images, completing `library/` and `:latest` where omitted
    pub fn add_images<S: AsRef<str>>(&mut self, images: &[S]) -> Result<()> {
        for image in images {
            self.images.push(ImageName::parse(image.as_ref())?);
        }
        self.images.sort_by_key(|image| image.to_string());
        self.images.dedup();
        Ok(())
    }

    /// Scan the configured repository and add the selected daily, weekly
    /// and release images
    pub fn update_images_from_repo<H: HttpClient>(&mut self, http: H) -> Result<()> {
        let scan_config = match &self.config.scan {
            Some(scan_config) => scan_config.clone(),
            None => {
                log::debug!("No repository configured, skipping scan");
                return Ok(());
            }
        };
        log::debug!("Scanning '{}' for images", scan_config.tags_url());
        let prefix = scan_config.image_host_prefix();
        let result = scan::scan(scan_config, http)?;
        let images: Vec<String> = [Bucket::Daily, Bucket::Weekly, Bucket::Release]
            .iter()
            .flat_map(|bucket| result.selected(*bucket))
            .map(|tag| format!("{}{}:{}", prefix, result.repository(), tag.name))
            .collect();
        log::debug!("Images from repository: {:?}", images);
        self.add_images(&images)
    }

    /// List nodes that can run Lab pods
    ///
    /// Unschedulable nodes, nodes tainted `NoSchedule`, and nodes rejected by
    /// [NodePolicy] are left out.
    pub fn build_nodelist(&mut self) -> Result<&[String]> {
        log::debug!("Getting schedulable node list");
        let nodes = self
            .cluster
            .list_nodes()
            .map_err(|source| Error::ClusterQuery {
                resource: "nodes",
                source,
            })?;
        self.nodes = nodes
            .iter()
            .filter(|node| is_schedulable(node))
            .filter(|node| !self.reject_by_label(node))
            .filter_map(|node| node.metadata.name.clone())
            .collect();
        log::debug!("Schedulable nodes: {:?}", self.nodes);
        Ok(&self.nodes)
    }

    /// Whether the label policy keeps Labs off `node`
    pub fn reject_by_label(&self, node: &Node) -> bool {
        reject_by_label(&self.config.node_policy, node)
    }

    /// One job per node and image, in image order within each node
    pub fn build_pod_specs(&mut self) -> &BTreeMap<String, Vec<PullJob>> {
        self.jobs = self
            .nodes
            .iter()
            .map(|node| {
                let jobs = self
                    .images
                    .iter()
                    .map(|image| PullJob::new(image, node, &self.config.command))
                    .collect();
                (node.clone(), jobs)
            })
            .collect();
        &self.jobs
    }

    fn limits(&self) -> Result<Limits> {
        Ok(Limits {
            poll_interval: self.config.poll_interval()?,
            max_tries: self.config.max_tries.max(1),
            timeout: self.config.timeout(),
        })
    }

    /// Run every job, in parallel across nodes
    ///
    /// A node that fails stops pulling, the others carry on. Fails with
    /// [Error::PrepullTimeout] when the whole run exceeds the configured
    /// timeout, after deleting every pod it may have left behind.
    pub fn run_pods(&self) -> Result<PrepullReport> {
        run::run_jobs(
            Arc::clone(&self.cluster),
            &self.namespace,
            &self.jobs,
            self.limits()?,
        )
    }

    /// Delete pods of this prepuller's jobs in phase `Succeeded` or `Failed`
    ///
    /// Other pods are never touched. Returns the names of deleted pods.
    pub fn clean_completed_pods(&self) -> Result<Vec<String>> {
        let namespace = &self.namespace;
        let pods = self
            .cluster
            .list_pods(namespace)
            .map_err(|source| Error::ClusterQuery {
                resource: "pods",
                source,
            })?;
        let mut deleted = Vec::new();
        for pod in &pods {
            let name = match name_of(pod) {
                Some(name) if self.owns_pod(name) => name,
                _ => continue,
            };
            let phase = phase_of(pod);
            if terminal_state(phase).is_none() {
                log::debug!("Pod '{}' {}; not cleaning", name, phase.unwrap_or("Unknown"));
                continue;
            }
            log::debug!("Pod '{}' {}; cleaning", name, phase.unwrap_or("Unknown"));
            if cluster::delete_pod(&*self.cluster, namespace, name)? {
                deleted.push(name.to_string());
            }
        }
        Ok(deleted)
    }

    fn owns_pod(&self, name: &str) -> bool {
        self.jobs.values().flatten().any(|job| job.pod_name == name)
    }

    /// Delete a pod. A pod which is already gone is not an error.
    pub fn delete_pod(&self, name: &str) -> Result<()> {
        cluster::delete_pod(&*self.cluster, &self.namespace, name)?;
        Ok(())
    }

    /// Poll a pod until it is `Succeeded` or `Failed`, then delete it
    pub fn wait_for_pod(&self, name: &str) -> Result<JobState> {
        let state = run::wait_for_pod(
            &*self.cluster,
            &self.namespace,
            name,
            &self.limits()?,
            &Cancel::default(),
        )?;
        if state != JobState::Deleted {
            self.delete_pod(name)?;
        }
        Ok(state)
    }
}

fn is_schedulable(node: &Node) -> bool {
    let name = node.metadata.name.as_deref().unwrap_or("Node Name Unknown");
    let spec = match &node.spec {
        Some(spec) => spec,
        None => return true,
    };
    if spec.unschedulable == Some(true) {
        log::debug!("Node '{}' is unschedulable", name);
        return false;
    }
    let no_schedule = spec
        .taints
        .iter()
        .flatten()
        .any(|taint| taint.effect == "NoSchedule");
    if no_schedule {
        log::debug!("Node '{}' is tainted NoSchedule", name);
        return false;
    }
    true
}

fn reject_by_label(policy: &NodePolicy, node: &Node) -> bool {
    if !policy.restrict_lab_nodes {
        return false;
    }
    let name = node.metadata.name.as_deref().unwrap_or("Node Name Unknown");
    let labels = match &node.metadata.labels {
        Some(labels) if !labels.is_empty() => labels,
        _ => {
            log::debug!("Nodes are not labelled");
            return false;
        }
    };
    let is_ok = |label: &str| labels.get(label).map(String::as_str) == Some("ok");
    if is_ok(LAB_NODE_LABEL) {
        log::debug!("Node '{}' is allowed for Lab usage", name);
        return false;
    }
    if !policy.allow_dask_spawn {
        log::debug!("Lab spawn not allowed for node '{}'", name);
        return true;
    }
    if !policy.restrict_dask_nodes || is_ok(DASK_NODE_LABEL) {
        log::debug!("Node '{}' is allowed for Dask usage", name);
        return false;
    }
    log::debug!("Lab/Dask spawn not allowed for node '{}'", name);
    true
}

/// Prepull `images`, in addition to those of `config`, on every eligible node
///
/// Builds the node list and pod specs, runs them, then clears completed pods.
pub fn prepull<C, S>(cluster: Arc<C>, images: &[S], config: PrepullerConfig) -> Result<PrepullReport>
where
    C: ClusterApi + ?Sized + 'static,
    S: AsRef<str>,
{
    let mut prepuller = Prepuller::new(cluster, config)?;
    prepuller.add_images(images)?;
    prepuller.build_nodelist()?;
    prepuller.build_pod_specs();
    let report = prepuller.run_pods()?;
    prepuller.clean_completed_pods()?;
    Ok(report)
}
