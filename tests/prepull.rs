use k8s_openapi::api::core::v1::{Node, NodeSpec, Pod, PodStatus, Taint};
use kube::api::ObjectMeta;
use labpuller::{
    config::PrepullerConfig,
    error::{ApiError, Error, Result},
    prepull::{ClusterApi, JobState},
    prepull, Prepuller,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

#[derive(Default)]
struct State {
    pods: BTreeMap<String, Pod>,
    reads: HashMap<String, u32>,
    created: Vec<String>,
    deleted: Vec<String>,
}

/// In-memory cluster
///
/// A submitted pod is `Pending` on its first read and `Succeeded` on the
/// next, unless it runs on a stuck node, where it stays `Pending`.
#[derive(Default)]
struct MockCluster {
    nodes: Vec<Node>,
    stuck_nodes: HashSet<String>,
    /// Nodes on which the API server rejects pod creation
    broken_nodes: HashSet<String>,
    /// Every create call takes this long to land
    create_delay: Option<Duration>,
    /// Deletes fail with a server error
    broken_delete: bool,
    state: Mutex<State>,
}

impl MockCluster {
    fn new(names: &[&str]) -> Self {
        MockCluster {
            nodes: names.iter().map(|name| node(name, None)).collect(),
            ..Default::default()
        }
    }

    fn stuck(mut self, node: &str) -> Self {
        self.stuck_nodes.insert(node.to_string());
        self
    }

    fn broken(mut self, node: &str) -> Self {
        self.broken_nodes.insert(node.to_string());
        self
    }

    /// A pod left over from elsewhere, frozen in `phase`
    fn insert_pod(&self, name: &str, phase: Option<&str>) {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: phase.map(|phase| PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.state.lock().unwrap().pods.insert(name.to_string(), pod);
    }

    fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    fn remaining(&self) -> Vec<String> {
        self.state.lock().unwrap().pods.keys().cloned().collect()
    }
}

fn node(name: &str, spec: Option<NodeSpec>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec,
        ..Default::default()
    }
}

fn not_found(name: &str) -> ApiError {
    ApiError::new(Some(404), format!("pods \"{}\" not found", name))
}

fn node_of(pod: &Pod) -> String {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.clone())
        .unwrap_or_default()
}

impl ClusterApi for MockCluster {
    fn list_nodes(&self) -> std::result::Result<Vec<Node>, ApiError> {
        Ok(self.nodes.clone())
    }

    fn create_pod(&self, _namespace: &str, pod: &Pod) -> std::result::Result<Pod, ApiError> {
        if let Some(delay) = self.create_delay {
            std::thread::sleep(delay);
        }
        if self.broken_nodes.contains(&node_of(pod)) {
            return Err(ApiError::new(Some(500), "internal error"));
        }
        let name = pod.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        if state.pods.contains_key(&name) {
            return Err(ApiError::new(Some(409), "already exists"));
        }
        state.created.push(name.clone());
        state.pods.insert(name, pod.clone());
        Ok(pod.clone())
    }

    fn read_pod(&self, _namespace: &str, name: &str) -> std::result::Result<Pod, ApiError> {
        let mut state = self.state.lock().unwrap();
        let mut pod = state.pods.get(name).cloned().ok_or_else(|| not_found(name))?;
        if pod.status.is_some() {
            return Ok(pod);
        }
        let reads = state.reads.entry(name.to_string()).or_default();
        *reads += 1;
        let node = node_of(&pod);
        let phase = if *reads > 1 && !self.stuck_nodes.contains(&node) {
            "Succeeded"
        } else {
            "Pending"
        };
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        Ok(pod)
    }

    fn list_pods(&self, _namespace: &str) -> std::result::Result<Vec<Pod>, ApiError> {
        Ok(self.state.lock().unwrap().pods.values().cloned().collect())
    }

    fn delete_pod(&self, _namespace: &str, name: &str) -> std::result::Result<(), ApiError> {
        if self.broken_delete {
            return Err(ApiError::new(Some(500), "internal error"));
        }
        let mut state = self.state.lock().unwrap();
        state.deleted.push(name.to_string());
        match state.pods.remove(name) {
            Some(_) => Ok(()),
            None => Err(not_found(name)),
        }
    }
}

fn config(images: &[&str]) -> PrepullerConfig {
    PrepullerConfig {
        namespace: Some("prepuller".to_string()),
        images: images.iter().map(|i| i.to_string()).collect(),
        poll_interval: 0.005,
        max_tries: 20,
        timeout: 30,
        ..Default::default()
    }
}

fn prepuller(cluster: &Arc<MockCluster>, images: &[&str]) -> Result<Prepuller<MockCluster>> {
    let mut prepuller = Prepuller::new(Arc::clone(cluster), config(images))?;
    prepuller.build_nodelist()?;
    prepuller.build_pod_specs();
    Ok(prepuller)
}

#[test]
fn every_node_pulls_every_image() -> Result<()> {
    let cluster = Arc::new(MockCluster::new(&["node-1", "node-2", "node-3"]));
    let report = prepull(
        Arc::clone(&cluster),
        &["lsstsqre/sciplat-lab:w_2023_04", "alpine"],
        config(&[]),
    )?;
    report.ensure_success()?;
    assert_eq!(report.nodes.len(), 3);
    for node in &report.nodes {
        assert_eq!(node.jobs.len(), 2);
        assert!(node.jobs.iter().all(|(_, state)| *state == JobState::Deleted));
    }
    // Images are pulled in sorted order within a node
    let created = cluster.created();
    let node_1: Vec<&String> = created.iter().filter(|n| n.ends_with("-1")).collect();
    assert_eq!(
        node_1,
        vec!["pp-library-alpine-latest-1", "pp-lsstsqre-sciplat-lab-w-2023-04-1"]
    );
    assert_eq!(created.len(), 6);
    assert!(cluster.remaining().is_empty());
    Ok(())
}

#[test]
fn unschedulable_nodes_are_skipped() -> Result<()> {
    let mut cluster = MockCluster::new(&["node-1"]);
    cluster.nodes.push(node(
        "node-2",
        Some(NodeSpec {
            unschedulable: Some(true),
            ..Default::default()
        }),
    ));
    cluster.nodes.push(node(
        "node-3",
        Some(NodeSpec {
            taints: Some(vec![Taint {
                effect: "NoSchedule".to_string(),
                key: "gpu".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    ));
    let cluster = Arc::new(cluster);
    let prepuller = prepuller(&cluster, &["alpine"])?;
    assert_eq!(prepuller.nodes(), &["node-1".to_string()]);
    assert_eq!(prepuller.jobs().len(), 1);
    Ok(())
}

#[test]
fn stuck_node_fails_alone() -> Result<()> {
    let cluster = Arc::new(MockCluster::new(&["node-1", "node-2", "node-3"]).stuck("node-2"));
    let prepuller = prepuller(&cluster, &["alpine", "busybox"])?;

    let start = Instant::now();
    let report = prepuller.run_pods()?;
    assert!(start.elapsed() < Duration::from_secs(10));

    for name in ["node-1", "node-3"] {
        assert!(report.node(name).unwrap().is_success(), "{}", name);
    }
    let stuck = report.node("node-2").unwrap();
    assert!(matches!(stuck.error, Some(Error::PollExhausted { tries: 20, .. })));
    // The second image of the stuck node is never submitted
    assert_eq!(
        stuck.jobs,
        vec![
            ("pp-library-alpine-latest-2".to_string(), JobState::Submitted),
            ("pp-library-busybox-latest-2".to_string(), JobState::Built),
        ]
    );
    assert!(!cluster.created().contains(&"pp-library-busybox-latest-2".to_string()));
    assert!(cluster.deleted().contains(&"pp-library-alpine-latest-2".to_string()));
    assert!(cluster.remaining().is_empty());

    match report.ensure_success() {
        Err(Error::NodeFailures(nodes)) => assert_eq!(nodes, vec!["node-2".to_string()]),
        other => panic!("unexpected {:?}", other),
    }
    Ok(())
}

#[test]
fn timeout_deletes_unconfirmed_pods() -> Result<()> {
    let cluster = Arc::new(MockCluster::new(&["node-1", "node-2"]).stuck("node-2"));
    let mut config = config(&["alpine", "busybox"]);
    config.max_tries = u32::MAX;
    config.timeout = 1;
    let mut prepuller = Prepuller::new(Arc::clone(&cluster), config)?;
    prepuller.build_nodelist()?;
    prepuller.build_pod_specs();

    let start = Instant::now();
    let err = prepuller.run_pods().unwrap_err();
    assert!(matches!(err, Error::PrepullTimeout(_)));
    assert!(start.elapsed() < Duration::from_secs(10));

    let deleted = cluster.deleted();
    // Created and stuck
    assert!(deleted.contains(&"pp-library-alpine-latest-2".to_string()));
    // Never created
    assert!(deleted.contains(&"pp-library-busybox-latest-2".to_string()));
    assert!(!cluster
        .remaining()
        .contains(&"pp-library-alpine-latest-2".to_string()));
    Ok(())
}

#[test]
fn pod_created_after_timeout_is_removed() -> Result<()> {
    let mut cluster = MockCluster::new(&["node-1"]);
    cluster.create_delay = Some(Duration::from_millis(1500));
    let cluster = Arc::new(cluster);
    let mut config = config(&["alpine"]);
    config.timeout = 1;
    let mut prepuller = Prepuller::new(Arc::clone(&cluster), config)?;
    prepuller.build_nodelist()?;
    prepuller.build_pod_specs();

    let err = prepuller.run_pods().unwrap_err();
    assert!(matches!(err, Error::PrepullTimeout(_)));

    // The worker is still inside its create call here
    let start = Instant::now();
    while cluster.created().is_empty() || !cluster.remaining().is_empty() {
        assert!(start.elapsed() < Duration::from_secs(10), "left {:?}", cluster.remaining());
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(cluster.created(), vec!["pp-library-alpine-latest-1"]);
    Ok(())
}

#[test]
fn unbounded_timeout_has_no_deadline() -> Result<()> {
    let cluster = Arc::new(MockCluster::new(&["node-1"]));
    let mut config = config(&["alpine"]);
    config.timeout = u64::MAX;
    let mut prepuller = Prepuller::new(Arc::clone(&cluster), config)?;
    prepuller.build_nodelist()?;
    prepuller.build_pod_specs();
    prepuller.run_pods()?.ensure_success()?;
    assert!(cluster.remaining().is_empty());
    Ok(())
}

#[test]
fn invalid_poll_interval_is_rejected() {
    let cluster = Arc::new(MockCluster::new(&["node-1"]));
    let mut config = config(&["alpine"]);
    config.poll_interval = f64::INFINITY;
    assert!(matches!(
        Prepuller::new(cluster, config),
        Err(Error::InvalidPollInterval(_))
    ));
}

#[test]
fn create_failure_fails_only_that_node() -> Result<()> {
    let cluster = Arc::new(MockCluster::new(&["node-1", "node-2", "node-3"]).broken("node-2"));
    let prepuller = prepuller(&cluster, &["alpine"])?;
    let report = prepuller.run_pods()?;

    for name in ["node-1", "node-3"] {
        assert!(report.node(name).unwrap().is_success(), "{}", name);
    }
    match &report.node("node-2").unwrap().error {
        Some(Error::PodLifecycle {
            operation,
            pod,
            source,
            ..
        }) => {
            assert_eq!(*operation, "create");
            assert_eq!(pod, "pp-library-alpine-latest-2");
            assert_eq!(source.code, Some(500));
        }
        other => panic!("unexpected {:?}", other),
    }
    match report.ensure_success() {
        Err(Error::NodeFailures(nodes)) => assert_eq!(nodes, vec!["node-2".to_string()]),
        other => panic!("unexpected {:?}", other),
    }
    Ok(())
}

#[test]
fn delete_failure_is_propagated() -> Result<()> {
    let mut cluster = MockCluster::new(&["node-1"]);
    cluster.broken_delete = true;
    let cluster = Arc::new(cluster);
    let prepuller = prepuller(&cluster, &["alpine"])?;
    cluster.insert_pod("pp-library-alpine-latest-1", Some("Succeeded"));
    match prepuller.clean_completed_pods() {
        Err(Error::PodLifecycle { operation, pod, .. }) => {
            assert_eq!(operation, "delete");
            assert_eq!(pod, "pp-library-alpine-latest-1");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(cluster.remaining(), vec!["pp-library-alpine-latest-1"]);
    Ok(())
}

#[test]
fn existing_pod_is_adopted() -> Result<()> {
    let cluster = Arc::new(MockCluster::new(&["node-1"]));
    let prepuller = prepuller(&cluster, &["alpine"])?;
    // Left by an earlier run, not yet read
    cluster.insert_pod("pp-library-alpine-latest-1", None);
    let mut leftover = cluster.state.lock().unwrap();
    if let Some(pod) = leftover.pods.get_mut("pp-library-alpine-latest-1") {
        pod.spec = prepuller.jobs()["node-1"][0].pod.spec.clone();
    }
    drop(leftover);

    let report = prepuller.run_pods()?;
    report.ensure_success()?;
    assert!(cluster.created().is_empty());
    assert!(cluster.remaining().is_empty());
    Ok(())
}

#[test]
fn clean_completed_pods_is_idempotent() -> Result<()> {
    let cluster = Arc::new(MockCluster::new(&["node-1", "node-2"]));
    let prepuller = prepuller(&cluster, &["alpine"])?;
    cluster.insert_pod("pp-library-alpine-latest-1", Some("Succeeded"));
    cluster.insert_pod("pp-library-alpine-latest-2", Some("Failed"));
    cluster.insert_pod("pp-library-busybox-latest-1", Some("Succeeded"));
    cluster.insert_pod("jupyter-someone", Some("Succeeded"));

    let mut first = prepuller.clean_completed_pods()?;
    first.sort();
    assert_eq!(
        first,
        vec!["pp-library-alpine-latest-1", "pp-library-alpine-latest-2"]
    );
    let deleted_after_first = cluster.deleted();

    assert!(prepuller.clean_completed_pods()?.is_empty());
    assert_eq!(cluster.deleted(), deleted_after_first);
    assert_eq!(
        cluster.remaining(),
        vec!["jupyter-someone", "pp-library-busybox-latest-1"]
    );
    Ok(())
}

#[test]
fn running_pods_are_not_cleaned() -> Result<()> {
    let cluster = Arc::new(MockCluster::new(&["node-1"]));
    let prepuller = prepuller(&cluster, &["alpine"])?;
    cluster.insert_pod("pp-library-alpine-latest-1", Some("Running"));
    assert!(prepuller.clean_completed_pods()?.is_empty());
    assert_eq!(cluster.remaining(), vec!["pp-library-alpine-latest-1"]);
    Ok(())
}

#[test]
fn deleting_missing_pod_is_benign() -> Result<()> {
    let cluster = Arc::new(MockCluster::new(&["node-1"]));
    let prepuller = prepuller(&cluster, &["alpine"])?;
    prepuller.delete_pod("pp-library-alpine-latest-1")?;
    assert_eq!(cluster.deleted(), vec!["pp-library-alpine-latest-1"]);
    Ok(())
}

#[test]
fn namespace_defaults_to_cluster() -> Result<()> {
    let cluster = Arc::new(MockCluster::new(&["node-1"]));
    let mut config = config(&["alpine"]);
    assert_eq!(Prepuller::new(Arc::clone(&cluster), config.clone())?.namespace(), "prepuller");
    config.namespace = None;
    assert_eq!(Prepuller::new(cluster, config)?.namespace(), "default");
    Ok(())
}

#[test]
fn images_are_normalized() -> Result<()> {
    let cluster = Arc::new(MockCluster::new(&[]));
    let prepuller = Prepuller::new(
        cluster,
        config(&["alpine", "library/alpine:latest", "lsstsqre/sciplat-lab:r23_0_2"]),
    )?;
    let images: Vec<String> = prepuller.images().iter().map(|i| i.to_string()).collect();
    assert_eq!(
        images,
        vec!["library/alpine:latest", "lsstsqre/sciplat-lab:r23_0_2"]
    );
    Ok(())
}
