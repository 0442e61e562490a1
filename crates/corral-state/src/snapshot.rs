//! Immutable point-in-time view of the state store.
//!
//! A `Snapshot` is read in a single redb read transaction and never changes
//! afterwards. All maps sit behind `Arc`, so cloning a snapshot is cheap and
//! workers can hand it around freely. Relations are resolved through the
//! secondary indexes built at load time (allocations by node and by job).

use std::collections::BTreeMap;
use std::sync::Arc;

use corral_core::{
    AllocId, Allocation, CsiVolume, EvalId, Evaluation, Job, JobKey, Node, NodeId,
};

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    index: u64,
    nodes: Arc<BTreeMap<NodeId, Node>>,
    allocs: Arc<BTreeMap<AllocId, Allocation>>,
    allocs_by_node: Arc<BTreeMap<NodeId, Vec<AllocId>>>,
    allocs_by_job: Arc<BTreeMap<JobKey, Vec<AllocId>>>,
    jobs: Arc<BTreeMap<JobKey, Job>>,
    job_versions: Arc<BTreeMap<(JobKey, u64), Job>>,
    evals: Arc<BTreeMap<EvalId, Evaluation>>,
    csi_volumes: Arc<BTreeMap<String, CsiVolume>>,
    node_alloc_index: Arc<BTreeMap<NodeId, u64>>,
}

impl Snapshot {
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::default()
    }

    /// Store index this snapshot was read at.
    pub fn index(&self) -> u64 {
        self.index
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// All nodes, ordered by id.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Nodes ready for placements in any of `datacenters` (all datacenters
    /// when empty), ordered by id, plus the ready count per datacenter.
    pub fn ready_nodes(&self, datacenters: &[String]) -> (Vec<&Node>, BTreeMap<String, u32>) {
        let mut by_dc = BTreeMap::new();
        let nodes = self
            .nodes
            .values()
            .filter(|n| n.ready())
            .filter(|n| datacenters.is_empty() || datacenters.iter().any(|dc| *dc == n.datacenter))
            .inspect(|n| *by_dc.entry(n.datacenter.clone()).or_insert(0) += 1)
            .collect();
        (nodes, by_dc)
    }

    /// Last index at which the node's allocation set changed.
    pub fn node_alloc_index(&self, node_id: &str) -> u64 {
        self.node_alloc_index.get(node_id).copied().unwrap_or(0)
    }

    // ── Allocations ────────────────────────────────────────────────

    pub fn alloc(&self, id: &str) -> Option<&Allocation> {
        self.allocs.get(id)
    }

    pub fn allocs(&self) -> impl Iterator<Item = &Allocation> {
        self.allocs.values()
    }

    /// Every allocation on the node, terminal ones included.
    pub fn allocs_by_node(&self, node_id: &str) -> Vec<&Allocation> {
        self.resolve(self.allocs_by_node.get(node_id))
    }

    /// Allocations on the node that still hold resources.
    pub fn live_allocs_by_node(&self, node_id: &str) -> Vec<&Allocation> {
        let mut allocs = self.allocs_by_node(node_id);
        allocs.retain(|a| !a.terminal_status());
        allocs
    }

    pub fn allocs_by_job(&self, key: &JobKey) -> Vec<&Allocation> {
        self.resolve(self.allocs_by_job.get(key))
    }

    fn resolve(&self, ids: Option<&Vec<AllocId>>) -> Vec<&Allocation> {
        ids.map(|ids| ids.iter().filter_map(|id| self.allocs.get(id)).collect())
            .unwrap_or_default()
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn job(&self, key: &JobKey) -> Option<&Job> {
        self.jobs.get(key)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn job_by_version(&self, key: &JobKey, version: u64) -> Option<&Job> {
        self.job_versions.get(&(key.clone(), version))
    }

    /// Running system and sysbatch jobs.
    pub fn per_node_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs
            .values()
            .filter(|j| j.job_type.is_per_node() && !j.stopped())
    }

    // ── Evaluations ────────────────────────────────────────────────

    pub fn eval(&self, id: &str) -> Option<&Evaluation> {
        self.evals.get(id)
    }

    pub fn evals(&self) -> impl Iterator<Item = &Evaluation> {
        self.evals.values()
    }

    pub fn evals_by_job(&self, key: &JobKey) -> Vec<&Evaluation> {
        self.evals
            .values()
            .filter(|e| e.namespace == key.namespace && e.job_id == key.id)
            .collect()
    }

    // ── CSI volumes ────────────────────────────────────────────────

    pub fn csi_volume(&self, namespace: &str, id: &str) -> Option<&CsiVolume> {
        self.csi_volumes.get(&format!("{namespace}/{id}"))
    }
}

/// Accumulates records and builds the secondary indexes of a [`Snapshot`].
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    index: u64,
    nodes: BTreeMap<NodeId, Node>,
    allocs: BTreeMap<AllocId, Allocation>,
    jobs: BTreeMap<JobKey, Job>,
    job_versions: BTreeMap<(JobKey, u64), Job>,
    evals: BTreeMap<EvalId, Evaluation>,
    csi_volumes: BTreeMap<String, CsiVolume>,
    node_alloc_index: BTreeMap<NodeId, u64>,
}

impl SnapshotBuilder {
    pub fn index(mut self, index: u64) -> Self {
        self.index = index;
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn alloc(mut self, alloc: Allocation) -> Self {
        self.allocs.insert(alloc.id.clone(), alloc);
        self
    }

    /// Adds the job as both the latest version and a historical version.
    pub fn job(mut self, job: Job) -> Self {
        self.job_versions.insert((job.key(), job.version), job.clone());
        self.jobs.insert(job.key(), job);
        self
    }

    /// Adds a historical version without touching the latest job.
    pub fn job_version(mut self, job: Job) -> Self {
        self.job_versions.insert((job.key(), job.version), job);
        self
    }

    pub fn eval(mut self, eval: Evaluation) -> Self {
        self.evals.insert(eval.id.clone(), eval);
        self
    }

    pub fn csi_volume(mut self, volume: CsiVolume) -> Self {
        self.csi_volumes.insert(volume.table_key(), volume);
        self
    }

    pub fn node_alloc_index(mut self, node_id: &str, index: u64) -> Self {
        self.node_alloc_index.insert(node_id.to_string(), index);
        self
    }

    pub fn build(self) -> Snapshot {
        let mut by_node: BTreeMap<NodeId, Vec<AllocId>> = BTreeMap::new();
        let mut by_job: BTreeMap<JobKey, Vec<AllocId>> = BTreeMap::new();
        for alloc in self.allocs.values() {
            by_node
                .entry(alloc.node_id.clone())
                .or_default()
                .push(alloc.id.clone());
            by_job.entry(alloc.job_key()).or_default().push(alloc.id.clone());
        }
        Snapshot {
            index: self.index,
            nodes: Arc::new(self.nodes),
            allocs: Arc::new(self.allocs),
            allocs_by_node: Arc::new(by_node),
            allocs_by_job: Arc::new(by_job),
            jobs: Arc::new(self.jobs),
            job_versions: Arc::new(self.job_versions),
            evals: Arc::new(self.evals),
            csi_volumes: Arc::new(self.csi_volumes),
            node_alloc_index: Arc::new(self.node_alloc_index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::{AllocDesiredStatus, NodeStatus};

    fn node(id: &str, dc: &str) -> Node {
        Node {
            id: id.to_string(),
            datacenter: dc.to_string(),
            ..Default::default()
        }
    }

    fn alloc(id: &str, node_id: &str, job_id: &str) -> Allocation {
        Allocation {
            id: id.to_string(),
            namespace: "default".to_string(),
            node_id: node_id.to_string(),
            job_id: job_id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn ready_nodes_filters_by_datacenter_and_status() {
        let mut down = node("n3", "dc1");
        down.status = NodeStatus::Down;
        let snap = Snapshot::builder()
            .node(node("n1", "dc1"))
            .node(node("n2", "dc2"))
            .node(down)
            .build();

        let (nodes, by_dc) = snap.ready_nodes(&["dc1".to_string()]);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "n1");
        assert_eq!(by_dc.get("dc1"), Some(&1));

        let (all, _) = snap.ready_nodes(&[]);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn alloc_indexes_resolve() {
        let mut stopped = alloc("a2", "n1", "web");
        stopped.desired_status = AllocDesiredStatus::Stop;
        let snap = Snapshot::builder()
            .alloc(alloc("a1", "n1", "web"))
            .alloc(stopped)
            .alloc(alloc("a3", "n2", "db"))
            .build();

        assert_eq!(snap.allocs_by_node("n1").len(), 2);
        assert_eq!(snap.live_allocs_by_node("n1").len(), 1);
        assert_eq!(snap.allocs_by_job(&JobKey::new("default", "web")).len(), 2);
        assert!(snap.allocs_by_node("missing").is_empty());
    }

    #[test]
    fn clone_shares_maps() {
        let snap = Snapshot::builder().index(7).node(node("n1", "dc1")).build();
        let copy = snap.clone();
        assert!(Arc::ptr_eq(&snap.nodes, &copy.nodes));
        assert_eq!(copy.index(), 7);
    }
}
