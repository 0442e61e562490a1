//! Placement stacks: feasibility → fit → score → select.
//!
//! [`GenericStack`] picks the best node in the job's datacenters for one
//! instance of a task group and falls back to preemption when every
//! feasible node is exhausted. [`SystemStack`] evaluates a single, given
//! node for per-node jobs.
//!
//! Candidate nodes are iterated in node id order, and ties are broken on
//! node id, so identical inputs always produce the same choice.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use corral_core::{AllocatedResources, Allocation, Dimension, Job, Node, NodeId, TaskGroup};
use corral_state::Snapshot;

use crate::context::EvalContext;
use crate::feasible::{Rejection, check_node};
use crate::fit::fit_task_group;
use crate::preempt::select_preemption;
use crate::scorer::{NodeScore, ScoreInput, SpreadState, affinity_score, better, score_node};

/// Per-selection options.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Nodes that hosted a failed predecessor of this placement.
    pub penalty_nodes: BTreeSet<NodeId>,
}

/// The node chosen for one placement.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedNode {
    pub node_id: NodeId,
    pub score: f64,
    pub resources: AllocatedResources,
    /// Allocations to evict before the placement fits.
    pub preempted: Vec<Allocation>,
}

/// Outcome of a fit-and-score attempt on one feasible node.
enum Attempt {
    Scored(NodeScore, AllocatedResources),
    Exhausted(Dimension),
}

/// Score one feasible node against the plan's proposed allocations.
fn attempt(
    ctx: &EvalContext,
    job: &Job,
    tg: &TaskGroup,
    node: &Node,
    affinity: Option<f64>,
    spread: Option<f64>,
    penalized: bool,
) -> Attempt {
    let proposed = ctx.proposed_allocs(&node.id);
    match fit_task_group(node, tg, &proposed) {
        Ok(resources) => {
            let input = ScoreInput {
                node,
                tg,
                proposed: &proposed,
                job_id: &job.id,
                affinity,
                spread,
                penalized,
            };
            Attempt::Scored(score_node(&input, ctx.weights(), ctx.algorithm()), resources)
        }
        Err(e) => Attempt::Exhausted(e.dimension),
    }
}

pub struct GenericStack {
    job: Job,
    nodes: Vec<Node>,
    available: BTreeMap<String, u32>,
}

impl GenericStack {
    /// Build a stack over the ready nodes in the job's datacenters.
    pub fn new(job: &Job, snapshot: &Snapshot) -> Self {
        let (ready, available) = snapshot.ready_nodes(&job.datacenters);
        let mut nodes: Vec<Node> = ready.into_iter().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            job: job.clone(),
            nodes,
            available,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Select the best node for one instance of `tg`. Metrics of the
    /// attempt are left in `ctx.metrics()`.
    pub fn select(&self, ctx: &mut EvalContext, tg: &TaskGroup, options: &SelectOptions) -> Option<RankedNode> {
        ctx.reset_metrics();
        ctx.metrics_mut().nodes_available = self.available.clone();

        let job = &self.job;
        let candidates: Vec<&Node> = self.nodes.iter().collect();
        let spread = SpreadState::new(ctx, job, tg, &candidates);

        let mut best: Option<(NodeScore, AllocatedResources)> = None;
        let mut exhausted: Vec<&Node> = Vec::new();

        for node in &self.nodes {
            ctx.metrics_mut().nodes_evaluated += 1;
            match check_node(ctx, job, tg, node) {
                Ok(()) => {}
                Err(Rejection::Filtered(reason)) => {
                    trace!(node_id = %node.id, reason = %reason, "node filtered");
                    ctx.metrics_mut().filter_node(node, &reason);
                    continue;
                }
                Err(Rejection::Exhausted(dim)) => {
                    ctx.metrics_mut().exhausted_node(node, dim.as_str());
                    continue;
                }
            }

            let affinity = affinity_score(ctx, job, tg, node);
            let penalized = options.penalty_nodes.contains(&node.id);
            match attempt(ctx, job, tg, node, affinity, spread.score(node), penalized) {
                Attempt::Scored(score, resources) => {
                    ctx.metrics_mut().scores.insert(node.id.clone(), score.score);
                    if best.as_ref().is_none_or(|(b, _)| better(&score, b)) {
                        best = Some((score, resources));
                    }
                }
                Attempt::Exhausted(dim) => {
                    trace!(node_id = %node.id, dimension = %dim, "node exhausted");
                    ctx.metrics_mut().exhausted_node(node, dim.as_str());
                    exhausted.push(node);
                }
            }
        }

        if let Some((score, resources)) = best {
            debug!(
                job_id = %job.id,
                task_group = %tg.name,
                node_id = %score.node_id,
                score = score.score,
                "selected node"
            );
            return Some(RankedNode {
                node_id: score.node_id,
                score: score.score,
                resources,
                preempted: Vec::new(),
            });
        }

        if !exhausted.is_empty() && ctx.preemption().allowed(job.job_type, job.priority) {
            if let Some(result) = select_preemption(ctx, job, tg, &exhausted) {
                return Some(RankedNode {
                    node_id: result.node_id,
                    score: 0.0,
                    resources: result.resources,
                    preempted: result.victims,
                });
            }
        }

        ctx.metrics_mut().classify_failure();
        None
    }
}

/// Evaluates a single node for system and sysbatch jobs.
pub struct SystemStack {
    job: Job,
}

impl SystemStack {
    pub fn new(job: &Job) -> Self {
        Self { job: job.clone() }
    }

    /// Place one instance of `tg` on `node`, preempting if the node is
    /// exhausted and preemption is allowed for the job.
    pub fn select_node(&self, ctx: &mut EvalContext, tg: &TaskGroup, node: &Node) -> Result<RankedNode, Rejection> {
        let job = &self.job;
        ctx.reset_metrics();
        ctx.metrics_mut().nodes_evaluated += 1;
        ctx.metrics_mut()
            .nodes_available
            .insert(node.datacenter.clone(), 1);

        if let Err(rejection) = check_node(ctx, job, tg, node) {
            match &rejection {
                Rejection::Filtered(reason) => ctx.metrics_mut().filter_node(node, reason),
                Rejection::Exhausted(dim) => ctx.metrics_mut().exhausted_node(node, dim.as_str()),
            }
            ctx.metrics_mut().classify_failure();
            return Err(rejection);
        }

        let affinity = affinity_score(ctx, job, tg, node);
        match attempt(ctx, job, tg, node, affinity, None, false) {
            Attempt::Scored(score, resources) => {
                ctx.metrics_mut().scores.insert(node.id.clone(), score.score);
                Ok(RankedNode {
                    node_id: node.id.clone(),
                    score: score.score,
                    resources,
                    preempted: Vec::new(),
                })
            }
            Attempt::Exhausted(dim) => {
                ctx.metrics_mut().exhausted_node(node, dim.as_str());
                if ctx.preemption().allowed(job.job_type, job.priority) {
                    if let Some(result) = select_preemption(ctx, job, tg, &[node]) {
                        return Ok(RankedNode {
                            node_id: result.node_id,
                            score: 0.0,
                            resources: result.resources,
                            preempted: result.victims,
                        });
                    }
                }
                ctx.metrics_mut().classify_failure();
                Err(Rejection::Exhausted(dim))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::config::CorralConfig;
    use corral_core::{
        AllocatedTaskResources, Constraint, DriverInfo, Evaluation, JobType, NodeResources, Operand, Plan,
        PlacementFailure, Task, TaskResources,
    };

    const GIB: u64 = 1024 * 1024 * 1024;

    fn node(id: &str, cpu: u64, mem: u64) -> Node {
        let mut n = Node {
            id: id.to_string(),
            datacenter: "dc1".to_string(),
            resources: NodeResources {
                cpu_shares: cpu,
                memory_bytes: mem,
                ..Default::default()
            },
            ..Default::default()
        };
        n.drivers.insert("exec".to_string(), DriverInfo::healthy());
        n.compute_class();
        n
    }

    fn job(priority: i32, cpu: u64, mem: u64) -> Job {
        Job {
            id: "web".to_string(),
            priority,
            datacenters: vec!["dc1".to_string()],
            task_groups: vec![TaskGroup {
                name: "main".to_string(),
                count: 1,
                tasks: vec![Task {
                    name: "t".to_string(),
                    driver: "exec".to_string(),
                    resources: TaskResources {
                        cpu_shares: cpu,
                        memory_bytes: mem,
                        devices: Vec::new(),
                    },
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn alloc(id: &str, job_id: &str, node: &str, priority: i32, cpu: u64, mem: u64) -> Allocation {
        let mut resources = AllocatedResources::default();
        resources.tasks.insert(
            "t".to_string(),
            AllocatedTaskResources {
                cpu_shares: cpu,
                memory_bytes: mem,
                devices: Vec::new(),
            },
        );
        Allocation {
            id: id.to_string(),
            namespace: "default".to_string(),
            job_id: job_id.to_string(),
            task_group: "main".to_string(),
            node_id: node.to_string(),
            job_priority: priority,
            resources,
            ..Default::default()
        }
    }

    fn ctx(job: &Job, snapshot: Snapshot) -> EvalContext {
        let plan = Plan::new(&Evaluation::default(), "t", 0, Some(job.clone()));
        EvalContext::new(snapshot, plan, &CorralConfig::default())
    }

    #[test]
    fn prefers_more_utilized_node() {
        // Same free capacity, n2 is more utilized.
        let snap = Snapshot::builder()
            .node(node("n1", 2000, 4 * GIB))
            .node(node("n2", 4000, 4 * GIB))
            .alloc(alloc("other", "db", "n2", 50, 2000, GIB))
            .build();
        let j = job(50, 500, GIB / 2);
        let stack = GenericStack::new(&j, &snap);
        let mut ctx = ctx(&j, snap);
        let picked = stack.select(&mut ctx, &j.task_groups[0], &SelectOptions::default()).unwrap();
        assert_eq!(picked.node_id, "n2");
        assert_eq!(ctx.metrics().scores.len(), 2);
    }

    #[test]
    fn selection_is_deterministic() {
        let snap = Snapshot::builder()
            .node(node("b", 4000, 4 * GIB))
            .node(node("a", 4000, 4 * GIB))
            .node(node("c", 4000, 4 * GIB))
            .build();
        let j = job(50, 500, GIB);
        let stack = GenericStack::new(&j, &snap);
        for _ in 0..5 {
            let mut c = ctx(&j, snap.clone());
            let picked = stack.select(&mut c, &j.task_groups[0], &SelectOptions::default()).unwrap();
            assert_eq!(picked.node_id, "a");
        }
    }

    #[test]
    fn records_filter_and_exhaustion() {
        let mut edge = node("n1", 4000, 4 * GIB);
        edge.node_class = "edge".to_string();
        edge.compute_class();
        let snap = Snapshot::builder()
            .node(edge)
            .node(node("n2", 100, GIB))
            .build();
        let mut j = job(50, 500, GIB);
        j.constraints.push(Constraint::new("${node.class}", Operand::NotEqual, "edge"));
        let stack = GenericStack::new(&j, &snap);
        let mut ctx = ctx(&j, snap);

        assert!(stack.select(&mut ctx, &j.task_groups[0], &SelectOptions::default()).is_none());
        let m = ctx.metrics();
        assert_eq!(m.nodes_evaluated, 2);
        assert_eq!(m.nodes_filtered, 1);
        assert_eq!(m.nodes_exhausted, 1);
        assert_eq!(m.dimension_exhausted.get("cpu"), Some(&1));
        assert_eq!(m.failure, Some(PlacementFailure::InsufficientCapacity));
    }

    #[test]
    fn unsatisfiable_when_everything_filtered() {
        let snap = Snapshot::builder().node(node("n1", 4000, 4 * GIB)).build();
        let mut j = job(50, 500, GIB);
        j.task_groups[0].tasks[0].driver = "docker".to_string();
        let stack = GenericStack::new(&j, &snap);
        let mut ctx = ctx(&j, snap);
        assert!(stack.select(&mut ctx, &j.task_groups[0], &SelectOptions::default()).is_none());
        assert_eq!(ctx.metrics().failure, Some(PlacementFailure::ConstraintUnsatisfiable));
        assert_eq!(ctx.metrics().node_reasons["n1"], "missing driver: docker");
    }

    #[test]
    fn falls_back_to_preemption() {
        let snap = Snapshot::builder()
            .node(node("n1", 3000, 4 * GIB))
            .alloc(alloc("low", "batch", "n1", 10, 2000, GIB))
            .build();
        let j = job(50, 2000, GIB);
        let stack = GenericStack::new(&j, &snap);
        let mut ctx = ctx(&j, snap);
        let picked = stack.select(&mut ctx, &j.task_groups[0], &SelectOptions::default()).unwrap();
        assert_eq!(picked.node_id, "n1");
        assert_eq!(picked.preempted.len(), 1);
        assert_eq!(picked.preempted[0].id, "low");
    }

    #[test]
    fn preemption_respects_priority_floor() {
        let snap = Snapshot::builder()
            .node(node("n1", 3000, 4 * GIB))
            .alloc(alloc("low", "batch", "n1", 10, 2000, GIB))
            .build();
        let j = job(40, 2000, GIB);
        let stack = GenericStack::new(&j, &snap);
        let mut ctx = ctx(&j, snap);
        assert!(stack.select(&mut ctx, &j.task_groups[0], &SelectOptions::default()).is_none());
    }

    #[test]
    fn penalty_node_is_avoided() {
        let snap = Snapshot::builder()
            .node(node("n1", 4000, 4 * GIB))
            .node(node("n2", 4000, 4 * GIB))
            .build();
        let j = job(50, 500, GIB);
        let stack = GenericStack::new(&j, &snap);
        let mut ctx = ctx(&j, snap);
        let options = SelectOptions {
            penalty_nodes: BTreeSet::from(["n1".to_string()]),
        };
        let picked = stack.select(&mut ctx, &j.task_groups[0], &options).unwrap();
        assert_eq!(picked.node_id, "n2");
    }

    #[test]
    fn system_stack_reports_rejections() {
        let fits = node("n1", 4000, 4 * GIB);
        let small = node("n2", 100, GIB);
        let snap = Snapshot::builder().node(fits.clone()).node(small.clone()).build();
        let mut j = job(50, 500, GIB);
        j.job_type = JobType::System;
        let stack = SystemStack::new(&j);
        let mut ctx = ctx(&j, snap);

        assert!(stack.select_node(&mut ctx, &j.task_groups[0], &fits).is_ok());
        assert_eq!(
            stack.select_node(&mut ctx, &j.task_groups[0], &small).unwrap_err(),
            Rejection::Exhausted(Dimension::Cpu)
        );
    }
}
