//! Node scoring for placement decisions.
//!
//! Evaluates feasible nodes using a weighted average of normalized factors,
//! each in `-1.0..=1.0`:
//! - **Bin-packing**: dominant-dimension utilization after placement
//!   (inverted when the scheduler algorithm is `spread`)
//! - **Job anti-affinity**: penalize stacking instances of one group on a node
//! - **Affinity**: matched affinity weights over total affinity weight
//! - **Spread**: distance from the desired share of an attribute value
//! - **Reschedule penalty**: avoid the node a failed predecessor ran on
//!
//! Only factors that apply to a node enter its average; bin-packing always
//! applies.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use corral_core::config::{SchedulerAlgorithm, ScoringWeights};
use corral_core::{Allocation, ComparableResources, Constraint, Job, Node, NodeId, TaskGroup};

use crate::context::EvalContext;
use crate::feasible::{meets_constraint, resolve_target};
use crate::fit::used_resources;

/// Scored placement result for a single node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeScore {
    pub node_id: NodeId,
    /// Weighted average of the applicable factors.
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Individual factor values; `None` when a factor did not apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreBreakdown {
    pub bin_packing: f64,
    pub job_anti_affinity: Option<f64>,
    pub affinity: Option<f64>,
    pub spread: Option<f64>,
    pub reschedule_penalty: Option<f64>,
}

/// Inputs of [`score_node`] that do not depend on the evaluation context.
pub struct ScoreInput<'a> {
    pub node: &'a Node,
    pub tg: &'a TaskGroup,
    /// Allocations on the node, not counting the one being placed.
    pub proposed: &'a [&'a Allocation],
    pub job_id: &'a str,
    pub affinity: Option<f64>,
    pub spread: Option<f64>,
    pub penalized: bool,
}

/// Score a single feasible node.
pub fn score_node(input: &ScoreInput<'_>, weights: &ScoringWeights, algorithm: SchedulerAlgorithm) -> NodeScore {
    let capacity = input.node.comparable_capacity();
    let projected: ComparableResources = used_resources(input.proposed).plus(&input.tg.comparable_ask());
    let util = projected.dominant_utilization(&capacity);
    let bin_packing = match algorithm {
        SchedulerAlgorithm::Binpack => util,
        SchedulerAlgorithm::Spread => 1.0 - util,
    };

    let collisions = input
        .proposed
        .iter()
        .filter(|a| a.job_id == input.job_id && a.task_group == input.tg.name)
        .count();
    let job_anti_affinity = (collisions > 0).then(|| {
        let desired = input.tg.count.max(1) as f64;
        (-((collisions + 1) as f64) / desired).max(-1.0)
    });

    let reschedule_penalty = input.penalized.then_some(-1.0);

    let breakdown = ScoreBreakdown {
        bin_packing,
        job_anti_affinity,
        affinity: input.affinity,
        spread: input.spread,
        reschedule_penalty,
    };

    let factors = [
        (Some(bin_packing), weights.bin_packing),
        (job_anti_affinity, weights.job_anti_affinity),
        (input.affinity, weights.affinity),
        (input.spread, weights.spread),
        (reschedule_penalty, weights.reschedule_penalty),
    ];
    let (sum, total_weight) = factors
        .iter()
        .filter_map(|(value, weight)| value.map(|v| (v * weight, *weight)))
        .fold((0.0, 0.0), |(s, w), (v, wt)| (s + v, w + wt));
    let score = if total_weight > 0.0 { sum / total_weight } else { 0.0 };

    NodeScore {
        node_id: input.node.id.clone(),
        score,
        breakdown,
    }
}

/// Whether `a` ranks ahead of `b`: higher score, then smaller node id.
pub fn better(a: &NodeScore, b: &NodeScore) -> bool {
    compare(a, b) == Ordering::Less
}

fn compare(a: &NodeScore, b: &NodeScore) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.node_id.cmp(&b.node_id))
}

/// Sort scores best first.
pub fn rank_nodes(mut scores: Vec<NodeScore>) -> Vec<NodeScore> {
    scores.sort_by(compare);
    scores
}

/// Σ matched affinity weights / Σ |weights| over job, group and task
/// affinities. `None` when the group has no affinities.
pub fn affinity_score(ctx: &mut EvalContext, job: &Job, tg: &TaskGroup, node: &Node) -> Option<f64> {
    let affinities: Vec<_> = job
        .affinities
        .iter()
        .chain(tg.affinities.iter())
        .chain(tg.tasks.iter().flat_map(|t| t.affinities.iter()))
        .collect();
    let total: f64 = affinities.iter().map(|a| f64::from(a.weight).abs()).sum();
    if total == 0.0 {
        return None;
    }
    let matched: f64 = affinities
        .iter()
        .filter(|a| {
            let c = Constraint::new(&a.l_target, a.operand, &a.r_target);
            meets_constraint(ctx, &c, node)
        })
        .map(|a| f64::from(a.weight))
        .sum();
    Some(matched / total)
}

/// Spread bookkeeping for one task group, computed once per selection.
#[derive(Debug, Clone, Default)]
pub struct SpreadState {
    blocks: Vec<SpreadBlock>,
}

#[derive(Debug, Clone)]
struct SpreadBlock {
    attribute: String,
    weight: f64,
    /// Desired count per listed value; `None` for an even split.
    targets: Option<BTreeMap<String, f64>>,
    /// Desired count for values not listed in `targets`.
    remainder: f64,
    /// Desired count per value for an even split.
    even: f64,
    used: BTreeMap<String, u32>,
}

impl SpreadState {
    pub fn new(ctx: &EvalContext, job: &Job, tg: &TaskGroup, candidates: &[&Node]) -> Self {
        let spreads: Vec<_> = job.spreads.iter().chain(tg.spreads.iter()).collect();
        if spreads.is_empty() {
            return Self::default();
        }
        let count = f64::from(tg.count.max(1));
        let allocs: Vec<&Allocation> = ctx
            .proposed_job_allocs(&job.key())
            .into_iter()
            .filter(|a| a.task_group == tg.name)
            .collect();

        let blocks = spreads
            .into_iter()
            .map(|spread| {
                let mut used = BTreeMap::new();
                for alloc in &allocs {
                    let value = ctx
                        .snapshot()
                        .node(&alloc.node_id)
                        .and_then(|n| resolve_target(&spread.attribute, n));
                    if let Some(value) = value {
                        *used.entry(value).or_insert(0) += 1;
                    }
                }

                let (targets, remainder) = if spread.targets.is_empty() {
                    (None, 0.0)
                } else {
                    let listed: u32 = spread.targets.iter().map(|t| u32::from(t.percent)).sum();
                    let map = spread
                        .targets
                        .iter()
                        .map(|t| (t.value.clone(), f64::from(t.percent) / 100.0 * count))
                        .collect();
                    let rest = 100u32.saturating_sub(listed);
                    (Some(map), f64::from(rest) / 100.0 * count)
                };

                let distinct: BTreeSet<String> = candidates
                    .iter()
                    .filter_map(|n| resolve_target(&spread.attribute, n))
                    .chain(used.keys().cloned())
                    .collect();
                let even = if distinct.is_empty() {
                    0.0
                } else {
                    count / distinct.len() as f64
                };

                SpreadBlock {
                    attribute: spread.attribute.clone(),
                    weight: f64::from(spread.weight),
                    targets,
                    remainder,
                    even,
                    used,
                }
            })
            .collect();
        Self { blocks }
    }

    /// Weighted spread score of placing one more instance on `node`.
    pub fn score(&self, node: &Node) -> Option<f64> {
        let total_weight: f64 = self.blocks.iter().map(|b| b.weight).sum();
        if total_weight == 0.0 {
            return None;
        }
        let sum: f64 = self
            .blocks
            .iter()
            .map(|b| b.score(node) * b.weight)
            .sum();
        Some(sum / total_weight)
    }
}

impl SpreadBlock {
    fn score(&self, node: &Node) -> f64 {
        let Some(value) = resolve_target(&self.attribute, node) else {
            return -1.0;
        };
        let desired = match &self.targets {
            Some(targets) => targets.get(&value).copied().unwrap_or(self.remainder),
            None => self.even,
        };
        if desired <= 0.0 {
            return -1.0;
        }
        let used = f64::from(self.used.get(&value).copied().unwrap_or(0));
        ((desired - used) / desired).clamp(-1.0, 1.0)
    }
}
