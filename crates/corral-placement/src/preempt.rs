//! Preemption: Evict lower-priority allocations to make room.
//!
//! Consulted only after no node could host a task group outright. Each
//! exhausted node is considered independently:
//!
//! 1. Victims are proposed allocations of other jobs with strictly lower
//!    priority that the plan does not already place or stop.
//! 2. If evicting every victim still does not fit, the node is skipped.
//! 3. Greedily add victims (lowest priority first, then most useful for the
//!    missing resources) until the full fit succeeds.
//! 4. Prune victims whose eviction turned out to be unnecessary.
//!
//! Among nodes that work, the one with the least disruption wins.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use tracing::debug;

use corral_core::{
    AllocatedResources, Allocation, ComparableResources, Job, Node, NodeId, TaskGroup,
};

use crate::context::EvalContext;
use crate::fit::{fit_task_group, used_resources};

/// A feasible eviction set on one node.
#[derive(Debug, Clone, PartialEq)]
pub struct PreemptionResult {
    pub node_id: NodeId,
    pub victims: Vec<Allocation>,
    /// Resources assigned to the new allocation once victims are gone.
    pub resources: AllocatedResources,
}

impl PreemptionResult {
    fn max_priority(&self) -> i32 {
        self.victims.iter().map(|a| a.job_priority).max().unwrap_or(0)
    }

    fn freed(&self) -> ComparableResources {
        self.victims
            .iter()
            .fold(ComparableResources::default(), |acc, a| acc.plus(&a.comparable_resources()))
    }

    /// Ordering by disruption: lower max victim priority, fewer victims,
    /// fewer freed resources, then node id.
    fn cmp_disruption(&self, other: &Self) -> Ordering {
        let (a, b) = (self.freed(), other.freed());
        self.max_priority()
            .cmp(&other.max_priority())
            .then_with(|| self.victims.len().cmp(&other.victims.len()))
            .then_with(|| (a.cpu_shares, a.memory_bytes).cmp(&(b.cpu_shares, b.memory_bytes)))
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

/// Pick the least disruptive eviction set across `nodes`.
pub fn select_preemption(
    ctx: &EvalContext,
    job: &Job,
    tg: &TaskGroup,
    nodes: &[&Node],
) -> Option<PreemptionResult> {
    let best = nodes
        .iter()
        .filter_map(|node| preempt_on_node(ctx, job, tg, node))
        .min_by(PreemptionResult::cmp_disruption)?;
    debug!(
        job_id = %job.id,
        task_group = %tg.name,
        node_id = %best.node_id,
        victims = best.victims.len(),
        "found preemption candidate"
    );
    Some(best)
}

/// Minimal eviction set on one node, if any.
pub fn preempt_on_node(
    ctx: &EvalContext,
    job: &Job,
    tg: &TaskGroup,
    node: &Node,
) -> Option<PreemptionResult> {
    let placed: BTreeSet<&str> = ctx
        .plan()
        .node_allocation
        .values()
        .flatten()
        .map(|a| a.id.as_str())
        .collect();
    let key = job.key();

    let (mut candidates, fixed): (Vec<&Allocation>, Vec<&Allocation>) = ctx
        .proposed_allocs(&node.id)
        .into_iter()
        .partition(|a| {
            a.job_priority < job.priority && a.job_key() != key && !placed.contains(a.id.as_str())
        });
    if candidates.is_empty() {
        return None;
    }

    // Nothing short of a full eviction helps: not a candidate node.
    fit_task_group(node, tg, &fixed).ok()?;

    candidates.sort_by(|a, b| a.job_priority.cmp(&b.job_priority).then_with(|| a.id.cmp(&b.id)));

    let capacity = node.comparable_capacity();
    let ask = tg.comparable_ask();
    let mut victims: Vec<&Allocation> = Vec::new();

    loop {
        let remaining = retained(&fixed, &candidates, &victims);
        if fit_task_group(node, tg, &remaining).is_ok() {
            break;
        }
        let missing = used_resources(&remaining).plus(&ask).saturating_sub(&capacity);
        let next = candidates
            .iter()
            .filter(|c| !victims.iter().any(|v| v.id == c.id))
            .min_by(|a, b| {
                a.job_priority
                    .cmp(&b.job_priority)
                    .then_with(|| usefulness(b, &missing).total_cmp(&usefulness(a, &missing)))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .copied()?;
        victims.push(next);
    }

    // Prune, most valuable victims first.
    victims.sort_by(|a, b| b.job_priority.cmp(&a.job_priority).then_with(|| a.id.cmp(&b.id)));
    let mut i = 0;
    while i < victims.len() {
        let mut trial = victims.clone();
        trial.remove(i);
        if fit_task_group(node, tg, &retained(&fixed, &candidates, &trial)).is_ok() {
            victims = trial;
        } else {
            i += 1;
        }
    }

    let resources = fit_task_group(node, tg, &retained(&fixed, &candidates, &victims)).ok()?;
    Some(PreemptionResult {
        node_id: node.id.clone(),
        victims: victims.into_iter().cloned().collect(),
        resources,
    })
}

fn retained<'a>(
    fixed: &[&'a Allocation],
    candidates: &[&'a Allocation],
    victims: &[&Allocation],
) -> Vec<&'a Allocation> {
    fixed
        .iter()
        .copied()
        .chain(
            candidates
                .iter()
                .copied()
                .filter(|c| !victims.iter().any(|v| v.id == c.id)),
        )
        .collect()
}

/// Average share of each still-missing dimension that evicting `alloc`
/// would free. Zero when nothing countable is missing (ports, devices).
fn usefulness(alloc: &Allocation, missing: &ComparableResources) -> f64 {
    let freed = alloc.comparable_resources();
    let dims = [
        (freed.cpu_shares, missing.cpu_shares),
        (freed.memory_bytes, missing.memory_bytes),
        (freed.disk_bytes, missing.disk_bytes),
        (freed.bandwidth_mbits, missing.bandwidth_mbits),
    ];
    let (sum, n) = dims
        .iter()
        .filter(|(_, m)| *m > 0)
        .fold((0.0, 0u32), |(s, n), (f, m)| {
            (s + (*f).min(*m) as f64 / *m as f64, n + 1)
        });
    if n == 0 { 0.0 } else { sum / f64::from(n) }
}
