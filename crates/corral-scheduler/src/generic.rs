//! Placement pass for service and batch jobs.

use std::collections::BTreeSet;

use tracing::trace;

use corral_core::{
    AllocClientStatus, AllocDesiredStatus, Allocation, Job, JobKey, NodeId, RescheduleEvent, ReschedulePolicy,
    TaskGroup, generate_uuid,
};
use corral_placement::{EvalContext, GenericStack, RankedNode, SelectOptions};

use crate::reconcile::{AllocReconciler, PlacementRequest};
use crate::scheduler::Pass;

/// Reconcile the job against the context's snapshot and fill the plan.
/// `now` is unix seconds.
pub(crate) fn compute(ctx: &mut EvalContext, job: Option<&Job>, key: &JobKey, now: u64) -> Pass {
    let results = AllocReconciler::new(job, key.clone(), ctx.snapshot(), now).compute();
    let eval_id = ctx.plan().eval_id.clone();

    for stop in &results.stop {
        ctx.plan_mut()
            .append_stopped_alloc(&stop.alloc, &stop.description, stop.client_status);
    }
    for mut alloc in results.in_place_update {
        alloc.eval_id = eval_id.clone();
        ctx.plan_mut().append_alloc(alloc);
    }

    let mut pass = Pass {
        followups: results.followups,
        desired: results.desired,
        ..Default::default()
    };

    let Some(job) = job.filter(|j| !j.stopped()) else {
        return pass;
    };
    for tg in &job.task_groups {
        pass.queued.insert(tg.name.clone(), 0);
    }
    if results.place.is_empty() {
        return pass;
    }

    let stack = GenericStack::new(job, ctx.snapshot());
    for request in &results.place {
        let Some(tg) = job.lookup_task_group(&request.task_group) else {
            continue;
        };

        // Once a group failed, the remaining instances fail the same way.
        if pass.failed.contains_key(&tg.name) {
            let metric = pass.failed[&tg.name].clone();
            pass.record_failure(&tg.name, &metric);
            keep_previous(ctx, request);
            continue;
        }

        let options = SelectOptions {
            penalty_nodes: penalty_nodes(request),
        };
        match stack.select(ctx, tg, &options) {
            Some(ranked) => {
                let alloc = new_alloc(&eval_id, job, tg, request, &ranked, now);
                trace!(alloc_id = %alloc.id, name = %alloc.name, node_id = %alloc.node_id, "placing");
                for victim in &ranked.preempted {
                    ctx.plan_mut().append_preempted_alloc(victim, &alloc.id);
                }
                ctx.plan_mut().append_alloc(alloc);
            }
            None => {
                let metric = ctx.metrics().clone();
                pass.record_failure(&tg.name, &metric);
                keep_previous(ctx, request);
            }
        }
    }
    pass
}

/// A destructive update whose replacement cannot be placed leaves the old
/// allocation running.
fn keep_previous(ctx: &mut EvalContext, request: &PlacementRequest) {
    if request.destructive {
        if let Some(previous) = &request.previous {
            ctx.plan_mut().pop_update(previous);
        }
    }
}

/// Rescheduled placements avoid the nodes their lineage failed on.
fn penalty_nodes(request: &PlacementRequest) -> BTreeSet<NodeId> {
    let mut nodes = BTreeSet::new();
    if !request.reschedule {
        return nodes;
    }
    if let Some(previous) = &request.previous {
        nodes.insert(previous.node_id.clone());
        nodes.extend(previous.reschedule_tracker.iter().map(|e| e.prev_node_id.clone()));
    }
    nodes
}

pub(crate) fn new_alloc(
    eval_id: &str,
    job: &Job,
    tg: &TaskGroup,
    request: &PlacementRequest,
    ranked: &RankedNode,
    now: u64,
) -> Allocation {
    let mut reschedule_tracker = Vec::new();
    if let (Some(previous), true) = (&request.previous, request.reschedule) {
        let policy = tg
            .reschedule_policy
            .clone()
            .unwrap_or_else(|| ReschedulePolicy::default_for(job.job_type));
        reschedule_tracker = previous.reschedule_tracker.clone();
        reschedule_tracker.push(RescheduleEvent {
            reschedule_time: now,
            prev_alloc_id: previous.id.clone(),
            prev_node_id: previous.node_id.clone(),
            delay_secs: policy.next_delay(&previous.reschedule_tracker),
        });
    }

    Allocation {
        id: generate_uuid(),
        name: request.name.clone(),
        namespace: job.namespace.clone(),
        eval_id: eval_id.to_string(),
        node_id: ranked.node_id.clone(),
        job_id: job.id.clone(),
        job_version: job.version,
        job_priority: job.priority,
        job_type: job.job_type,
        task_group: tg.name.clone(),
        resources: ranked.resources.clone(),
        desired_status: AllocDesiredStatus::Run,
        client_status: AllocClientStatus::Pending,
        previous_allocation: request.previous.as_ref().map(|p| p.id.clone()),
        reschedule_tracker,
        preempted_allocations: ranked.preempted.iter().map(|a| a.id.clone()).collect(),
        ..Default::default()
    }
}
