//! Placement pass for system and sysbatch jobs: one allocation per task
//! group on every eligible node.
//!
//! Nodes are walked in id order. For each (node, group) pair the existing
//! allocations are diffed against what should run there:
//!
//! - down or disconnected node: live allocations are marked lost, nothing
//!   is placed
//! - draining node: allocations are stopped unless the drain ignores
//!   system jobs
//! - node outside the job's datacenters: allocations are stopped
//! - failed, lost or (for system jobs) completed allocations are replaced
//! - outdated allocations are updated in place or replaced
//!
//! Nodes that fail a group's constraints are skipped silently. Nodes that
//! qualify but lack capacity are placement failures.

use std::collections::BTreeMap;

use corral_core::{
    AllocClientStatus, AllocMetric, Allocation, Job, JobKey, Node, TaskGroup, alloc_name, epoch_secs,
};
use corral_placement::{EvalContext, Rejection, SystemStack};
use corral_state::Snapshot;

use crate::generic::new_alloc;
use crate::reconcile::{
    ALLOC_GROUP_REMOVED, ALLOC_JOB_STOPPED, ALLOC_LOST, ALLOC_MIGRATING, ALLOC_NOT_NEEDED, ALLOC_UPDATING,
    DesiredUpdates, PlacementRequest,
};
use crate::scheduler::Pass;

pub(crate) fn compute(ctx: &mut EvalContext, job: Option<&Job>, key: &JobKey) -> Pass {
    let snapshot = ctx.snapshot().clone();
    let eval_id = ctx.plan().eval_id.clone();
    let mut pass = Pass::default();
    let mut desired: BTreeMap<String, DesiredUpdates> = BTreeMap::new();

    let live: Vec<&Allocation> = snapshot
        .allocs_by_job(key)
        .into_iter()
        .filter(|a| !a.server_terminal_status())
        .collect();

    let job = match job {
        Some(job) if !job.stopped() => job,
        _ => {
            for alloc in live.iter().filter(|a| !a.client_terminal_status()) {
                desired.entry(alloc.task_group.clone()).or_default().stop += 1;
                ctx.plan_mut().append_stopped_alloc(alloc, ALLOC_JOB_STOPPED, None);
            }
            pass.desired = desired;
            return pass;
        }
    };

    let mut by_slot: BTreeMap<(&str, &str), Vec<&Allocation>> = BTreeMap::new();
    for alloc in live {
        if job.lookup_task_group(&alloc.task_group).is_none() {
            if !alloc.client_terminal_status() {
                desired.entry(alloc.task_group.clone()).or_default().stop += 1;
                ctx.plan_mut().append_stopped_alloc(alloc, ALLOC_GROUP_REMOVED, None);
            }
            continue;
        }
        by_slot
            .entry((alloc.node_id.as_str(), alloc.task_group.as_str()))
            .or_default()
            .push(alloc);
    }

    // Allocations on nodes that left the cluster entirely.
    let orphaned: Vec<(&str, &str)> = by_slot
        .keys()
        .filter(|(node_id, _)| snapshot.node(node_id).is_none())
        .copied()
        .collect();
    for slot in orphaned {
        for alloc in by_slot.remove(&slot).unwrap_or_default() {
            if !alloc.client_terminal_status() {
                desired.entry(alloc.task_group.clone()).or_default().lost += 1;
                ctx.plan_mut()
                    .append_stopped_alloc(alloc, ALLOC_LOST, Some(AllocClientStatus::Lost));
            }
        }
    }

    for tg in &job.task_groups {
        pass.queued.insert(tg.name.clone(), 0);
    }

    let stack = SystemStack::new(job);
    let now = epoch_secs();
    for node in snapshot.nodes() {
        for tg in &job.task_groups {
            let existing = by_slot
                .remove(&(node.id.as_str(), tg.name.as_str()))
                .unwrap_or_default();
            let counts = desired.entry(tg.name.clone()).or_default();
            let Some(request) = diff_slot(ctx, &snapshot, job, tg, node, existing, counts) else {
                continue;
            };

            match stack.select_node(ctx, tg, node) {
                Ok(ranked) => {
                    counts.place += 1;
                    let alloc = new_alloc(&eval_id, job, tg, &request, &ranked, now);
                    for victim in &ranked.preempted {
                        ctx.plan_mut().append_preempted_alloc(victim, &alloc.id);
                    }
                    ctx.plan_mut().append_alloc(alloc);
                }
                // The node does not qualify for this group; an outdated
                // allocation there is still stopped.
                Err(Rejection::Filtered(_)) => {}
                Err(Rejection::Exhausted(_)) => {
                    let metric = ctx.metrics().clone();
                    merge_failure(&mut pass, &tg.name, &metric);
                    if request.destructive {
                        if let Some(previous) = &request.previous {
                            ctx.plan_mut().pop_update(previous);
                        }
                    }
                }
            }
        }
    }

    pass.desired = desired;
    pass
}

/// Stop what must go from one (node, group) slot and return the placement
/// the slot still needs, if any.
fn diff_slot(
    ctx: &mut EvalContext,
    snapshot: &Snapshot,
    job: &Job,
    tg: &TaskGroup,
    node: &Node,
    mut existing: Vec<&Allocation>,
    counts: &mut DesiredUpdates,
) -> Option<PlacementRequest> {
    let in_datacenter = job.datacenters.is_empty() || job.datacenters.contains(&node.datacenter);
    let drained = node.drain.as_ref().is_some_and(|d| !d.ignore_system_jobs);

    if node.terminal_status() || drained || !in_datacenter {
        for alloc in existing.iter().filter(|a| !a.client_terminal_status()) {
            if node.terminal_status() {
                counts.lost += 1;
                ctx.plan_mut()
                    .append_stopped_alloc(alloc, ALLOC_LOST, Some(AllocClientStatus::Lost));
            } else if drained {
                counts.migrate += 1;
                ctx.plan_mut().append_stopped_alloc(alloc, ALLOC_MIGRATING, None);
            } else {
                counts.stop += 1;
                ctx.plan_mut().append_stopped_alloc(alloc, ALLOC_NOT_NEEDED, None);
            }
        }
        return None;
    }

    // Keep the newest live allocation; stop any duplicates.
    existing.sort_by(|a, b| {
        a.client_terminal_status()
            .cmp(&b.client_terminal_status())
            .then_with(|| b.create_index.cmp(&a.create_index))
            .then_with(|| a.id.cmp(&b.id))
    });
    let mut existing = existing.into_iter();
    let current = existing.next();
    for extra in existing.filter(|a| !a.client_terminal_status()) {
        counts.stop += 1;
        ctx.plan_mut().append_stopped_alloc(extra, ALLOC_NOT_NEEDED, None);
    }

    let name = alloc_name(&job.id, &tg.name, 0);
    let fresh = |previous: Option<&Allocation>, destructive: bool| PlacementRequest {
        name: name.clone(),
        task_group: tg.name.clone(),
        previous: previous.cloned(),
        reschedule: false,
        destructive,
    };

    let Some(alloc) = current else {
        return node.ready().then(|| fresh(None, false));
    };

    match alloc.client_status {
        AllocClientStatus::Complete if job.job_type.keeps_completed() => {
            counts.ignore += 1;
            None
        }
        AllocClientStatus::Complete | AllocClientStatus::Failed | AllocClientStatus::Lost => {
            if node.ready() {
                Some(fresh(Some(alloc), false))
            } else {
                counts.ignore += 1;
                None
            }
        }
        AllocClientStatus::Pending | AllocClientStatus::Running => {
            if alloc.job_version == job.version {
                counts.ignore += 1;
                return None;
            }
            if update_in_place_ok(snapshot, job, tg, alloc) {
                counts.in_place_update += 1;
                let mut updated = alloc.clone();
                updated.job_version = job.version;
                updated.job_priority = job.priority;
                updated.eval_id = ctx.plan().eval_id.clone();
                ctx.plan_mut().append_alloc(updated);
                return None;
            }
            counts.destructive_update += 1;
            ctx.plan_mut().append_stopped_alloc(alloc, ALLOC_UPDATING, None);
            node.ready().then(|| fresh(Some(alloc), true))
        }
    }
}

fn update_in_place_ok(snapshot: &Snapshot, job: &Job, tg: &TaskGroup, alloc: &Allocation) -> bool {
    let Some(old_job) = snapshot.job_by_version(&job.key(), alloc.job_version) else {
        return false;
    };
    old_job.lookup_task_group(&tg.name).is_some_and(|old_tg| {
        old_tg.in_place_compatible(tg) && old_tg.constraints == tg.constraints && old_job.constraints == job.constraints
    })
}

/// Fold another exhausted node into the group's failure record.
fn merge_failure(pass: &mut Pass, group: &str, metric: &AllocMetric) {
    if let Some(existing) = pass.failed.get_mut(group) {
        existing.nodes_evaluated += metric.nodes_evaluated;
        existing.nodes_exhausted += metric.nodes_exhausted;
        for (dc, n) in &metric.nodes_available {
            *existing.nodes_available.entry(dc.clone()).or_default() += n;
        }
        for (dim, n) in &metric.dimension_exhausted {
            *existing.dimension_exhausted.entry(dim.clone()).or_default() += n;
        }
        existing
            .node_reasons
            .extend(metric.node_reasons.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    pass.record_failure(group, metric);
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::config::CorralConfig;
    use corral_core::{
        AllocDesiredStatus, AllocatedResources, AllocatedTaskResources, Constraint, DrainStrategy, DriverInfo,
        Evaluation, JobType, NodeResources, NodeStatus, Operand, Plan, Task, TaskResources, TriggerBy,
    };

    const GIB: u64 = 1024 * 1024 * 1024;

    fn node(id: &str, cpu: u64) -> Node {
        let mut n = Node {
            id: id.to_string(),
            datacenter: "dc1".to_string(),
            resources: NodeResources {
                cpu_shares: cpu,
                memory_bytes: 8 * GIB,
                ..Default::default()
            },
            ..Default::default()
        };
        n.attributes.insert("os.name".to_string(), "linux".to_string());
        n.drivers.insert("exec".to_string(), DriverInfo::healthy());
        n.compute_class();
        n
    }

    fn job(job_type: JobType) -> Job {
        Job {
            id: "agent".to_string(),
            job_type,
            priority: 60,
            version: 1,
            task_groups: vec![TaskGroup {
                name: "main".to_string(),
                count: 1,
                tasks: vec![Task {
                    name: "t".to_string(),
                    driver: "exec".to_string(),
                    resources: TaskResources {
                        cpu_shares: 500,
                        memory_bytes: GIB,
                        devices: Vec::new(),
                    },
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn alloc(id: &str, job_id: &str, node: &str, priority: i32, cpu: u64) -> Allocation {
        let mut resources = AllocatedResources::default();
        resources.tasks.insert(
            "t".to_string(),
            AllocatedTaskResources {
                cpu_shares: cpu,
                memory_bytes: GIB,
                devices: Vec::new(),
            },
        );
        Allocation {
            id: id.to_string(),
            name: format!("{job_id}.main[0]"),
            namespace: "default".to_string(),
            job_id: job_id.to_string(),
            job_version: 1,
            job_priority: priority,
            task_group: "main".to_string(),
            node_id: node.to_string(),
            resources,
            client_status: AllocClientStatus::Running,
            ..Default::default()
        }
    }

    fn ctx(job: &Job, snapshot: Snapshot) -> EvalContext {
        let eval = Evaluation::for_job(job, TriggerBy::JobRegister);
        EvalContext::new(snapshot, Plan::new(&eval, "tok", 0, Some(job.clone())), &CorralConfig::default())
    }

    fn placed_nodes(ctx: EvalContext) -> Vec<String> {
        ctx.into_plan().node_allocation.keys().cloned().collect()
    }

    #[test]
    fn one_alloc_per_ready_node() {
        let j = job(JobType::System);
        let mut down = node("n3", 4000);
        down.status = NodeStatus::Down;
        let snap = Snapshot::builder()
            .node(node("n1", 4000))
            .node(node("n2", 4000))
            .node(down)
            .job(j.clone())
            .build();
        let mut ctx = ctx(&j, snap);
        let pass = compute(&mut ctx, Some(&j), &j.key());
        assert!(pass.failed.is_empty());
        assert_eq!(pass.desired["main"].place, 2);
        assert_eq!(placed_nodes(ctx), vec!["n1", "n2"]);
    }

    #[test]
    fn existing_allocs_are_left_alone() {
        let j = job(JobType::System);
        let snap = Snapshot::builder()
            .node(node("n1", 4000))
            .node(node("n2", 4000))
            .job(j.clone())
            .alloc(alloc("a1", "agent", "n1", 60, 500))
            .build();
        let mut ctx = ctx(&j, snap);
        let pass = compute(&mut ctx, Some(&j), &j.key());
        assert_eq!(pass.desired["main"].ignore, 1);
        assert_eq!(placed_nodes(ctx), vec!["n2"]);
    }

    #[test]
    fn filtered_nodes_are_skipped_silently() {
        let mut j = job(JobType::System);
        j.constraints.push(Constraint::new("${attr.os.name}", Operand::Equal, "windows"));
        let snap = Snapshot::builder().node(node("n1", 4000)).job(j.clone()).build();
        let mut ctx = ctx(&j, snap);
        let pass = compute(&mut ctx, Some(&j), &j.key());
        assert!(pass.failed.is_empty());
        assert_eq!(pass.queued["main"], 0);
        assert!(ctx.plan().is_no_op());
    }

    #[test]
    fn exhausted_nodes_are_failures() {
        let mut j = job(JobType::System);
        j.priority = 40;
        let snap = Snapshot::builder()
            .node(node("n1", 400))
            .node(node("n2", 400))
            .job(j.clone())
            .build();
        let mut ctx = ctx(&j, snap);
        let pass = compute(&mut ctx, Some(&j), &j.key());
        assert_eq!(pass.queued["main"], 2);
        let metric = &pass.failed["main"];
        assert_eq!(metric.nodes_exhausted, 2);
        assert_eq!(metric.coalesced_failures, 1);
        assert_eq!(metric.node_reasons.len(), 2);
    }

    #[test]
    fn exhausted_node_preempts_lower_priority() {
        let j = job(JobType::System);
        let snap = Snapshot::builder()
            .node(node("n1", 1000))
            .job(j.clone())
            .alloc(alloc("low", "batchy", "n1", 10, 800))
            .build();
        let mut ctx = ctx(&j, snap);
        let pass = compute(&mut ctx, Some(&j), &j.key());
        assert!(pass.failed.is_empty());
        let plan = ctx.into_plan();
        assert_eq!(plan.node_preemptions["n1"][0].id, "low");
        assert_eq!(plan.node_preemptions["n1"][0].desired_status, AllocDesiredStatus::Evict);
        assert_eq!(plan.node_allocation["n1"][0].preempted_allocations, vec!["low".to_string()]);
    }

    #[test]
    fn down_and_draining_nodes_stop_allocs() {
        let j = job(JobType::System);
        let mut down = node("n1", 4000);
        down.status = NodeStatus::Down;
        let mut draining = node("n2", 4000);
        draining.drain = Some(DrainStrategy::default());
        let mut ignoring = node("n3", 4000);
        ignoring.drain = Some(DrainStrategy {
            ignore_system_jobs: true,
            ..Default::default()
        });
        let snap = Snapshot::builder()
            .node(down)
            .node(draining)
            .node(ignoring)
            .job(j.clone())
            .alloc(alloc("a1", "agent", "n1", 60, 500))
            .alloc(alloc("a2", "agent", "n2", 60, 500))
            .alloc(alloc("a3", "agent", "n3", 60, 500))
            .build();
        let mut ctx = ctx(&j, snap);
        let pass = compute(&mut ctx, Some(&j), &j.key());
        assert_eq!(pass.desired["main"].lost, 1);
        assert_eq!(pass.desired["main"].migrate, 1);
        let plan = ctx.into_plan();
        assert_eq!(plan.node_update["n1"][0].client_status, AllocClientStatus::Lost);
        assert_eq!(plan.node_update["n2"][0].id, "a2");
        assert!(!plan.node_update.contains_key("n3"));
        assert!(plan.node_allocation.is_empty());
    }

    #[test]
    fn sysbatch_keeps_completed_system_replaces_it() {
        let mut done = alloc("a1", "agent", "n1", 60, 500);
        done.client_status = AllocClientStatus::Complete;

        let sysbatch = job(JobType::SysBatch);
        let snap = Snapshot::builder()
            .node(node("n1", 4000))
            .job(sysbatch.clone())
            .alloc(done.clone())
            .build();
        let mut c = ctx(&sysbatch, snap);
        compute(&mut c, Some(&sysbatch), &sysbatch.key());
        assert!(c.plan().is_no_op());

        let system = job(JobType::System);
        let snap = Snapshot::builder().node(node("n1", 4000)).job(system.clone()).alloc(done).build();
        let mut c = ctx(&system, snap);
        compute(&mut c, Some(&system), &system.key());
        let plan = c.into_plan();
        assert_eq!(plan.node_allocation["n1"][0].previous_allocation.as_deref(), Some("a1"));
    }

    #[test]
    fn stopped_job_stops_everything() {
        let mut j = job(JobType::System);
        j.stop = true;
        let snap = Snapshot::builder()
            .node(node("n1", 4000))
            .job(j.clone())
            .alloc(alloc("a1", "agent", "n1", 60, 500))
            .build();
        let mut ctx = ctx(&j, snap);
        compute(&mut ctx, Some(&j), &j.key());
        let plan = ctx.into_plan();
        assert_eq!(plan.node_update["n1"].len(), 1);
        assert!(plan.node_allocation.is_empty());
    }
}
