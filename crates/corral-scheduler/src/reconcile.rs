//! Allocation reconciler for service and batch jobs.
//!
//! Compares a job's desired task groups with the allocations that exist for
//! it and decides, per group, what has to change:
//!
//! - allocations of a stopped job or a removed group are stopped
//! - lost allocations (node down or gone) are stopped and replaced
//! - allocations on draining nodes are migrated (stopped and replaced)
//! - failed allocations are rescheduled now, later, or not at all
//! - allocations of an older job version are updated in place or replaced
//! - the running count is converged to the group's `count`
//!
//! The reconciler is pure: it reads the snapshot and produces a
//! [`ReconcileResults`] for the scheduler to turn into a plan.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use corral_core::{
    AllocClientStatus, AllocId, Allocation, EvalStatus, Job, JobKey, ReschedulePolicy, TaskGroup, TriggerBy,
    alloc_name,
};
use corral_state::Snapshot;

pub(crate) const ALLOC_NOT_NEEDED: &str = "alloc not needed due to job update";
pub(crate) const ALLOC_JOB_STOPPED: &str = "alloc not needed since job is stopped";
pub(crate) const ALLOC_GROUP_REMOVED: &str = "alloc not needed as task group was removed";
pub(crate) const ALLOC_MIGRATING: &str = "alloc is being migrated";
pub(crate) const ALLOC_UPDATING: &str = "alloc is being updated due to job update";
pub(crate) const ALLOC_LOST: &str = "alloc is lost since its node is down";

/// One allocation the scheduler must place.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementRequest {
    pub name: String,
    pub task_group: String,
    /// The allocation this one replaces.
    pub previous: Option<Allocation>,
    /// Replacement of a failed allocation.
    pub reschedule: bool,
    /// Replacement of an outdated allocation; the old one keeps running if
    /// this placement fails.
    pub destructive: bool,
}

/// One allocation the scheduler must stop.
#[derive(Debug, Clone, PartialEq)]
pub struct StopRequest {
    pub alloc: Allocation,
    pub description: String,
    pub client_status: Option<AllocClientStatus>,
}

/// Per-group summary of the reconciler's decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredUpdates {
    pub place: u32,
    pub stop: u32,
    pub ignore: u32,
    pub in_place_update: u32,
    pub destructive_update: u32,
    pub migrate: u32,
    pub lost: u32,
    pub reschedule_now: u32,
    pub reschedule_later: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileResults {
    pub place: Vec<PlacementRequest>,
    pub stop: Vec<StopRequest>,
    /// Updated copies of allocations whose new job version runs unchanged.
    pub in_place_update: Vec<Allocation>,
    /// Delayed reschedules: wait-until (unix millis) → failed allocation ids.
    pub followups: BTreeMap<u64, Vec<AllocId>>,
    pub desired: BTreeMap<String, DesiredUpdates>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replace {
    Lost,
    Migrate,
    Reschedule,
}

#[derive(Debug, Clone, Copy)]
enum Slot<'a> {
    Existing(&'a Allocation),
    InPlace(&'a Allocation),
    Destructive(&'a Allocation),
    Replace(&'a Allocation, Replace),
}

impl<'a> Slot<'a> {
    fn alloc(&self) -> &'a Allocation {
        match *self {
            Slot::Existing(a) | Slot::InPlace(a) | Slot::Destructive(a) | Slot::Replace(a, _) => a,
        }
    }

    fn index(&self) -> u32 {
        self.alloc().index().unwrap_or(u32::MAX)
    }

    /// Replacements are dropped before running allocations on scale-down.
    fn keep_rank(&self) -> u8 {
        match self {
            Slot::Replace(..) => 0,
            _ => 1,
        }
    }
}

pub struct AllocReconciler<'a> {
    job: Option<&'a Job>,
    key: JobKey,
    snapshot: &'a Snapshot,
    /// Unix seconds.
    now: u64,
}

impl<'a> AllocReconciler<'a> {
    pub fn new(job: Option<&'a Job>, key: JobKey, snapshot: &'a Snapshot, now: u64) -> Self {
        Self {
            job,
            key,
            snapshot,
            now,
        }
    }

    pub fn compute(&self) -> ReconcileResults {
        let mut results = ReconcileResults::default();
        let allocs = self.snapshot.allocs_by_job(&self.key);

        let job = match self.job {
            Some(job) if !job.stopped() => job,
            _ => {
                for alloc in allocs.into_iter().filter(|a| !a.terminal_status()) {
                    results.desired.entry(alloc.task_group.clone()).or_default().stop += 1;
                    results.stop.push(StopRequest {
                        alloc: alloc.clone(),
                        description: ALLOC_JOB_STOPPED.to_string(),
                        client_status: None,
                    });
                }
                return results;
            }
        };

        let mut by_group: BTreeMap<&str, Vec<&Allocation>> = BTreeMap::new();
        for alloc in allocs {
            by_group.entry(alloc.task_group.as_str()).or_default().push(alloc);
        }

        for (group, allocs) in &by_group {
            if job.lookup_task_group(group).is_some() {
                continue;
            }
            for alloc in allocs.iter().filter(|a| !a.terminal_status()) {
                results.desired.entry(group.to_string()).or_default().stop += 1;
                results.stop.push(StopRequest {
                    alloc: (*alloc).clone(),
                    description: ALLOC_GROUP_REMOVED.to_string(),
                    client_status: None,
                });
            }
        }

        for tg in &job.task_groups {
            let allocs = by_group.remove(tg.name.as_str()).unwrap_or_default();
            self.compute_group(job, tg, allocs, &mut results);
        }
        results
    }

    fn compute_group(&self, job: &Job, tg: &TaskGroup, allocs: Vec<&'a Allocation>, results: &mut ReconcileResults) {
        let policy = tg
            .reschedule_policy
            .clone()
            .unwrap_or_else(|| ReschedulePolicy::default_for(job.job_type));
        let keeps_completed = job.job_type.keeps_completed();
        let pending_followups = self.pending_followups();
        let mut desired = DesiredUpdates::default();
        let mut slots: Vec<Slot<'a>> = Vec::new();

        for alloc in allocs {
            if alloc.server_terminal_status() {
                desired.ignore += 1;
                continue;
            }
            match alloc.client_status {
                AllocClientStatus::Complete if keeps_completed => {
                    slots.push(Slot::Existing(alloc));
                    continue;
                }
                AllocClientStatus::Complete | AllocClientStatus::Lost => {
                    desired.ignore += 1;
                    continue;
                }
                AllocClientStatus::Failed => {
                    if alloc.next_allocation.is_some() {
                        desired.ignore += 1;
                        continue;
                    }
                    match alloc.next_reschedule_time(&policy, self.now) {
                        Some(at) if at <= self.now => {
                            slots.push(Slot::Replace(alloc, Replace::Reschedule));
                        }
                        Some(at) => {
                            desired.reschedule_later += 1;
                            let wait_until = at * 1000;
                            if !pending_followups.contains(&wait_until) {
                                results.followups.entry(wait_until).or_default().push(alloc.id.clone());
                            }
                            slots.push(Slot::Existing(alloc));
                        }
                        // Out of attempts: the failed allocation keeps its slot.
                        None => slots.push(Slot::Existing(alloc)),
                    }
                    continue;
                }
                AllocClientStatus::Pending | AllocClientStatus::Running => {}
            }

            match self.snapshot.node(&alloc.node_id) {
                None => slots.push(Slot::Replace(alloc, Replace::Lost)),
                Some(node) if node.terminal_status() => slots.push(Slot::Replace(alloc, Replace::Lost)),
                Some(node) if node.draining() => slots.push(Slot::Replace(alloc, Replace::Migrate)),
                Some(_) if alloc.job_version != job.version => {
                    if self.update_in_place_ok(job, tg, alloc) {
                        slots.push(Slot::InPlace(alloc));
                    } else {
                        slots.push(Slot::Destructive(alloc));
                    }
                }
                Some(_) => slots.push(Slot::Existing(alloc)),
            }
        }

        // Scale down: drop the highest indexes, replacements first.
        let count = tg.count as usize;
        slots.sort_by(|a, b| {
            b.keep_rank()
                .cmp(&a.keep_rank())
                .then_with(|| a.index().cmp(&b.index()))
                .then_with(|| a.alloc().id.cmp(&b.alloc().id))
        });
        let removed = if slots.len() > count { slots.split_off(count) } else { Vec::new() };

        for slot in removed {
            match slot {
                Slot::Existing(alloc) if alloc.client_terminal_status() => desired.ignore += 1,
                Slot::Existing(alloc) | Slot::InPlace(alloc) | Slot::Destructive(alloc) => {
                    desired.stop += 1;
                    results.stop.push(stop(alloc, ALLOC_NOT_NEEDED, None));
                }
                Slot::Replace(alloc, Replace::Lost) => {
                    desired.stop += 1;
                    results.stop.push(stop(alloc, ALLOC_LOST, Some(AllocClientStatus::Lost)));
                }
                Slot::Replace(alloc, Replace::Migrate) => {
                    desired.stop += 1;
                    results.stop.push(stop(alloc, ALLOC_NOT_NEEDED, None));
                }
                Slot::Replace(_, Replace::Reschedule) => desired.ignore += 1,
            }
        }

        let mut used: BTreeSet<u32> = BTreeSet::new();
        let mut place: Vec<PlacementRequest> = Vec::new();
        for slot in &slots {
            used.insert(slot.index());
            match *slot {
                Slot::Existing(_) => desired.ignore += 1,
                Slot::InPlace(alloc) => {
                    desired.in_place_update += 1;
                    let mut updated = alloc.clone();
                    updated.job_version = job.version;
                    updated.job_priority = job.priority;
                    results.in_place_update.push(updated);
                }
                Slot::Destructive(alloc) => {
                    desired.destructive_update += 1;
                    results.stop.push(stop(alloc, ALLOC_UPDATING, None));
                    place.push(replacement(tg, alloc, false, true));
                }
                Slot::Replace(alloc, Replace::Lost) => {
                    desired.lost += 1;
                    results.stop.push(stop(alloc, ALLOC_LOST, Some(AllocClientStatus::Lost)));
                    place.push(replacement(tg, alloc, false, false));
                }
                Slot::Replace(alloc, Replace::Migrate) => {
                    desired.migrate += 1;
                    results.stop.push(stop(alloc, ALLOC_MIGRATING, None));
                    place.push(replacement(tg, alloc, false, false));
                }
                Slot::Replace(alloc, Replace::Reschedule) => {
                    desired.reschedule_now += 1;
                    place.push(replacement(tg, alloc, true, false));
                }
            }
        }

        // Scale up: fill the lowest free indexes.
        let mut missing = count.saturating_sub(slots.len());
        let mut index = 0u32;
        while missing > 0 {
            if used.insert(index) {
                place.push(PlacementRequest {
                    name: alloc_name(&job.id, &tg.name, index),
                    task_group: tg.name.clone(),
                    previous: None,
                    reschedule: false,
                    destructive: false,
                });
                missing -= 1;
            }
            index += 1;
        }

        place.sort_by_key(|p| name_index(&p.name));
        desired.place += place.len() as u32;
        results.place.extend(place);
        results.desired.insert(tg.name.clone(), desired);
    }

    /// An outdated allocation may keep running under the new version when
    /// everything that affects its placement is unchanged.
    fn update_in_place_ok(&self, job: &Job, tg: &TaskGroup, alloc: &Allocation) -> bool {
        let Some(old_job) = self.snapshot.job_by_version(&self.key, alloc.job_version) else {
            return false;
        };
        let Some(old_tg) = old_job.lookup_task_group(&tg.name) else {
            return false;
        };
        let dc_ok = job.datacenters.is_empty()
            || self
                .snapshot
                .node(&alloc.node_id)
                .is_some_and(|n| job.datacenters.contains(&n.datacenter));
        dc_ok
            && old_tg.in_place_compatible(tg)
            && old_tg.constraints == tg.constraints
            && old_job.constraints == job.constraints
    }

    /// Wait-until times of retry evaluations already pending for the job.
    fn pending_followups(&self) -> BTreeSet<u64> {
        self.snapshot
            .evals_by_job(&self.key)
            .into_iter()
            .filter(|e| e.status == EvalStatus::Pending && e.triggered_by == TriggerBy::RetryFailedAlloc)
            .filter_map(|e| e.wait_until)
            .collect()
    }
}

fn stop(alloc: &Allocation, description: &str, client_status: Option<AllocClientStatus>) -> StopRequest {
    StopRequest {
        alloc: alloc.clone(),
        description: description.to_string(),
        client_status,
    }
}

fn replacement(tg: &TaskGroup, previous: &Allocation, reschedule: bool, destructive: bool) -> PlacementRequest {
    PlacementRequest {
        name: previous.name.clone(),
        task_group: tg.name.clone(),
        previous: Some(previous.clone()),
        reschedule,
        destructive,
    }
}

fn name_index(name: &str) -> u32 {
    let probe = Allocation {
        name: name.to_string(),
        ..Default::default()
    };
    probe.index().unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::{
        AllocDesiredStatus, DrainStrategy, Evaluation, JobType, Node, NodeStatus, RescheduleEvent, Task,
        TaskResources,
    };

    fn job(count: u32) -> Job {
        Job {
            id: "web".to_string(),
            version: 1,
            task_groups: vec![TaskGroup {
                name: "api".to_string(),
                count,
                tasks: vec![Task {
                    name: "srv".to_string(),
                    driver: "exec".to_string(),
                    resources: TaskResources {
                        cpu_shares: 100,
                        memory_bytes: 64,
                        devices: Vec::new(),
                    },
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            ..Default::default()
        }
    }

    fn alloc(index: u32, node: &str) -> Allocation {
        Allocation {
            id: format!("a{index}"),
            name: alloc_name("web", "api", index),
            namespace: "default".to_string(),
            job_id: "web".to_string(),
            job_version: 1,
            task_group: "api".to_string(),
            node_id: node.to_string(),
            client_status: AllocClientStatus::Running,
            ..Default::default()
        }
    }

    fn reconcile(job: Option<&Job>, snap: &Snapshot, now: u64) -> ReconcileResults {
        AllocReconciler::new(job, JobKey::new("default", "web"), snap, now).compute()
    }

    fn names(place: &[PlacementRequest]) -> Vec<&str> {
        place.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn fresh_job_places_count() {
        let j = job(3);
        let snap = Snapshot::builder().job(j.clone()).build();
        let r = reconcile(Some(&j), &snap, 0);
        assert_eq!(names(&r.place), vec!["web.api[0]", "web.api[1]", "web.api[2]"]);
        assert_eq!(r.desired["api"].place, 3);
        assert!(r.stop.is_empty());
    }

    #[test]
    fn fills_gaps_in_indexes() {
        let j = job(3);
        let snap = Snapshot::builder()
            .job(j.clone())
            .node(node("n1"))
            .alloc(alloc(0, "n1"))
            .alloc(alloc(2, "n1"))
            .build();
        let r = reconcile(Some(&j), &snap, 0);
        assert_eq!(names(&r.place), vec!["web.api[1]"]);
        assert_eq!(r.desired["api"].ignore, 2);
    }

    #[test]
    fn scale_down_stops_highest_indexes() {
        let j = job(1);
        let snap = Snapshot::builder()
            .job(j.clone())
            .node(node("n1"))
            .alloc(alloc(0, "n1"))
            .alloc(alloc(1, "n1"))
            .alloc(alloc(2, "n1"))
            .build();
        let r = reconcile(Some(&j), &snap, 0);
        let mut stopped: Vec<&str> = r.stop.iter().map(|s| s.alloc.id.as_str()).collect();
        stopped.sort();
        assert_eq!(stopped, vec!["a1", "a2"]);
        assert!(r.place.is_empty());
    }

    #[test]
    fn stopped_job_stops_everything() {
        let mut j = job(2);
        j.stop = true;
        let mut done = alloc(1, "n1");
        done.client_status = AllocClientStatus::Complete;
        let snap = Snapshot::builder()
            .node(node("n1"))
            .alloc(alloc(0, "n1"))
            .alloc(done)
            .build();
        let r = reconcile(Some(&j), &snap, 0);
        assert_eq!(r.stop.len(), 1);
        assert_eq!(r.stop[0].description, ALLOC_JOB_STOPPED);

        let r = reconcile(None, &snap, 0);
        assert_eq!(r.stop.len(), 1);
    }

    #[test]
    fn lost_allocs_are_replaced() {
        let j = job(2);
        let mut down = node("n2");
        down.status = NodeStatus::Down;
        let snap = Snapshot::builder()
            .job(j.clone())
            .node(node("n1"))
            .node(down)
            .alloc(alloc(0, "n1"))
            .alloc(alloc(1, "n2"))
            .build();
        let r = reconcile(Some(&j), &snap, 0);
        assert_eq!(r.stop.len(), 1);
        assert_eq!(r.stop[0].client_status, Some(AllocClientStatus::Lost));
        assert_eq!(names(&r.place), vec!["web.api[1]"]);
        assert_eq!(r.place[0].previous.as_ref().unwrap().id, "a1");
        assert_eq!(r.desired["api"].lost, 1);
    }

    #[test]
    fn draining_node_migrates() {
        let j = job(1);
        let mut draining = node("n1");
        draining.drain = Some(DrainStrategy::default());
        let snap = Snapshot::builder()
            .job(j.clone())
            .node(draining)
            .alloc(alloc(0, "n1"))
            .build();
        let r = reconcile(Some(&j), &snap, 0);
        assert_eq!(r.stop[0].description, ALLOC_MIGRATING);
        assert_eq!(r.place.len(), 1);
        assert_eq!(r.desired["api"].migrate, 1);
    }

    #[test]
    fn removed_group_is_stopped() {
        let j = job(1);
        let mut orphan = alloc(0, "n1");
        orphan.id = "orphan".to_string();
        orphan.task_group = "old".to_string();
        let snap = Snapshot::builder()
            .job(j.clone())
            .node(node("n1"))
            .alloc(orphan)
            .alloc(alloc(0, "n1"))
            .build();
        let r = reconcile(Some(&j), &snap, 0);
        assert_eq!(r.stop.len(), 1);
        assert_eq!(r.stop[0].alloc.id, "orphan");
        assert_eq!(r.stop[0].description, ALLOC_GROUP_REMOVED);
    }

    #[test]
    fn unchanged_group_updates_in_place() {
        let old = job(1);
        let mut new = old.clone();
        new.version = 2;
        new.priority = 70;
        let snap = Snapshot::builder()
            .job_version(old)
            .job(new.clone())
            .node(node("n1"))
            .alloc(alloc(0, "n1"))
            .build();
        let r = reconcile(Some(&new), &snap, 0);
        assert!(r.place.is_empty());
        assert!(r.stop.is_empty());
        assert_eq!(r.in_place_update.len(), 1);
        assert_eq!(r.in_place_update[0].job_version, 2);
        assert_eq!(r.in_place_update[0].job_priority, 70);
    }

    #[test]
    fn changed_group_is_destructive() {
        let old = job(1);
        let mut new = old.clone();
        new.version = 2;
        new.task_groups[0].tasks[0].resources.cpu_shares = 500;
        let snap = Snapshot::builder()
            .job_version(old)
            .job(new.clone())
            .node(node("n1"))
            .alloc(alloc(0, "n1"))
            .build();
        let r = reconcile(Some(&new), &snap, 0);
        assert_eq!(r.stop.len(), 1);
        assert_eq!(r.stop[0].description, ALLOC_UPDATING);
        assert_eq!(r.place.len(), 1);
        assert!(r.place[0].destructive);
        assert_eq!(r.place[0].name, "web.api[0]");
    }

    #[test]
    fn batch_completed_allocs_count() {
        let mut j = job(2);
        j.job_type = JobType::Batch;
        let mut done = alloc(0, "n1");
        done.client_status = AllocClientStatus::Complete;
        let snap = Snapshot::builder()
            .job(j.clone())
            .node(node("n1"))
            .alloc(done)
            .alloc(alloc(1, "n1"))
            .build();
        let r = reconcile(Some(&j), &snap, 0);
        assert!(r.place.is_empty());
        assert!(r.stop.is_empty());
    }

    #[test]
    fn service_completed_allocs_are_replaced() {
        let j = job(1);
        let mut done = alloc(0, "n1");
        done.client_status = AllocClientStatus::Complete;
        let snap = Snapshot::builder().job(j.clone()).node(node("n1")).alloc(done).build();
        let r = reconcile(Some(&j), &snap, 0);
        assert_eq!(names(&r.place), vec!["web.api[0]"]);
        assert!(r.place[0].previous.is_none());
    }

    fn failed(index: u32, modify_time: u64) -> Allocation {
        let mut a = alloc(index, "n1");
        a.client_status = AllocClientStatus::Failed;
        a.modify_time = modify_time;
        a
    }

    #[test]
    fn failed_alloc_rescheduled_after_delay() {
        let mut j = job(1);
        j.task_groups[0].reschedule_policy = Some(ReschedulePolicy {
            attempts: 2,
            interval_secs: 3600,
            delay_secs: 30,
            unlimited: false,
            ..Default::default()
        });
        let snap = Snapshot::builder()
            .job(j.clone())
            .node(node("n1"))
            .alloc(failed(0, 1000))
            .build();

        // Too early: delayed follow-up, no placement.
        let r = reconcile(Some(&j), &snap, 1010);
        assert!(r.place.is_empty());
        assert_eq!(r.followups.get(&1_030_000), Some(&vec!["a0".to_string()]));

        // Delay elapsed: replace now.
        let r = reconcile(Some(&j), &snap, 1030);
        assert_eq!(r.place.len(), 1);
        assert!(r.place[0].reschedule);
        assert!(r.followups.is_empty());
    }

    #[test]
    fn pending_followup_is_not_duplicated() {
        let mut j = job(1);
        j.task_groups[0].reschedule_policy = Some(ReschedulePolicy {
            attempts: 2,
            interval_secs: 3600,
            delay_secs: 30,
            unlimited: false,
            ..Default::default()
        });
        let pending = Evaluation {
            id: "e1".to_string(),
            namespace: "default".to_string(),
            job_id: "web".to_string(),
            status: EvalStatus::Pending,
            triggered_by: TriggerBy::RetryFailedAlloc,
            wait_until: Some(1_030_000),
            ..Default::default()
        };
        let snap = Snapshot::builder()
            .job(j.clone())
            .node(node("n1"))
            .alloc(failed(0, 1000))
            .eval(pending)
            .build();
        let r = reconcile(Some(&j), &snap, 1010);
        assert!(r.followups.is_empty());
        assert_eq!(r.desired["api"].reschedule_later, 1);
    }

    #[test]
    fn exhausted_reschedules_keep_the_slot() {
        let mut j = job(1);
        j.task_groups[0].reschedule_policy = Some(ReschedulePolicy {
            attempts: 1,
            interval_secs: 3600,
            delay_secs: 5,
            unlimited: false,
            ..Default::default()
        });
        let mut a = failed(0, 1000);
        a.reschedule_tracker.push(RescheduleEvent {
            reschedule_time: 900,
            prev_alloc_id: "older".to_string(),
            prev_node_id: "n1".to_string(),
            delay_secs: 5,
        });
        let snap = Snapshot::builder().job(j.clone()).node(node("n1")).alloc(a).build();
        let r = reconcile(Some(&j), &snap, 2000);
        assert!(r.place.is_empty());
        assert!(r.followups.is_empty());
    }

    #[test]
    fn server_stopped_allocs_are_ignored() {
        let j = job(1);
        let mut stopped = alloc(0, "n1");
        stopped.desired_status = AllocDesiredStatus::Stop;
        let snap = Snapshot::builder().job(j.clone()).node(node("n1")).alloc(stopped).build();
        let r = reconcile(Some(&j), &snap, 0);
        assert_eq!(names(&r.place), vec!["web.api[0]"]);
        assert_eq!(r.desired["api"].ignore, 1);
    }
}
