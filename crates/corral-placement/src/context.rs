//! Per-evaluation placement context.
//!
//! An `EvalContext` pairs the immutable snapshot a scheduler works from
//! with the plan it is building. Every placement question ("what runs on
//! this node right now?") is answered against the *proposed* state:
//! snapshot allocations, minus what the plan stops or preempts, plus what
//! the plan places.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use regex::Regex;

use corral_core::config::{CorralConfig, PreemptionConfig, SchedulerAlgorithm, ScoringWeights};
use corral_core::{AllocMetric, Allocation, Job, JobKey, Plan};
use corral_state::Snapshot;

pub struct EvalContext {
    snapshot: Snapshot,
    plan: Plan,
    algorithm: SchedulerAlgorithm,
    weights: ScoringWeights,
    preemption: PreemptionConfig,
    metrics: AllocMetric,
    eligibility: EvalEligibility,
    regex_cache: HashMap<String, Option<Regex>>,
}

impl EvalContext {
    pub fn new(snapshot: Snapshot, plan: Plan, config: &CorralConfig) -> Self {
        let eligibility = plan
            .job
            .as_ref()
            .map(EvalEligibility::new)
            .unwrap_or_default();
        Self {
            snapshot,
            plan,
            algorithm: config.scheduler.algorithm,
            weights: config.scheduler.weights.clone(),
            preemption: config.preemption.clone(),
            metrics: AllocMetric::default(),
            eligibility,
            regex_cache: HashMap::new(),
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn plan_mut(&mut self) -> &mut Plan {
        &mut self.plan
    }

    pub fn into_plan(self) -> Plan {
        self.plan
    }

    pub fn algorithm(&self) -> SchedulerAlgorithm {
        self.algorithm
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn preemption(&self) -> &PreemptionConfig {
        &self.preemption
    }

    // ── Metrics ────────────────────────────────────────────────────

    pub fn metrics(&self) -> &AllocMetric {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut AllocMetric {
        &mut self.metrics
    }

    pub fn reset_metrics(&mut self) {
        self.metrics = AllocMetric::default();
    }

    // ── Eligibility ────────────────────────────────────────────────

    pub fn eligibility(&self) -> &EvalEligibility {
        &self.eligibility
    }

    pub fn eligibility_mut(&mut self) -> &mut EvalEligibility {
        &mut self.eligibility
    }

    /// Compiled regex for `pattern`, cached for the evaluation. `None` for
    /// invalid patterns.
    pub fn regex(&mut self, pattern: &str) -> Option<&Regex> {
        self.regex_cache
            .entry(pattern.to_string())
            .or_insert_with(|| Regex::new(pattern).ok())
            .as_ref()
    }

    // ── Proposed state ─────────────────────────────────────────────

    /// Ids of allocations the plan stops or preempts.
    fn plan_removed(&self) -> BTreeSet<&str> {
        self.plan
            .node_update
            .values()
            .chain(self.plan.node_preemptions.values())
            .flatten()
            .map(|a| a.id.as_str())
            .collect()
    }

    /// Ids of allocations the plan places (in-place updates replace the
    /// snapshot copy of the same id).
    fn plan_placed(&self) -> BTreeSet<&str> {
        self.plan
            .node_allocation
            .values()
            .flatten()
            .map(|a| a.id.as_str())
            .collect()
    }

    /// Non-terminal allocations that will occupy `node_id` if the plan
    /// commits.
    pub fn proposed_allocs(&self, node_id: &str) -> Vec<&Allocation> {
        let removed = self.plan_removed();
        let placed = self.plan_placed();
        let mut allocs: Vec<&Allocation> = self
            .snapshot
            .live_allocs_by_node(node_id)
            .into_iter()
            .filter(|a| !removed.contains(a.id.as_str()) && !placed.contains(a.id.as_str()))
            .collect();
        if let Some(new) = self.plan.node_allocation.get(node_id) {
            allocs.extend(new.iter().filter(|a| !a.terminal_status()));
        }
        allocs
    }

    /// Non-terminal allocations of a job across the cluster if the plan
    /// commits.
    pub fn proposed_job_allocs(&self, key: &JobKey) -> Vec<&Allocation> {
        let removed = self.plan_removed();
        let placed = self.plan_placed();
        let mut allocs: Vec<&Allocation> = self
            .snapshot
            .allocs_by_job(key)
            .into_iter()
            .filter(|a| !a.terminal_status())
            .filter(|a| !removed.contains(a.id.as_str()) && !placed.contains(a.id.as_str()))
            .collect();
        allocs.extend(
            self.plan
                .node_allocation
                .values()
                .flatten()
                .filter(|a| a.job_key() == *key && !a.terminal_status()),
        );
        allocs
    }

    /// Read and write claims the plan adds to a CSI volume.
    pub fn plan_csi_claims(&self, job: &Job, source: &str) -> (usize, usize) {
        let mut reads = 0;
        let mut writes = 0;
        for alloc in self.plan.node_allocation.values().flatten() {
            if alloc.job_key() != job.key() {
                continue;
            }
            // In-place updates already hold their claims.
            if self.snapshot.alloc(&alloc.id).is_some() {
                continue;
            }
            let Some(tg) = job.lookup_task_group(&alloc.task_group) else {
                continue;
            };
            for vol in tg.csi_volumes().filter(|v| v.source == source) {
                if vol.read_only {
                    reads += 1;
                } else {
                    writes += 1;
                }
            }
        }
        (reads, writes)
    }
}

/// Tracks which computed node classes satisfy each task group's
/// class-determined checks (drivers and constraints).
#[derive(Debug, Clone, Default)]
pub struct EvalEligibility {
    task_groups: BTreeMap<String, BTreeMap<String, bool>>,
    escaped: bool,
}

impl EvalEligibility {
    pub fn new(job: &Job) -> Self {
        Self {
            task_groups: BTreeMap::new(),
            escaped: job.escapes_computed_class(),
        }
    }

    /// Constraints reference node-unique values, so classes say nothing.
    pub fn escaped(&self) -> bool {
        self.escaped
    }

    pub fn task_group_status(&self, tg: &str, class: &str) -> Option<bool> {
        if self.escaped {
            return None;
        }
        self.task_groups.get(tg)?.get(class).copied()
    }

    pub fn set_task_group(&mut self, tg: &str, class: &str, eligible: bool) {
        if self.escaped || class.is_empty() {
            return;
        }
        self.task_groups
            .entry(tg.to_string())
            .or_default()
            .insert(class.to_string(), eligible);
    }

    /// Per-class eligibility merged across task groups: a class is eligible
    /// if any task group found it eligible.
    pub fn class_eligibility(&self) -> BTreeMap<String, bool> {
        let mut out: BTreeMap<String, bool> = BTreeMap::new();
        for classes in self.task_groups.values() {
            for (class, eligible) in classes {
                let entry = out.entry(class.clone()).or_insert(false);
                *entry |= *eligible;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::{AllocDesiredStatus, Constraint, Evaluation, TaskGroup};

    fn alloc(id: &str, node: &str) -> Allocation {
        Allocation {
            id: id.to_string(),
            namespace: "default".to_string(),
            job_id: "web".to_string(),
            node_id: node.to_string(),
            ..Default::default()
        }
    }

    fn ctx(snapshot: Snapshot) -> EvalContext {
        let plan = Plan::new(&Evaluation::default(), "t", 0, None);
        EvalContext::new(snapshot, plan, &CorralConfig::default())
    }

    #[test]
    fn proposed_allocs_apply_plan() {
        let mut stopped = alloc("gone", "n1");
        stopped.desired_status = AllocDesiredStatus::Stop;
        let snap = Snapshot::builder()
            .alloc(alloc("a1", "n1"))
            .alloc(alloc("a2", "n1"))
            .alloc(stopped)
            .build();
        let mut ctx = ctx(snap.clone());

        let a1 = snap.alloc("a1").unwrap().clone();
        ctx.plan_mut().append_stopped_alloc(&a1, "test", None);
        ctx.plan_mut().append_alloc(alloc("a3", "n1"));

        let mut ids: Vec<&str> = ctx.proposed_allocs("n1").iter().map(|a| a.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a2", "a3"]);

        let job_allocs = ctx.proposed_job_allocs(&JobKey::new("default", "web"));
        assert_eq!(job_allocs.len(), 2);
    }

    #[test]
    fn in_place_update_replaces_snapshot_copy() {
        let snap = Snapshot::builder().alloc(alloc("a1", "n1")).build();
        let mut ctx = ctx(snap);
        let mut updated = alloc("a1", "n1");
        updated.job_version = 2;
        ctx.plan_mut().append_alloc(updated);

        let allocs = ctx.proposed_allocs("n1");
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].job_version, 2);
    }

    #[test]
    fn eligibility_merges_task_groups() {
        let job = Job {
            task_groups: vec![TaskGroup::default()],
            ..Default::default()
        };
        let mut elig = EvalEligibility::new(&job);
        elig.set_task_group("a", "v1:aa", false);
        elig.set_task_group("b", "v1:aa", true);
        elig.set_task_group("a", "v1:bb", false);

        let merged = elig.class_eligibility();
        assert_eq!(merged.get("v1:aa"), Some(&true));
        assert_eq!(merged.get("v1:bb"), Some(&false));
        assert_eq!(elig.task_group_status("a", "v1:bb"), Some(false));
    }

    #[test]
    fn escaped_job_skips_class_cache() {
        let job = Job {
            constraints: vec![Constraint::distinct_hosts()],
            ..Default::default()
        };
        let mut elig = EvalEligibility::new(&job);
        assert!(elig.escaped());
        elig.set_task_group("a", "v1:aa", false);
        assert_eq!(elig.task_group_status("a", "v1:aa"), None);
        assert!(elig.class_eligibility().is_empty());
    }

    #[test]
    fn regex_cache_handles_invalid_patterns() {
        let mut ctx = ctx(Snapshot::default());
        assert!(ctx.regex("^linux$").is_some());
        assert!(ctx.regex("(").is_none());
    }
}
