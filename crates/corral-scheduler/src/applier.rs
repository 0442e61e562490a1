//! Plan applier: The single serialization point for cluster mutations.
//!
//! Schedulers work from snapshots and may race each other. The applier
//! re-validates every plan against the latest state under one lock before
//! committing it:
//!
//! 1. The evaluation's delivery token must still be outstanding, and the
//!    job's epoch must not have moved (job superseded or deregistered).
//! 2. Each node's portion is accepted only if the node's allocation index
//!    has not advanced past the plan's snapshot index, the node can take
//!    new placements, and the resulting allocation set fits.
//! 3. Accepted nodes commit in one store transaction, which repeats the
//!    index check. Rejected nodes are absent from the result and
//!    `refresh_index` tells the scheduler what to re-plan against.
//!
//! Stops and preemptions free capacity, so committed plans unblock blocked
//! evaluations for the affected node classes. Jobs that lost allocations to
//! preemption are evaluated again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use corral_core::{Allocation, Evaluation, JobKey, Plan, PlanResult, TriggerBy};
use corral_placement::allocs_fit;
use corral_state::{Snapshot, StateError, StateStore};

use crate::blocked::BlockedEvals;
use crate::broker::EvalBroker;
use crate::error::{SchedulerError, SchedulerResult};

pub struct PlanApplier {
    store: StateStore,
    broker: Arc<EvalBroker>,
    blocked: Arc<BlockedEvals>,
    lock: Mutex<()>,
}

impl PlanApplier {
    pub fn new(store: StateStore, broker: Arc<EvalBroker>, blocked: Arc<BlockedEvals>) -> Self {
        Self {
            store,
            broker,
            blocked,
            lock: Mutex::new(()),
        }
    }

    /// Validate and commit `plan`, returning what was actually applied.
    pub fn submit(&self, plan: &Plan) -> SchedulerResult<PlanResult> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let rejected = |reason: &str| SchedulerError::PlanRejected {
            eval_id: plan.eval_id.clone(),
            reason: reason.to_string(),
        };
        if self.broker.outstanding(&plan.eval_id).as_deref() != Some(plan.eval_token.as_str()) {
            return Err(rejected("evaluation token is not outstanding"));
        }
        if let Some(job) = &plan.job {
            if self.broker.job_epoch(&job.key()) != plan.job_epoch {
                return Err(rejected("job was superseded"));
            }
        }

        let snapshot = self.store.snapshot()?;
        let mut result = PlanResult::default();
        for node_id in plan.node_ids() {
            if let Err(reason) = evaluate_node(&snapshot, plan, &node_id) {
                debug!(eval_id = %plan.eval_id, node_id = %node_id, reason = %reason, "plan rejected for node");
                result.rejected_nodes.push(node_id);
                continue;
            }
            if let Some(allocs) = plan.node_update.get(&node_id) {
                result.node_update.insert(node_id.clone(), allocs.clone());
            }
            if let Some(allocs) = plan.node_allocation.get(&node_id) {
                result.node_allocation.insert(node_id.clone(), allocs.clone());
            }
            if let Some(allocs) = plan.node_preemptions.get(&node_id) {
                result.node_preemptions.insert(node_id.clone(), allocs.clone());
            }
        }

        if plan.all_at_once && !result.rejected_nodes.is_empty() {
            result = reject_all(plan);
        }
        if !result.rejected_nodes.is_empty() {
            result.refresh_index = snapshot.index();
        }
        if result.is_no_op() {
            return Ok(result);
        }

        let index = match self.store.commit_plan(&result, plan.snapshot_index) {
            Ok(index) => index,
            Err(StateError::StaleIndex {
                node_id,
                current,
                expected,
            }) => {
                debug!(eval_id = %plan.eval_id, node_id = %node_id, current, expected, "plan raced a newer write");
                let mut result = reject_all(plan);
                result.refresh_index = self.store.latest_index()?;
                return Ok(result);
            }
            Err(e) => return Err(e.into()),
        };
        result.alloc_index = index;

        let freed: BTreeSet<&String> = result
            .node_update
            .keys()
            .chain(result.node_preemptions.keys())
            .collect();
        let classes: BTreeSet<&str> = freed
            .into_iter()
            .filter_map(|id| snapshot.node(id))
            .map(|n| n.computed_class.as_str())
            .collect();
        for class in classes {
            self.blocked.unblock(class, index);
        }

        let preempted_jobs: BTreeSet<JobKey> = result
            .node_preemptions
            .values()
            .flatten()
            .map(Allocation::job_key)
            .collect();
        self.evaluate_preempted(&snapshot, &preempted_jobs)?;

        let count = |m: &BTreeMap<String, Vec<Allocation>>| m.values().map(Vec::len).sum::<usize>();
        info!(
            eval_id = %plan.eval_id,
            index,
            placed = count(&result.node_allocation),
            stopped = count(&result.node_update),
            preempted = count(&result.node_preemptions),
            rejected = result.rejected_nodes.len(),
            "plan applied"
        );
        Ok(result)
    }

    fn evaluate_preempted(&self, snapshot: &Snapshot, jobs: &BTreeSet<JobKey>) -> SchedulerResult<()> {
        let evals: Vec<Evaluation> = jobs
            .iter()
            .filter_map(|key| snapshot.job(key))
            .filter(|job| !job.stopped())
            .map(|job| Evaluation::for_job(job, TriggerBy::Preemption))
            .collect();
        if evals.is_empty() {
            return Ok(());
        }
        let index = self.store.upsert_evals(&evals)?;
        for mut eval in evals {
            eval.create_index = index;
            eval.modify_index = index;
            debug!(eval_id = %eval.id, job = %eval.job_key(), "evaluating preempted job");
            self.broker.enqueue(eval)?;
        }
        Ok(())
    }
}

fn reject_all(plan: &Plan) -> PlanResult {
    PlanResult {
        rejected_nodes: plan.node_ids().into_iter().collect(),
        ..Default::default()
    }
}

/// Whether the plan's portion for `node_id` can be applied to `snapshot`.
fn evaluate_node(snapshot: &Snapshot, plan: &Plan, node_id: &str) -> Result<(), String> {
    let current = snapshot.node_alloc_index(node_id);
    if current > plan.snapshot_index {
        return Err(format!(
            "node alloc index {current} is newer than plan index {}",
            plan.snapshot_index
        ));
    }

    let placements = plan.node_allocation.get(node_id).map(Vec::as_slice).unwrap_or_default();
    if placements.is_empty() {
        return Ok(());
    }
    let Some(node) = snapshot.node(node_id) else {
        return Err("node not found".to_string());
    };
    let new_placements = placements.iter().any(|a| snapshot.alloc(&a.id).is_none());
    if new_placements && !node.ready() {
        return Err(format!("node is {} and not ready for placements", node.status.as_str()));
    }

    let removed: BTreeSet<&str> = plan
        .node_update
        .get(node_id)
        .into_iter()
        .chain(plan.node_preemptions.get(node_id))
        .flatten()
        .chain(placements)
        .map(|a| a.id.as_str())
        .collect();
    let mut proposed: Vec<&Allocation> = snapshot
        .live_allocs_by_node(node_id)
        .into_iter()
        .filter(|a| !removed.contains(a.id.as_str()))
        .collect();
    proposed.extend(placements.iter().filter(|a| !a.terminal_status()));

    allocs_fit(node, &proposed).map_err(|e| format!("resources exhausted: {}", e.dimension))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use corral_core::config::{BlockedConfig, BrokerConfig};
    use corral_core::{
        AllocClientStatus, AllocatedResources, AllocatedTaskResources, EvalStatus, Evaluation, Job, JobType, Node,
        NodeResources, NodeStatus, TriggerBy,
    };

    const GIB: u64 = 1024 * 1024 * 1024;

    struct Harness {
        store: StateStore,
        broker: Arc<EvalBroker>,
        blocked: Arc<BlockedEvals>,
        applier: PlanApplier,
    }

    fn harness() -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let broker = Arc::new(EvalBroker::new(BrokerConfig::default()));
        let blocked = Arc::new(BlockedEvals::new(broker.clone(), BlockedConfig::default()));
        let applier = PlanApplier::new(store.clone(), broker.clone(), blocked.clone());
        Harness {
            store,
            broker,
            blocked,
            applier,
        }
    }

    fn node(id: &str, cpu: u64) -> Node {
        Node {
            id: id.to_string(),
            datacenter: "dc1".to_string(),
            resources: NodeResources {
                cpu_shares: cpu,
                memory_bytes: 8 * GIB,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn alloc(id: &str, job_id: &str, node: &str, cpu: u64) -> Allocation {
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
            name: format!("{job_id}.g[0]"),
            namespace: "default".to_string(),
            job_id: job_id.to_string(),
            task_group: "g".to_string(),
            node_id: node.to_string(),
            resources,
            client_status: AllocClientStatus::Running,
            ..Default::default()
        }
    }

    /// Register a job and take an outstanding delivery for its evaluation.
    async fn outstanding_plan(h: &Harness, job_id: &str) -> Plan {
        let job = h
            .store
            .upsert_job(&Job {
                id: job_id.to_string(),
                ..Default::default()
            })
            .unwrap();
        h.broker.enqueue(Evaluation::for_job(&job, TriggerBy::JobRegister)).unwrap();
        let (eval, token) = h.broker.dequeue(&JobType::ALL, Duration::ZERO).await.unwrap();
        let epoch = h.broker.job_epoch(&job.key());
        let mut plan = Plan::new(&eval, &token, epoch, Some(job));
        plan.snapshot_index = h.store.latest_index().unwrap();
        plan
    }

    #[tokio::test]
    async fn commits_fitting_plan() {
        let h = harness();
        h.store.upsert_node(&node("n1", 4000)).unwrap();
        let mut plan = outstanding_plan(&h, "web").await;
        plan.append_alloc(alloc("a1", "web", "n1", 1000));

        let result = h.applier.submit(&plan).unwrap();
        assert!(result.rejected_nodes.is_empty());
        assert_eq!(result.refresh_index, 0);
        assert!(result.alloc_index > plan.snapshot_index);
        assert!(h.store.get_alloc("a1").unwrap().is_some());
    }

    #[tokio::test]
    async fn rejects_stale_token_and_epoch() {
        let h = harness();
        h.store.upsert_node(&node("n1", 4000)).unwrap();
        let mut plan = outstanding_plan(&h, "web").await;
        plan.append_alloc(alloc("a1", "web", "n1", 1000));

        let mut forged = plan.clone();
        forged.eval_token = "stale".to_string();
        assert!(matches!(h.applier.submit(&forged), Err(SchedulerError::PlanRejected { .. })));

        h.broker.cancel_by_job(&plan.job.as_ref().unwrap().key());
        assert!(matches!(h.applier.submit(&plan), Err(SchedulerError::PlanRejected { .. })));
        assert!(h.store.get_alloc("a1").unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_commit_rejects_only_stale_node() {
        let h = harness();
        h.store.upsert_node(&node("a", 4000)).unwrap();
        h.store.upsert_node(&node("b", 4000)).unwrap();
        let mut plan = outstanding_plan(&h, "web").await;
        plan.append_alloc(alloc("on-a", "web", "a", 1000));
        plan.append_alloc(alloc("on-b", "web", "b", 1000));

        // Node a changes after the plan's snapshot.
        h.store.upsert_allocs(&[alloc("other", "db", "a", 500)]).unwrap();

        let result = h.applier.submit(&plan).unwrap();
        assert_eq!(result.rejected_nodes, vec!["a".to_string()]);
        assert!(result.refresh_index > plan.snapshot_index);
        assert!(result.node_allocation.contains_key("b"));
        assert!(!result.node_allocation.contains_key("a"));
        assert!(h.store.get_alloc("on-b").unwrap().is_some());
        assert!(h.store.get_alloc("on-a").unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_overcommit_and_unready_nodes() {
        let h = harness();
        h.store.upsert_node(&node("small", 1000)).unwrap();
        let mut down = node("down", 4000);
        down.status = NodeStatus::Down;
        h.store.upsert_node(&down).unwrap();
        h.store.upsert_node(&node("ok", 4000)).unwrap();
        let mut plan = outstanding_plan(&h, "web").await;
        plan.append_alloc(alloc("big", "web", "small", 2000));
        plan.append_alloc(alloc("lost", "web", "down", 100));
        plan.append_alloc(alloc("fine", "web", "ok", 100));

        let result = h.applier.submit(&plan).unwrap();
        assert_eq!(result.rejected_nodes, vec!["down".to_string(), "small".to_string()]);
        assert!(result.node_allocation.contains_key("ok"));
    }

    #[tokio::test]
    async fn all_at_once_is_all_or_nothing() {
        let h = harness();
        h.store.upsert_node(&node("small", 1000)).unwrap();
        h.store.upsert_node(&node("ok", 4000)).unwrap();
        let mut plan = outstanding_plan(&h, "web").await;
        plan.all_at_once = true;
        plan.append_alloc(alloc("big", "web", "small", 2000));
        plan.append_alloc(alloc("fine", "web", "ok", 100));

        let result = h.applier.submit(&plan).unwrap();
        assert!(result.is_no_op());
        assert_eq!(result.rejected_nodes.len(), 2);
        assert!(h.store.get_alloc("fine").unwrap().is_none());
    }

    #[tokio::test]
    async fn stops_free_capacity_within_the_plan() {
        let h = harness();
        h.store.upsert_node(&node("n1", 2000)).unwrap();
        h.store.upsert_allocs(&[alloc("old", "web", "n1", 1500)]).unwrap();
        let mut plan = outstanding_plan(&h, "web").await;
        let old = h.store.get_alloc("old").unwrap().unwrap();
        plan.append_stopped_alloc(&old, "alloc is being updated", None);
        plan.append_alloc(alloc("new", "web", "n1", 1500));

        let result = h.applier.submit(&plan).unwrap();
        assert!(result.rejected_nodes.is_empty());
        assert!(h.store.get_alloc("old").unwrap().unwrap().terminal_status());
    }

    #[tokio::test]
    async fn committed_stops_unblock_evaluations() {
        let h = harness();
        let stored = h.store.upsert_node(&node("n1", 4000)).unwrap();
        h.store.upsert_allocs(&[alloc("victim", "db", "n1", 500)]).unwrap();
        h.blocked.block(Evaluation {
            id: "blocked".to_string(),
            namespace: "default".to_string(),
            job_id: "waiting".to_string(),
            status: EvalStatus::Blocked,
            snapshot_index: h.store.latest_index().unwrap(),
            ..Default::default()
        });

        let mut plan = outstanding_plan(&h, "web").await;
        let victim = h.store.get_alloc("victim").unwrap().unwrap();
        plan.append_stopped_alloc(&victim, "alloc not needed", None);
        h.applier.submit(&plan).unwrap();

        assert_eq!(h.blocked.stats().total_blocked, 0);
        let (eval, _) = h.broker.dequeue(&JobType::ALL, Duration::ZERO).await.unwrap();
        assert_eq!(eval.id, "blocked");
        assert!(!stored.computed_class.is_empty());
    }
}
