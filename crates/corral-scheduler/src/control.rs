//! Control plane: External mutations normalized into evaluations.
//!
//! Every entry point writes the change to the store, then creates the
//! evaluations it implies and hands them to the broker:
//!
//! | Input                         | Evaluations                                   |
//! |-------------------------------|-----------------------------------------------|
//! | `register_job`                | one for the job                               |
//! | `deregister_job`              | one for the job; waiting ones are canceled    |
//! | node upsert / status / drain  | one per job with live allocations on the node |
//! |                               | plus one per system job                       |
//! | `update_alloc_client_status`  | one for the job when the allocation ended     |
//!
//! Node changes that leave the node ready, and allocations that end, are
//! capacity signals for blocked evaluations.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use corral_core::{
    AllocClientStatus, DrainStrategy, EvalStatus, Evaluation, Job, JobKey, Node, NodeStatus,
    SchedulingEligibility, TriggerBy, epoch_millis, generate_uuid,
};
use corral_state::{StateError, StateStore};

use crate::blocked::BlockedEvals;
use crate::broker::EvalBroker;
use crate::error::{SchedulerError, SchedulerResult};
use crate::worker::cancel_evals;

#[derive(Clone)]
pub struct ControlPlane {
    store: StateStore,
    broker: Arc<EvalBroker>,
    blocked: Arc<BlockedEvals>,
}

impl ControlPlane {
    pub fn new(store: StateStore, broker: Arc<EvalBroker>, blocked: Arc<BlockedEvals>) -> Self {
        Self { store, broker, blocked }
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Register a new job or a new version of an existing one.
    pub fn register_job(&self, job: Job) -> SchedulerResult<Evaluation> {
        validate_job(&job)?;
        let stored = self.store.upsert_job(&job)?;
        info!(job = %stored.key(), version = stored.version, job_type = %stored.job_type, "job registered");

        let eval = Evaluation::for_job(&stored, TriggerBy::JobRegister);
        let mut created = self.submit_evals(vec![eval])?;
        Ok(created.remove(0))
    }

    /// Stop a job, or remove it entirely with `purge`. Evaluations of the
    /// job still waiting in the broker or the blocked set are canceled.
    pub fn deregister_job(&self, namespace: &str, job_id: &str, purge: bool) -> SchedulerResult<Evaluation> {
        let key = JobKey::new(namespace, job_id);
        let Some(mut job) = self.store.get_job(&key)? else {
            return Err(StateError::NotFound(format!("job {key}")).into());
        };

        let mut canceled = self.broker.cancel_by_job(&key);
        canceled.extend(self.blocked.untrack(&key));
        cancel_evals(&self.store, canceled)?;

        let eval = if purge {
            self.store.delete_job(&key)?;
            Evaluation::for_job(&job, TriggerBy::JobDeregister)
        } else {
            job.stop = true;
            let stored = self.store.upsert_job(&job)?;
            Evaluation::for_job(&stored, TriggerBy::JobDeregister)
        };
        info!(job = %key, purge, "job deregistered");

        let mut created = self.submit_evals(vec![eval])?;
        Ok(created.remove(0))
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Register a node or replace its definition.
    pub fn upsert_node(&self, mut node: Node) -> SchedulerResult<Vec<Evaluation>> {
        node.compute_class();
        let stored = self.store.upsert_node(&node)?;
        info!(node = %stored.id, status = stored.status.as_str(), class = %stored.computed_class, "node upserted");
        self.node_changed(&stored, TriggerBy::NodeUpdate)
    }

    pub fn update_node_status(&self, node_id: &str, status: NodeStatus) -> SchedulerResult<Vec<Evaluation>> {
        let node = self
            .store
            .update_node_status(node_id, status)?
            .ok_or_else(|| StateError::NotFound(format!("node {node_id}")))?;
        info!(node = %node_id, status = status.as_str(), "node status updated");
        self.node_changed(&node, TriggerBy::NodeUpdate)
    }

    /// Start (`Some`) or cancel (`None`) draining a node.
    pub fn update_node_drain(
        &self,
        node_id: &str,
        drain: Option<DrainStrategy>,
    ) -> SchedulerResult<Vec<Evaluation>> {
        let draining = drain.is_some();
        let node = self
            .store
            .update_node_drain(node_id, drain)?
            .ok_or_else(|| StateError::NotFound(format!("node {node_id}")))?;
        info!(node = %node_id, draining, "node drain updated");
        self.node_changed(&node, TriggerBy::NodeDrain)
    }

    pub fn update_node_eligibility(
        &self,
        node_id: &str,
        eligibility: SchedulingEligibility,
    ) -> SchedulerResult<Vec<Evaluation>> {
        let node = self
            .store
            .update_node_eligibility(node_id, eligibility)?
            .ok_or_else(|| StateError::NotFound(format!("node {node_id}")))?;
        info!(node = %node_id, eligibility = ?eligibility, "node eligibility updated");
        self.node_changed(&node, TriggerBy::NodeUpdate)
    }

    fn node_changed(&self, node: &Node, triggered_by: TriggerBy) -> SchedulerResult<Vec<Evaluation>> {
        let evals = self.node_evals(node, triggered_by)?;
        let created = self.submit_evals(evals)?;
        if node.ready() {
            self.blocked.unblock(&node.computed_class, node.modify_index);
        }
        Ok(created)
    }

    /// One evaluation per job with live allocations on the node, plus one
    /// per system job.
    fn node_evals(&self, node: &Node, triggered_by: TriggerBy) -> SchedulerResult<Vec<Evaluation>> {
        let snapshot = self.store.snapshot()?;
        let mut seen = BTreeSet::new();
        let mut evals = Vec::new();

        for alloc in snapshot.live_allocs_by_node(&node.id) {
            let key = alloc.job_key();
            if !seen.insert(key.clone()) {
                continue;
            }
            let mut eval = match snapshot.job(&key) {
                Some(job) => Evaluation::for_job(job, triggered_by),
                None => Evaluation {
                    id: generate_uuid(),
                    namespace: alloc.namespace.clone(),
                    priority: alloc.job_priority,
                    job_type: alloc.job_type,
                    triggered_by,
                    job_id: alloc.job_id.clone(),
                    status: EvalStatus::Pending,
                    create_time: epoch_millis(),
                    ..Default::default()
                },
            };
            eval.node_id = Some(node.id.clone());
            evals.push(eval);
        }

        for job in snapshot.per_node_jobs() {
            if !seen.insert(job.key()) {
                continue;
            }
            let mut eval = Evaluation::for_job(job, triggered_by);
            eval.node_id = Some(node.id.clone());
            evals.push(eval);
        }

        debug!(node = %node.id, count = evals.len(), "node evaluations created");
        Ok(evals)
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Record a client-reported allocation status. An allocation that ended
    /// frees capacity and may need replacing.
    pub fn update_alloc_client_status(
        &self,
        alloc_id: &str,
        status: AllocClientStatus,
        description: &str,
    ) -> SchedulerResult<Option<Evaluation>> {
        let alloc = self
            .store
            .update_alloc_client_status(alloc_id, status, description)?
            .ok_or_else(|| StateError::NotFound(format!("allocation {alloc_id}")))?;
        debug!(alloc = %alloc_id, status = ?status, "allocation client status updated");
        if !status.terminal() {
            return Ok(None);
        }

        if let Some(node) = self.store.get_node(&alloc.node_id)? {
            self.blocked.unblock(&node.computed_class, alloc.modify_index);
        }

        let triggered_by = match status {
            AllocClientStatus::Failed => TriggerBy::AllocFailure,
            AllocClientStatus::Lost => TriggerBy::AllocStop,
            AllocClientStatus::Complete if !alloc.job_type.keeps_completed() => TriggerBy::AllocStop,
            _ => return Ok(None),
        };
        let Some(job) = self.store.get_job(&alloc.job_key())? else {
            return Ok(None);
        };
        if job.stopped() {
            return Ok(None);
        }
        let mut created = self.submit_evals(vec![Evaluation::for_job(&job, triggered_by)])?;
        Ok(created.pop())
    }

    // ── Evaluations ────────────────────────────────────────────────

    /// Persist evaluations and hand them to the broker. Returns them with
    /// their store indexes.
    pub fn submit_evals(&self, evals: Vec<Evaluation>) -> SchedulerResult<Vec<Evaluation>> {
        if evals.is_empty() {
            return Ok(evals);
        }
        let index = self.store.upsert_evals(&evals)?;
        let stamped: Vec<Evaluation> = evals
            .into_iter()
            .map(|mut e| {
                e.create_index = index;
                e.modify_index = index;
                e
            })
            .collect();
        for eval in &stamped {
            debug!(eval_id = %eval.id, job = %eval.job_key(), triggered_by = ?eval.triggered_by, "evaluation submitted");
        }
        self.broker.enqueue_all(stamped.iter().cloned())?;
        Ok(stamped)
    }
}

fn validate_job(job: &Job) -> SchedulerResult<()> {
    let invalid = |reason: &str| SchedulerError::InvalidJob {
        job: job.key().to_string(),
        reason: reason.to_string(),
    };
    if job.id.is_empty() {
        return Err(invalid("missing id"));
    }
    if job.task_groups.is_empty() {
        return Err(invalid("no task groups"));
    }
    if !(1..=100).contains(&job.priority) {
        return Err(invalid("priority must be between 1 and 100"));
    }
    let mut names = BTreeSet::new();
    for tg in &job.task_groups {
        if tg.name.is_empty() {
            return Err(invalid("task group without a name"));
        }
        if !names.insert(tg.name.as_str()) {
            return Err(invalid(&format!("duplicate task group {}", tg.name)));
        }
        if tg.tasks.is_empty() {
            return Err(invalid(&format!("task group {} has no tasks", tg.name)));
        }
    }
    Ok(())
}
