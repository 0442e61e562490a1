//! Scheduler variants and the shared evaluation driver.
//!
//! Every variant runs the same loop around its own placement pass:
//!
//! ```text
//! snapshot ──► pass (reconcile + place) ──► plan ──► Planner::submit_plan
//!    ▲                                                    │
//!    └──────────── refreshed snapshot on partial commit ◄─┘
//! ```
//!
//! The loop is bounded by `max_plan_attempts`. Groups that could not be
//! fully placed end up on a blocked follow-up evaluation; failed
//! allocations whose reschedule is delayed get a `wait_until` follow-up.

use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};

use corral_core::config::CorralConfig;
use corral_core::{
    AllocId, AllocMetric, EvalStatus, Evaluation, JobType, PlacementFailure, Plan, PlanResult, TriggerBy,
    epoch_millis, epoch_secs,
};
use corral_placement::EvalContext;
use corral_state::Snapshot;

use crate::error::{SchedulerError, SchedulerResult};
use crate::outcome::{EvalOutcome, FailedPlacement};
use crate::reconcile::DesiredUpdates;
use crate::{generic, system};

/// Where a scheduler sends its plans and evaluation updates.
pub trait Planner {
    /// Submit a plan. When part of it was rejected, the refreshed snapshot
    /// to re-plan against is returned alongside the result.
    fn submit_plan(&mut self, plan: Plan) -> SchedulerResult<(PlanResult, Option<Snapshot>)>;

    /// Persist the evaluation being processed.
    fn update_eval(&mut self, eval: &Evaluation) -> SchedulerResult<()>;

    /// Persist and route a new follow-up or blocked evaluation.
    fn create_eval(&mut self, eval: &Evaluation) -> SchedulerResult<()>;

    /// Return a blocked evaluation that still cannot make progress to the
    /// blocked set.
    fn reblock_eval(&mut self, eval: &Evaluation) -> SchedulerResult<()>;
}

/// What one placement pass decided beyond the plan itself.
#[derive(Debug, Default)]
pub(crate) struct Pass {
    /// Placement metrics of groups with unplaced instances.
    pub failed: BTreeMap<String, AllocMetric>,
    /// Unplaced instances per group.
    pub queued: BTreeMap<String, u32>,
    /// Delayed reschedules keyed by `wait_until` (unix millis).
    pub followups: BTreeMap<u64, Vec<AllocId>>,
    pub desired: BTreeMap<String, DesiredUpdates>,
}

impl Pass {
    /// Count one unplaced instance of `group`, keeping the first metric.
    pub(crate) fn record_failure(&mut self, group: &str, metric: &AllocMetric) {
        match self.failed.get_mut(group) {
            Some(existing) => existing.coalesced_failures += 1,
            None => {
                self.failed.insert(group.to_string(), metric.clone());
            }
        }
        *self.queued.entry(group.to_string()).or_default() += 1;
    }
}

/// Scheduling policy, one per job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduler {
    Service,
    Batch,
    System,
    SysBatch,
}

impl Scheduler {
    pub fn for_type(job_type: JobType) -> Self {
        match job_type {
            JobType::Service => Scheduler::Service,
            JobType::Batch => Scheduler::Batch,
            JobType::System => Scheduler::System,
            JobType::SysBatch => Scheduler::SysBatch,
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Scheduler::Service => JobType::Service,
            Scheduler::Batch => JobType::Batch,
            Scheduler::System => JobType::System,
            Scheduler::SysBatch => JobType::SysBatch,
        }
    }

    /// Process one evaluation against `snapshot`.
    ///
    /// Placement failures are recorded on the evaluation, never returned as
    /// errors. Errors are reserved for the planner and the store.
    pub fn process(
        &self,
        config: &CorralConfig,
        snapshot: Snapshot,
        eval: &Evaluation,
        token: &str,
        job_epoch: u64,
        planner: &mut dyn Planner,
    ) -> SchedulerResult<EvalOutcome> {
        let mut outcome = EvalOutcome::new(&eval.id, &eval.namespace, &eval.job_id);

        if let Err(err) = self.validate(&snapshot, eval) {
            warn!(eval_id = %eval.id, error = %err, "canceling malformed evaluation");
            let mut canceled = eval.clone();
            canceled.status = EvalStatus::Canceled;
            canceled.status_description = err.to_string();
            planner.update_eval(&canceled)?;
            outcome.status = EvalStatus::Canceled;
            outcome.status_description = canceled.status_description;
            return Ok(outcome);
        }

        let key = eval.job_key();
        let limit = config.scheduler.max_plan_attempts.for_type(eval.job_type);
        let mut snapshot = snapshot;
        let mut pass = Pass::default();
        let mut eligibility = (BTreeMap::new(), false);
        let mut settled = false;

        while outcome.plan_attempts < limit {
            outcome.plan_attempts += 1;
            let job = snapshot.job(&key).cloned();
            let mut plan = Plan::new(eval, token, job_epoch, job.clone());
            plan.snapshot_index = snapshot.index();

            let mut ctx = EvalContext::new(snapshot.clone(), plan, config);
            pass = match self {
                Scheduler::Service | Scheduler::Batch => generic::compute(&mut ctx, job.as_ref(), &key, epoch_secs()),
                Scheduler::System | Scheduler::SysBatch => system::compute(&mut ctx, job.as_ref(), &key),
            };
            eligibility = (ctx.eligibility().class_eligibility(), ctx.eligibility().escaped());
            let plan = ctx.into_plan();

            if plan.is_no_op() {
                settled = true;
                break;
            }

            let (result, refreshed) = planner.submit_plan(plan.clone())?;
            outcome.record_commit(&result);
            let (full, expected, actual) = result.full_commit(&plan);
            if full {
                settled = true;
                break;
            }
            debug!(
                eval_id = %eval.id,
                attempt = outcome.plan_attempts,
                expected,
                actual,
                refresh_index = result.refresh_index,
                "plan partially committed, refreshing"
            );
            if let Some(fresh) = refreshed {
                snapshot = fresh;
            }
        }

        outcome.desired_updates = std::mem::take(&mut pass.desired);

        if !settled {
            let err = SchedulerError::StaleOptimisticConcurrency {
                eval_id: eval.id.clone(),
                attempts: outcome.plan_attempts,
            };
            error!(error = %err, "evaluation failed");
            let wait_until = epoch_millis() + config.scheduler.failed_followup_delay_secs * 1000;
            let followup = eval.create_followup_eval(TriggerBy::MaxPlanAttempts, wait_until);
            planner.create_eval(&followup)?;

            let mut failed = eval.clone();
            failed.status = EvalStatus::Failed;
            failed.status_description = err.to_string();
            failed.next_eval = Some(followup.id.clone());
            planner.update_eval(&failed)?;

            outcome.status = EvalStatus::Failed;
            outcome.status_description = failed.status_description;
            outcome.followup_evals.push(followup.id);
            return Ok(outcome);
        }

        for (wait_until, alloc_ids) in &pass.followups {
            let followup = eval.create_followup_eval(TriggerBy::RetryFailedAlloc, *wait_until);
            debug!(
                eval_id = %eval.id,
                followup = %followup.id,
                wait_until,
                allocs = alloc_ids.len(),
                "created delayed reschedule evaluation"
            );
            planner.create_eval(&followup)?;
            outcome.followup_evals.push(followup.id);
        }

        for (group, metric) in &pass.failed {
            let queued = pass.queued.get(group).copied().unwrap_or(0);
            if let Some(failure) = metric.failure {
                let err = SchedulerError::from_failure(group, failure);
                match failure {
                    PlacementFailure::ConstraintUnsatisfiable => {
                        warn!(eval_id = %eval.id, queued, error = %err, "placement failed")
                    }
                    PlacementFailure::InsufficientCapacity => {
                        debug!(eval_id = %eval.id, queued, error = %err, "placement failed")
                    }
                }
            }
            outcome
                .failed
                .insert(group.clone(), FailedPlacement::from_metric(metric, queued));
        }

        let (class_eligibility, escaped) = eligibility;
        if !pass.failed.is_empty() && eval.status == EvalStatus::Blocked {
            let mut reblocked = eval.clone();
            reblocked.class_eligibility = class_eligibility;
            reblocked.escaped_computed_class = escaped;
            reblocked.queued_allocations = pass.queued;
            reblocked.failed_tg_allocs = pass.failed;
            reblocked.snapshot_index = snapshot.index();
            planner.reblock_eval(&reblocked)?;
            outcome.status = EvalStatus::Blocked;
            outcome.blocked_eval = Some(eval.id.clone());
            return Ok(outcome);
        }

        let mut done = eval.clone();
        done.status = EvalStatus::Complete;
        done.status_description.clear();
        done.queued_allocations = pass.queued.clone();
        done.failed_tg_allocs = pass.failed.clone();
        if !pass.failed.is_empty() {
            let mut blocked = eval.create_blocked_eval(class_eligibility, escaped, pass.queued, pass.failed);
            blocked.snapshot_index = snapshot.index();
            planner.create_eval(&blocked)?;
            done.blocked_eval = Some(blocked.id.clone());
            outcome.blocked_eval = Some(blocked.id);
        }
        planner.update_eval(&done)?;

        info!(
            eval_id = %eval.id,
            job = %key,
            placed = outcome.placements.len(),
            stopped = outcome.stops.len(),
            preempted = outcome.preemptions.len(),
            blocked = outcome.blocked_eval.is_some(),
            "evaluation complete"
        );
        outcome.status = EvalStatus::Complete;
        Ok(outcome)
    }

    fn validate(&self, snapshot: &Snapshot, eval: &Evaluation) -> SchedulerResult<()> {
        let malformed = |reason: String| SchedulerError::MalformedEvaluation {
            eval_id: eval.id.clone(),
            reason,
        };
        if eval.job_id.is_empty() {
            return Err(malformed("missing job id".to_string()));
        }
        if eval.job_type != self.job_type() {
            return Err(malformed(format!(
                "{} evaluation routed to the {} scheduler",
                eval.job_type,
                self.job_type()
            )));
        }
        if let Some(job) = snapshot.job(&eval.job_key()) {
            if job.job_type != eval.job_type {
                return Err(malformed(format!(
                    "job type {} does not match evaluation type {}",
                    job.job_type, eval.job_type
                )));
            }
            if eval.job_modify_index > job.job_modify_index {
                return Err(malformed(format!(
                    "unknown job version (modify index {})",
                    eval.job_modify_index
                )));
            }
        }
        Ok(())
    }
}
