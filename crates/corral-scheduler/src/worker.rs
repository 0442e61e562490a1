//! Scheduling workers.
//!
//! A worker loops dequeue → process → ack/nack. Processing runs the
//! scheduler matching the evaluation's job type against a fresh snapshot;
//! the worker's [`Planner`] routes plans to the [`PlanApplier`] and
//! persists evaluation updates before they reach the broker or the
//! blocked set.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use corral_core::config::CorralConfig;
use corral_core::{EvalStatus, Evaluation, JobType, Plan, PlanResult};
use corral_state::{Snapshot, StateStore};

use crate::applier::PlanApplier;
use crate::blocked::BlockedEvals;
use crate::broker::EvalBroker;
use crate::error::SchedulerResult;
use crate::outcome::EvalOutcome;
use crate::scheduler::{Planner, Scheduler};

/// How long one dequeue waits before re-checking for shutdown.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

pub struct Worker {
    id: usize,
    config: Arc<CorralConfig>,
    store: StateStore,
    broker: Arc<EvalBroker>,
    blocked: Arc<BlockedEvals>,
    applier: Arc<PlanApplier>,
}

impl Worker {
    pub fn new(
        id: usize,
        config: Arc<CorralConfig>,
        store: StateStore,
        broker: Arc<EvalBroker>,
        blocked: Arc<BlockedEvals>,
        applier: Arc<PlanApplier>,
    ) -> Self {
        Self {
            id,
            config,
            store,
            broker,
            blocked,
            applier,
        }
    }

    /// Process evaluations until the shutdown signal.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = self.id, "scheduling worker started");
        loop {
            tokio::select! {
                result = self.run_once(DEQUEUE_TIMEOUT) => {
                    if let Err(e) = result {
                        warn!(worker = self.id, error = %e, "evaluation processing failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!(worker = self.id, "scheduling worker shutting down");
                    break;
                }
            }
        }
    }

    /// Dequeue and process at most one evaluation, waiting up to `timeout`
    /// for one to become ready.
    ///
    /// Returns `Ok(None)` when nothing was ready. A processing error nacks
    /// the evaluation for redelivery before being returned.
    pub async fn run_once(&self, timeout: Duration) -> SchedulerResult<Option<EvalOutcome>> {
        let Some((eval, token)) = self.broker.dequeue(&JobType::ALL, timeout).await else {
            return Ok(None);
        };
        debug!(
            worker = self.id,
            eval_id = %eval.id,
            job = %eval.job_key(),
            triggered_by = ?eval.triggered_by,
            "evaluation dequeued"
        );

        match self.process(&eval, &token) {
            Ok(outcome) => {
                if let Err(e) = self.broker.ack(&eval.id, &token) {
                    warn!(worker = self.id, eval_id = %eval.id, error = %e, "failed to ack evaluation");
                }
                cancel_evals(&self.store, self.broker.take_cancelable())?;
                cancel_evals(&self.store, self.blocked.take_duplicates())?;
                Ok(Some(outcome))
            }
            Err(err) => {
                if let Err(e) = self.broker.nack(&eval.id, &token) {
                    debug!(worker = self.id, eval_id = %eval.id, error = %e, "nack after failure not possible");
                }
                Err(err)
            }
        }
    }

    fn process(&self, eval: &Evaluation, token: &str) -> SchedulerResult<EvalOutcome> {
        let epoch = self.broker.job_epoch(&eval.job_key());
        let snapshot = self.store.snapshot()?;
        let mut planner = WorkerPlanner {
            store: &self.store,
            broker: &self.broker,
            blocked: &self.blocked,
            applier: &self.applier,
        };
        Scheduler::for_type(eval.job_type).process(&self.config, snapshot, eval, token, epoch, &mut planner)
    }
}

/// Persist superseded evaluations as canceled.
pub(crate) fn cancel_evals(store: &StateStore, evals: Vec<Evaluation>) -> SchedulerResult<()> {
    if evals.is_empty() {
        return Ok(());
    }
    let canceled: Vec<Evaluation> = evals
        .into_iter()
        .map(|mut e| {
            e.status = EvalStatus::Canceled;
            e.status_description = "superseded by a newer evaluation".to_string();
            e
        })
        .collect();
    store.upsert_evals(&canceled)?;
    debug!(count = canceled.len(), "superseded evaluations canceled");
    Ok(())
}

struct WorkerPlanner<'a> {
    store: &'a StateStore,
    broker: &'a EvalBroker,
    blocked: &'a BlockedEvals,
    applier: &'a PlanApplier,
}

impl Planner for WorkerPlanner<'_> {
    fn submit_plan(&mut self, plan: Plan) -> SchedulerResult<(PlanResult, Option<Snapshot>)> {
        let result = self.applier.submit(&plan)?;
        let refreshed = if result.refresh_index > 0 {
            Some(self.store.snapshot()?)
        } else {
            None
        };
        Ok((result, refreshed))
    }

    fn update_eval(&mut self, eval: &Evaluation) -> SchedulerResult<()> {
        self.store.upsert_evals(std::slice::from_ref(eval))?;

        // Everything placed: an older blocked evaluation of the job is moot.
        if eval.status == EvalStatus::Complete && eval.blocked_eval.is_none() {
            if let Some(stale) = self.blocked.untrack(&eval.job_key()) {
                if stale.id != eval.id {
                    cancel_evals(self.store, vec![stale])?;
                }
            }
        }
        Ok(())
    }

    fn create_eval(&mut self, eval: &Evaluation) -> SchedulerResult<()> {
        let index = self.store.upsert_evals(std::slice::from_ref(eval))?;
        let mut created = eval.clone();
        created.create_index = index;
        created.modify_index = index;
        if created.status == EvalStatus::Blocked {
            self.blocked.block(created);
        } else {
            self.broker.enqueue(created)?;
        }
        Ok(())
    }

    fn reblock_eval(&mut self, eval: &Evaluation) -> SchedulerResult<()> {
        let index = self.store.upsert_evals(std::slice::from_ref(eval))?;
        let mut reblocked = eval.clone();
        reblocked.modify_index = index;
        self.blocked.reblock(reblocked);
        Ok(())
    }
}
