//! Engine: Wires the store, broker, blocked set and plan applier together.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use corral_core::config::CorralConfig;
use corral_core::{EvalStatus, TriggerBy, epoch_millis};
use corral_state::StateStore;

use crate::applier::PlanApplier;
use crate::blocked::BlockedEvals;
use crate::broker::EvalBroker;
use crate::control::ControlPlane;
use crate::error::SchedulerResult;
use crate::worker::{Worker, cancel_evals};

pub struct Engine {
    config: Arc<CorralConfig>,
    store: StateStore,
    broker: Arc<EvalBroker>,
    blocked: Arc<BlockedEvals>,
    applier: Arc<PlanApplier>,
}

impl Engine {
    pub fn new(config: CorralConfig, store: StateStore) -> Self {
        let broker = Arc::new(EvalBroker::new(config.broker.clone()));
        let blocked = Arc::new(BlockedEvals::new(broker.clone(), config.blocked.clone()));
        let applier = Arc::new(PlanApplier::new(store.clone(), broker.clone(), blocked.clone()));
        Self {
            config: Arc::new(config),
            store,
            broker,
            blocked,
            applier,
        }
    }

    pub fn in_memory(config: CorralConfig) -> SchedulerResult<Self> {
        Ok(Self::new(config, StateStore::open_in_memory()?))
    }

    pub fn open(config: CorralConfig, path: &Path) -> SchedulerResult<Self> {
        Ok(Self::new(config, StateStore::open(path)?))
    }

    pub fn config(&self) -> &CorralConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn broker(&self) -> &Arc<EvalBroker> {
        &self.broker
    }

    pub fn blocked(&self) -> &Arc<BlockedEvals> {
        &self.blocked
    }

    pub fn control(&self) -> ControlPlane {
        ControlPlane::new(self.store.clone(), self.broker.clone(), self.blocked.clone())
    }

    pub fn worker(&self, id: usize) -> Worker {
        Worker::new(
            id,
            self.config.clone(),
            self.store.clone(),
            self.broker.clone(),
            self.blocked.clone(),
            self.applier.clone(),
        )
    }

    /// Re-queue evaluations left pending or blocked in the store. Returns
    /// the number restored.
    pub fn restore(&self) -> SchedulerResult<usize> {
        let mut evals = self.store.list_evals()?;
        evals.sort_by_key(|e| e.create_index);

        let mut restored = 0;
        for eval in evals {
            match eval.status {
                EvalStatus::Pending => {
                    self.broker.enqueue(eval)?;
                    restored += 1;
                }
                EvalStatus::Blocked => {
                    self.blocked.block(eval);
                    restored += 1;
                }
                _ => {}
            }
        }
        info!(restored, "evaluations restored");
        Ok(restored)
    }

    /// Settle evaluations the broker or blocked set gave up on: failed ones
    /// are persisted as failed with a delayed follow-up, superseded ones as
    /// canceled. Returns the number of failed evaluations reaped.
    pub fn reap(&self) -> SchedulerResult<usize> {
        let failed = self.broker.take_failed();
        let reaped = failed.len();
        for eval in failed {
            let wait_until = epoch_millis() + self.config.scheduler.failed_followup_delay_secs * 1000;
            let followup = eval.create_followup_eval(TriggerBy::FailedFollowUp, wait_until);

            let mut settled = eval;
            settled.status = EvalStatus::Failed;
            settled.status_description = "evaluation reached its delivery limit".to_string();
            settled.next_eval = Some(followup.id.clone());
            warn!(eval_id = %settled.id, followup = %followup.id, "reaping failed evaluation");
            self.control().submit_evals(vec![followup])?;
            self.store.upsert_evals(&[settled])?;
        }

        cancel_evals(&self.store, self.broker.take_cancelable())?;
        cancel_evals(&self.store, self.blocked.take_duplicates())?;
        Ok(reaped)
    }

    /// Reap on `interval` until the shutdown signal.
    pub async fn run_reaper(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "evaluation reaper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reap() {
                        warn!(error = %e, "evaluation reaping failed");
                    }
                    let broker = self.broker.stats();
                    let blocked = self.blocked.stats();
                    debug!(
                        ready = broker.total_ready,
                        unacked = broker.total_unacked,
                        pending = broker.total_pending,
                        waiting = broker.total_waiting,
                        blocked = blocked.total_blocked,
                        "evaluation queue stats"
                    );
                }
                _ = shutdown.changed() => {
                    info!("evaluation reaper shutting down");
                    break;
                }
            }
        }
    }
}
