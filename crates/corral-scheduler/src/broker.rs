//! Evaluation broker: Priority queues with at-least-once delivery.
//!
//! Evaluations wait in one ready heap per job type, ordered by priority and
//! then by enqueue order. A dequeue hands out the evaluation together with a
//! fresh token; the evaluation stays *unacked* until the worker acks or
//! nacks it with that token, or until the nack timeout expires.
//!
//! # Guarantees
//!
//! - At most one evaluation per job is ready or unacked at a time. Later
//!   evaluations for the job wait in the job's pending list; when the owner
//!   is acked the newest pending one is promoted and the rest are handed
//!   back as superseded.
//! - A nacked evaluation is redelivered after a delay, up to the delivery
//!   limit, then parked in the failed queue.
//! - Evaluations with a `wait_until` in the future are held until then.
//!
//! All timers run on tokio time and are driven from broker calls; waiting
//! dequeuers sleep on a [`Notify`] until work arrives or the next timer is
//! due.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use corral_core::config::BrokerConfig;
use corral_core::{EvalId, Evaluation, JobKey, JobType, epoch_millis, generate_uuid};

use crate::error::{SchedulerError, SchedulerResult};

#[derive(Debug)]
struct ReadyEval {
    priority: i32,
    seq: u64,
    eval: Evaluation,
}

impl PartialEq for ReadyEval {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for ReadyEval {}

impl PartialOrd for ReadyEval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEval {
    /// Max-heap order: higher priority first, then earlier enqueue.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct Unacked {
    eval: Evaluation,
    token: String,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct BrokerState {
    enabled: bool,
    seq: u64,
    ready: HashMap<JobType, BinaryHeap<ReadyEval>>,
    unack: HashMap<EvalId, Unacked>,
    /// The evaluation that currently owns each job (ready, unacked, or
    /// waiting out a nack delay).
    job_evals: HashMap<JobKey, EvalId>,
    /// Evaluations waiting for their job's owner to finish.
    pending: HashMap<JobKey, Vec<ReadyEval>>,
    /// Evaluations held until an instant: `wait_until` and nack delays.
    delayed: Vec<(Instant, Evaluation)>,
    deliveries: HashMap<EvalId, u32>,
    failed: Vec<Evaluation>,
    cancelable: Vec<Evaluation>,
    epochs: HashMap<JobKey, u64>,
}

/// Point-in-time broker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub total_ready: usize,
    pub total_unacked: usize,
    pub total_pending: usize,
    pub total_waiting: usize,
    pub total_failed: usize,
    pub ready_by_type: BTreeMap<String, usize>,
}

pub struct EvalBroker {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl EvalBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BrokerState {
                enabled: true,
                ..Default::default()
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Enqueue ────────────────────────────────────────────────────

    pub fn enqueue(&self, eval: Evaluation) -> SchedulerResult<()> {
        let mut state = self.lock();
        if !state.enabled {
            return Err(SchedulerError::BrokerDisabled);
        }
        let now = Instant::now();
        let wall = epoch_millis();
        match eval.wait_until {
            Some(wait_until) if wait_until > wall => {
                let at = now + Duration::from_millis(wait_until - wall);
                debug!(eval_id = %eval.id, delay_ms = wait_until - wall, "evaluation delayed");
                state.delayed.push((at, eval));
            }
            _ => {
                state.enqueue_ready(eval);
            }
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn enqueue_all(&self, evals: impl IntoIterator<Item = Evaluation>) -> SchedulerResult<()> {
        for eval in evals {
            self.enqueue(eval)?;
        }
        Ok(())
    }

    // ── Dequeue ────────────────────────────────────────────────────

    /// Wait up to `timeout` for the highest-priority ready evaluation of
    /// one of `types`. Returns the evaluation and its delivery token.
    pub async fn dequeue(&self, types: &[JobType], timeout: Duration) -> Option<(Evaluation, String)> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_timer = {
                let mut state = self.lock();
                let now = Instant::now();
                state.process_timers(&self.config, now);
                if state.enabled {
                    if let Some(found) = state.pop_ready(types, now, self.config.nack_timeout()) {
                        return Some(found);
                    }
                }
                state.next_timer()
            };

            if Instant::now() >= deadline {
                return None;
            }
            let wake = next_timer.map_or(deadline, |t| t.min(deadline));
            let _ = tokio::time::timeout_at(wake, notified).await;
        }
    }

    // ── Ack / nack ─────────────────────────────────────────────────

    /// Complete an evaluation and release its job.
    pub fn ack(&self, eval_id: &str, token: &str) -> SchedulerResult<()> {
        let mut state = self.lock();
        state.check_token(eval_id, token)?;
        if let Some(entry) = state.unack.remove(eval_id) {
            state.deliveries.remove(eval_id);
            state.release_job(&entry.eval.job_key());
            debug!(eval_id, "evaluation acked");
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Hand an evaluation back for redelivery.
    pub fn nack(&self, eval_id: &str, token: &str) -> SchedulerResult<()> {
        let mut state = self.lock();
        state.check_token(eval_id, token)?;
        state.nack(&self.config, eval_id, Instant::now());
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Current token of an unacked evaluation.
    pub fn outstanding(&self, eval_id: &str) -> Option<String> {
        let mut state = self.lock();
        state.process_timers(&self.config, Instant::now());
        state.unack.get(eval_id).map(|u| u.token.clone())
    }

    /// Extend the nack timeout of an unacked evaluation.
    pub fn outstanding_reset(&self, eval_id: &str, token: &str) -> SchedulerResult<()> {
        let mut state = self.lock();
        state.check_token(eval_id, token)?;
        let deadline = Instant::now() + self.config.nack_timeout();
        if let Some(entry) = state.unack.get_mut(eval_id) {
            entry.deadline = deadline;
        }
        Ok(())
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Cancel every waiting evaluation of a job and bump its epoch, which
    /// voids plans of any evaluation already being processed.
    pub fn cancel_by_job(&self, key: &JobKey) -> Vec<Evaluation> {
        let mut state = self.lock();
        *state.epochs.entry(key.clone()).or_insert(0) += 1;

        let mut canceled: Vec<Evaluation> = state
            .pending
            .remove(key)
            .unwrap_or_default()
            .into_iter()
            .map(|r| r.eval)
            .collect();

        for heap in state.ready.values_mut() {
            let (matched, kept): (Vec<ReadyEval>, Vec<ReadyEval>) =
                std::mem::take(heap).into_iter().partition(|r| r.eval.job_key() == *key);
            *heap = kept.into_iter().collect();
            canceled.extend(matched.into_iter().map(|r| r.eval));
        }
        let (matched, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|(_, e)| e.job_key() == *key);
        state.delayed = kept;
        canceled.extend(matched.into_iter().map(|(_, e)| e));

        for eval in &canceled {
            state.deliveries.remove(&eval.id);
            if state.job_evals.get(key) == Some(&eval.id) {
                state.job_evals.remove(key);
            }
        }
        debug!(job = %key, canceled = canceled.len(), "canceled job evaluations");
        canceled
    }

    pub fn job_epoch(&self, key: &JobKey) -> u64 {
        self.lock().epochs.get(key).copied().unwrap_or(0)
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Enable or disable the broker. Disabling drops all queued state.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.lock();
        if !enabled {
            let epochs = std::mem::take(&mut state.epochs);
            *state = BrokerState {
                epochs,
                ..Default::default()
            };
        }
        state.enabled = enabled;
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Drain evaluations that exceeded the delivery limit.
    pub fn take_failed(&self) -> Vec<Evaluation> {
        std::mem::take(&mut self.lock().failed)
    }

    /// Drain evaluations superseded by a newer one for the same job.
    pub fn take_cancelable(&self) -> Vec<Evaluation> {
        std::mem::take(&mut self.lock().cancelable)
    }

    pub fn stats(&self) -> BrokerStats {
        let mut state = self.lock();
        state.process_timers(&self.config, Instant::now());
        let ready_by_type: BTreeMap<String, usize> = state
            .ready
            .iter()
            .filter(|(_, h)| !h.is_empty())
            .map(|(t, h)| (t.as_str().to_string(), h.len()))
            .collect();
        BrokerStats {
            total_ready: ready_by_type.values().sum(),
            total_unacked: state.unack.len(),
            total_pending: state.pending.values().map(Vec::len).sum(),
            total_waiting: state.delayed.len(),
            total_failed: state.failed.len(),
            ready_by_type,
        }
    }
}

impl BrokerState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Make `eval` ready, or park it behind its job's current owner.
    fn enqueue_ready(&mut self, eval: Evaluation) {
        let key = eval.job_key();
        let entry = ReadyEval {
            priority: eval.priority,
            seq: self.next_seq(),
            eval,
        };
        if let Some(owner) = self.job_evals.get(&key) {
            if *owner != entry.eval.id {
                debug!(eval_id = %entry.eval.id, job = %key, "evaluation pending behind job owner");
                self.pending.entry(key).or_default().push(entry);
                return;
            }
        }
        self.job_evals.insert(key, entry.eval.id.clone());
        self.ready.entry(entry.eval.job_type).or_default().push(entry);
    }

    fn pop_ready(&mut self, types: &[JobType], now: Instant, nack_timeout: Duration) -> Option<(Evaluation, String)> {
        let job_type = types
            .iter()
            .filter_map(|t| self.ready.get(t).and_then(|h| h.peek()).map(|r| (*t, r)))
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(t, _)| t)?;
        let entry = self.ready.get_mut(&job_type)?.pop()?;
        let eval = entry.eval;
        let token = generate_uuid();
        *self.deliveries.entry(eval.id.clone()).or_insert(0) += 1;
        self.unack.insert(
            eval.id.clone(),
            Unacked {
                eval: eval.clone(),
                token: token.clone(),
                deadline: now + nack_timeout,
            },
        );
        debug!(eval_id = %eval.id, job_type = %job_type, "evaluation dequeued");
        Some((eval, token))
    }

    fn check_token(&self, eval_id: &str, token: &str) -> SchedulerResult<()> {
        match self.unack.get(eval_id) {
            None => Err(SchedulerError::NotOutstanding(eval_id.to_string())),
            Some(u) if u.token != token => Err(SchedulerError::TokenMismatch(eval_id.to_string())),
            Some(_) => Ok(()),
        }
    }

    fn nack(&mut self, config: &BrokerConfig, eval_id: &str, now: Instant) {
        let Some(entry) = self.unack.remove(eval_id) else {
            return;
        };
        let deliveries = self.deliveries.get(eval_id).copied().unwrap_or(0);
        if deliveries >= config.delivery_limit {
            let err = SchedulerError::EvaluationRetryExhausted {
                eval_id: eval_id.to_string(),
                deliveries,
            };
            warn!(error = %err, "evaluation moved to failed queue");
            self.deliveries.remove(eval_id);
            self.release_job(&entry.eval.job_key());
            self.failed.push(entry.eval);
            return;
        }
        let delay = if deliveries <= 1 {
            config.initial_nack_delay()
        } else {
            config.subsequent_nack_delay()
        };
        debug!(eval_id, deliveries, delay_ms = delay.as_millis() as u64, "evaluation nacked");
        self.delayed.push((now + delay, entry.eval));
    }

    /// Free the job's slot and promote the newest waiting evaluation.
    fn release_job(&mut self, key: &JobKey) {
        self.job_evals.remove(key);
        let Some(mut waiting) = self.pending.remove(key) else {
            return;
        };
        waiting.sort_by(|a, b| {
            a.eval
                .create_index
                .cmp(&b.eval.create_index)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        let Some(newest) = waiting.pop() else {
            return;
        };
        self.cancelable.extend(waiting.into_iter().map(|r| r.eval));
        self.enqueue_ready(newest.eval);
    }

    /// Auto-nack expired deliveries and release due delayed evaluations.
    fn process_timers(&mut self, config: &BrokerConfig, now: Instant) {
        let expired: Vec<EvalId> = self
            .unack
            .iter()
            .filter(|(_, u)| u.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            warn!(eval_id = %id, "nack timeout reached");
            self.nack(config, &id, now);
        }

        if self.delayed.iter().any(|(at, _)| *at <= now) {
            let (due, later): (Vec<_>, Vec<_>) =
                std::mem::take(&mut self.delayed).into_iter().partition(|(at, _)| *at <= now);
            self.delayed = later;
            let mut due = due;
            due.sort_by_key(|(at, _)| *at);
            for (_, eval) in due {
                self.enqueue_ready(eval);
            }
        }
    }

    fn next_timer(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|(at, _)| *at);
        let unacked = self.unack.values().map(|u| u.deadline);
        delayed.chain(unacked).min()
    }
}
