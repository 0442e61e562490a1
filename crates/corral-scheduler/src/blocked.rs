//! Blocked evaluations: Parked until cluster capacity changes.
//!
//! An evaluation that could not place everything leaves a blocked
//! follow-up behind. It is held here until a capacity signal (a node joined
//! or changed, allocations stopped) arrives for a node class the
//! evaluation could use:
//!
//! - evaluations whose constraints escaped class computation unblock on
//!   any signal
//! - otherwise the class must be eligible or unknown to the evaluation
//!
//! At most one blocked evaluation per job is kept; an older one is handed
//! back as a duplicate to be canceled. Unblocks of the same job are spaced
//! by `min_unblock_interval` through the broker's `wait_until` delay.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use corral_core::config::BlockedConfig;
use corral_core::{Evaluation, JobKey, epoch_millis};

use crate::broker::EvalBroker;

#[derive(Debug, Default)]
struct BlockedState {
    enabled: bool,
    captured: BTreeMap<JobKey, Evaluation>,
    duplicates: Vec<Evaluation>,
    /// Store index of the latest unblock per node class.
    unblock_indexes: HashMap<String, u64>,
    /// Unix millis of the latest unblock per job.
    last_unblock: HashMap<JobKey, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedStats {
    pub total_blocked: usize,
    pub total_escaped: usize,
    pub total_duplicates: usize,
}

pub struct BlockedEvals {
    broker: Arc<EvalBroker>,
    config: BlockedConfig,
    state: Mutex<BlockedState>,
}

impl BlockedEvals {
    pub fn new(broker: Arc<EvalBroker>, config: BlockedConfig) -> Self {
        Self {
            broker,
            config,
            state: Mutex::new(BlockedState {
                enabled: true,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BlockedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a blocked evaluation. If capacity for it already changed after
    /// the snapshot it was computed on, it goes straight back to the broker.
    pub fn block(&self, eval: Evaluation) {
        let mut state = self.lock();
        if !state.enabled {
            return;
        }
        let key = eval.job_key();

        let superseded = state
            .captured
            .get(&key)
            .is_some_and(|existing| existing.id != eval.id && existing.create_index > eval.create_index);
        if superseded {
            debug!(eval_id = %eval.id, "blocked evaluation superseded on arrival");
            state.duplicates.push(eval);
            return;
        }
        if let Some(older) = state.captured.remove(&key) {
            if older.id != eval.id {
                debug!(eval_id = %older.id, newer = %eval.id, "blocked evaluation superseded");
                state.duplicates.push(older);
            }
        }

        if missed_unblock(&state, &eval) {
            debug!(eval_id = %eval.id, job = %key, "capacity changed since snapshot, unblocking immediately");
            let eval = rate_limited(&mut state, &self.config, eval);
            drop(state);
            self.enqueue(eval);
            return;
        }

        debug!(eval_id = %eval.id, job = %key, escaped = eval.escaped_computed_class, "evaluation blocked");
        state.captured.insert(key, eval);
    }

    /// Return an unblocked evaluation that still could not place to the
    /// blocked set.
    pub fn reblock(&self, eval: Evaluation) {
        debug!(eval_id = %eval.id, "reblocking evaluation");
        self.block(eval);
    }

    /// Capacity changed on nodes of `computed_class` at store `index`.
    pub fn unblock(&self, computed_class: &str, index: u64) {
        let mut state = self.lock();
        if !state.enabled {
            return;
        }
        let last = state.unblock_indexes.entry(computed_class.to_string()).or_insert(0);
        *last = (*last).max(index);

        let keys: Vec<JobKey> = state
            .captured
            .iter()
            .filter(|(_, e)| e.escaped_computed_class || e.class_eligibility.get(computed_class) != Some(&false))
            .map(|(k, _)| k.clone())
            .collect();

        let mut ready = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(eval) = state.captured.remove(&key) {
                ready.push(rate_limited(&mut state, &self.config, eval));
            }
        }
        drop(state);

        if !ready.is_empty() {
            debug!(class = computed_class, index, count = ready.len(), "unblocking evaluations");
        }
        for eval in ready {
            self.enqueue(eval);
        }
    }

    /// Stop tracking the blocked evaluation of a job.
    pub fn untrack(&self, key: &JobKey) -> Option<Evaluation> {
        self.lock().captured.remove(key)
    }

    pub fn blocked_for(&self, key: &JobKey) -> Option<Evaluation> {
        self.lock().captured.get(key).cloned()
    }

    /// Drain blocked evaluations superseded by a newer one.
    pub fn take_duplicates(&self) -> Vec<Evaluation> {
        std::mem::take(&mut self.lock().duplicates)
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.lock();
        if !enabled {
            *state = BlockedState::default();
        }
        state.enabled = enabled;
    }

    pub fn stats(&self) -> BlockedStats {
        let state = self.lock();
        BlockedStats {
            total_blocked: state.captured.len(),
            total_escaped: state.captured.values().filter(|e| e.escaped_computed_class).count(),
            total_duplicates: state.duplicates.len(),
        }
    }

    fn enqueue(&self, eval: Evaluation) {
        let eval_id = eval.id.clone();
        if let Err(e) = self.broker.enqueue(eval) {
            warn!(eval_id = %eval_id, error = %e, "failed to enqueue unblocked evaluation");
        }
    }
}

/// Whether a class the evaluation could use changed after its snapshot.
fn missed_unblock(state: &BlockedState, eval: &Evaluation) -> bool {
    state.unblock_indexes.iter().any(|(class, index)| {
        *index > eval.snapshot_index
            && (eval.escaped_computed_class || eval.class_eligibility.get(class) != Some(&false))
    })
}

/// Delay the evaluation if its job was unblocked too recently.
fn rate_limited(state: &mut BlockedState, config: &BlockedConfig, mut eval: Evaluation) -> Evaluation {
    let now = epoch_millis();
    let key = eval.job_key();
    let earliest = state
        .last_unblock
        .get(&key)
        .map_or(now, |last| last + config.min_unblock_interval_ms);
    if earliest > now {
        eval.wait_until = Some(earliest);
    }
    state.last_unblock.insert(key, earliest.max(now));
    eval
}
