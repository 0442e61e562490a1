//! Per-evaluation outcome records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use corral_core::{AllocId, AllocMetric, EvalId, EvalStatus, NodeId, PlacementFailure, PlanResult};

use crate::reconcile::DesiredUpdates;

/// A committed placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub alloc_id: AllocId,
    pub name: String,
    pub task_group: String,
    pub node_id: NodeId,
}

/// A committed eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preemption {
    pub alloc_id: AllocId,
    pub node_id: NodeId,
    pub preempted_by: AllocId,
}

/// Why a task group's remaining instances were not placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPlacement {
    pub kind: Option<PlacementFailure>,
    /// Instances left unplaced.
    pub queued: u32,
    /// Reason each rejected node was rejected.
    pub node_reasons: BTreeMap<NodeId, String>,
    pub nodes_evaluated: u32,
    pub nodes_filtered: u32,
    pub nodes_exhausted: u32,
}

impl FailedPlacement {
    pub fn from_metric(metric: &AllocMetric, queued: u32) -> Self {
        Self {
            kind: metric.failure,
            queued,
            node_reasons: metric.node_reasons.clone(),
            nodes_evaluated: metric.nodes_evaluated,
            nodes_filtered: metric.nodes_filtered,
            nodes_exhausted: metric.nodes_exhausted,
        }
    }
}

/// Everything one evaluation did, for logging and the `simulate` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalOutcome {
    pub eval_id: EvalId,
    pub namespace: String,
    pub job_id: String,
    pub status: EvalStatus,
    pub status_description: String,
    pub placements: Vec<Placement>,
    pub stops: Vec<AllocId>,
    pub preemptions: Vec<Preemption>,
    pub failed: BTreeMap<String, FailedPlacement>,
    pub desired_updates: BTreeMap<String, DesiredUpdates>,
    pub blocked_eval: Option<EvalId>,
    pub followup_evals: Vec<EvalId>,
    pub plan_attempts: u32,
}

impl EvalOutcome {
    pub fn new(eval_id: &str, namespace: &str, job_id: &str) -> Self {
        Self {
            eval_id: eval_id.to_string(),
            namespace: namespace.to_string(),
            job_id: job_id.to_string(),
            status: EvalStatus::Pending,
            status_description: String::new(),
            placements: Vec::new(),
            stops: Vec::new(),
            preemptions: Vec::new(),
            failed: BTreeMap::new(),
            desired_updates: BTreeMap::new(),
            blocked_eval: None,
            followup_evals: Vec::new(),
            plan_attempts: 0,
        }
    }

    /// Fold what a plan submission committed into the record.
    pub fn record_commit(&mut self, result: &PlanResult) {
        for alloc in result.node_allocation.values().flatten() {
            // In-place updates carry the stored allocation's create index.
            if alloc.create_index != 0 {
                continue;
            }
            self.placements.push(Placement {
                alloc_id: alloc.id.clone(),
                name: alloc.name.clone(),
                task_group: alloc.task_group.clone(),
                node_id: alloc.node_id.clone(),
            });
        }
        self.stops
            .extend(result.node_update.values().flatten().map(|a| a.id.clone()));
        for alloc in result.node_preemptions.values().flatten() {
            self.preemptions.push(Preemption {
                alloc_id: alloc.id.clone(),
                node_id: alloc.node_id.clone(),
                preempted_by: alloc.preempted_by_allocation.clone().unwrap_or_default(),
            });
        }
    }
}
