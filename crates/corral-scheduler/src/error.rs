//! Scheduler error types.

use corral_core::PlacementFailure;
use thiserror::Error;

/// Errors that can occur while scheduling evaluations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("insufficient capacity for task group {task_group}")]
    InsufficientCapacity { task_group: String },

    #[error("constraints unsatisfiable for task group {task_group}")]
    ConstraintUnsatisfiable { task_group: String },

    #[error("evaluation {eval_id}: plan rejected {attempts} times against newer state")]
    StaleOptimisticConcurrency { eval_id: String, attempts: u32 },

    #[error("evaluation {eval_id} exceeded delivery limit ({deliveries})")]
    EvaluationRetryExhausted { eval_id: String, deliveries: u32 },

    #[error("malformed evaluation {eval_id}: {reason}")]
    MalformedEvaluation { eval_id: String, reason: String },

    #[error("invalid job {job}: {reason}")]
    InvalidJob { job: String, reason: String },

    #[error("plan for evaluation {eval_id} rejected: {reason}")]
    PlanRejected { eval_id: String, reason: String },

    #[error("evaluation {0} is not outstanding")]
    NotOutstanding(String),

    #[error("token mismatch for evaluation {0}")]
    TokenMismatch(String),

    #[error("evaluation broker is disabled")]
    BrokerDisabled,

    #[error("state store error: {0}")]
    State(#[from] corral_state::StateError),
}

impl SchedulerError {
    /// The escalation error matching a placement failure kind.
    pub fn from_failure(task_group: &str, failure: PlacementFailure) -> Self {
        let task_group = task_group.to_string();
        match failure {
            PlacementFailure::InsufficientCapacity => SchedulerError::InsufficientCapacity { task_group },
            PlacementFailure::ConstraintUnsatisfiable => SchedulerError::ConstraintUnsatisfiable { task_group },
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
