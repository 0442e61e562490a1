//! corral-scheduler — turns change events into committed placements.
//!
//! Evaluations flow from the control plane through the broker to workers,
//! which run the scheduler for the job's type and submit plans to the
//! applier:
//!
//! - Reconciles desired against actual allocations per task group
//! - Places, migrates, reschedules and preempts through `corral-placement`
//! - Serializes plan commits with per-node optimistic concurrency
//! - Parks evaluations that could not place everything until capacity frees
//!
//! # Architecture
//!
//! ```text
//! ControlPlane ──► EvalBroker ──► Worker ──► Scheduler::process
//!     │               ▲   ▲                       │
//!     │               │   └── BlockedEvals ◄──────┤ blocked follow-ups
//!     │               │          ▲                ▼
//!     └──► StateStore ◄──────────┴──────── PlanApplier
//! ```

pub mod applier;
pub mod blocked;
pub mod broker;
pub mod control;
pub mod engine;
pub mod error;
mod generic;
pub mod outcome;
pub mod reconcile;
pub mod scheduler;
mod system;
pub mod worker;

pub use applier::PlanApplier;
pub use blocked::{BlockedEvals, BlockedStats};
pub use broker::{BrokerStats, EvalBroker};
pub use control::ControlPlane;
pub use engine::Engine;
pub use error::{SchedulerError, SchedulerResult};
pub use outcome::{EvalOutcome, FailedPlacement, Placement, Preemption};
pub use reconcile::{AllocReconciler, DesiredUpdates, ReconcileResults};
pub use scheduler::{Planner, Scheduler};
pub use worker::Worker;
