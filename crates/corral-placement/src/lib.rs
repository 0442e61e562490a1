//! corral-placement — where does one allocation go?
//!
//! Given an immutable snapshot and the plan being built, decides which node
//! receives each instance of a task group. It does NOT reconcile desired
//! against actual state (that's `corral-scheduler`); it only answers
//! placement questions.
//!
//! # Components
//!
//! - **`context`** — per-evaluation state: snapshot, plan, metrics, caches
//! - **`feasible`** — status, driver, constraint and volume filters
//! - **`fit`** — resource, device and port assignment
//! - **`scorer`** — bin-packing, anti-affinity, affinity, spread, penalty
//! - **`preempt`** — eviction of lower-priority allocations
//! - **`stack`** — the select pipeline for generic and system jobs

pub mod context;
pub mod feasible;
pub mod fit;
pub mod preempt;
pub mod scorer;
pub mod stack;

pub use context::{EvalContext, EvalEligibility};
pub use feasible::{Rejection, check_node};
pub use fit::{allocs_fit, fit_task_group};
pub use preempt::{PreemptionResult, select_preemption};
pub use scorer::{NodeScore, ScoreBreakdown, rank_nodes, score_node};
pub use stack::{GenericStack, RankedNode, SelectOptions, SystemStack};
