//! corral-state — embedded state store for Corral.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for jobs, nodes, allocations, evaluations and CSI
//! volumes.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Schedulers never read tables directly: they take a [`Snapshot`], an
//! immutable view read in one transaction, and hand plans back through
//! [`StateStore::commit_plan`], which enforces per-node optimistic
//! concurrency.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod snapshot;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use snapshot::{Snapshot, SnapshotBuilder};
pub use store::StateStore;
