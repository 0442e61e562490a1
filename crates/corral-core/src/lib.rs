//! corral-core — shared data model for the Corral scheduling engine.
//!
//! Holds the value types every other crate speaks: jobs and their task
//! groups, nodes, allocations, evaluations and plans, the resource model
//! used for feasibility checks, and the TOML configuration.
//!
//! # Modules
//!
//! - **`structs`** — jobs, nodes, allocations, evaluations, plans
//! - **`resources`** — comparable resource arithmetic
//! - **`network`** — per-node port and bandwidth bookkeeping
//! - **`devices`** — per-node device instance bookkeeping
//! - **`config`** — `corral.toml` parsing

pub mod config;
pub mod devices;
pub mod network;
pub mod resources;
pub mod structs;

pub use config::{ConfigError, CorralConfig};
pub use devices::DeviceAccounter;
pub use network::NetworkIndex;
pub use resources::{ComparableResources, Dimension, InsufficientCapacity};
pub use structs::*;
