//! redb table definitions for the Corral state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow the pattern `{namespace}/{id}`; job versions
//! append `@{version:020}` so that versions sort numerically.

use redb::TableDefinition;

pub(crate) type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Latest job version keyed by `{namespace}/{job_id}`.
pub const JOBS: JsonTable = TableDefinition::new("jobs");

/// Every job version keyed by `{namespace}/{job_id}@{version}`.
pub const JOB_VERSIONS: JsonTable = TableDefinition::new("job_versions");

/// Nodes keyed by `{node_id}`.
pub const NODES: JsonTable = TableDefinition::new("nodes");

/// Allocations keyed by `{alloc_id}`.
pub const ALLOCS: JsonTable = TableDefinition::new("allocs");

/// Evaluations keyed by `{eval_id}`.
pub const EVALS: JsonTable = TableDefinition::new("evals");

/// CSI volumes keyed by `{namespace}/{volume_id}`.
pub const CSI_VOLUMES: JsonTable = TableDefinition::new("csi_volumes");

/// Store-wide counters (`index`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Index of the last write touching each node's allocations.
pub const NODE_ALLOC_INDEX: TableDefinition<&str, u64> = TableDefinition::new("node_alloc_index");

pub(crate) const INDEX_KEY: &str = "index";
