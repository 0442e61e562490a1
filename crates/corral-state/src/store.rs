//! StateStore: Redb-backed state persistence for Corral.
//!
//! Provides typed CRUD operations over jobs, job versions, nodes,
//! allocations, evaluations and CSI volumes, plus the two operations the
//! scheduler depends on: [`StateStore::snapshot`] and
//! [`StateStore::commit_plan`]. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).
//!
//! Every write bumps a store-wide index and stamps it into the records it
//! touches. Writes that change a node's allocation set also record the index
//! per node; plan commits compare it against the index the plan was
//! computed at.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table, TableHandle, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use corral_core::{
    AllocClientStatus, Allocation, CsiVolume, DrainStrategy, Evaluation, Job, JobKey, Node,
    NodeStatus, PlanResult, SchedulingEligibility, VolumeKind, epoch_secs, version_key,
};

use crate::error::{StateError, StateResult};
use crate::snapshot::Snapshot;
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonWriteTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for def in [JOBS, JOB_VERSIONS, NODES, ALLOCS, EVALS, CSI_VOLUMES] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.open_table(NODE_ALLOC_INDEX).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Current store-wide index.
    pub fn latest_index(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        Ok(meta
            .get(INDEX_KEY)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0))
    }

    // ── Snapshot ───────────────────────────────────────────────────

    /// Read every record in one read transaction.
    pub fn snapshot(&self) -> StateResult<Snapshot> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let mut builder = Snapshot::builder();

        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        let index = meta
            .get(INDEX_KEY)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);
        builder = builder.index(index);

        let node_index = txn.open_table(NODE_ALLOC_INDEX).map_err(map_err!(Table))?;
        for entry in node_index.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            builder = builder.node_alloc_index(key.value(), value.value());
        }

        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        for node in read_all::<Node, _>(&table)? {
            builder = builder.node(node);
        }
        let table = txn.open_table(ALLOCS).map_err(map_err!(Table))?;
        for alloc in read_all::<Allocation, _>(&table)? {
            builder = builder.alloc(alloc);
        }
        let table = txn.open_table(JOB_VERSIONS).map_err(map_err!(Table))?;
        for job in read_all::<Job, _>(&table)? {
            builder = builder.job_version(job);
        }
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        for job in read_all::<Job, _>(&table)? {
            builder = builder.job(job);
        }
        let table = txn.open_table(EVALS).map_err(map_err!(Table))?;
        for eval in read_all::<Evaluation, _>(&table)? {
            builder = builder.eval(eval);
        }
        let table = txn.open_table(CSI_VOLUMES).map_err(map_err!(Table))?;
        for vol in read_all::<CsiVolume, _>(&table)? {
            builder = builder.csi_volume(vol);
        }

        Ok(builder.build())
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Store a new version of a job. The version is one past the stored
    /// latest version; indexes are stamped from the store. Returns the job
    /// as stored.
    pub fn upsert_job(&self, job: &Job) -> StateResult<Job> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index = bump_index(&txn)?;
        let mut stored = job.clone();
        {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let key = job.table_key();
            match read_json::<Job, _>(&jobs, &key)? {
                Some(prev) => {
                    stored.version = prev.version + 1;
                    stored.create_index = prev.create_index;
                }
                None => {
                    stored.version = 0;
                    stored.create_index = index;
                }
            }
            stored.modify_index = index;
            stored.job_modify_index = index;
            if stored.submit_time == 0 {
                stored.submit_time = epoch_secs();
            }
            write_json(&mut jobs, &key, &stored)?;

            let mut versions = txn.open_table(JOB_VERSIONS).map_err(map_err!(Table))?;
            write_json(&mut versions, &stored.version_key(), &stored)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job = %stored.key(), version = stored.version, index, "job stored");
        Ok(stored)
    }

    pub fn get_job(&self, key: &JobKey) -> StateResult<Option<Job>> {
        self.get(JOBS, &format!("{}/{}", key.namespace, key.id))
    }

    pub fn get_job_version(&self, key: &JobKey, version: u64) -> StateResult<Option<Job>> {
        self.get(JOB_VERSIONS, &version_key(&key.namespace, &key.id, version))
    }

    pub fn list_jobs(&self) -> StateResult<Vec<Job>> {
        self.list(JOBS)
    }

    /// Purge a job and all its versions. Returns true if it existed.
    pub fn delete_job(&self, key: &JobKey) -> StateResult<bool> {
        let prefix = format!("{}/{}@", key.namespace, key.id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            existed = jobs
                .remove(format!("{}/{}", key.namespace, key.id).as_str())
                .map_err(map_err!(Write))?
                .is_some();

            let mut versions = txn.open_table(JOB_VERSIONS).map_err(map_err!(Table))?;
            let keys: Vec<String> = versions
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (k, _) = entry.ok()?;
                    let k = k.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            for k in &keys {
                versions.remove(k.as_str()).map_err(map_err!(Write))?;
            }
        }
        if existed {
            bump_index(&txn)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job = %key, existed, "job deleted");
        Ok(existed)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node. The computed class is refreshed on every
    /// write. Returns the node as stored.
    pub fn upsert_node(&self, node: &Node) -> StateResult<Node> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index = bump_index(&txn)?;
        let mut stored = node.clone();
        {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let prev = read_json::<Node, _>(&nodes, &node.id)?;
            stored.create_index = prev.as_ref().map_or(index, |p| p.create_index);
            stored.modify_index = index;
            if prev.as_ref().is_none_or(|p| p.status != stored.status) {
                stored.status_updated_at = epoch_secs();
            }
            stored.compute_class();
            write_json(&mut nodes, &stored.id, &stored)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node = %stored.id, class = %stored.computed_class, index, "node stored");
        Ok(stored)
    }

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<Node>> {
        self.get(NODES, node_id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.list(NODES)
    }

    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        self.delete(NODES, node_id)
    }

    pub fn update_node_status(&self, node_id: &str, status: NodeStatus) -> StateResult<Option<Node>> {
        self.modify_node(node_id, |node| {
            if node.status != status {
                node.status = status;
                node.status_updated_at = epoch_secs();
            }
        })
    }

    pub fn update_node_drain(
        &self,
        node_id: &str,
        drain: Option<DrainStrategy>,
    ) -> StateResult<Option<Node>> {
        self.modify_node(node_id, |node| {
            // Draining nodes are ineligible; ending a drain restores eligibility.
            node.scheduling_eligibility = if drain.is_some() {
                SchedulingEligibility::Ineligible
            } else {
                SchedulingEligibility::Eligible
            };
            node.drain = drain;
        })
    }

    pub fn update_node_eligibility(
        &self,
        node_id: &str,
        eligibility: SchedulingEligibility,
    ) -> StateResult<Option<Node>> {
        self.modify_node(node_id, |node| node.scheduling_eligibility = eligibility)
    }

    fn modify_node(&self, node_id: &str, f: impl FnOnce(&mut Node)) -> StateResult<Option<Node>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let Some(mut node) = read_json::<Node, _>(&nodes, node_id)? else {
                return Ok(None);
            };
            let index = bump_index(&txn)?;
            f(&mut node);
            node.modify_index = index;
            node.compute_class();
            write_json(&mut nodes, node_id, &node)?;
            updated = node;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node = %node_id, status = %updated.status.as_str(), "node updated");
        Ok(Some(updated))
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Insert or update allocations outside of a plan (restores, fixtures).
    pub fn upsert_allocs(&self, allocs: &[Allocation]) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index = bump_index(&txn)?;
        {
            let mut table = txn.open_table(ALLOCS).map_err(map_err!(Table))?;
            let mut node_index = txn.open_table(NODE_ALLOC_INDEX).map_err(map_err!(Table))?;
            for alloc in allocs {
                let mut stored = alloc.clone();
                let prev = read_json::<Allocation, _>(&table, &alloc.id)?;
                stored.create_index = prev.as_ref().map_or(index, |p| p.create_index);
                stored.modify_index = index;
                write_json(&mut table, &stored.id, &stored)?;
                node_index
                    .insert(stored.node_id.as_str(), index)
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = allocs.len(), index, "allocations stored");
        Ok(index)
    }

    pub fn get_alloc(&self, alloc_id: &str) -> StateResult<Option<Allocation>> {
        self.get(ALLOCS, alloc_id)
    }

    pub fn list_allocs(&self) -> StateResult<Vec<Allocation>> {
        self.list(ALLOCS)
    }

    /// Record a client-side status change. Terminal statuses release the
    /// allocation's CSI claims.
    pub fn update_alloc_client_status(
        &self,
        alloc_id: &str,
        status: AllocClientStatus,
        description: &str,
    ) -> StateResult<Option<Allocation>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut allocs = txn.open_table(ALLOCS).map_err(map_err!(Table))?;
            let Some(mut alloc) = read_json::<Allocation, _>(&allocs, alloc_id)? else {
                return Ok(None);
            };
            let index = bump_index(&txn)?;
            alloc.client_status = status;
            alloc.client_description = description.to_string();
            alloc.modify_index = index;
            alloc.modify_time = epoch_secs();
            write_json(&mut allocs, alloc_id, &alloc)?;
            if status.terminal() {
                release_claims(&txn, &alloc, index)?;
            }
            updated = alloc;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(alloc = %alloc_id, status = ?status, "alloc client status updated");
        Ok(Some(updated))
    }

    // ── Plans ──────────────────────────────────────────────────────

    /// Atomically apply the accepted portion of a plan.
    ///
    /// Fails with [`StateError::StaleIndex`] without writing anything if any
    /// touched node's allocation index is newer than `expected_index`.
    /// Returns the index the plan was committed at.
    pub fn commit_plan(&self, result: &PlanResult, expected_index: u64) -> StateResult<u64> {
        let nodes: BTreeSet<&String> = result
            .node_update
            .keys()
            .chain(result.node_allocation.keys())
            .chain(result.node_preemptions.keys())
            .collect();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index;
        {
            let mut node_index = txn.open_table(NODE_ALLOC_INDEX).map_err(map_err!(Table))?;
            for node_id in &nodes {
                let current = node_index
                    .get(node_id.as_str())
                    .map_err(map_err!(Read))?
                    .map(|g| g.value())
                    .unwrap_or(0);
                if current > expected_index {
                    return Err(StateError::StaleIndex {
                        node_id: node_id.to_string(),
                        current,
                        expected: expected_index,
                    });
                }
            }
            index = bump_index(&txn)?;
            for node_id in &nodes {
                node_index
                    .insert(node_id.as_str(), index)
                    .map_err(map_err!(Write))?;
            }
        }

        let now = epoch_secs();
        let mut released = Vec::new();
        let mut claimed = Vec::new();
        {
            let mut allocs = txn.open_table(ALLOCS).map_err(map_err!(Table))?;

            let stops = result
                .node_update
                .values()
                .chain(result.node_preemptions.values())
                .flatten();
            for update in stops {
                let mut stored =
                    read_json::<Allocation, _>(&allocs, &update.id)?.unwrap_or_else(|| update.clone());
                stored.desired_status = update.desired_status;
                stored.desired_description = update.desired_description.clone();
                if update.client_status.terminal() {
                    stored.client_status = update.client_status;
                }
                if update.preempted_by_allocation.is_some() {
                    stored.preempted_by_allocation = update.preempted_by_allocation.clone();
                }
                stored.modify_index = index;
                stored.modify_time = now;
                write_json(&mut allocs, &stored.id, &stored)?;
                released.push(stored);
            }

            for placed in result.node_allocation.values().flatten() {
                let mut stored = placed.clone();
                match read_json::<Allocation, _>(&allocs, &placed.id)? {
                    // In-place update keeps the original identity.
                    Some(prev) => {
                        stored.create_index = prev.create_index;
                        stored.create_time = prev.create_time;
                    }
                    None => {
                        stored.create_index = index;
                        stored.create_time = now;
                    }
                }
                stored.modify_index = index;
                stored.modify_time = now;

                if let Some(prev_id) = &stored.previous_allocation {
                    if let Some(mut prev) = read_json::<Allocation, _>(&allocs, prev_id)? {
                        prev.next_allocation = Some(stored.id.clone());
                        prev.modify_index = index;
                        write_json(&mut allocs, prev_id, &prev)?;
                    }
                }
                write_json(&mut allocs, &stored.id, &stored)?;
                claimed.push(stored);
            }
        }

        for alloc in &released {
            release_claims(&txn, alloc, index)?;
        }
        for alloc in &claimed {
            claim_volumes(&txn, alloc, index)?;
        }

        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            index,
            nodes = nodes.len(),
            placed = claimed.len(),
            stopped = released.len(),
            "plan committed"
        );
        Ok(index)
    }

    // ── Evaluations ────────────────────────────────────────────────

    /// Insert or update evaluations, stamping indexes.
    pub fn upsert_evals(&self, evals: &[Evaluation]) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index = bump_index(&txn)?;
        {
            let mut table = txn.open_table(EVALS).map_err(map_err!(Table))?;
            for eval in evals {
                let mut stored = eval.clone();
                let prev = read_json::<Evaluation, _>(&table, &eval.id)?;
                stored.create_index = prev.as_ref().map_or(index, |p| p.create_index);
                stored.modify_index = index;
                write_json(&mut table, &stored.id, &stored)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = evals.len(), index, "evaluations stored");
        Ok(index)
    }

    pub fn get_eval(&self, eval_id: &str) -> StateResult<Option<Evaluation>> {
        self.get(EVALS, eval_id)
    }

    pub fn list_evals(&self) -> StateResult<Vec<Evaluation>> {
        self.list(EVALS)
    }

    pub fn delete_eval(&self, eval_id: &str) -> StateResult<bool> {
        self.delete(EVALS, eval_id)
    }

    // ── CSI volumes ────────────────────────────────────────────────

    pub fn upsert_csi_volume(&self, volume: &CsiVolume) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index = bump_index(&txn)?;
        {
            let mut table = txn.open_table(CSI_VOLUMES).map_err(map_err!(Table))?;
            let mut stored = volume.clone();
            stored.modify_index = index;
            write_json(&mut table, &stored.table_key(), &stored)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn get_csi_volume(&self, namespace: &str, id: &str) -> StateResult<Option<CsiVolume>> {
        self.get(CSI_VOLUMES, &format!("{namespace}/{id}"))
    }

    // ── Generic record access ──────────────────────────────────────

    fn get<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_json(&table, key)
    }

    fn list<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_all(&table)
    }

    fn delete(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        if existed {
            bump_index(&txn)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(table = def.name(), %key, existed, "record deleted");
        Ok(existed)
    }
}

// ── Transaction helpers ────────────────────────────────────────────

fn bump_index(txn: &WriteTransaction) -> StateResult<u64> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    let current = meta
        .get(INDEX_KEY)
        .map_err(map_err!(Read))?
        .map(|g| g.value())
        .unwrap_or(0);
    let next = current + 1;
    meta.insert(INDEX_KEY, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn read_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn read_all<T, R>(table: &R) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
    }
    Ok(results)
}

fn write_json<T: Serialize>(table: &mut JsonWriteTable<'_>, key: &str, value: &T) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// CSI volume table keys the allocation's task group mounts.
fn csi_sources(txn: &WriteTransaction, alloc: &Allocation) -> StateResult<Vec<(String, bool)>> {
    let versions = txn.open_table(JOB_VERSIONS).map_err(map_err!(Table))?;
    let key = version_key(&alloc.namespace, &alloc.job_id, alloc.job_version);
    let Some(job) = read_json::<Job, _>(&versions, &key)? else {
        return Ok(Vec::new());
    };
    Ok(job
        .lookup_task_group(&alloc.task_group)
        .map(|tg| {
            tg.volumes
                .values()
                .filter(|v| v.kind == VolumeKind::Csi)
                .map(|v| (format!("{}/{}", alloc.namespace, v.source), v.read_only))
                .collect()
        })
        .unwrap_or_default())
}

fn claim_volumes(txn: &WriteTransaction, alloc: &Allocation, index: u64) -> StateResult<()> {
    let sources = csi_sources(txn, alloc)?;
    if sources.is_empty() {
        return Ok(());
    }
    let mut volumes = txn.open_table(CSI_VOLUMES).map_err(map_err!(Table))?;
    for (key, read_only) in sources {
        let Some(mut vol) = read_json::<CsiVolume, _>(&volumes, &key)? else {
            continue;
        };
        if read_only {
            vol.read_claims.insert(alloc.id.clone());
        } else {
            vol.write_claims.insert(alloc.id.clone());
        }
        vol.modify_index = index;
        write_json(&mut volumes, &key, &vol)?;
    }
    Ok(())
}

fn release_claims(txn: &WriteTransaction, alloc: &Allocation, index: u64) -> StateResult<()> {
    let sources = csi_sources(txn, alloc)?;
    if sources.is_empty() {
        return Ok(());
    }
    let mut volumes = txn.open_table(CSI_VOLUMES).map_err(map_err!(Table))?;
    for (key, _) in sources {
        let Some(mut vol) = read_json::<CsiVolume, _>(&volumes, &key)? else {
            continue;
        };
        if vol.release(&alloc.id) {
            vol.modify_index = index;
            write_json(&mut volumes, &key, &vol)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use corral_core::{
        AllocDesiredStatus, CsiAccessMode, JobType, NodeResources, TaskGroup, VolumeRequest,
    };

    fn test_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            name: id.to_string(),
            job_type: JobType::Service,
            datacenters: vec!["dc1".to_string()],
            task_groups: vec![TaskGroup {
                name: "web".to_string(),
                count: 2,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn test_node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            datacenter: "dc1".to_string(),
            resources: NodeResources {
                cpu_shares: 4000,
                memory_bytes: 8 * 1024 * 1024 * 1024,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn test_alloc(id: &str, node_id: &str) -> Allocation {
        Allocation {
            id: id.to_string(),
            name: format!("api.web[{}]", id.len()),
            namespace: "default".to_string(),
            node_id: node_id.to_string(),
            job_id: "api".to_string(),
            task_group: "web".to_string(),
            ..Default::default()
        }
    }

    // ── Job CRUD ───────────────────────────────────────────────────

    #[test]
    fn job_upsert_bumps_version() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store.upsert_job(&test_job("api")).unwrap();
        let second = store.upsert_job(&test_job("api")).unwrap();

        assert_eq!(first.version, 0);
        assert_eq!(second.version, 1);
        assert_eq!(second.create_index, first.create_index);
        assert!(second.job_modify_index > first.job_modify_index);

        let key = JobKey::new("default", "api");
        assert_eq!(store.get_job(&key).unwrap().unwrap().version, 1);
        assert!(store.get_job_version(&key, 0).unwrap().is_some());
        assert!(store.get_job_version(&key, 1).unwrap().is_some());
    }

    #[test]
    fn job_delete_removes_versions() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert_job(&test_job("api")).unwrap();
        store.upsert_job(&test_job("api")).unwrap();
        store.upsert_job(&test_job("other")).unwrap();

        let key = JobKey::new("default", "api");
        assert!(store.delete_job(&key).unwrap());
        assert!(!store.delete_job(&key).unwrap());
        assert!(store.get_job_version(&key, 0).unwrap().is_none());
        assert!(
            store
                .get_job_version(&JobKey::new("default", "other"), 0)
                .unwrap()
                .is_some()
        );
    }

    // ── Node CRUD ──────────────────────────────────────────────────

    #[test]
    fn node_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let stored = store.upsert_node(&test_node("node-1")).unwrap();

        assert!(!stored.computed_class.is_empty());
        assert_eq!(store.get_node("node-1").unwrap(), Some(stored));
        assert_eq!(store.list_nodes().unwrap().len(), 1);
    }

    #[test]
    fn node_drain_makes_ineligible() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert_node(&test_node("node-1")).unwrap();

        let node = store
            .update_node_drain("node-1", Some(DrainStrategy::default()))
            .unwrap()
            .unwrap();
        assert!(node.draining());
        assert!(!node.ready());

        let node = store.update_node_drain("node-1", None).unwrap().unwrap();
        assert!(node.ready());
    }

    #[test]
    fn node_status_update_on_missing_node() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(
            store
                .update_node_status("ghost", NodeStatus::Down)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn node_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert_node(&test_node("node-1")).unwrap();

        assert!(store.delete_node("node-1").unwrap());
        assert!(store.get_node("node-1").unwrap().is_none());
    }

    // ── Plans ──────────────────────────────────────────────────────

    #[test]
    fn commit_plan_stamps_indexes() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert_node(&test_node("node-1")).unwrap();
        let snap = store.snapshot().unwrap();

        let mut result = PlanResult::default();
        result
            .node_allocation
            .insert("node-1".to_string(), vec![test_alloc("a1", "node-1")]);
        let index = store.commit_plan(&result, snap.index()).unwrap();

        let snap = store.snapshot().unwrap();
        assert_eq!(snap.index(), index);
        assert_eq!(snap.node_alloc_index("node-1"), index);
        let alloc = snap.alloc("a1").unwrap();
        assert_eq!(alloc.create_index, index);
        assert_eq!(alloc.modify_index, index);
    }

    #[test]
    fn commit_plan_rejects_stale_node() {
        let store = StateStore::open_in_memory().unwrap();
        let before = store.snapshot().unwrap().index();
        store.upsert_allocs(&[test_alloc("a0", "node-1")]).unwrap();

        let mut result = PlanResult::default();
        result
            .node_allocation
            .insert("node-1".to_string(), vec![test_alloc("a1", "node-1")]);
        let err = store.commit_plan(&result, before).unwrap_err();
        assert!(matches!(err, StateError::StaleIndex { .. }));
        assert!(store.get_alloc("a1").unwrap().is_none());
    }

    #[test]
    fn commit_plan_links_previous_allocation() {
        let store = StateStore::open_in_memory().unwrap();
        let mut failed = test_alloc("old", "node-1");
        failed.client_status = AllocClientStatus::Failed;
        store.upsert_allocs(&[failed]).unwrap();
        let snap = store.snapshot().unwrap();

        let mut replacement = test_alloc("new", "node-2");
        replacement.previous_allocation = Some("old".to_string());
        let mut result = PlanResult::default();
        result
            .node_allocation
            .insert("node-2".to_string(), vec![replacement]);
        store.commit_plan(&result, snap.index()).unwrap();

        let old = store.get_alloc("old").unwrap().unwrap();
        assert_eq!(old.next_allocation.as_deref(), Some("new"));
    }

    #[test]
    fn commit_plan_stops_and_preempts() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .upsert_allocs(&[test_alloc("a1", "node-1"), test_alloc("a2", "node-1")])
            .unwrap();
        let snap = store.snapshot().unwrap();

        let mut stop = test_alloc("a1", "node-1");
        stop.desired_status = AllocDesiredStatus::Stop;
        stop.client_status = AllocClientStatus::Lost;
        let mut evict = test_alloc("a2", "node-1");
        evict.desired_status = AllocDesiredStatus::Evict;
        evict.preempted_by_allocation = Some("a3".to_string());

        let mut result = PlanResult::default();
        result.node_update.insert("node-1".to_string(), vec![stop]);
        result
            .node_preemptions
            .insert("node-1".to_string(), vec![evict]);
        store.commit_plan(&result, snap.index()).unwrap();

        let a1 = store.get_alloc("a1").unwrap().unwrap();
        assert_eq!(a1.desired_status, AllocDesiredStatus::Stop);
        assert_eq!(a1.client_status, AllocClientStatus::Lost);
        let a2 = store.get_alloc("a2").unwrap().unwrap();
        assert_eq!(a2.desired_status, AllocDesiredStatus::Evict);
        assert_eq!(a2.preempted_by_allocation.as_deref(), Some("a3"));
    }

    // ── CSI claims ─────────────────────────────────────────────────

    #[test]
    fn csi_claims_follow_alloc_lifecycle() {
        let store = StateStore::open_in_memory().unwrap();
        let mut job = test_job("api");
        let mut volumes = BTreeMap::new();
        volumes.insert(
            "data".to_string(),
            VolumeRequest {
                name: "data".to_string(),
                kind: VolumeKind::Csi,
                source: "db-vol".to_string(),
                read_only: false,
            },
        );
        job.task_groups[0].volumes = volumes;
        let job = store.upsert_job(&job).unwrap();
        store
            .upsert_csi_volume(&CsiVolume {
                id: "db-vol".to_string(),
                namespace: "default".to_string(),
                plugin_id: "ebs".to_string(),
                access_mode: CsiAccessMode::SingleNodeWriter,
                schedulable: true,
                ..Default::default()
            })
            .unwrap();

        let mut alloc = test_alloc("a1", "node-1");
        alloc.job_version = job.version;
        let mut result = PlanResult::default();
        result.node_allocation.insert("node-1".to_string(), vec![alloc]);
        let snap = store.snapshot().unwrap();
        store.commit_plan(&result, snap.index()).unwrap();

        let vol = store.get_csi_volume("default", "db-vol").unwrap().unwrap();
        assert!(vol.write_claims.contains("a1"));

        store
            .update_alloc_client_status("a1", AllocClientStatus::Complete, "done")
            .unwrap();
        let vol = store.get_csi_volume("default", "db-vol").unwrap().unwrap();
        assert!(vol.write_claims.is_empty());
    }

    // ── Evaluations ────────────────────────────────────────────────

    #[test]
    fn eval_upsert_preserves_create_index() {
        let store = StateStore::open_in_memory().unwrap();
        let mut eval = Evaluation {
            id: "e1".to_string(),
            ..Default::default()
        };
        let first = store.upsert_evals(std::slice::from_ref(&eval)).unwrap();
        eval.status = corral_core::EvalStatus::Complete;
        let second = store.upsert_evals(&[eval]).unwrap();

        let stored = store.get_eval("e1").unwrap().unwrap();
        assert_eq!(stored.create_index, first);
        assert_eq!(stored.modify_index, second);
        assert!(store.delete_eval("e1").unwrap());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.upsert_job(&test_job("api")).unwrap();
            store.upsert_node(&test_node("node-1")).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let snap = store.snapshot().unwrap();
        assert!(snap.job(&JobKey::new("default", "api")).is_some());
        assert!(snap.node("node-1").is_some());
        assert_eq!(snap.index(), 2);
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert_eq!(store.latest_index().unwrap(), 0);
        assert!(store.list_jobs().unwrap().is_empty());
        assert!(store.list_nodes().unwrap().is_empty());
        assert!(store.list_allocs().unwrap().is_empty());
        assert!(store.list_evals().unwrap().is_empty());
        assert!(!store.delete_node("nope").unwrap());
        assert!(!store.delete_eval("nope").unwrap());
        assert!(
            store
                .update_alloc_client_status("nope", AllocClientStatus::Failed, "")
                .unwrap()
                .is_none()
        );
        // Failed lookups do not advance the index.
        assert_eq!(store.latest_index().unwrap(), 0);
    }
}
