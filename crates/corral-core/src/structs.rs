//! Domain types for the Corral scheduler.
//!
//! These types represent jobs, nodes, allocations, evaluations and plans.
//! All of them are serializable to/from JSON for storage in redb tables.
//! Relations are expressed by identifier only: a node never embeds its
//! allocations, an allocation refers to its node by `node_id`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::resources::ComparableResources;

/// Unique identifier for a job within a namespace.
pub type JobId = String;

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Unique identifier for an allocation.
pub type AllocId = String;

/// Unique identifier for an evaluation.
pub type EvalId = String;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_JOB_PRIORITY: i32 = 50;
pub const MIN_JOB_PRIORITY: i32 = 1;
pub const MAX_JOB_PRIORITY: i32 = 100;

/// Generate a random identifier for allocations and evaluations.
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Job ────────────────────────────────────────────────────────────

/// Namespace-scoped job identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub namespace: String,
    pub id: JobId,
}

impl JobKey {
    pub fn new(namespace: &str, id: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            id: id.to_string(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Scheduling policy of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    #[default]
    Service,
    Batch,
    System,
    SysBatch,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Service => "service",
            JobType::Batch => "batch",
            JobType::System => "system",
            JobType::SysBatch => "sysbatch",
        }
    }

    /// System and sysbatch jobs place one allocation per eligible node.
    pub fn is_per_node(&self) -> bool {
        matches!(self, JobType::System | JobType::SysBatch)
    }

    /// Batch-like jobs never replace successfully completed allocations.
    pub fn keeps_completed(&self) -> bool {
        matches!(self, JobType::Batch | JobType::SysBatch)
    }

    pub const ALL: [JobType; 4] = [JobType::Service, JobType::Batch, JobType::System, JobType::SysBatch];
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declarative job definition (already validated and normalized).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Job {
    pub namespace: String,
    pub id: JobId,
    pub name: String,
    /// Bumped on every registration; each version is stored separately.
    pub version: u64,
    pub job_type: JobType,
    /// 1..=100, higher preempts lower.
    pub priority: i32,
    pub datacenters: Vec<String>,
    pub constraints: Vec<Constraint>,
    pub affinities: Vec<Affinity>,
    pub spreads: Vec<Spread>,
    pub task_groups: Vec<TaskGroup>,
    /// Set when the job is deregistered; all allocations get stopped.
    pub stop: bool,
    /// Commit the plan only if every placement succeeds.
    pub all_at_once: bool,
    pub create_index: u64,
    pub modify_index: u64,
    pub job_modify_index: u64,
    /// Unix timestamp (seconds) of the submission that created this version.
    pub submit_time: u64,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            id: String::new(),
            name: String::new(),
            version: 0,
            job_type: JobType::Service,
            priority: DEFAULT_JOB_PRIORITY,
            datacenters: Vec::new(),
            constraints: Vec::new(),
            affinities: Vec::new(),
            spreads: Vec::new(),
            task_groups: Vec::new(),
            stop: false,
            all_at_once: false,
            create_index: 0,
            modify_index: 0,
            job_modify_index: 0,
            submit_time: 0,
        }
    }
}

impl Job {
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.namespace, &self.id)
    }

    /// Composite key for the jobs table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.id)
    }

    /// Composite key for the job versions table. The version is zero-padded
    /// so that a prefix scan yields versions in order.
    pub fn version_key(&self) -> String {
        version_key(&self.namespace, &self.id, self.version)
    }

    pub fn lookup_task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }

    pub fn stopped(&self) -> bool {
        self.stop
    }

    /// Whether any constraint or affinity depends on node-unique values,
    /// which makes computed-class caching unsound for this job.
    pub fn escapes_computed_class(&self) -> bool {
        let escaped = |cs: &[Constraint]| cs.iter().any(Constraint::escapes_computed_class);
        escaped(&self.constraints)
            || self.task_groups.iter().any(|tg| {
                escaped(&tg.constraints) || tg.tasks.iter().any(|t| escaped(&t.constraints))
            })
    }
}

pub fn version_key(namespace: &str, id: &str, version: u64) -> String {
    format!("{namespace}/{id}@{version:020}")
}

/// A group of tasks placed together as one allocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TaskGroup {
    pub name: String,
    /// Desired instance count (ignored by system and sysbatch jobs).
    pub count: u32,
    pub tasks: Vec<Task>,
    pub constraints: Vec<Constraint>,
    pub affinities: Vec<Affinity>,
    pub spreads: Vec<Spread>,
    /// Group network asks (bandwidth and ports).
    pub networks: Vec<NetworkResource>,
    /// Volume requests keyed by the group-local volume name.
    pub volumes: BTreeMap<String, VolumeRequest>,
    pub ephemeral_disk_bytes: u64,
    pub reschedule_policy: Option<ReschedulePolicy>,
}

impl TaskGroup {
    /// Countable resources the whole group asks for.
    pub fn comparable_ask(&self) -> ComparableResources {
        let mut ask = ComparableResources::new(0, 0, self.ephemeral_disk_bytes);
        for task in &self.tasks {
            ask.cpu_shares += task.resources.cpu_shares;
            ask.memory_bytes += task.resources.memory_bytes;
        }
        ask.bandwidth_mbits = self.networks.iter().map(|n| n.mbits).sum();
        ask
    }

    /// Whether two versions of a group can be updated in place: same tasks,
    /// drivers, resources, networks and volumes.
    pub fn in_place_compatible(&self, other: &TaskGroup) -> bool {
        self.tasks == other.tasks
            && self.networks == other.networks
            && self.volumes == other.volumes
            && self.ephemeral_disk_bytes == other.ephemeral_disk_bytes
    }

    pub fn csi_volumes(&self) -> impl Iterator<Item = &VolumeRequest> {
        self.volumes.values().filter(|v| v.kind == VolumeKind::Csi)
    }
}

/// A single unit of work run by a driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Task {
    pub name: String,
    pub driver: String,
    pub resources: TaskResources,
    pub constraints: Vec<Constraint>,
    pub affinities: Vec<Affinity>,
}

/// Resource ask of a single task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TaskResources {
    pub cpu_shares: u64,
    pub memory_bytes: u64,
    pub devices: Vec<DeviceRequest>,
}

/// A request for `count` instances of a device.
///
/// `name` is `type`, `vendor/type` or `vendor/type/model`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceRequest {
    pub name: String,
    pub count: u64,
}

/// A network ask: bandwidth plus static and dynamic ports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct NetworkResource {
    /// Host network device to use; the node's first network when empty.
    pub device: String,
    pub mbits: u64,
    pub reserved_ports: Vec<Port>,
    pub dynamic_ports: Vec<Port>,
}

/// A labelled port. `value` is zero for dynamic asks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Port {
    pub label: String,
    #[serde(default)]
    pub value: u16,
}

/// How a group mounts a volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeKind {
    #[default]
    Host,
    Csi,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct VolumeRequest {
    pub name: String,
    pub kind: VolumeKind,
    /// Host volume name or CSI volume ID.
    pub source: String,
    pub read_only: bool,
}

// ── Constraints, affinities, spreads ───────────────────────────────

/// Comparison operator for constraints and affinities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    #[serde(rename = "=", alias = "==", alias = "is")]
    Equal,
    #[serde(rename = "!=", alias = "not")]
    NotEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterEqual,
    #[serde(rename = "regexp")]
    Regexp,
    #[serde(rename = "version")]
    Version,
    #[serde(rename = "semver")]
    Semver,
    #[serde(rename = "set_contains", alias = "set_contains_all")]
    SetContains,
    #[serde(rename = "set_contains_any")]
    SetContainsAny,
    #[serde(rename = "is_set")]
    IsSet,
    #[serde(rename = "is_not_set")]
    IsNotSet,
    #[serde(rename = "distinct_hosts")]
    DistinctHosts,
    #[serde(rename = "distinct_property")]
    DistinctProperty,
}

impl Operand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operand::Equal => "=",
            Operand::NotEqual => "!=",
            Operand::Less => "<",
            Operand::LessEqual => "<=",
            Operand::Greater => ">",
            Operand::GreaterEqual => ">=",
            Operand::Regexp => "regexp",
            Operand::Version => "version",
            Operand::Semver => "semver",
            Operand::SetContains => "set_contains",
            Operand::SetContainsAny => "set_contains_any",
            Operand::IsSet => "is_set",
            Operand::IsNotSet => "is_not_set",
            Operand::DistinctHosts => "distinct_hosts",
            Operand::DistinctProperty => "distinct_property",
        }
    }
}

/// A hard placement rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Constraint {
    #[serde(default)]
    pub l_target: String,
    pub operand: Operand,
    #[serde(default)]
    pub r_target: String,
}

impl Constraint {
    pub fn new(l_target: &str, operand: Operand, r_target: &str) -> Self {
        Self {
            l_target: l_target.to_string(),
            operand,
            r_target: r_target.to_string(),
        }
    }

    pub fn distinct_hosts() -> Self {
        Self::new("", Operand::DistinctHosts, "")
    }

    fn escapes_computed_class(&self) -> bool {
        matches!(self.operand, Operand::DistinctHosts | Operand::DistinctProperty)
            || target_is_unique(&self.l_target)
            || target_is_unique(&self.r_target)
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.l_target, self.operand.as_str(), self.r_target)
    }
}

fn target_is_unique(target: &str) -> bool {
    target.starts_with("${node.unique.")
        || target.starts_with("${attr.unique.")
        || target.starts_with("${meta.unique.")
}

/// A soft placement preference. Positive weights attract, negative repel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Affinity {
    pub l_target: String,
    pub operand: Operand,
    pub r_target: String,
    /// -100..=100.
    pub weight: i8,
}

/// Preference for distributing placements across an attribute's values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Spread {
    pub attribute: String,
    /// 0..=100.
    pub weight: u8,
    /// Explicit percentages; an even split over observed values when empty.
    #[serde(default)]
    pub targets: Vec<SpreadTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpreadTarget {
    pub value: String,
    pub percent: u8,
}

// ── Reschedule policy ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayFunction {
    #[default]
    Constant,
    Exponential,
    Fibonacci,
}

/// How failed allocations of a group are replaced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReschedulePolicy {
    /// Attempts allowed within `interval_secs` (ignored when unlimited).
    pub attempts: u32,
    pub interval_secs: u64,
    pub delay_secs: u64,
    pub delay_function: DelayFunction,
    pub max_delay_secs: u64,
    pub unlimited: bool,
}

impl Default for ReschedulePolicy {
    fn default() -> Self {
        Self::default_for(JobType::Service)
    }
}

impl ReschedulePolicy {
    pub fn default_for(job_type: JobType) -> Self {
        match job_type {
            JobType::Batch | JobType::SysBatch => Self {
                attempts: 1,
                interval_secs: 24 * 60 * 60,
                delay_secs: 5,
                delay_function: DelayFunction::Constant,
                max_delay_secs: 0,
                unlimited: false,
            },
            JobType::Service | JobType::System => Self {
                attempts: 0,
                interval_secs: 0,
                delay_secs: 30,
                delay_function: DelayFunction::Exponential,
                max_delay_secs: 60 * 60,
                unlimited: true,
            },
        }
    }

    pub fn enabled(&self) -> bool {
        self.unlimited || (self.attempts > 0 && self.interval_secs > 0)
    }

    /// Delay before the next attempt, given the attempts already made.
    pub fn next_delay(&self, previous: &[RescheduleEvent]) -> u64 {
        let delay = match self.delay_function {
            DelayFunction::Constant => self.delay_secs,
            DelayFunction::Exponential => match previous.last() {
                None => self.delay_secs,
                Some(last) => last.delay_secs.saturating_mul(2).max(self.delay_secs),
            },
            DelayFunction::Fibonacci => match previous {
                [] | [_] => self.delay_secs,
                [.., a, b] => a.delay_secs.saturating_add(b.delay_secs),
            },
        };
        if self.max_delay_secs > 0 {
            delay.min(self.max_delay_secs)
        } else {
            delay
        }
    }
}

/// A record of one reschedule of an allocation's lineage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RescheduleEvent {
    /// Unix timestamp (seconds).
    pub reschedule_time: u64,
    pub prev_alloc_id: AllocId,
    pub prev_node_id: NodeId,
    pub delay_secs: u64,
}

// ── Node ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Initializing,
    #[default]
    Ready,
    Down,
    Disconnected,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Initializing => "initializing",
            NodeStatus::Ready => "ready",
            NodeStatus::Down => "down",
            NodeStatus::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingEligibility {
    #[default]
    Eligible,
    Ineligible,
}

/// Drain in progress on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DrainStrategy {
    /// Unix timestamp (seconds) after which remaining allocations are forced off.
    pub deadline: u64,
    pub ignore_system_jobs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverInfo {
    pub detected: bool,
    pub healthy: bool,
}

impl DriverInfo {
    pub fn healthy() -> Self {
        Self {
            detected: true,
            healthy: true,
        }
    }
}

/// A host network interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct NodeNetwork {
    pub device: String,
    pub ip: String,
    pub mbits: u64,
}

/// A group of identical device instances on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct NodeDevice {
    pub vendor: String,
    pub device_type: String,
    pub name: String,
    pub instances: Vec<DeviceInstance>,
    pub attributes: BTreeMap<String, String>,
}

impl NodeDevice {
    /// Whether a request name (`type`, `vendor/type`, `vendor/type/model`)
    /// selects this device group.
    pub fn matches(&self, request: &str) -> bool {
        let parts: Vec<&str> = request.split('/').collect();
        match parts.as_slice() {
            [t] => *t == self.device_type,
            [v, t] => *v == self.vendor && *t == self.device_type,
            [v, t, n] => *v == self.vendor && *t == self.device_type && *n == self.name,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInstance {
    pub id: String,
    pub healthy: bool,
}

/// Total schedulable resources of a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeResources {
    pub cpu_shares: u64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub networks: Vec<NodeNetwork>,
    pub devices: Vec<NodeDevice>,
    pub min_dynamic_port: u16,
    pub max_dynamic_port: u16,
    /// Ports held by the host itself, never handed out.
    pub reserved_ports: Vec<u16>,
}

impl Default for NodeResources {
    fn default() -> Self {
        Self {
            cpu_shares: 0,
            memory_bytes: 0,
            disk_bytes: 0,
            networks: Vec::new(),
            devices: Vec::new(),
            min_dynamic_port: 20000,
            max_dynamic_port: 32000,
            reserved_ports: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct HostVolume {
    pub path: String,
    pub read_only: bool,
}

/// A CSI node plugin fingerprinted on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CsiNodePlugin {
    pub healthy: bool,
    /// Maximum volumes the plugin can mount on this node (0 = unlimited).
    #[serde(default)]
    pub max_volumes: u32,
}

/// A worker node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub datacenter: String,
    pub node_class: String,
    pub status: NodeStatus,
    pub scheduling_eligibility: SchedulingEligibility,
    pub drain: Option<DrainStrategy>,
    pub attributes: BTreeMap<String, String>,
    pub meta: BTreeMap<String, String>,
    pub drivers: BTreeMap<String, DriverInfo>,
    pub resources: NodeResources,
    /// Held back for the host operating system and agent.
    pub reserved: ComparableResources,
    pub host_volumes: BTreeMap<String, HostVolume>,
    pub csi_plugins: BTreeMap<String, CsiNodePlugin>,
    /// Hash of all scheduling-relevant, non-unique properties.
    pub computed_class: String,
    pub create_index: u64,
    pub modify_index: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub status_updated_at: u64,
}

impl Node {
    /// Ready for new placements.
    pub fn ready(&self) -> bool {
        self.status == NodeStatus::Ready
            && self.scheduling_eligibility == SchedulingEligibility::Eligible
            && self.drain.is_none()
    }

    pub fn draining(&self) -> bool {
        self.drain.is_some()
    }

    /// Allocations on a down or disconnected node are lost.
    pub fn terminal_status(&self) -> bool {
        matches!(self.status, NodeStatus::Down | NodeStatus::Disconnected)
    }

    /// Countable capacity available to allocations (total minus reserved).
    pub fn comparable_capacity(&self) -> ComparableResources {
        let total = ComparableResources {
            cpu_shares: self.resources.cpu_shares,
            memory_bytes: self.resources.memory_bytes,
            disk_bytes: self.resources.disk_bytes,
            bandwidth_mbits: self.resources.networks.iter().map(|n| n.mbits).sum(),
        };
        total.saturating_sub(&self.reserved)
    }

    /// Recompute `computed_class` from the node's scheduling-relevant
    /// properties. Keys under `unique.` are excluded so that otherwise
    /// identical nodes share a class.
    pub fn compute_class(&mut self) {
        let mut hasher = Sha256::new();
        hasher.update(self.datacenter.as_bytes());
        hasher.update([0]);
        hasher.update(self.node_class.as_bytes());
        hasher.update([0]);
        for (scope, map) in [("attr", &self.attributes), ("meta", &self.meta)] {
            for (k, v) in map.iter().filter(|(k, _)| !k.starts_with("unique.")) {
                hasher.update(scope.as_bytes());
                hasher.update(k.as_bytes());
                hasher.update([b'=']);
                hasher.update(v.as_bytes());
                hasher.update([0]);
            }
        }
        for (driver, info) in &self.drivers {
            hasher.update(driver.as_bytes());
            hasher.update([u8::from(info.detected && info.healthy)]);
        }
        let digest = hasher.finalize();
        self.computed_class = format!("v1:{}", hex::encode(&digest[..8]));
    }
}

// ── CSI volumes ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CsiAccessMode {
    SingleNodeReader,
    #[default]
    SingleNodeWriter,
    MultiNodeReader,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

/// A registered CSI volume and its current claims.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CsiVolume {
    pub id: String,
    pub namespace: String,
    pub plugin_id: String,
    pub access_mode: CsiAccessMode,
    pub schedulable: bool,
    pub read_claims: BTreeSet<AllocId>,
    pub write_claims: BTreeSet<AllocId>,
    pub modify_index: u64,
}

impl CsiVolume {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.id)
    }

    pub fn can_read(&self) -> bool {
        if !self.schedulable {
            return false;
        }
        match self.access_mode {
            CsiAccessMode::SingleNodeReader | CsiAccessMode::SingleNodeWriter => {
                self.read_claims.is_empty() && self.write_claims.is_empty()
            }
            _ => true,
        }
    }

    pub fn can_write(&self) -> bool {
        if !self.schedulable {
            return false;
        }
        match self.access_mode {
            CsiAccessMode::SingleNodeWriter => {
                self.read_claims.is_empty() && self.write_claims.is_empty()
            }
            CsiAccessMode::MultiNodeSingleWriter => self.write_claims.is_empty(),
            CsiAccessMode::MultiNodeMultiWriter => true,
            CsiAccessMode::SingleNodeReader | CsiAccessMode::MultiNodeReader => false,
        }
    }

    /// Drop any claim held by `alloc_id`. Returns true if one existed.
    pub fn release(&mut self, alloc_id: &str) -> bool {
        let r = self.read_claims.remove(alloc_id);
        let w = self.write_claims.remove(alloc_id);
        r || w
    }
}

// ── Allocation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocDesiredStatus {
    #[default]
    Run,
    Stop,
    Evict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocClientStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

impl AllocClientStatus {
    pub fn terminal(&self) -> bool {
        matches!(
            self,
            AllocClientStatus::Complete | AllocClientStatus::Failed | AllocClientStatus::Lost
        )
    }
}

/// Specific device instances handed to a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocatedDevice {
    pub vendor: String,
    pub device_type: String,
    pub name: String,
    pub device_ids: Vec<String>,
}

/// A concrete port reservation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocatedPort {
    pub label: String,
    pub value: u16,
}

/// Bandwidth and ports reserved on a host network device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AllocatedNetwork {
    pub device: String,
    pub ip: String,
    pub mbits: u64,
    pub ports: Vec<AllocatedPort>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AllocatedTaskResources {
    pub cpu_shares: u64,
    pub memory_bytes: u64,
    pub devices: Vec<AllocatedDevice>,
}

/// Everything reserved on a node for one allocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AllocatedResources {
    pub tasks: BTreeMap<String, AllocatedTaskResources>,
    pub disk_bytes: u64,
    pub networks: Vec<AllocatedNetwork>,
}

impl AllocatedResources {
    pub fn comparable(&self) -> ComparableResources {
        let mut out = ComparableResources::new(0, 0, self.disk_bytes);
        for task in self.tasks.values() {
            out.cpu_shares += task.cpu_shares;
            out.memory_bytes += task.memory_bytes;
        }
        out.bandwidth_mbits = self.networks.iter().map(|n| n.mbits).sum();
        out
    }

    pub fn devices(&self) -> impl Iterator<Item = &AllocatedDevice> {
        self.tasks.values().flat_map(|t| t.devices.iter())
    }
}

/// One task group instance bound to one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Allocation {
    pub id: AllocId,
    /// `<job>.<group>[<index>]`
    pub name: String,
    pub namespace: String,
    pub eval_id: EvalId,
    pub node_id: NodeId,
    pub job_id: JobId,
    pub job_version: u64,
    /// Priority of the job version that created this allocation.
    pub job_priority: i32,
    pub job_type: JobType,
    pub task_group: String,
    pub resources: AllocatedResources,
    pub desired_status: AllocDesiredStatus,
    pub desired_description: String,
    pub client_status: AllocClientStatus,
    pub client_description: String,
    pub previous_allocation: Option<AllocId>,
    pub next_allocation: Option<AllocId>,
    pub reschedule_tracker: Vec<RescheduleEvent>,
    pub preempted_by_allocation: Option<AllocId>,
    pub preempted_allocations: Vec<AllocId>,
    /// Delayed evaluation that will reschedule this allocation.
    pub followup_eval_id: Option<EvalId>,
    pub create_index: u64,
    pub modify_index: u64,
    /// Unix timestamp (seconds).
    pub create_time: u64,
    /// Unix timestamp (seconds).
    pub modify_time: u64,
}

impl Allocation {
    pub fn job_key(&self) -> JobKey {
        JobKey::new(&self.namespace, &self.job_id)
    }

    /// Stopped by the server or finished on the client.
    pub fn terminal_status(&self) -> bool {
        self.server_terminal_status() || self.client_terminal_status()
    }

    pub fn server_terminal_status(&self) -> bool {
        matches!(
            self.desired_status,
            AllocDesiredStatus::Stop | AllocDesiredStatus::Evict
        )
    }

    pub fn client_terminal_status(&self) -> bool {
        self.client_status.terminal()
    }

    /// Instance index parsed from the name, if well-formed.
    pub fn index(&self) -> Option<u32> {
        let open = self.name.rfind('[')?;
        let close = self.name.rfind(']')?;
        self.name.get(open + 1..close)?.parse().ok()
    }

    pub fn comparable_resources(&self) -> ComparableResources {
        self.resources.comparable()
    }

    /// When the next reschedule attempt may run under `policy`, or `None`
    /// if the lineage exhausted its attempts. `now` is in unix seconds.
    pub fn next_reschedule_time(&self, policy: &ReschedulePolicy, now: u64) -> Option<u64> {
        if !policy.enabled() || self.client_status != AllocClientStatus::Failed {
            return None;
        }
        if !policy.unlimited {
            let window_start = now.saturating_sub(policy.interval_secs);
            let recent = self
                .reschedule_tracker
                .iter()
                .filter(|e| e.reschedule_time > window_start)
                .count() as u32;
            if recent >= policy.attempts {
                return None;
            }
        }
        let failed_at = self.modify_time.max(self.create_time);
        Some(failed_at + policy.next_delay(&self.reschedule_tracker))
    }
}

pub fn alloc_name(job_id: &str, group: &str, index: u32) -> String {
    format!("{job_id}.{group}[{index}]")
}

// ── Evaluation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    #[default]
    Pending,
    Blocked,
    Complete,
    Failed,
    Canceled,
}

impl EvalStatus {
    pub fn terminal(&self) -> bool {
        matches!(
            self,
            EvalStatus::Complete | EvalStatus::Failed | EvalStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvalStatus::Pending => "pending",
            EvalStatus::Blocked => "blocked",
            EvalStatus::Complete => "complete",
            EvalStatus::Failed => "failed",
            EvalStatus::Canceled => "canceled",
        }
    }
}

/// What caused an evaluation to be created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerBy {
    #[default]
    JobRegister,
    JobDeregister,
    NodeUpdate,
    NodeDrain,
    AllocStop,
    AllocFailure,
    FailedFollowUp,
    QueuedAllocs,
    Preemption,
    MaxPlanAttempts,
    RetryFailedAlloc,
}

/// Why a task group could not be (fully) placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementFailure {
    /// Some nodes could host the group but lack free capacity right now.
    InsufficientCapacity,
    /// No node in the cluster can ever satisfy the group's filters.
    ConstraintUnsatisfiable,
}

/// Placement metrics for one task group within one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AllocMetric {
    pub nodes_evaluated: u32,
    pub nodes_filtered: u32,
    pub nodes_exhausted: u32,
    /// Ready nodes per datacenter.
    pub nodes_available: BTreeMap<String, u32>,
    pub class_filtered: BTreeMap<String, u32>,
    pub constraint_filtered: BTreeMap<String, u32>,
    pub class_exhausted: BTreeMap<String, u32>,
    pub dimension_exhausted: BTreeMap<String, u32>,
    /// Reason each rejected node was rejected.
    pub node_reasons: BTreeMap<NodeId, String>,
    /// Final normalized score of each scored node.
    pub scores: BTreeMap<NodeId, f64>,
    /// Additional identical failures folded into this record.
    pub coalesced_failures: u32,
    pub failure: Option<PlacementFailure>,
}

impl AllocMetric {
    pub fn filter_node(&mut self, node: &Node, reason: &str) {
        self.nodes_filtered += 1;
        if !node.node_class.is_empty() {
            *self.class_filtered.entry(node.node_class.clone()).or_default() += 1;
        }
        *self.constraint_filtered.entry(reason.to_string()).or_default() += 1;
        self.node_reasons.insert(node.id.clone(), reason.to_string());
    }

    pub fn exhausted_node(&mut self, node: &Node, dimension: &str) {
        self.nodes_exhausted += 1;
        if !node.node_class.is_empty() {
            *self.class_exhausted.entry(node.node_class.clone()).or_default() += 1;
        }
        *self.dimension_exhausted.entry(dimension.to_string()).or_default() += 1;
        self.node_reasons
            .insert(node.id.clone(), format!("resources exhausted: {dimension}"));
    }

    /// Classify the failure: transient shortage if any node was merely
    /// exhausted, structural otherwise.
    pub fn classify_failure(&mut self) {
        self.failure = Some(if self.nodes_exhausted > 0 {
            PlacementFailure::InsufficientCapacity
        } else {
            PlacementFailure::ConstraintUnsatisfiable
        });
    }
}

/// One unit of scheduling work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Evaluation {
    pub id: EvalId,
    pub namespace: String,
    pub priority: i32,
    pub job_type: JobType,
    pub triggered_by: TriggerBy,
    pub job_id: JobId,
    pub job_modify_index: u64,
    pub node_id: Option<NodeId>,
    pub status: EvalStatus,
    pub status_description: String,
    /// Unix timestamp (millis) before which the evaluation must not run.
    pub wait_until: Option<u64>,
    pub previous_eval: Option<EvalId>,
    pub next_eval: Option<EvalId>,
    pub blocked_eval: Option<EvalId>,
    pub failed_tg_allocs: BTreeMap<String, AllocMetric>,
    /// Node classes known to be eligible (true) or ineligible (false).
    pub class_eligibility: BTreeMap<String, bool>,
    /// Constraints reference node-unique values; class eligibility is moot.
    pub escaped_computed_class: bool,
    pub queued_allocations: BTreeMap<String, u32>,
    pub snapshot_index: u64,
    pub create_index: u64,
    pub modify_index: u64,
    /// Unix timestamp (millis).
    pub create_time: u64,
}

impl Evaluation {
    /// A fresh pending evaluation for `job`.
    pub fn for_job(job: &Job, triggered_by: TriggerBy) -> Self {
        Self {
            id: generate_uuid(),
            namespace: job.namespace.clone(),
            priority: job.priority,
            job_type: job.job_type,
            triggered_by,
            job_id: job.id.clone(),
            job_modify_index: job.job_modify_index,
            status: EvalStatus::Pending,
            create_time: epoch_millis(),
            ..Default::default()
        }
    }

    pub fn job_key(&self) -> JobKey {
        JobKey::new(&self.namespace, &self.job_id)
    }

    pub fn terminal_status(&self) -> bool {
        self.status.terminal()
    }

    /// A blocked follow-up linked to this evaluation.
    pub fn create_blocked_eval(
        &self,
        class_eligibility: BTreeMap<String, bool>,
        escaped_computed_class: bool,
        queued_allocations: BTreeMap<String, u32>,
        failed_tg_allocs: BTreeMap<String, AllocMetric>,
    ) -> Evaluation {
        Evaluation {
            id: generate_uuid(),
            namespace: self.namespace.clone(),
            priority: self.priority,
            job_type: self.job_type,
            triggered_by: TriggerBy::QueuedAllocs,
            job_id: self.job_id.clone(),
            job_modify_index: self.job_modify_index,
            status: EvalStatus::Blocked,
            status_description: "created to place remaining allocations".to_string(),
            previous_eval: Some(self.id.clone()),
            class_eligibility,
            escaped_computed_class,
            queued_allocations,
            failed_tg_allocs,
            create_time: epoch_millis(),
            ..Default::default()
        }
    }

    /// A delayed follow-up linked to this evaluation.
    pub fn create_followup_eval(&self, triggered_by: TriggerBy, wait_until_millis: u64) -> Evaluation {
        Evaluation {
            id: generate_uuid(),
            namespace: self.namespace.clone(),
            priority: self.priority,
            job_type: self.job_type,
            triggered_by,
            job_id: self.job_id.clone(),
            job_modify_index: self.job_modify_index,
            status: EvalStatus::Pending,
            wait_until: Some(wait_until_millis),
            previous_eval: Some(self.id.clone()),
            create_time: epoch_millis(),
            ..Default::default()
        }
    }
}

// ── Plan ───────────────────────────────────────────────────────────

/// Placements, stops and preemptions proposed by one scheduling pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Plan {
    pub eval_id: EvalId,
    /// Broker delivery token; the plan is void once the token is stale.
    pub eval_token: String,
    /// Job epoch observed at dequeue; bumped when the job is superseded.
    pub job_epoch: u64,
    pub priority: i32,
    pub job: Option<Job>,
    /// Allocations to stop, by node.
    pub node_update: BTreeMap<NodeId, Vec<Allocation>>,
    /// Allocations to place, by node.
    pub node_allocation: BTreeMap<NodeId, Vec<Allocation>>,
    /// Lower-priority allocations evicted to make room, by node.
    pub node_preemptions: BTreeMap<NodeId, Vec<Allocation>>,
    /// State index the plan was computed against.
    pub snapshot_index: u64,
    pub all_at_once: bool,
}

impl Plan {
    pub fn new(eval: &Evaluation, eval_token: &str, job_epoch: u64, job: Option<Job>) -> Self {
        Self {
            eval_id: eval.id.clone(),
            eval_token: eval_token.to_string(),
            job_epoch,
            priority: eval.priority,
            all_at_once: job.as_ref().is_some_and(|j| j.all_at_once),
            job,
            ..Default::default()
        }
    }

    /// Record a stop for `alloc`. An optional client status marks the
    /// allocation lost/failed at the same time.
    pub fn append_stopped_alloc(
        &mut self,
        alloc: &Allocation,
        description: &str,
        client_status: Option<AllocClientStatus>,
    ) {
        let mut stopped = alloc.clone();
        stopped.desired_status = AllocDesiredStatus::Stop;
        stopped.desired_description = description.to_string();
        if let Some(status) = client_status {
            stopped.client_status = status;
        }
        self.node_update
            .entry(alloc.node_id.clone())
            .or_default()
            .push(stopped);
    }

    /// Record an eviction of `alloc` in favour of `preempting_alloc_id`.
    pub fn append_preempted_alloc(&mut self, alloc: &Allocation, preempting_alloc_id: &str) {
        let mut evicted = alloc.clone();
        evicted.desired_status = AllocDesiredStatus::Evict;
        evicted.desired_description = format!("preempted by alloc {preempting_alloc_id}");
        evicted.preempted_by_allocation = Some(preempting_alloc_id.to_string());
        self.node_preemptions
            .entry(alloc.node_id.clone())
            .or_default()
            .push(evicted);
    }

    pub fn append_alloc(&mut self, alloc: Allocation) {
        self.node_allocation
            .entry(alloc.node_id.clone())
            .or_default()
            .push(alloc);
    }

    /// Remove a previously appended stop (used when a stop turns out to be
    /// an in-place update instead).
    pub fn pop_update(&mut self, alloc: &Allocation) {
        if let Some(list) = self.node_update.get_mut(&alloc.node_id) {
            list.retain(|a| a.id != alloc.id);
            if list.is_empty() {
                self.node_update.remove(&alloc.node_id);
            }
        }
    }

    pub fn is_no_op(&self) -> bool {
        self.node_update.is_empty()
            && self.node_allocation.is_empty()
            && self.node_preemptions.is_empty()
    }

    /// Every node touched by this plan.
    pub fn node_ids(&self) -> BTreeSet<NodeId> {
        self.node_update
            .keys()
            .chain(self.node_allocation.keys())
            .chain(self.node_preemptions.keys())
            .cloned()
            .collect()
    }

    pub fn placement_count(&self) -> usize {
        self.node_allocation.values().map(Vec::len).sum()
    }
}

/// What the store actually committed for a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PlanResult {
    pub node_update: BTreeMap<NodeId, Vec<Allocation>>,
    pub node_allocation: BTreeMap<NodeId, Vec<Allocation>>,
    pub node_preemptions: BTreeMap<NodeId, Vec<Allocation>>,
    /// Nodes whose portion of the plan was rejected.
    pub rejected_nodes: Vec<NodeId>,
    /// Index the scheduler must refresh to before re-planning; zero on a
    /// full commit.
    pub refresh_index: u64,
    /// Index at which the accepted portion was committed.
    pub alloc_index: u64,
}

impl PlanResult {
    pub fn is_no_op(&self) -> bool {
        self.node_update.is_empty()
            && self.node_allocation.is_empty()
            && self.node_preemptions.is_empty()
    }

    /// Whether every placement and stop of `plan` was committed. Returns
    /// `(full, expected, actual)` counts.
    pub fn full_commit(&self, plan: &Plan) -> (bool, usize, usize) {
        let count = |m: &BTreeMap<NodeId, Vec<Allocation>>| m.values().map(Vec::len).sum::<usize>();
        let expected = count(&plan.node_allocation) + count(&plan.node_update) + count(&plan.node_preemptions);
        let actual = count(&self.node_allocation) + count(&self.node_update) + count(&self.node_preemptions);
        (expected == actual, expected, actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(name: &str) -> Allocation {
        Allocation {
            id: generate_uuid(),
            name: name.to_string(),
            node_id: "node-1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn alloc_index_parses_name() {
        assert_eq!(alloc("web.frontend[3]").index(), Some(3));
        assert_eq!(alloc("broken").index(), None);
        assert_eq!(alloc_name("web", "frontend", 7), "web.frontend[7]");
    }

    #[test]
    fn terminal_status_covers_server_and_client() {
        let mut a = alloc("web.frontend[0]");
        assert!(!a.terminal_status());
        a.desired_status = AllocDesiredStatus::Evict;
        assert!(a.terminal_status());
        a.desired_status = AllocDesiredStatus::Run;
        a.client_status = AllocClientStatus::Lost;
        assert!(a.terminal_status());
    }

    #[test]
    fn operand_accepts_aliases() {
        let c: Constraint =
            serde_json::from_str(r#"{"l_target":"${attr.os}","operand":"==","r_target":"linux"}"#)
                .unwrap();
        assert_eq!(c.operand, Operand::Equal);
        let c: Constraint = serde_json::from_str(r#"{"operand":"distinct_hosts"}"#).unwrap();
        assert_eq!(c, Constraint::distinct_hosts());
    }

    #[test]
    fn computed_class_ignores_unique_attributes() {
        let mut a = Node {
            id: "a".to_string(),
            datacenter: "dc1".to_string(),
            ..Default::default()
        };
        a.attributes.insert("unique.hostname".to_string(), "a".to_string());
        a.attributes.insert("kernel.name".to_string(), "linux".to_string());
        let mut b = a.clone();
        b.id = "b".to_string();
        b.attributes.insert("unique.hostname".to_string(), "b".to_string());

        a.compute_class();
        b.compute_class();
        assert_eq!(a.computed_class, b.computed_class);

        b.node_class = "gpu".to_string();
        b.compute_class();
        assert_ne!(a.computed_class, b.computed_class);
    }

    #[test]
    fn device_name_matching() {
        let dev = NodeDevice {
            vendor: "nvidia".to_string(),
            device_type: "gpu".to_string(),
            name: "a100".to_string(),
            ..Default::default()
        };
        assert!(dev.matches("gpu"));
        assert!(dev.matches("nvidia/gpu"));
        assert!(dev.matches("nvidia/gpu/a100"));
        assert!(!dev.matches("amd/gpu"));
        assert!(!dev.matches("fpga"));
    }

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let policy = ReschedulePolicy {
            delay_secs: 10,
            delay_function: DelayFunction::Exponential,
            max_delay_secs: 30,
            unlimited: true,
            ..Default::default()
        };
        let ev = |d| RescheduleEvent {
            reschedule_time: 0,
            prev_alloc_id: String::new(),
            prev_node_id: String::new(),
            delay_secs: d,
        };
        assert_eq!(policy.next_delay(&[]), 10);
        assert_eq!(policy.next_delay(&[ev(10)]), 20);
        assert_eq!(policy.next_delay(&[ev(10), ev(20)]), 30);
    }

    #[test]
    fn limited_policy_exhausts_attempts() {
        let policy = ReschedulePolicy::default_for(JobType::Batch);
        let mut a = alloc("batch.work[0]");
        a.client_status = AllocClientStatus::Failed;
        a.modify_time = 1_000;
        assert_eq!(a.next_reschedule_time(&policy, 1_000), Some(1_005));

        a.reschedule_tracker.push(RescheduleEvent {
            reschedule_time: 990,
            prev_alloc_id: "x".to_string(),
            prev_node_id: "n".to_string(),
            delay_secs: 5,
        });
        assert_eq!(a.next_reschedule_time(&policy, 1_000), None);
    }

    #[test]
    fn plan_pop_update_removes_empty_node_entry() {
        let a = alloc("web.frontend[0]");
        let eval = Evaluation::default();
        let mut plan = Plan::new(&eval, "token", 0, None);
        plan.append_stopped_alloc(&a, "test", None);
        assert!(!plan.is_no_op());
        plan.pop_update(&a);
        assert!(plan.is_no_op());
    }

    #[test]
    fn csi_single_writer_claims() {
        let mut vol = CsiVolume {
            id: "db".to_string(),
            schedulable: true,
            access_mode: CsiAccessMode::SingleNodeWriter,
            ..Default::default()
        };
        assert!(vol.can_write());
        vol.write_claims.insert("a1".to_string());
        assert!(!vol.can_write());
        assert!(!vol.can_read());
        assert!(vol.release("a1"));
        assert!(vol.can_write());
    }
}
