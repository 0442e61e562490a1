//! Feasibility filters.
//!
//! A node is checked in a fixed order and rejected at the first failure:
//!
//! 1. node status (ready, eligible, not draining)
//! 2. drivers of every task detected and healthy
//! 3. job, group and task constraints (`distinct_*` last)
//! 4. volumes: host volumes present, CSI plugins healthy, claims available
//!
//! Resource, device and port capacity is checked afterwards by
//! [`crate::fit`]. Checks 2 and 3 (minus `distinct_*`) depend only on
//! properties folded into the node's computed class, so their outcome is
//! cached per class unless the job's constraints escape it.

use std::cmp::Ordering;

use corral_core::{
    Constraint, CsiAccessMode, Dimension, InsufficientCapacity, Job, Node, Operand, TaskGroup,
};

use crate::context::EvalContext;

/// Why a node was rejected before capacity checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Structurally unable to host the group.
    Filtered(String),
    /// Could host the group if capacity were freed.
    Exhausted(Dimension),
}

impl From<InsufficientCapacity> for Rejection {
    fn from(e: InsufficientCapacity) -> Self {
        Rejection::Exhausted(e.dimension)
    }
}

/// Run filters 1–4 for one node.
pub fn check_node(ctx: &mut EvalContext, job: &Job, tg: &TaskGroup, node: &Node) -> Result<(), Rejection> {
    if !node.ready() {
        return Err(Rejection::Filtered(status_reason(node)));
    }

    match ctx.eligibility().task_group_status(&tg.name, &node.computed_class) {
        Some(false) => {
            return Err(Rejection::Filtered("computed class ineligible".to_string()));
        }
        Some(true) => {}
        None => {
            let result = check_class_properties(ctx, job, tg, node);
            ctx.eligibility_mut()
                .set_task_group(&tg.name, &node.computed_class, result.is_ok());
            result.map_err(Rejection::Filtered)?;
        }
    }

    check_distinct(ctx, job, tg, node).map_err(Rejection::Filtered)?;
    check_volumes(ctx, job, tg, node)
}

fn status_reason(node: &Node) -> String {
    if node.draining() {
        "node is draining".to_string()
    } else if node.scheduling_eligibility != corral_core::SchedulingEligibility::Eligible {
        "node is ineligible".to_string()
    } else {
        format!("node is {}", node.status.as_str())
    }
}

/// Drivers plus every non-`distinct_*` constraint.
fn check_class_properties(ctx: &mut EvalContext, job: &Job, tg: &TaskGroup, node: &Node) -> Result<(), String> {
    for task in &tg.tasks {
        match node.drivers.get(&task.driver) {
            Some(info) if info.detected && info.healthy => {}
            _ => return Err(format!("missing driver: {}", task.driver)),
        }
    }

    let constraints = job
        .constraints
        .iter()
        .chain(tg.constraints.iter())
        .chain(tg.tasks.iter().flat_map(|t| t.constraints.iter()));
    for constraint in constraints {
        if matches!(constraint.operand, Operand::DistinctHosts | Operand::DistinctProperty) {
            continue;
        }
        if !meets_constraint(ctx, constraint, node) {
            return Err(constraint.to_string());
        }
    }
    Ok(())
}

/// Evaluate one non-`distinct_*` constraint against a node.
pub fn meets_constraint(ctx: &mut EvalContext, constraint: &Constraint, node: &Node) -> bool {
    let l = resolve_target(&constraint.l_target, node);
    let r = resolve_target(&constraint.r_target, node);
    check_operand(ctx, constraint.operand, l.as_deref(), r.as_deref())
}

/// Interpolate `${...}` targets against node properties. Plain strings are
/// literals; unknown interpolations resolve to nothing.
pub fn resolve_target(target: &str, node: &Node) -> Option<String> {
    let Some(inner) = target.strip_prefix("${").and_then(|t| t.strip_suffix('}')) else {
        return Some(target.to_string());
    };
    match inner {
        "node.unique.id" => Some(node.id.clone()),
        "node.unique.name" => Some(node.name.clone()),
        "node.datacenter" => Some(node.datacenter.clone()),
        "node.class" => Some(node.node_class.clone()),
        _ => {
            if let Some(key) = inner.strip_prefix("attr.") {
                node.attributes.get(key).cloned()
            } else if let Some(key) = inner.strip_prefix("meta.") {
                node.meta.get(key).cloned()
            } else {
                None
            }
        }
    }
}

pub fn check_operand(ctx: &mut EvalContext, operand: Operand, l: Option<&str>, r: Option<&str>) -> bool {
    match operand {
        Operand::Equal => l.is_some() && l == r,
        Operand::NotEqual => l != r,
        Operand::Less | Operand::LessEqual | Operand::Greater | Operand::GreaterEqual => {
            let (Some(l), Some(r)) = (l, r) else {
                return false;
            };
            let ord = compare_lexical_or_numeric(l, r);
            match operand {
                Operand::Less => ord == Ordering::Less,
                Operand::LessEqual => ord != Ordering::Greater,
                Operand::Greater => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }
        }
        Operand::Regexp => match (l, r) {
            (Some(l), Some(r)) => ctx.regex(r).is_some_and(|re| re.is_match(l)),
            _ => false,
        },
        Operand::Version => match (l, r) {
            (Some(l), Some(r)) => check_version(l, r, false),
            _ => false,
        },
        Operand::Semver => match (l, r) {
            (Some(l), Some(r)) => check_version(l, r, true),
            _ => false,
        },
        Operand::SetContains => match (l, r) {
            (Some(l), Some(r)) => {
                let have = split_set(l);
                split_set(r).iter().all(|item| have.contains(item))
            }
            _ => false,
        },
        Operand::SetContainsAny => match (l, r) {
            (Some(l), Some(r)) => {
                let have = split_set(l);
                split_set(r).iter().any(|item| have.contains(item))
            }
            _ => false,
        },
        Operand::IsSet => l.is_some(),
        Operand::IsNotSet => l.is_none(),
        Operand::DistinctHosts | Operand::DistinctProperty => true,
    }
}

fn compare_lexical_or_numeric(l: &str, r: &str) -> Ordering {
    match (l.parse::<f64>(), r.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => l.cmp(r),
    }
}

fn split_set(s: &str) -> Vec<&str> {
    s.split(',').map(str::trim).filter(|x| !x.is_empty()).collect()
}

/// `version` accepts partial versions (`1.2`), a leading `v` and ignores
/// pre-release tags on the node side; `semver` requires strict versions.
fn check_version(value: &str, requirement: &str, strict: bool) -> bool {
    let Ok(req) = semver::VersionReq::parse(requirement) else {
        return false;
    };
    let version = if strict {
        semver::Version::parse(value).ok()
    } else {
        lenient_version(value)
    };
    version.is_some_and(|v| req.matches(&v))
}

fn lenient_version(value: &str) -> Option<semver::Version> {
    let trimmed = value.trim().trim_start_matches('v');
    let core = trimmed.split(['-', '+']).next()?;
    let parts: Vec<u64> = core
        .split('.')
        .map(|p| p.parse().ok())
        .collect::<Option<_>>()?;
    match parts.as_slice() {
        [major] => Some(semver::Version::new(*major, 0, 0)),
        [major, minor] => Some(semver::Version::new(*major, *minor, 0)),
        [major, minor, patch] => Some(semver::Version::new(*major, *minor, *patch)),
        _ => None,
    }
}

/// `distinct_hosts` and `distinct_property`, checked against the proposed
/// allocations of the job.
fn check_distinct(ctx: &EvalContext, job: &Job, tg: &TaskGroup, node: &Node) -> Result<(), String> {
    let job_level = job.constraints.iter().map(|c| (c, false));
    let group_level = tg
        .constraints
        .iter()
        .chain(tg.tasks.iter().flat_map(|t| t.constraints.iter()))
        .map(|c| (c, true));

    let mut job_allocs = None;
    for (constraint, group_scoped) in job_level.chain(group_level) {
        if !matches!(constraint.operand, Operand::DistinctHosts | Operand::DistinctProperty) {
            continue;
        }
        let allocs = job_allocs.get_or_insert_with(|| ctx.proposed_job_allocs(&job.key()));
        let relevant = allocs
            .iter()
            .filter(|a| !group_scoped || a.task_group == tg.name);

        match constraint.operand {
            Operand::DistinctHosts => {
                if relevant.clone().any(|a| a.node_id == node.id) {
                    return Err("distinct_hosts".to_string());
                }
            }
            _ => {
                let Some(value) = resolve_target(&constraint.l_target, node) else {
                    return Err(format!("distinct_property: {} missing", constraint.l_target));
                };
                let limit = constraint.r_target.parse::<usize>().unwrap_or(1).max(1);
                let used = relevant
                    .filter(|a| {
                        ctx.snapshot()
                            .node(&a.node_id)
                            .and_then(|n| resolve_target(&constraint.l_target, n))
                            .is_some_and(|v| v == value)
                    })
                    .count();
                if used >= limit {
                    return Err(format!("distinct_property: {}={} used by {}", constraint.l_target, value, used));
                }
            }
        }
    }
    Ok(())
}

/// Host volumes and CSI volumes requested by the group.
fn check_volumes(ctx: &EvalContext, job: &Job, tg: &TaskGroup, node: &Node) -> Result<(), Rejection> {
    for req in tg.volumes.values() {
        match req.kind {
            corral_core::VolumeKind::Host => match node.host_volumes.get(&req.source) {
                None => return Err(Rejection::Filtered(format!("missing host volume: {}", req.source))),
                Some(vol) if vol.read_only && !req.read_only => {
                    return Err(Rejection::Filtered(format!("host volume {} is read-only", req.source)));
                }
                Some(_) => {}
            },
            corral_core::VolumeKind::Csi => {
                let Some(vol) = ctx.snapshot().csi_volume(&job.namespace, &req.source) else {
                    return Err(Rejection::Filtered(format!("unknown CSI volume: {}", req.source)));
                };
                match node.csi_plugins.get(&vol.plugin_id) {
                    Some(plugin) if plugin.healthy => {
                        if plugin.max_volumes > 0 {
                            let mounted = csi_volumes_on_node(ctx, &vol.plugin_id, &node.id);
                            if mounted >= plugin.max_volumes as usize {
                                return Err(Rejection::Exhausted(Dimension::Volumes));
                            }
                        }
                    }
                    _ => {
                        return Err(Rejection::Filtered(format!("CSI plugin {} unavailable", vol.plugin_id)));
                    }
                }

                let mut claimed = vol.clone();
                let (reads, writes) = ctx.plan_csi_claims(job, &req.source);
                for i in 0..reads {
                    claimed.read_claims.insert(format!("plan-read-{i}"));
                }
                for i in 0..writes {
                    claimed.write_claims.insert(format!("plan-write-{i}"));
                }
                let available = if req.read_only {
                    claimed.can_read()
                } else {
                    claimed.can_write()
                };
                if !available {
                    // Reader-only volumes can never be written.
                    if !req.read_only
                        && matches!(
                            vol.access_mode,
                            CsiAccessMode::SingleNodeReader | CsiAccessMode::MultiNodeReader
                        )
                    {
                        return Err(Rejection::Filtered(format!("CSI volume {} is read-only", req.source)));
                    }
                    return Err(Rejection::Exhausted(Dimension::Volumes));
                }
            }
        }
    }
    Ok(())
}

/// Distinct CSI volumes of `plugin_id` claimed by allocations on the node.
fn csi_volumes_on_node(ctx: &EvalContext, plugin_id: &str, node_id: &str) -> usize {
    let on_node: std::collections::BTreeSet<&str> = ctx
        .proposed_allocs(node_id)
        .into_iter()
        .map(|a| a.id.as_str())
        .collect();
    ctx.snapshot()
        .jobs()
        .flat_map(|j| j.task_groups.iter().flat_map(move |tg| tg.csi_volumes().map(move |v| (j, v))))
        .filter_map(|(j, v)| ctx.snapshot().csi_volume(&j.namespace, &v.source))
        .filter(|vol| vol.plugin_id == plugin_id)
        .map(|vol| (vol.table_key(), vol))
        .collect::<std::collections::BTreeMap<_, _>>()
        .values()
        .filter(|vol| {
            vol.read_claims
                .iter()
                .chain(vol.write_claims.iter())
                .any(|id| on_node.contains(id.as_str()))
        })
        .count()
}
