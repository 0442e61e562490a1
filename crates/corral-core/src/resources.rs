//! Resource model: Capacity and consumption arithmetic.
//!
//! `ComparableResources` flattens the countable dimensions (CPU, memory,
//! disk, bandwidth) into one value that can be added, subtracted and
//! compared. Discrete units (ports, device instances) are tracked by
//! [`crate::network::NetworkIndex`] and [`crate::devices::DeviceAccounter`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A resource dimension that can run out on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Cpu,
    Memory,
    Disk,
    Bandwidth,
    Ports,
    Devices,
    Volumes,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Cpu => "cpu",
            Dimension::Memory => "memory",
            Dimension::Disk => "disk",
            Dimension::Bandwidth => "network: bandwidth exceeded",
            Dimension::Ports => "network: port collision",
            Dimension::Devices => "devices",
            Dimension::Volumes => "volumes: claims exhausted",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when an ask does not fit. Callers treat this as a
/// feasibility signal, not as a hard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("insufficient capacity: {dimension} exhausted")]
pub struct InsufficientCapacity {
    pub dimension: Dimension,
}

impl InsufficientCapacity {
    pub fn new(dimension: Dimension) -> Self {
        Self { dimension }
    }
}

/// Flattened, countable resources of a node or an allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparableResources {
    /// CPU in shares (MHz-equivalent).
    pub cpu_shares: u64,
    /// Memory in bytes.
    pub memory_bytes: u64,
    /// Disk in bytes.
    pub disk_bytes: u64,
    /// Network bandwidth in Mbit/s.
    pub bandwidth_mbits: u64,
}

impl ComparableResources {
    pub fn new(cpu_shares: u64, memory_bytes: u64, disk_bytes: u64) -> Self {
        Self {
            cpu_shares,
            memory_bytes,
            disk_bytes,
            bandwidth_mbits: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Add `other` into `self`.
    pub fn add(&mut self, other: &Self) {
        self.cpu_shares = self.cpu_shares.saturating_add(other.cpu_shares);
        self.memory_bytes = self.memory_bytes.saturating_add(other.memory_bytes);
        self.disk_bytes = self.disk_bytes.saturating_add(other.disk_bytes);
        self.bandwidth_mbits = self.bandwidth_mbits.saturating_add(other.bandwidth_mbits);
    }

    /// Return `self + other` without mutating either side.
    pub fn plus(&self, other: &Self) -> Self {
        let mut out = *self;
        out.add(other);
        out
    }

    /// Return `self - other`, failing on the first dimension that would
    /// go negative.
    pub fn checked_sub(&self, other: &Self) -> Result<Self, InsufficientCapacity> {
        let sub = |a: u64, b: u64, dim| a.checked_sub(b).ok_or(InsufficientCapacity::new(dim));
        Ok(Self {
            cpu_shares: sub(self.cpu_shares, other.cpu_shares, Dimension::Cpu)?,
            memory_bytes: sub(self.memory_bytes, other.memory_bytes, Dimension::Memory)?,
            disk_bytes: sub(self.disk_bytes, other.disk_bytes, Dimension::Disk)?,
            bandwidth_mbits: sub(self.bandwidth_mbits, other.bandwidth_mbits, Dimension::Bandwidth)?,
        })
    }

    /// Subtract `other` in place. On failure `self` is left untouched.
    pub fn subtract(&mut self, other: &Self) -> Result<(), InsufficientCapacity> {
        *self = self.checked_sub(other)?;
        Ok(())
    }

    /// Subtract, clamping each dimension at zero.
    pub fn saturating_sub(&self, other: &Self) -> Self {
        Self {
            cpu_shares: self.cpu_shares.saturating_sub(other.cpu_shares),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            disk_bytes: self.disk_bytes.saturating_sub(other.disk_bytes),
            bandwidth_mbits: self.bandwidth_mbits.saturating_sub(other.bandwidth_mbits),
        }
    }

    /// Check that `self` covers `other` in every dimension. Reports the
    /// first exhausted dimension otherwise.
    pub fn superset(&self, other: &Self) -> Result<(), InsufficientCapacity> {
        self.checked_sub(other).map(|_| ())
    }

    /// Post-placement utilization of the dominant dimension, in `0.0..=1.0`.
    ///
    /// `self` is the projected usage, `total` the node capacity. Only CPU
    /// and memory are considered; disk and bandwidth rarely dominate.
    pub fn dominant_utilization(&self, total: &Self) -> f64 {
        let ratio = |used: u64, cap: u64| {
            if cap == 0 {
                0.0
            } else {
                (used as f64 / cap as f64).min(1.0)
            }
        };
        ratio(self.cpu_shares, total.cpu_shares).max(ratio(self.memory_bytes, total.memory_bytes))
    }
}

/// Whether `ask` fits into `available`.
pub fn fits(ask: &ComparableResources, available: &ComparableResources) -> bool {
    available.superset(ask).is_ok()
}

/// Sum an iterator of resources.
pub fn sum<'a>(items: impl IntoIterator<Item = &'a ComparableResources>) -> ComparableResources {
    items.into_iter().fold(ComparableResources::default(), |acc, r| acc.plus(r))
}
