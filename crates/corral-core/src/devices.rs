//! Device instance bookkeeping for a single node.
//!
//! Only healthy instances are offered. Instances held by non-terminal
//! allocations are marked used; `assign` hands out free instance IDs in
//! a stable order so that identical inputs produce identical choices.

use std::collections::BTreeSet;

use crate::resources::{Dimension, InsufficientCapacity};
use crate::structs::{AllocatedDevice, Allocation, DeviceRequest, Node, NodeDevice};

#[derive(Debug, Clone)]
pub struct DeviceAccounter {
    groups: Vec<DeviceGroup>,
}

#[derive(Debug, Clone)]
struct DeviceGroup {
    device: NodeDevice,
    free: BTreeSet<String>,
    used: BTreeSet<String>,
}

impl DeviceAccounter {
    pub fn new(node: &Node) -> Self {
        let groups = node
            .resources
            .devices
            .iter()
            .map(|d| DeviceGroup {
                device: d.clone(),
                free: d
                    .instances
                    .iter()
                    .filter(|i| i.healthy)
                    .map(|i| i.id.clone())
                    .collect(),
                used: BTreeSet::new(),
            })
            .collect();
        Self { groups }
    }

    /// Mark instances held by non-terminal allocations as used. Returns
    /// true if an instance was claimed twice.
    pub fn add_allocs<'a>(&mut self, allocs: impl IntoIterator<Item = &'a Allocation>) -> bool {
        let mut collide = false;
        for alloc in allocs {
            if alloc.terminal_status() {
                continue;
            }
            for dev in alloc.resources.devices() {
                collide |= self.add_reserved(dev);
            }
        }
        collide
    }

    /// Mark one allocated device as used. Returns true on a double claim.
    pub fn add_reserved(&mut self, dev: &AllocatedDevice) -> bool {
        let mut collide = false;
        let Some(group) = self.groups.iter_mut().find(|g| {
            g.device.vendor == dev.vendor
                && g.device.device_type == dev.device_type
                && g.device.name == dev.name
        }) else {
            return false;
        };
        for id in &dev.device_ids {
            group.free.remove(id);
            collide |= !group.used.insert(id.clone());
        }
        collide
    }

    /// Pick `request.count` free instances from the first matching group
    /// with enough capacity. Does not mutate the accounter.
    pub fn assign(&self, request: &DeviceRequest) -> Result<AllocatedDevice, InsufficientCapacity> {
        let group = self
            .groups
            .iter()
            .filter(|g| g.device.matches(&request.name))
            .find(|g| g.free.len() as u64 >= request.count)
            .ok_or(InsufficientCapacity::new(Dimension::Devices))?;

        Ok(AllocatedDevice {
            vendor: group.device.vendor.clone(),
            device_type: group.device.device_type.clone(),
            name: group.device.name.clone(),
            device_ids: group.free.iter().take(request.count as usize).cloned().collect(),
        })
    }

    /// Whether any group on the node could ever satisfy `request`, counting
    /// used instances as well.
    pub fn could_satisfy(&self, request: &DeviceRequest) -> bool {
        self.groups.iter().any(|g| {
            g.device.matches(&request.name) && (g.free.len() + g.used.len()) as u64 >= request.count
        })
    }
}
