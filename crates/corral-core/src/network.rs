//! Port and bandwidth bookkeeping for a single node.
//!
//! A `NetworkIndex` is rebuilt for every node being evaluated: it starts
//! from the node's networks and host-reserved ports, then absorbs the
//! node's proposed allocations. `assign_ports` answers one group ask
//! without mutating the index; callers commit the result with
//! [`NetworkIndex::add_reserved`] when they accept the placement.

use std::collections::{BTreeMap, BTreeSet};

use crate::resources::{Dimension, InsufficientCapacity};
use crate::structs::{AllocatedNetwork, AllocatedPort, Allocation, NetworkResource, Node};

#[derive(Debug, Clone)]
pub struct NetworkIndex {
    /// Device name to (ip, available mbits).
    devices: BTreeMap<String, (String, u64)>,
    used_bandwidth: BTreeMap<String, u64>,
    used_ports: BTreeSet<u16>,
    min_dynamic_port: u16,
    max_dynamic_port: u16,
}

impl NetworkIndex {
    pub fn new(node: &Node) -> Self {
        let devices = node
            .resources
            .networks
            .iter()
            .map(|n| (n.device.clone(), (n.ip.clone(), n.mbits)))
            .collect();
        Self {
            devices,
            used_bandwidth: BTreeMap::new(),
            used_ports: node.resources.reserved_ports.iter().copied().collect(),
            min_dynamic_port: node.resources.min_dynamic_port,
            max_dynamic_port: node.resources.max_dynamic_port,
        }
    }

    /// Absorb the networks of non-terminal allocations. Returns true if a
    /// port collision or bandwidth overcommit was found.
    pub fn add_allocs<'a>(&mut self, allocs: impl IntoIterator<Item = &'a Allocation>) -> bool {
        let mut collide = false;
        for alloc in allocs {
            if alloc.terminal_status() {
                continue;
            }
            for net in &alloc.resources.networks {
                collide |= self.add_reserved(net);
            }
        }
        collide
    }

    /// Record one allocated network. Returns true on a collision.
    pub fn add_reserved(&mut self, net: &AllocatedNetwork) -> bool {
        let mut collide = false;
        for port in &net.ports {
            collide |= !self.used_ports.insert(port.value);
        }
        let used = self.used_bandwidth.entry(net.device.clone()).or_default();
        *used += net.mbits;
        if let Some((_, avail)) = self.devices.get(&net.device) {
            collide |= *used > *avail;
        }
        collide
    }

    /// Whether the index already exceeds a device's bandwidth.
    pub fn overcommitted(&self) -> bool {
        self.used_bandwidth
            .iter()
            .any(|(dev, used)| self.devices.get(dev).is_some_and(|(_, avail)| used > avail))
    }

    /// Find a concrete network for `ask`: a device with enough free
    /// bandwidth, the requested static ports and the lowest free dynamic
    /// ports. Does not mutate the index.
    pub fn assign_ports(&self, ask: &NetworkResource) -> Result<AllocatedNetwork, InsufficientCapacity> {
        let (device, ip) = self.select_device(ask)?;

        let mut taken = BTreeSet::new();
        let mut ports = Vec::with_capacity(ask.reserved_ports.len() + ask.dynamic_ports.len());
        for port in &ask.reserved_ports {
            if self.used_ports.contains(&port.value) || !taken.insert(port.value) {
                return Err(InsufficientCapacity::new(Dimension::Ports));
            }
            ports.push(AllocatedPort {
                label: port.label.clone(),
                value: port.value,
            });
        }

        let mut candidates = (self.min_dynamic_port..=self.max_dynamic_port)
            .filter(|p| !self.used_ports.contains(p) && !taken.contains(p));
        for port in &ask.dynamic_ports {
            let value = candidates
                .next()
                .ok_or(InsufficientCapacity::new(Dimension::Ports))?;
            ports.push(AllocatedPort {
                label: port.label.clone(),
                value,
            });
        }

        Ok(AllocatedNetwork {
            device,
            ip,
            mbits: ask.mbits,
            ports,
        })
    }

    fn select_device(&self, ask: &NetworkResource) -> Result<(String, String), InsufficientCapacity> {
        let free = |dev: &str, avail: u64| avail.saturating_sub(*self.used_bandwidth.get(dev).unwrap_or(&0));

        if !ask.device.is_empty() {
            return match self.devices.get(&ask.device) {
                Some((ip, avail)) if free(&ask.device, *avail) >= ask.mbits => {
                    Ok((ask.device.clone(), ip.clone()))
                }
                _ => Err(InsufficientCapacity::new(Dimension::Bandwidth)),
            };
        }

        // Nodes without fingerprinted networks can still host port-only asks.
        if self.devices.is_empty() {
            return if ask.mbits == 0 {
                Ok((String::new(), String::new()))
            } else {
                Err(InsufficientCapacity::new(Dimension::Bandwidth))
            };
        }

        self.devices
            .iter()
            .find(|(dev, (_, avail))| free(dev, *avail) >= ask.mbits)
            .map(|(dev, (ip, _))| (dev.clone(), ip.clone()))
            .ok_or(InsufficientCapacity::new(Dimension::Bandwidth))
    }
}
