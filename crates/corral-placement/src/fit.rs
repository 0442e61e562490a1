//! Resource fitting of a task group onto a node.
//!
//! `fit_task_group` is the one place that turns an ask into concrete
//! resources: countable capacity first, then device instances, then
//! ports and bandwidth. The stack, the preemptor and the plan applier all
//! call into this module so that they agree on what "fits" means.

use corral_core::{
    AllocatedResources, AllocatedTaskResources, Allocation, ComparableResources, DeviceAccounter,
    Dimension, InsufficientCapacity, NetworkIndex, Node, TaskGroup,
};

/// Countable resources the given allocations hold.
pub fn used_resources(allocs: &[&Allocation]) -> ComparableResources {
    allocs
        .iter()
        .filter(|a| !a.terminal_status())
        .fold(ComparableResources::default(), |acc, a| {
            acc.plus(&a.comparable_resources())
        })
}

/// Assign resources for one instance of `tg` on `node`, given the
/// allocations already occupying it.
pub fn fit_task_group(
    node: &Node,
    tg: &TaskGroup,
    allocs: &[&Allocation],
) -> Result<AllocatedResources, InsufficientCapacity> {
    let capacity = node.comparable_capacity();
    let free = capacity.checked_sub(&used_resources(allocs))?;
    free.superset(&tg.comparable_ask())?;

    let mut devices = DeviceAccounter::new(node);
    devices.add_allocs(allocs.iter().copied());

    let mut out = AllocatedResources {
        disk_bytes: tg.ephemeral_disk_bytes,
        ..Default::default()
    };
    for task in &tg.tasks {
        let mut task_res = AllocatedTaskResources {
            cpu_shares: task.resources.cpu_shares,
            memory_bytes: task.resources.memory_bytes,
            devices: Vec::new(),
        };
        for request in &task.resources.devices {
            let dev = devices.assign(request)?;
            devices.add_reserved(&dev);
            task_res.devices.push(dev);
        }
        out.tasks.insert(task.name.clone(), task_res);
    }

    let mut networks = NetworkIndex::new(node);
    networks.add_allocs(allocs.iter().copied());
    for ask in &tg.networks {
        let net = networks.assign_ports(ask)?;
        networks.add_reserved(&net);
        out.networks.push(net);
    }

    Ok(out)
}

/// Verify that a complete allocation set fits on the node: countable
/// capacity, no port collisions or bandwidth overcommit, no device instance
/// claimed twice.
pub fn allocs_fit(node: &Node, allocs: &[&Allocation]) -> Result<(), InsufficientCapacity> {
    node.comparable_capacity().superset(&used_resources(allocs))?;

    let mut networks = NetworkIndex::new(node);
    if networks.add_allocs(allocs.iter().copied()) || networks.overcommitted() {
        return Err(InsufficientCapacity::new(Dimension::Ports));
    }

    let mut devices = DeviceAccounter::new(node);
    if devices.add_allocs(allocs.iter().copied()) {
        return Err(InsufficientCapacity::new(Dimension::Devices));
    }
    Ok(())
}
