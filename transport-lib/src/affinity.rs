use thread_lib::{bind_memory_to_node, cpu_mask_str, mem_policy_str, run_on_node};
use tracing::{info, warn};

use crate::topo::TopologyProvider;

/// NUMA node owning one selected NIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicNumaAssociation {
    pub device_name: String,
    pub numa_node: i32,
}

/// Resolves the NUMA node of every NIC in a comma-joined device list.
pub fn associate_nics(
    topology: &dyn TopologyProvider,
    device_pattern: &str,
) -> Vec<NicNumaAssociation> {
    device_pattern
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| NicNumaAssociation {
            device_name: name.to_string(),
            numa_node: topology.device_numa_node(name),
        })
        .collect()
}

/// NUMA node of the first selected NIC, -1 if none.
pub fn primary_numa_node(nics: &[NicNumaAssociation]) -> i32 {
    nics.first().map_or(-1, |nic| nic.numa_node)
}

fn log_affinity() {
    info!("[Affinity] cpu mask={} mempolicy={}", cpu_mask_str(), mem_policy_str());
}

/// Pins the calling thread's CPUs and future allocations to `node`.
///
/// Best effort: returns whether both bindings took effect.
pub fn bind_to_numa_node(node: i32) -> bool {
    let Ok(node) = u32::try_from(node) else {
        warn!(node, "no NUMA node for selected devices, skipping binding");
        return false;
    };
    log_affinity();
    let mut bound = true;
    if let Err(e) = run_on_node(node) {
        warn!(node, error = %e, "failed to bind CPUs to NUMA node");
        bound = false;
    }
    if let Err(e) = bind_memory_to_node(node) {
        warn!(node, error = %e, "failed to bind memory to NUMA node");
        bound = false;
    }
    log_affinity();
    bound
}
