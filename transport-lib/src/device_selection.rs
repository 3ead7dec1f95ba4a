use tracing::{debug, info, warn};

use crate::topo::{SysfsTopology, TopologyProvider};

/// Picks the RDMA NICs a process should use.
pub struct DeviceSelector {
    topology: Box<dyn TopologyProvider>,
}

impl DeviceSelector {
    pub fn new(topology: Box<dyn TopologyProvider>) -> Self {
        DeviceSelector { topology }
    }

    pub fn sysfs() -> Self {
        Self::new(Box::new(SysfsTopology::new()))
    }

    pub fn topology(&self) -> &dyn TopologyProvider {
        self.topology.as_ref()
    }

    fn ensure_initialized(&mut self) -> bool {
        if self.topology.is_initialized() {
            return true;
        }
        match self.topology.init() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "topology init failed, using backend default devices");
                false
            }
        }
    }

    /// Comma-joined NIC names, at most `max_devices` of them.
    ///
    /// An empty string means no devices could be determined and the backend
    /// should use its default.
    pub fn select(
        &mut self,
        max_devices: usize,
        accelerator: Option<u32>,
        rank: u32,
    ) -> String {
        if !self.ensure_initialized() {
            return String::new();
        }
        let devices = match accelerator {
            Some(gpu) => match self.topology.nearest_rdma_devices(gpu) {
                Ok(mut nearest) => {
                    nearest.truncate(max_devices);
                    debug!(gpu, ?nearest, "topology-aware device selection");
                    nearest
                }
                Err(e) => {
                    warn!(gpu, error = %e, "topology-aware selection failed, falling back to rank");
                    self.select_by_rank(max_devices, rank)
                }
            },
            None => self.select_by_rank(max_devices, rank),
        };
        let joined = devices.join(",");
        info!(devices = %joined, ?accelerator, rank, "selected RDMA devices");
        joined
    }

    fn select_by_rank(&self, max_devices: usize, rank: u32) -> Vec<String> {
        let mut names: Vec<_> =
            self.topology.rdma_devices().into_iter().map(|dev| dev.name).collect();
        names.sort();
        rank_based_selection(&names, max_devices, rank)
    }

    pub fn shutdown(&mut self) {
        if self.topology.is_initialized() {
            self.topology.shutdown();
        }
    }
}

/// Takes `min(max_devices, n)` consecutive names starting at
/// `(rank * max_devices) mod n`, wrapping around.
pub fn rank_based_selection(names: &[String], max_devices: usize, rank: u32) -> Vec<String> {
    let n = names.len();
    if n == 0 || max_devices == 0 {
        return Vec::new();
    }
    let start = (rank as usize).wrapping_mul(max_devices) % n;
    (0..max_devices.min(n)).map(|i| names[(start + i) % n].clone()).collect()
}
