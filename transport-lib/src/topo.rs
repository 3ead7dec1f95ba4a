use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use mockall::automock;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct PciAddress {
    domain: u16,
    bus: u8,
    device: u8,
    function: u8,
}

impl PciAddress {
    pub fn new(domain: u16, bus: u8, device: u8, function: u8) -> Self {
        PciAddress { domain, bus, device, function }
    }

    /// Ordering key for how far apart two functions sit on the PCI fabric.
    fn distance(&self, other: &PciAddress) -> (bool, u8) {
        (self.domain != other.domain, self.bus.abs_diff(other.bus))
    }
}

impl FromStr for PciAddress {
    type Err = &'static str;

    fn from_str(addr: &str) -> std::result::Result<PciAddress, &'static str> {
        if addr.len() != 12 {
            return Err("PCI address must be 12 characters long");
        }
        if !(&addr[4..5] == ":" && &addr[7..8] == ":" && &addr[10..11] == ".") {
            return Err(
                "Invalid PCI address format, expected domain:bus:device.function",
            );
        }

        let domain =
            u16::from_str_radix(&addr[0..4], 16).map_err(|_| "Invalid domain")?;
        let bus = u8::from_str_radix(&addr[5..7], 16).map_err(|_| "Invalid bus")?;
        let device =
            u8::from_str_radix(&addr[8..10], 16).map_err(|_| "Invalid device")?;
        let function =
            u8::from_str_radix(&addr[11..12], 16).map_err(|_| "Invalid function")?;

        Ok(PciAddress::new(domain, bus, device, function))
    }
}

impl std::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:01x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmaDeviceInfo {
    pub name: String,
    pub pci: Option<PciAddress>,
    pub numa_node: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GpuInfo {
    pci: PciAddress,
    numa_node: i32,
}

/// Source of host hardware topology.
///
/// Owned by whoever selects devices; `init` must succeed before the query
/// methods return anything useful.
#[automock]
pub trait TopologyProvider: Send + Sync {
    fn init(&mut self) -> Result<()>;
    fn shutdown(&mut self);
    fn is_initialized(&self) -> bool;

    /// Every RDMA NIC on the host, sorted by name.
    fn rdma_devices(&self) -> Vec<RdmaDeviceInfo>;

    /// NIC names ordered from nearest to farthest from the given GPU.
    fn nearest_rdma_devices(&self, gpu: u32) -> Result<Vec<String>>;

    /// NUMA node owning the named NIC, -1 if unknown.
    fn device_numa_node(&self, name: &str) -> i32;
}

/// Topology read from sysfs and procfs under a configurable root.
pub struct SysfsTopology {
    root: PathBuf,
    devices: Option<Vec<RdmaDeviceInfo>>,
    gpus: HashMap<u32, GpuInfo>,
}

impl SysfsTopology {
    pub fn new() -> Self {
        Self::with_root("/")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        SysfsTopology { root: root.into(), devices: None, gpus: HashMap::new() }
    }

    fn infiniband_dir(&self) -> PathBuf {
        self.root.join("sys/class/infiniband")
    }

    fn scan_rdma_devices(&self) -> Result<Vec<RdmaDeviceInfo>> {
        let dir = self.infiniband_dir();
        let entries = fs::read_dir(&dir).map_err(|e| {
            TransportError::Topology(format!("failed to read {}: {e}", dir.display()))
        })?;
        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let pci = fs::read_link(entry.path().join("device"))
                .ok()
                .and_then(|link| {
                    link.file_name()
                        .and_then(|f| f.to_str())
                        .and_then(|f| f.parse::<PciAddress>().ok())
                });
            let numa_node = read_numa_node(&entry.path().join("device/numa_node"));
            devices.push(RdmaDeviceInfo { name, pci, numa_node });
        }
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(devices)
    }

    fn scan_gpus(&self) -> HashMap<u32, GpuInfo> {
        let mut gpus = HashMap::new();
        let Ok(entries) = fs::read_dir(self.root.join("proc/driver/nvidia/gpus")) else {
            return gpus;
        };
        for entry in entries.flatten() {
            let dir_name = entry.file_name().to_string_lossy().to_lowercase();
            let Ok(pci) = dir_name.parse::<PciAddress>() else { continue };
            let Ok(info) = fs::read_to_string(entry.path().join("information")) else {
                continue;
            };
            let Some(minor) = parse_device_minor(&info) else { continue };
            let numa_node = read_numa_node(
                &self.root.join("sys/bus/pci/devices").join(&dir_name).join("numa_node"),
            );
            gpus.insert(minor, GpuInfo { pci, numa_node });
        }
        gpus
    }
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyProvider for SysfsTopology {
    fn init(&mut self) -> Result<()> {
        if self.devices.is_some() {
            return Ok(());
        }
        let devices = self.scan_rdma_devices()?;
        self.gpus = self.scan_gpus();
        debug!(num_nics = devices.len(), num_gpus = self.gpus.len(), "topology scanned");
        self.devices = Some(devices);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.devices = None;
        self.gpus.clear();
    }

    fn is_initialized(&self) -> bool {
        self.devices.is_some()
    }

    fn rdma_devices(&self) -> Vec<RdmaDeviceInfo> {
        self.devices.clone().unwrap_or_default()
    }

    fn nearest_rdma_devices(&self, gpu: u32) -> Result<Vec<String>> {
        let devices = self.devices.as_ref().ok_or_else(|| {
            TransportError::Topology("topology not initialized".to_string())
        })?;
        let gpu_info = self.gpus.get(&gpu).ok_or_else(|| {
            TransportError::Topology(format!("GPU {gpu} not found"))
        })?;
        let mut ranked: Vec<_> = devices
            .iter()
            .map(|dev| {
                let same_numa = gpu_info.numa_node >= 0 && dev.numa_node == gpu_info.numa_node;
                let distance = dev
                    .pci
                    .map(|pci| pci.distance(&gpu_info.pci))
                    .unwrap_or((true, u8::MAX));
                ((!same_numa, distance), dev.name.as_str())
            })
            .collect();
        ranked.sort();
        Ok(ranked.into_iter().map(|(_, name)| name.to_string()).collect())
    }

    fn device_numa_node(&self, name: &str) -> i32 {
        read_numa_node(&self.infiniband_dir().join(name).join("device/numa_node"))
    }
}

fn read_numa_node(path: &Path) -> i32 {
    match fs::read_to_string(path) {
        Ok(s) => s.trim().parse().unwrap_or(-1),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read numa node");
            -1
        }
    }
}

fn parse_device_minor(information: &str) -> Option<u32> {
    information.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "Device Minor").then(|| value.trim().parse().ok())?
    })
}
