use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    api::{MemoryKind, NativeRegion, RegionKey},
    error::{Result, TransportError},
};

/// One memory range made remotely addressable through the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredMemoryRegion {
    pub addr: usize,
    pub len: usize,
    pub kind: MemoryKind,
    pub numa_node: i32,
    /// Whether the transport allocated the buffer and must free it.
    /// Caller-provided buffers are never freed here.
    pub owned: bool,
    pub per_device_handles: HashMap<u32, RegionKey>,
}

impl RegisteredMemoryRegion {
    fn new(addr: usize, len: usize, kind: MemoryKind, numa_node: i32, native: NativeRegion) -> Self {
        RegisteredMemoryRegion {
            addr,
            len,
            kind,
            numa_node,
            owned: false,
            per_device_handles: native.handles.into_iter().collect(),
        }
    }
}

/// Authoritative table of active registrations, keyed by `(addr, len)`.
///
/// The lock is held across the native call so register and deregister of the
/// same range never interleave.
#[derive(Default)]
pub struct MemoryRegistry {
    regions: Mutex<HashMap<(usize, usize), RegisteredMemoryRegion>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the range through `native` unless it is already registered.
    /// Returns whether a new registration was made.
    pub fn register_with(
        &self,
        addr: usize,
        len: usize,
        kind: MemoryKind,
        numa_node: i32,
        native: impl FnOnce() -> Result<NativeRegion>,
    ) -> Result<bool> {
        let mut regions = self.regions.lock();
        if let Some(existing) = regions.get(&(addr, len)) {
            if existing.kind != kind {
                return Err(TransportError::Registration(format!(
                    "region {addr:#x}+{len} already registered as {:?}",
                    existing.kind
                )));
            }
            debug!(addr, len, "memory region already registered");
            return Ok(false);
        }
        let region = native()?;
        regions.insert((addr, len), RegisteredMemoryRegion::new(addr, len, kind, numa_node, region));
        Ok(true)
    }

    /// Deregisters a known range through `native`. Unknown ranges are rejected
    /// without calling it. A refused deregistration keeps the entry.
    pub fn deregister_with(
        &self,
        addr: usize,
        len: usize,
        native: impl FnOnce() -> bool,
    ) -> Result<()> {
        let mut regions = self.regions.lock();
        if !regions.contains_key(&(addr, len)) {
            return Err(TransportError::UnknownRegion { addr, len });
        }
        if !native() {
            return Err(TransportError::Deregistration { addr, len });
        }
        regions.remove(&(addr, len));
        Ok(())
    }

    pub fn get(&self, addr: usize, len: usize) -> Option<RegisteredMemoryRegion> {
        self.regions.lock().get(&(addr, len)).cloned()
    }

    /// Removes and returns every registration.
    pub fn drain(&self) -> Vec<RegisteredMemoryRegion> {
        self.regions.lock().drain().map(|(_, region)| region).collect()
    }

    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.lock().is_empty()
    }
}
