//! In-process backend that moves bytes with `memcpy` between instances
//! sharing one [`LoopbackFabric`].

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    api::{
        InstanceId, NativeRegion, RegionKey, RequestHandle, TransferConfig,
        TransferDescriptor, TransferOpcode,
    },
    config::BackendConfig,
    error::{NativeStatus, Result},
    provider::{RdmaBackend, RdmaContext},
};

#[derive(Default)]
struct Instance {
    /// Region start to length.
    regions: Mutex<BTreeMap<usize, usize>>,
    ops: AtomicU64,
    bytes: AtomicU64,
}

impl Instance {
    fn contains(&self, addr: usize, len: usize) -> bool {
        let regions = self.regions.lock();
        let Some((&start, &region_len)) = regions.range(..=addr).next_back() else {
            return false;
        };
        addr.checked_add(len).is_some_and(|end| end <= start + region_len)
    }
}

/// Shared switchboard: listeners by `(host, port)` and every live instance.
#[derive(Default)]
pub struct LoopbackFabric {
    listeners: Mutex<HashMap<(String, u16), InstanceId>>,
    instances: DashMap<InstanceId, Arc<Instance>>,
    requests: DashMap<RequestHandle, NativeStatus>,
    next_instance: AtomicU64,
    next_request: AtomicU64,
}

impl LoopbackFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests submitted but not yet released.
    pub fn outstanding_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    pub fn is_listening(&self, host: &str, port: u16) -> bool {
        self.listeners.lock().contains_key(&(host.to_string(), port))
    }

    /// Occupies a port as if another process had bound it.
    pub fn reserve_port(&self, host: &str, port: u16) {
        self.listeners.lock().insert((host.to_string(), port), InstanceId(u64::MAX));
    }
}

/// Creates contexts that appear on the fabric under `host`.
pub struct LoopbackBackend {
    fabric: Arc<LoopbackFabric>,
    host: String,
}

impl LoopbackBackend {
    pub fn new(fabric: Arc<LoopbackFabric>, host: impl Into<String>) -> Self {
        LoopbackBackend { fabric, host: host.into() }
    }
}

impl RdmaBackend for LoopbackBackend {
    fn setup(&self, config: &BackendConfig) -> Result<Arc<dyn RdmaContext>> {
        let id = InstanceId(self.fabric.next_instance.fetch_add(1, Ordering::Relaxed));
        let instance = Arc::new(Instance::default());
        self.fabric.instances.insert(id, instance.clone());
        debug!(
            instance = %id,
            host = %self.host,
            devices = ?config.rdma.device_pattern,
            pollers = config.rdma.num_pollers,
            "loopback context created"
        );
        Ok(Arc::new(LoopbackContext {
            fabric: self.fabric.clone(),
            host: self.host.clone(),
            id,
            instance,
        }))
    }
}

struct LoopbackContext {
    fabric: Arc<LoopbackFabric>,
    host: String,
    id: InstanceId,
    instance: Arc<Instance>,
}

impl LoopbackContext {
    /// Moves every segment, at most `chunk` bytes per copy.
    fn copy(&self, descriptor: &TransferDescriptor, chunk: usize) -> NativeStatus {
        let Some(remote) = self.fabric.instances.get(&descriptor.instance_id).map(|r| r.value().clone())
        else {
            return -libc::ECONNREFUSED;
        };
        let mut remote_addr = descriptor.remote_addr as usize;
        for segment in &descriptor.segments {
            let len = segment.len as usize;
            if !self.instance.contains(segment.addr, len) || !remote.contains(remote_addr, len) {
                return -libc::EFAULT;
            }
            let (src, dst) = match descriptor.opcode {
                TransferOpcode::Write => (segment.addr, remote_addr),
                TransferOpcode::Read => (remote_addr, segment.addr),
            };
            let mut offset = 0;
            while offset < len {
                let n = chunk.min(len - offset);
                unsafe {
                    std::ptr::copy((src + offset) as *const u8, (dst + offset) as *mut u8, n);
                }
                offset += n;
            }
            self.instance.bytes.fetch_add(len as u64, Ordering::Relaxed);
            remote_addr += len;
        }
        self.instance.ops.fetch_add(1, Ordering::Relaxed);
        0
    }

    fn register(&self, addr: usize, len: usize) -> NativeRegion {
        self.instance.regions.lock().insert(addr, len);
        let key = RegionKey(addr as u64 ^ self.id.0.rotate_left(32));
        NativeRegion { handles: [(0, key)].into_iter().collect() }
    }
}

impl RdmaContext for LoopbackContext {
    fn instance_id(&self) -> InstanceId {
        self.id
    }

    fn setup_rpc_server(&self, port: u16) -> std::result::Result<(), NativeStatus> {
        let mut listeners = self.fabric.listeners.lock();
        let key = (self.host.clone(), port);
        if listeners.contains_key(&key) {
            return Err(-libc::EADDRINUSE);
        }
        listeners.insert(key, self.id);
        Ok(())
    }

    fn query_instance_id(
        &self,
        host: &str,
        port: u16,
    ) -> std::result::Result<InstanceId, NativeStatus> {
        self.fabric
            .listeners
            .lock()
            .get(&(host.to_string(), port))
            .copied()
            .filter(|id| self.fabric.instances.contains_key(id))
            .ok_or(-libc::ENOENT)
    }

    fn exec_transfer(
        &self,
        descriptor: &TransferDescriptor,
        config: &TransferConfig,
    ) -> Option<RequestHandle> {
        let status = self.copy(descriptor, config.max_segment_size.max(1) as usize);
        let handle = RequestHandle(self.fabric.next_request.fetch_add(1, Ordering::Relaxed));
        self.fabric.requests.insert(handle, status);
        Some(handle)
    }

    fn request_status(&self, request: RequestHandle) -> NativeStatus {
        self.fabric.requests.get(&request).map_or(-libc::EINVAL, |status| *status)
    }

    fn release_request(&self, request: RequestHandle) {
        self.fabric.requests.remove(&request);
    }

    fn register_ram(&self, addr: usize, len: usize, numa_node: i32) -> Option<NativeRegion> {
        debug!(addr, len, numa_node, "loopback register ram");
        Some(self.register(addr, len))
    }

    fn register_vram(&self, addr: usize, len: usize, gpu: i32) -> Option<NativeRegion> {
        debug!(addr, len, gpu, "loopback cannot address device memory");
        None
    }

    fn deregister(&self, addr: usize, len: usize) -> bool {
        let mut regions = self.instance.regions.lock();
        if regions.get(&addr) != Some(&len) {
            return false;
        }
        regions.remove(&addr);
        true
    }

    fn print_perf_info(&self) {
        info!(
            instance = %self.id,
            ops = self.instance.ops.load(Ordering::Relaxed),
            bytes = self.instance.bytes.load(Ordering::Relaxed),
            "loopback perf"
        );
    }

    fn cleanup(&self) {
        self.fabric.listeners.lock().retain(|_, id| *id != self.id);
        self.fabric.instances.remove(&self.id);
        self.instance.regions.lock().clear();
    }
}
