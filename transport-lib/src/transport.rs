use std::{
    ffi::c_void,
    sync::{
        Arc,
        atomic::{AtomicI32, AtomicU16, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::{
    affinity::{self, NicNumaAssociation},
    api::{Device, ExtendInfo, MemoryKind, RemoteEndpoint, TransferOpcode, TransferRequest},
    config::{
        BackendConfig, DYNAMIC_PORT_BASE, DYNAMIC_PORT_SPAN, ParallelConfig, TransportOptions,
    },
    device_selection::DeviceSelector,
    error::{Result, TransportError},
    interface::DataTransport,
    mr::MemoryRegistry,
    provider::{RdmaBackend, RdmaContext},
    reporter::{ActivityClock, PerfReporter},
    retry::CountingSleepRetry,
    transfer,
};

const IN_FLIGHT_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    ContextReady,
    Listening,
    Running,
    Stopped,
}

/// Everything the data path needs once `start` has succeeded.
struct LiveContext {
    ctx: Arc<dyn RdmaContext>,
    send_retry: CountingSleepRetry,
    receive_retry: CountingSleepRetry,
    read_timeout_ms: i32,
    write_timeout_ms: i32,
}

struct Lifecycle {
    selector: DeviceSelector,
    reporter: Option<PerfReporter>,
}

/// Blocking RDMA transport over a pluggable native backend.
pub struct RdmaTransport {
    backend: Arc<dyn RdmaBackend>,
    lifecycle: Mutex<Lifecycle>,
    state: RwLock<TransportState>,
    live: RwLock<Option<Arc<LiveContext>>>,
    registry: MemoryRegistry,
    activity: Arc<ActivityClock>,
    bind_port: AtomicU16,
    nic_numa: RwLock<Vec<NicNumaAssociation>>,
    rdma_numa_node: AtomicI32,
    meta_addr: RwLock<String>,
}

impl RdmaTransport {
    pub fn new(backend: Arc<dyn RdmaBackend>, selector: DeviceSelector) -> Self {
        RdmaTransport {
            backend,
            lifecycle: Mutex::new(Lifecycle { selector, reporter: None }),
            state: RwLock::new(TransportState::Uninitialized),
            live: RwLock::new(None),
            registry: MemoryRegistry::new(),
            activity: Arc::new(ActivityClock::default()),
            bind_port: AtomicU16::new(0),
            nic_numa: RwLock::new(Vec::new()),
            rdma_numa_node: AtomicI32::new(-1),
            meta_addr: RwLock::new(String::new()),
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state.read()
    }

    fn set_state(&self, state: TransportState) {
        *self.state.write() = state;
    }

    pub fn is_running(&self) -> bool {
        self.state() == TransportState::Running
    }

    pub fn local_server_name(&self) -> String {
        local_hostname()
    }

    pub fn meta_addr(&self) -> String {
        self.meta_addr.read().clone()
    }

    pub fn read_timeout_ms(&self) -> Option<i32> {
        self.live.read().as_ref().map(|live| live.read_timeout_ms)
    }

    pub fn write_timeout_ms(&self) -> Option<i32> {
        self.live.read().as_ref().map(|live| live.write_timeout_ms)
    }

    pub fn nic_numa_nodes(&self) -> Vec<NicNumaAssociation> {
        self.nic_numa.read().clone()
    }

    pub fn rdma_numa_node(&self) -> i32 {
        self.rdma_numa_node.load(Ordering::Relaxed)
    }

    pub fn registered_regions(&self) -> usize {
        self.registry.len()
    }

    fn live(&self) -> Option<Arc<LiveContext>> {
        self.live.read().clone()
    }

    fn start_locked(
        &self,
        lifecycle: &mut Lifecycle,
        opts: &TransportOptions,
        parallel: &ParallelConfig,
    ) -> Result<()> {
        match self.state() {
            TransportState::Uninitialized => {}
            TransportState::Stopped => {
                return Err(TransportError::Setup("transport already stopped".into()));
            }
            state => {
                return Err(TransportError::Setup(format!(
                    "transport already started ({state:?})"
                )));
            }
        }
        *self.meta_addr.write() = opts.meta_service_address.clone();

        let devices = lifecycle.selector.select(
            opts.max_rdma_devices,
            opts.accelerator_device,
            parallel.role_rank,
        );
        let nics = affinity::associate_nics(lifecycle.selector.topology(), &devices);
        let numa_node = affinity::primary_numa_node(&nics);
        self.rdma_numa_node.store(numa_node, Ordering::Relaxed);
        *self.nic_numa.write() = nics;
        if opts.enable_numa_allocation {
            affinity::bind_to_numa_node(numa_node);
        }

        let config = BackendConfig::new(opts, devices);
        let ctx = self.backend.setup(&config).inspect_err(|e| {
            error!(error = %e, "failed to create RDMA context");
        })?;
        self.set_state(TransportState::ContextReady);

        let port = if opts.service_fixed_port {
            bind_fixed_port(ctx.as_ref(), opts.local_port)
        } else {
            let base = DYNAMIC_PORT_BASE + rand::rng().random_range(0..DYNAMIC_PORT_SPAN);
            bind_dynamic_port(ctx.as_ref(), base, opts.bind_port_max_retry)
        };
        let port = match port {
            Ok(port) => port,
            Err(e) => {
                ctx.cleanup();
                self.set_state(TransportState::Uninitialized);
                return Err(e);
            }
        };
        self.bind_port.store(port, Ordering::Relaxed);
        self.set_state(TransportState::Listening);

        if opts.enable_perf_metrics {
            match PerfReporter::spawn(
                ctx.clone(),
                self.activity.clone(),
                Duration::from_millis(opts.perf_stats_interval_ms),
            ) {
                Ok(reporter) => lifecycle.reporter = Some(reporter),
                Err(e) => {
                    ctx.cleanup();
                    self.bind_port.store(0, Ordering::Relaxed);
                    self.set_state(TransportState::Uninitialized);
                    return Err(e);
                }
            }
        }

        *self.live.write() = Some(Arc::new(LiveContext {
            ctx,
            send_retry: CountingSleepRetry::new(
                opts.send_retry_count,
                Duration::from_millis(opts.send_retry_sleep_ms),
            ),
            receive_retry: CountingSleepRetry::new(
                opts.receive_retry_count,
                Duration::from_millis(opts.receive_retry_sleep_ms),
            ),
            read_timeout_ms: opts.read_timeout_ms,
            write_timeout_ms: opts.write_timeout_ms,
        }));
        self.set_state(TransportState::Running);

        if opts.start_settle_ms > 0 {
            std::thread::sleep(Duration::from_millis(opts.start_settle_ms));
        }
        info!(
            host = %self.local_server_name(),
            port,
            numa_node,
            perf = opts.enable_perf_metrics,
            "RDMA transport started"
        );
        Ok(())
    }

    fn transfer(
        &self,
        opcode: TransferOpcode,
        local: *mut c_void,
        len: usize,
        remote: &RemoteEndpoint,
        extend: &ExtendInfo,
    ) -> Result<()> {
        let live = self.live().ok_or(TransportError::NotReady)?;
        if local.is_null() || len == 0 {
            return Err(TransportError::InvalidArgument(format!(
                "invalid local buffer {local:p}+{len}"
            )));
        }
        let remote_addr = extend.remote_addr().ok_or_else(|| {
            TransportError::InvalidArgument("missing remote address".to_string())
        })?;
        if len > u32::MAX as usize {
            return Err(TransportError::InvalidArgument(format!(
                "length {len} exceeds a single segment"
            )));
        }
        self.activity.touch();

        let request = TransferRequest {
            opcode,
            local_addr: local as usize,
            remote_addr,
            length: len,
            remote_endpoint: remote.clone(),
        };
        let (timeout_ms, policy) = match opcode {
            TransferOpcode::Write => (live.write_timeout_ms, &live.send_retry),
            TransferOpcode::Read => (live.read_timeout_ms, &live.receive_retry),
        };
        transfer::execute(live.ctx.as_ref(), &request, timeout_ms, policy)
    }
}

/// Blocks until every send/receive that cloned `live` before it was taken
/// has returned. New calls see no context and fail with `NotReady`.
fn wait_for_in_flight(live: &Arc<LiveContext>) {
    if Arc::strong_count(live) > 1 {
        debug!(in_flight = Arc::strong_count(live) - 1, "waiting for in-flight transfers");
        while Arc::strong_count(live) > 1 {
            std::thread::sleep(IN_FLIGHT_POLL);
        }
    }
}

/// Tries `base, base + 1, ...` until the listener comes up or
/// `max_attempts` ports have been refused.
pub(crate) fn bind_dynamic_port(
    ctx: &dyn RdmaContext,
    base: u16,
    max_attempts: u32,
) -> Result<u16> {
    let attempts = max_attempts.max(1);
    for offset in 0..attempts {
        let Some(port) = u16::try_from(offset).ok().and_then(|o| base.checked_add(o))
        else {
            break;
        };
        match ctx.setup_rpc_server(port) {
            Ok(()) => return Ok(port),
            Err(status) => {
                warn!(port, status, "failed to bind RPC server, trying next port");
            }
        }
    }
    error!(base, attempts, "failed to bind RPC server");
    Err(TransportError::PortBind { base_port: base, attempts })
}

fn bind_fixed_port(ctx: &dyn RdmaContext, port: u16) -> Result<u16> {
    ctx.setup_rpc_server(port).map_err(|status| {
        error!(port, status, "failed to bind RPC server on fixed port");
        TransportError::PortBind { base_port: port, attempts: 1 }
    })?;
    Ok(port)
}

pub fn local_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}

impl DataTransport for RdmaTransport {
    fn start(&self, opts: &TransportOptions, parallel: &ParallelConfig) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        self.start_locked(&mut lifecycle, opts, parallel)
    }

    fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if self.state() == TransportState::Stopped {
            return;
        }
        if let Some(reporter) = lifecycle.reporter.take() {
            reporter.stop();
        }
        let taken = self.live.write().take();
        if let Some(live) = taken {
            wait_for_in_flight(&live);
            for region in self.registry.drain() {
                if !live.ctx.deregister(region.addr, region.len) {
                    warn!(addr = region.addr, len = region.len, "failed to deregister memory on stop");
                }
            }
            live.ctx.cleanup();
        }
        lifecycle.selector.shutdown();
        self.set_state(TransportState::Stopped);
        info!("RDMA transport stopped");
    }

    fn send(
        &self,
        local: *mut c_void,
        len: usize,
        remote: &RemoteEndpoint,
        extend: &ExtendInfo,
    ) -> Result<()> {
        self.transfer(TransferOpcode::Write, local, len, remote, extend)
            .inspect_err(|e| error!(remote = %remote, len, error = %e, "send failed"))
    }

    fn receive(
        &self,
        local: *mut c_void,
        len: usize,
        remote: &RemoteEndpoint,
        extend: &ExtendInfo,
    ) -> Result<()> {
        self.transfer(TransferOpcode::Read, local, len, remote, extend)
            .inspect_err(|e| error!(remote = %remote, len, error = %e, "receive failed"))
    }

    fn async_send(
        &self,
        _local: *mut c_void,
        _len: usize,
        _remote: &RemoteEndpoint,
        _extend: &ExtendInfo,
    ) -> Result<()> {
        Err(TransportError::NotImplemented("async_send"))
    }

    fn async_receive(
        &self,
        _local: *mut c_void,
        _len: usize,
        _remote: &RemoteEndpoint,
        _extend: &ExtendInfo,
    ) -> Result<()> {
        Err(TransportError::NotImplemented("async_receive"))
    }

    fn register_memory(&self, addr: *mut c_void, len: usize, device: Device) -> Result<()> {
        let Some(live) = self.live() else {
            warn!("register_memory called before start");
            return Err(TransportError::NotReady);
        };
        if addr.is_null() || len == 0 {
            return Err(TransportError::InvalidArgument(format!(
                "invalid memory region {addr:p}+{len}"
            )));
        }
        let addr = addr as usize;
        let kind = MemoryKind::from(device);
        let numa_node = match device {
            Device::Host => self.rdma_numa_node(),
            Device::Cuda(_) => -1,
        };
        self.registry
            .register_with(addr, len, kind, numa_node, || {
                let region = match device {
                    Device::Host => live.ctx.register_ram(addr, len, numa_node),
                    Device::Cuda(gpu) => live.ctx.register_vram(addr, len, gpu.0 as i32),
                };
                region.ok_or_else(|| {
                    TransportError::Registration(format!(
                        "backend returned no region for {addr:#x}+{len} on {device:?}"
                    ))
                })
            })
            .map(|_| ())
            .inspect_err(|e| error!(addr, len, error = %e, "memory registration failed"))
    }

    fn deregister_memory(&self, addr: *mut c_void, len: usize) -> Result<()> {
        let Some(live) = self.live() else {
            warn!("deregister_memory called before start");
            return Err(TransportError::NotReady);
        };
        let addr = addr as usize;
        self.registry
            .deregister_with(addr, len, || live.ctx.deregister(addr, len))
            .inspect_err(|e| warn!(addr, len, error = %e, "memory deregistration failed"))
    }

    fn bind_port(&self) -> u16 {
        self.bind_port.load(Ordering::Relaxed)
    }
}

impl Drop for RdmaTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
