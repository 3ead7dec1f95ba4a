use std::path::PathBuf;

use clap::Args;

pub const DEFAULT_LOG_DIR: &str = "/tmp/astate";
pub const DEFAULT_TIMEOUT_MS: i32 = -1;
pub const DEFAULT_NUM_POLLERS: u32 = 1;
pub const DEFAULT_MAX_RDMA_DEVICES: usize = 1;
pub const DEFAULT_PERF_STATS_INTERVAL_MS: u64 = 500;
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_RETRY_SLEEP_MS: u64 = 100;
pub const DEFAULT_BIND_PORT_MAX_RETRY: u32 = 10;
pub const DEFAULT_START_SETTLE_MS: u64 = 1000;

/// Base of the dynamic RPC port range. Candidates start at a random offset
/// in `0..DYNAMIC_PORT_SPAN` above it.
pub const DYNAMIC_PORT_BASE: u16 = 51010;
pub const DYNAMIC_PORT_SPAN: u16 = 1000;

pub const LOG_FILE_PREFIX: &str = "utrans";
pub const LOG_MAX_FILE_COUNT: u32 = 16;
pub const LOG_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Address of the meta service used by upper layers for discovery.
    #[arg(long, env = "ASTATE_META_SERVICE_ADDRESS", default_value = "")]
    pub meta_service_address: String,

    /// Receive (RDMA read) timeout in milliseconds, -1 waits forever.
    #[arg(
        long,
        env = "ASTATE_READ_TIMEOUT_MS",
        default_value_t = DEFAULT_TIMEOUT_MS,
        allow_negative_numbers = true
    )]
    pub read_timeout_ms: i32,

    /// Send (RDMA write) timeout in milliseconds, -1 waits forever.
    #[arg(
        long,
        env = "ASTATE_WRITE_TIMEOUT_MS",
        default_value_t = DEFAULT_TIMEOUT_MS,
        allow_negative_numbers = true
    )]
    pub write_timeout_ms: i32,

    #[arg(long, env = "ASTATE_RDMA_NUM_POLLERS", default_value_t = DEFAULT_NUM_POLLERS)]
    pub rdma_num_pollers: u32,

    #[arg(long, env = "ASTATE_MAX_RDMA_DEVICES", default_value_t = DEFAULT_MAX_RDMA_DEVICES)]
    pub max_rdma_devices: usize,

    /// Bind the starting thread's CPUs and memory to the NIC's NUMA node.
    #[arg(long, env = "ASTATE_ENABLE_NUMA_ALLOCATION")]
    pub enable_numa_allocation: bool,

    /// Listen on `local_port` only instead of probing a random port range.
    #[arg(long, env = "ASTATE_SERVICE_FIXED_PORT")]
    pub service_fixed_port: bool,

    #[arg(long, env = "ASTATE_LOCAL_PORT", default_value_t = 0)]
    pub local_port: u16,

    #[arg(
        long,
        env = "ASTATE_ENABLE_PERF_METRICS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_perf_metrics: bool,

    #[arg(
        long,
        env = "ASTATE_PERF_STATS_INTERVAL_MS",
        default_value_t = DEFAULT_PERF_STATS_INTERVAL_MS
    )]
    pub perf_stats_interval_ms: u64,

    #[arg(long, env = "ASTATE_SEND_RETRY_COUNT", default_value_t = DEFAULT_RETRY_COUNT)]
    pub send_retry_count: u32,

    #[arg(
        long,
        env = "ASTATE_SEND_RETRY_SLEEP_MS",
        default_value_t = DEFAULT_RETRY_SLEEP_MS
    )]
    pub send_retry_sleep_ms: u64,

    #[arg(long, env = "ASTATE_RECEIVE_RETRY_COUNT", default_value_t = DEFAULT_RETRY_COUNT)]
    pub receive_retry_count: u32,

    #[arg(
        long,
        env = "ASTATE_RECEIVE_RETRY_SLEEP_MS",
        default_value_t = DEFAULT_RETRY_SLEEP_MS
    )]
    pub receive_retry_sleep_ms: u64,

    #[arg(
        long,
        env = "ASTATE_BIND_PORT_MAX_RETRY",
        default_value_t = DEFAULT_BIND_PORT_MAX_RETRY
    )]
    pub bind_port_max_retry: u32,

    /// Delay after listener bring-up before `start` returns.
    #[arg(long, env = "ASTATE_START_SETTLE_MS", default_value_t = DEFAULT_START_SETTLE_MS)]
    pub start_settle_ms: u64,

    #[arg(long, env = "ASTATE_LOG_DIR", default_value = DEFAULT_LOG_DIR)]
    pub log_dir: PathBuf,

    /// Locally active accelerator index. Enables topology-aware NIC selection.
    #[arg(long, env = "ASTATE_ACCELERATOR_DEVICE")]
    pub accelerator_device: Option<u32>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            meta_service_address: String::new(),
            read_timeout_ms: DEFAULT_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_TIMEOUT_MS,
            rdma_num_pollers: DEFAULT_NUM_POLLERS,
            max_rdma_devices: DEFAULT_MAX_RDMA_DEVICES,
            enable_numa_allocation: false,
            service_fixed_port: false,
            local_port: 0,
            enable_perf_metrics: true,
            perf_stats_interval_ms: DEFAULT_PERF_STATS_INTERVAL_MS,
            send_retry_count: DEFAULT_RETRY_COUNT,
            send_retry_sleep_ms: DEFAULT_RETRY_SLEEP_MS,
            receive_retry_count: DEFAULT_RETRY_COUNT,
            receive_retry_sleep_ms: DEFAULT_RETRY_SLEEP_MS,
            bind_port_max_retry: DEFAULT_BIND_PORT_MAX_RETRY,
            start_settle_ms: DEFAULT_START_SETTLE_MS,
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            accelerator_device: None,
        }
    }
}

#[derive(Args, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParallelConfig {
    /// Rank of this process within its role, used to spread NIC choices.
    #[arg(long, env = "ASTATE_ROLE_RANK", default_value_t = 0)]
    pub role_rank: u32,
}

/// Log sink handed to the native backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendLogConfig {
    pub dir: String,
    pub file_name: String,
    pub max_file_count: u32,
    pub max_file_size: u64,
    pub self_delete: bool,
}

impl BackendLogConfig {
    pub fn new(dir: &std::path::Path, pid: u32) -> Self {
        let dir = truncate_to(&dir.to_string_lossy(), libc::PATH_MAX as usize - 1);
        let file_name =
            truncate_to(&format!("{LOG_FILE_PREFIX}-{pid}"), NAME_MAX - 1);
        Self {
            dir,
            file_name,
            max_file_count: LOG_MAX_FILE_COUNT,
            max_file_size: LOG_MAX_FILE_SIZE,
            self_delete: true,
        }
    }
}

const NAME_MAX: usize = 255;

/// Truncates to at most `max` bytes without splitting a character.
fn truncate_to(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_owned()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RdmaBackendConfig {
    pub num_pollers: u32,
    /// Comma-joined NIC names. `None` lets the backend choose.
    pub device_pattern: Option<String>,
}

/// Everything the native backend needs to create a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub log: BackendLogConfig,
    pub rdma: RdmaBackendConfig,
}

impl BackendConfig {
    pub fn new(opts: &TransportOptions, device_pattern: String) -> Self {
        Self {
            log: BackendLogConfig::new(&opts.log_dir, std::process::id()),
            rdma: RdmaBackendConfig {
                num_pollers: opts.rdma_num_pollers,
                device_pattern: (!device_pattern.is_empty()).then_some(device_pattern),
            },
        }
    }
}
