//! Types used in public API

use std::fmt;

use serde::{Deserialize, Serialize};

pub type SmallVec<T> = ::smallvec::SmallVec<[T; 4]>;

/// Identity of a remote transport instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    host: String,
    port: u16,
}

impl RemoteEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CudaDeviceId(pub u8);

/// Where a buffer handed to the transport lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Host,
    Cuda(CudaDeviceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    Ram,
    Vram,
}

impl From<Device> for MemoryKind {
    fn from(device: Device) -> Self {
        match device {
            Device::Host => MemoryKind::Ram,
            Device::Cuda(_) => MemoryKind::Vram,
        }
    }
}

/// Backend handle for a peer transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Reference to an in-flight or completed native transfer request.
/// Every handle returned by the backend must be released exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

/// Per-device native registration key (for verbs backends, the MR rkey).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RegionKey(pub u64);

/// What the backend hands back for a successful registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeRegion {
    pub handles: SmallVec<(u32, RegionKey)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferOpcode {
    /// Remote memory is copied into the local buffer.
    Read,
    /// The local buffer is copied into remote memory.
    Write,
}

/// One blocking data-plane operation, built per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub opcode: TransferOpcode,
    pub local_addr: usize,
    pub remote_addr: u64,
    pub length: usize,
    pub remote_endpoint: RemoteEndpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSegment {
    pub addr: usize,
    pub len: u32,
}

/// Request shape accepted by [`crate::RdmaContext::exec_transfer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub instance_id: InstanceId,
    pub opcode: TransferOpcode,
    pub remote_addr: u64,
    pub segments: SmallVec<BufferSegment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub queue_depth: u32,
    pub max_segment_size: u32,
    /// Negative waits forever.
    pub timeout_ms: i32,
}

impl TransferConfig {
    pub const QUEUE_DEPTH: u32 = 4;
    pub const MAX_SEGMENT_SIZE: u32 = 1024 * 1024;

    pub fn with_timeout(timeout_ms: i32) -> Self {
        Self {
            queue_depth: Self::QUEUE_DEPTH,
            max_segment_size: Self::MAX_SEGMENT_SIZE,
            timeout_ms,
        }
    }
}

/// Side-channel payload of a send/receive call.
///
/// For RDMA the payload has a single element: the raw remote address the
/// transfer reads from or writes to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendInfo(::smallvec::SmallVec<[u64; 1]>);

impl ExtendInfo {
    pub fn from_remote_addr(remote_addr: u64) -> Self {
        Self(::smallvec::smallvec![remote_addr])
    }

    /// The remote address, or `None` if the payload is empty or null.
    pub fn remote_addr(&self) -> Option<u64> {
        self.0.first().copied().filter(|&addr| addr != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
