use crate::api::{InstanceId, RemoteEndpoint};

pub type Result<T> = std::result::Result<T, TransportError>;

/// Native status code reported by the backend. Zero means success.
pub type NativeStatus = i32;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport context not initialized")]
    NotReady,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("failed to bind RPC server on {attempts} ports starting at {base_port}")]
    PortBind { base_port: u16, attempts: u32 },
    #[error("memory registration failed: {0}")]
    Registration(String),
    #[error("memory region {addr:#x}+{len} is not registered")]
    UnknownRegion { addr: usize, len: usize },
    #[error("backend refused to deregister memory region {addr:#x}+{len}")]
    Deregistration { addr: usize, len: usize },
    #[error("{0}")]
    Transfer(#[from] TransferFailure),
    #[error("non-retryable transfer error: {0}")]
    NonRetryable(String),
    #[error(
        "tensor shape mismatch for key {key}: expected {expected:?}, got {actual:?} from {node}"
    )]
    ShapeMismatch { key: String, expected: Vec<i64>, actual: Vec<i64>, node: String },
    #[error("illegal state: location record has no tensor handle")]
    MissingTensor,
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
    #[error("topology error: {0}")]
    Topology(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFailureKind {
    /// Resolving `(host, port)` to an instance id failed.
    InstanceLookup,
    /// The backend did not hand back a request object.
    NullSubmission,
    /// The request completed with a non-success status.
    Completion,
}

/// Diagnostic record of one failed transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "{kind:?} failure (status {status:?}), remote_addr={endpoint}, inst_id={instance_id:?}, \
     laddr={local_addr:#x}, raddr={remote_addr:#x}, length={length}"
)]
pub struct TransferFailure {
    pub kind: TransferFailureKind,
    pub status: Option<NativeStatus>,
    pub endpoint: RemoteEndpoint,
    pub instance_id: Option<InstanceId>,
    pub local_addr: usize,
    pub remote_addr: u64,
    pub length: usize,
}
