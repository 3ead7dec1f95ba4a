use std::sync::Arc;

use mockall::automock;

use crate::{
    api::{InstanceId, NativeRegion, RequestHandle, TransferConfig, TransferDescriptor},
    config::BackendConfig,
    error::{NativeStatus, Result},
};

/// Factory for native transport contexts.
#[automock]
pub trait RdmaBackend: Send + Sync {
    fn setup(&self, config: &BackendConfig) -> Result<Arc<dyn RdmaContext>>;
}

/// A live native transport context.
///
/// Implementations must accept concurrent calls from multiple threads.
#[automock]
pub trait RdmaContext: Send + Sync {
    fn instance_id(&self) -> InstanceId;

    /// Brings up the control listener on `port`.
    fn setup_rpc_server(&self, port: u16) -> std::result::Result<(), NativeStatus>;

    fn query_instance_id(
        &self,
        host: &str,
        port: u16,
    ) -> std::result::Result<InstanceId, NativeStatus>;

    /// Submits a transfer and waits for it to finish or time out.
    /// `None` means the backend could not create a request object.
    fn exec_transfer(
        &self,
        descriptor: &TransferDescriptor,
        config: &TransferConfig,
    ) -> Option<RequestHandle>;

    fn request_status(&self, request: RequestHandle) -> NativeStatus;

    fn release_request(&self, request: RequestHandle);

    fn register_ram(&self, addr: usize, len: usize, numa_node: i32) -> Option<NativeRegion>;

    fn register_vram(&self, addr: usize, len: usize, gpu: i32) -> Option<NativeRegion>;

    fn deregister(&self, addr: usize, len: usize) -> bool;

    fn print_perf_info(&self);

    /// Tears down listeners and native resources. Called at most once, after
    /// every in-flight `exec_transfer` issued through this context has returned.
    fn cleanup(&self);
}
