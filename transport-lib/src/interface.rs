use std::ffi::c_void;

use crate::{
    api::{Device, ExtendInfo, RemoteEndpoint},
    config::{ParallelConfig, TransportOptions},
    error::Result,
};

/// Capability surface of a blocking data transport.
pub trait DataTransport: Send + Sync {
    fn start(&self, opts: &TransportOptions, parallel: &ParallelConfig) -> Result<()>;

    fn stop(&self);

    /// Writes `len` bytes at `local` into the remote address carried by `extend`.
    fn send(
        &self,
        local: *mut c_void,
        len: usize,
        remote: &RemoteEndpoint,
        extend: &ExtendInfo,
    ) -> Result<()>;

    /// Reads `len` bytes from the remote address carried by `extend` into `local`.
    fn receive(
        &self,
        local: *mut c_void,
        len: usize,
        remote: &RemoteEndpoint,
        extend: &ExtendInfo,
    ) -> Result<()>;

    fn async_send(
        &self,
        local: *mut c_void,
        len: usize,
        remote: &RemoteEndpoint,
        extend: &ExtendInfo,
    ) -> Result<()>;

    fn async_receive(
        &self,
        local: *mut c_void,
        len: usize,
        remote: &RemoteEndpoint,
        extend: &ExtendInfo,
    ) -> Result<()>;

    fn register_memory(&self, addr: *mut c_void, len: usize, device: Device) -> Result<()>;

    fn deregister_memory(&self, addr: *mut c_void, len: usize) -> Result<()>;

    /// Port the control listener is bound to, 0 before `start`.
    fn bind_port(&self) -> u16;
}
