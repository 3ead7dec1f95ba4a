mod affinity;
pub mod api;
mod backend;
mod config;
mod device_selection;
mod error;
mod interface;
mod mr;
mod provider;
mod registry;
mod reporter;
mod retry;
mod topo;
mod transfer;
mod transport;

#[cfg(test)]
mod test_transport;

pub use affinity::{NicNumaAssociation, associate_nics, bind_to_numa_node, primary_numa_node};
pub use backend::{LoopbackBackend, LoopbackFabric};
pub use config::*;
pub use device_selection::{DeviceSelector, rank_based_selection};
pub use error::*;
pub use interface::DataTransport;
pub use mr::{MemoryRegistry, RegisteredMemoryRegion};
pub use provider::{RdmaBackend, RdmaContext};
pub use registry::{
    NodeInfo, ShardedKey, SharedTransferCache, TensorDesc, TensorInfo, TensorMemoryRdmaInfo,
    TensorRdmaInfo, TransferCache, TransferTensorMeta,
};
pub use reporter::{ACTIVITY_WINDOW_MS, ActivityClock, PerfReporter, reporter_tick};
pub use retry::{AttemptError, CountingSleepRetry, RetryError};
pub use topo::{PciAddress, RdmaDeviceInfo, SysfsTopology, TopologyProvider};
pub use transport::{RdmaTransport, TransportState, local_hostname};

pub use provider::{MockRdmaBackend, MockRdmaContext};
pub use topo::MockTopologyProvider;
