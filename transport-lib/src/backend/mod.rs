mod loopback;

pub use loopback::{LoopbackBackend, LoopbackFabric};
