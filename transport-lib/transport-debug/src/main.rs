use std::{
    ffi::c_void,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, ensure};
use clap::{Parser, Subcommand};
use logging_lib::LoggingOpts;
use tracing::info;
use transport_lib::{
    DataTransport, DeviceSelector, LoopbackBackend, LoopbackFabric, ParallelConfig,
    RdmaTransport, SysfsTopology, TopologyProvider, TransportOptions,
    api::{Device, ExtendInfo, RemoteEndpoint},
};

#[derive(Parser)]
struct Cli {
    #[command(flatten)]
    logging: LoggingOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print RDMA NICs and, optionally, their ordering for one GPU.
    Topology {
        #[arg(long, default_value = "/")]
        sysfs_root: PathBuf,

        #[arg(long)]
        gpu: Option<u32>,
    },

    /// Print the NICs a process with the given rank would use.
    Select {
        #[arg(long, default_value = "/")]
        sysfs_root: PathBuf,

        #[command(flatten)]
        transport: TransportOptions,

        #[command(flatten)]
        parallel: ParallelConfig,
    },

    /// Start two transports on an in-process fabric and move a buffer
    /// between them.
    SelfTest {
        #[arg(long, default_value = "/")]
        sysfs_root: PathBuf,

        #[arg(long, default_value_t = 1 << 20)]
        size: usize,

        #[arg(long, default_value_t = 8)]
        iterations: usize,

        #[command(flatten)]
        transport: TransportOptions,
    },
}

fn print_topology(sysfs_root: PathBuf, gpu: Option<u32>) -> anyhow::Result<()> {
    let mut topo = SysfsTopology::with_root(sysfs_root);
    topo.init().context("failed to scan topology")?;
    println!("{:<12} {:<14} {:>4}", "NIC", "PCI", "NUMA");
    for dev in topo.rdma_devices() {
        let pci = dev.pci.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        println!("{:<12} {:<14} {:>4}", dev.name, pci, dev.numa_node);
    }
    if let Some(gpu) = gpu {
        println!("nearest to GPU {gpu}: {}", topo.nearest_rdma_devices(gpu)?.join(","));
    }
    topo.shutdown();
    Ok(())
}

fn select(sysfs_root: PathBuf, opts: &TransportOptions, parallel: &ParallelConfig) {
    let mut selector = DeviceSelector::new(Box::new(SysfsTopology::with_root(sysfs_root)));
    let devices =
        selector.select(opts.max_rdma_devices, opts.accelerator_device, parallel.role_rank);
    if devices.is_empty() {
        println!("rank {}: <backend default>", parallel.role_rank);
    } else {
        println!("rank {}: {devices}", parallel.role_rank);
    }
    selector.shutdown();
}

fn start_node(
    fabric: &Arc<LoopbackFabric>,
    host: &str,
    sysfs_root: &PathBuf,
    opts: &TransportOptions,
    rank: u32,
) -> anyhow::Result<RdmaTransport> {
    let transport = RdmaTransport::new(
        Arc::new(LoopbackBackend::new(fabric.clone(), host)),
        DeviceSelector::new(Box::new(SysfsTopology::with_root(sysfs_root))),
    );
    transport
        .start(opts, &ParallelConfig { role_rank: rank })
        .with_context(|| format!("failed to start {host}"))?;
    Ok(transport)
}

fn fill_pattern(buf: &mut [u8], seed: u64) {
    let mut state = seed | 1;
    for b in buf.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *b = state as u8;
    }
}

fn self_test(
    sysfs_root: PathBuf,
    size: usize,
    iterations: usize,
    opts: &TransportOptions,
) -> anyhow::Result<()> {
    ensure!(size > 0, "size must be positive");
    let fabric = LoopbackFabric::new();
    let a = start_node(&fabric, "loopback-a", &sysfs_root, opts, 0)?;
    let b = start_node(&fabric, "loopback-b", &sysfs_root, opts, 1)?;
    let peer = RemoteEndpoint::new("loopback-b", b.bind_port());
    info!(a = a.bind_port(), b = b.bind_port(), "loopback transports started");

    let mut src = vec![0u8; size];
    let mut dst = vec![0u8; size];
    let mut back = vec![0u8; size];
    for (transport, buf) in [(&a, &mut src), (&b, &mut dst), (&a, &mut back)] {
        transport.register_memory(buf.as_mut_ptr() as *mut c_void, size, Device::Host)?;
    }
    let remote = ExtendInfo::from_remote_addr(dst.as_mut_ptr() as u64);

    let mut write_time = Duration::ZERO;
    let mut read_time = Duration::ZERO;
    for i in 0..iterations {
        fill_pattern(&mut src, i as u64);
        let start = Instant::now();
        a.send(src.as_mut_ptr() as *mut c_void, size, &peer, &remote)?;
        write_time += start.elapsed();

        let start = Instant::now();
        a.receive(back.as_mut_ptr() as *mut c_void, size, &peer, &remote)?;
        read_time += start.elapsed();
        ensure!(back == src, "iteration {i}: data mismatch after round trip");
    }

    let total = (size * iterations) as f64;
    println!(
        "{iterations} x {size} bytes: write {:.2} GB/s, read {:.2} GB/s",
        total / write_time.as_secs_f64().max(f64::EPSILON) / 1e9,
        total / read_time.as_secs_f64().max(f64::EPSILON) / 1e9,
    );

    for (transport, buf) in [(&a, &mut src), (&b, &mut dst), (&a, &mut back)] {
        transport.deregister_memory(buf.as_mut_ptr() as *mut c_void, size)?;
    }
    a.stop();
    b.stop();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging_lib::init(&cli.logging)?;

    match cli.command {
        Command::Topology { sysfs_root, gpu } => print_topology(sysfs_root, gpu),
        Command::Select { sysfs_root, transport, parallel } => {
            select(sysfs_root, &transport, &parallel);
            Ok(())
        }
        Command::SelfTest { sysfs_root, size, iterations, transport } => {
            self_test(sysfs_root, size, iterations, &transport)
        }
    }
}
