use std::{
    ffi::c_void,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering::SeqCst},
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    DataTransport, DeviceSelector, MockRdmaBackend, MockRdmaContext, MockTopologyProvider,
    NicNumaAssociation, RdmaContext, RdmaDeviceInfo, RdmaTransport, TransportError,
    TransportOptions, TransportState,
    api::{
        CudaDeviceId, Device, ExtendInfo, InstanceId, NativeRegion, RegionKey,
        RemoteEndpoint, RequestHandle, TransferOpcode,
    },
    config::ParallelConfig,
    error::{TransferFailure, TransferFailureKind},
};

fn selector() -> DeviceSelector {
    let mut topo = MockTopologyProvider::new();
    topo.expect_is_initialized().return_const(true);
    topo.expect_rdma_devices().returning(Vec::new);
    topo.expect_shutdown().return_const(());
    DeviceSelector::new(Box::new(topo))
}

fn opts() -> TransportOptions {
    TransportOptions {
        enable_perf_metrics: false,
        start_settle_ms: 0,
        send_retry_sleep_ms: 0,
        receive_retry_sleep_ms: 0,
        ..Default::default()
    }
}

fn transport_with(ctx: MockRdmaContext) -> RdmaTransport {
    transport_with_selector(ctx, selector())
}

fn transport_with_selector(ctx: MockRdmaContext, selector: DeviceSelector) -> RdmaTransport {
    let ctx: Arc<dyn RdmaContext> = Arc::new(ctx);
    let mut backend = MockRdmaBackend::new();
    backend.expect_setup().times(1).return_once(move |_| Ok(ctx));
    RdmaTransport::new(Arc::new(backend), selector)
}

/// Context that listens on the first port it is offered and is torn down once.
fn listening_ctx() -> MockRdmaContext {
    let mut ctx = MockRdmaContext::new();
    ctx.expect_setup_rpc_server().times(1).returning(|_| Ok(()));
    ctx.expect_cleanup().times(1).return_const(());
    ctx
}

fn region(key: u64) -> NativeRegion {
    NativeRegion { handles: [(0, RegionKey(key))].into_iter().collect() }
}

fn peer() -> RemoteEndpoint {
    RemoteEndpoint::new("peer", 51999)
}

#[test]
fn test_start_stop_lifecycle() {
    let transport = transport_with(listening_ctx());
    assert_eq!(transport.state(), TransportState::Uninitialized);
    assert_eq!(transport.bind_port(), 0);

    let opts = TransportOptions {
        meta_service_address: "meta:9000".into(),
        read_timeout_ms: 1500,
        ..opts()
    };
    transport.start(&opts, &ParallelConfig::default()).unwrap();
    assert_eq!(transport.state(), TransportState::Running);
    assert!(transport.is_running());
    assert!((51010..52010).contains(&transport.bind_port()));
    assert_eq!(transport.meta_addr(), "meta:9000");
    assert_eq!(transport.read_timeout_ms(), Some(1500));
    assert_eq!(transport.write_timeout_ms(), Some(-1));
    assert_eq!(transport.rdma_numa_node(), -1);
    assert!(!transport.local_server_name().is_empty());

    transport.stop();
    assert_eq!(transport.state(), TransportState::Stopped);
    assert_eq!(transport.read_timeout_ms(), None);
    transport.stop();
    assert_eq!(transport.state(), TransportState::Stopped);
}

#[test]
fn test_start_twice_is_rejected() {
    let transport = transport_with(listening_ctx());
    transport.start(&opts(), &ParallelConfig::default()).unwrap();
    let err = transport.start(&opts(), &ParallelConfig::default()).unwrap_err();
    assert!(matches!(err, TransportError::Setup(_)));
    assert_eq!(transport.state(), TransportState::Running);
}

#[test]
fn test_dynamic_port_retry() {
    let tried = Arc::new(Mutex::new(Vec::new()));
    let mut ctx = MockRdmaContext::new();
    let sink = tried.clone();
    ctx.expect_setup_rpc_server().times(4).returning(move |port| {
        let mut tried = sink.lock().unwrap();
        tried.push(port);
        if tried.len() <= 3 { Err(-libc::EADDRINUSE) } else { Ok(()) }
    });
    ctx.expect_cleanup().times(1).return_const(());
    let transport = transport_with(ctx);

    transport.start(&opts(), &ParallelConfig::default()).unwrap();
    let tried = tried.lock().unwrap().clone();
    let base = tried[0];
    assert!((51010..52010).contains(&base));
    assert_eq!(tried, [base, base + 1, base + 2, base + 3]);
    assert_eq!(transport.bind_port(), base + 3);
}

#[test]
fn test_dynamic_port_exhausted() {
    let mut ctx = MockRdmaContext::new();
    ctx.expect_setup_rpc_server().times(4).returning(|_| Err(-libc::EADDRINUSE));
    ctx.expect_cleanup().times(1).return_const(());
    let transport = transport_with(ctx);

    let opts = TransportOptions { bind_port_max_retry: 4, ..opts() };
    let err = transport.start(&opts, &ParallelConfig::default()).unwrap_err();
    assert!(matches!(err, TransportError::PortBind { attempts: 4, .. }));
    assert_eq!(transport.state(), TransportState::Uninitialized);
    assert_eq!(transport.bind_port(), 0);
}

#[test]
fn test_fixed_port() {
    let mut ctx = MockRdmaContext::new();
    ctx.expect_setup_rpc_server()
        .withf(|port| *port == 52345)
        .times(1)
        .returning(|_| Ok(()));
    ctx.expect_cleanup().times(1).return_const(());
    let transport = transport_with(ctx);

    let opts = TransportOptions { service_fixed_port: true, local_port: 52345, ..opts() };
    transport.start(&opts, &ParallelConfig::default()).unwrap();
    assert_eq!(transport.bind_port(), 52345);
}

#[test]
fn test_fixed_port_failure_is_fatal() {
    let mut ctx = MockRdmaContext::new();
    ctx.expect_setup_rpc_server().times(1).returning(|_| Err(-libc::EADDRINUSE));
    ctx.expect_cleanup().times(1).return_const(());
    let transport = transport_with(ctx);

    let opts = TransportOptions { service_fixed_port: true, local_port: 52345, ..opts() };
    let err = transport.start(&opts, &ParallelConfig::default()).unwrap_err();
    assert!(matches!(err, TransportError::PortBind { base_port: 52345, attempts: 1 }));
}

#[test]
fn test_context_setup_failure() {
    let mut backend = MockRdmaBackend::new();
    backend
        .expect_setup()
        .times(1)
        .returning(|_| Err(TransportError::Setup("no devices".into())));
    let transport = RdmaTransport::new(Arc::new(backend), selector());

    let err = transport.start(&opts(), &ParallelConfig::default()).unwrap_err();
    assert!(matches!(err, TransportError::Setup(_)));
    assert_eq!(transport.state(), TransportState::Uninitialized);
}

#[test]
fn test_device_selection_feeds_backend_and_numa() {
    let mut topo = MockTopologyProvider::new();
    topo.expect_is_initialized().return_const(true);
    topo.expect_rdma_devices().returning(|| {
        vec![
            RdmaDeviceInfo { name: "mlx5_0".into(), pci: None, numa_node: 0 },
            RdmaDeviceInfo { name: "mlx5_1".into(), pci: None, numa_node: 1 },
        ]
    });
    topo.expect_device_numa_node().returning(|name| if name == "mlx5_1" { 1 } else { 0 });
    topo.expect_shutdown().return_const(());

    let mut ctx = listening_ctx();
    ctx.expect_register_ram()
        .withf(|_, _, numa| *numa == 1)
        .times(1)
        .returning(|_, _, _| Some(region(1)));
    ctx.expect_deregister().times(1).return_const(true);
    let ctx: Arc<dyn RdmaContext> = Arc::new(ctx);
    let mut backend = MockRdmaBackend::new();
    backend
        .expect_setup()
        .withf(|config| config.rdma.device_pattern.as_deref() == Some("mlx5_1"))
        .times(1)
        .return_once(move |_| Ok(ctx));
    let transport = RdmaTransport::new(Arc::new(backend), DeviceSelector::new(Box::new(topo)));

    transport.start(&opts(), &ParallelConfig { role_rank: 1 }).unwrap();
    assert_eq!(
        transport.nic_numa_nodes(),
        [NicNumaAssociation { device_name: "mlx5_1".into(), numa_node: 1 }]
    );
    assert_eq!(transport.rdma_numa_node(), 1);

    let mut buf = vec![0u8; 64];
    transport
        .register_memory(buf.as_mut_ptr() as *mut c_void, buf.len(), Device::Host)
        .unwrap();
}

#[test]
fn test_not_ready() {
    let backend = MockRdmaBackend::new();
    let transport = RdmaTransport::new(Arc::new(backend), selector());
    let mut buf = vec![0u8; 8];
    let ptr = buf.as_mut_ptr() as *mut c_void;
    let extend = ExtendInfo::from_remote_addr(0x1000);

    assert!(matches!(transport.send(ptr, 8, &peer(), &extend), Err(TransportError::NotReady)));
    assert!(matches!(
        transport.receive(ptr, 8, &peer(), &extend),
        Err(TransportError::NotReady)
    ));
    assert!(matches!(
        transport.register_memory(ptr, 8, Device::Host),
        Err(TransportError::NotReady)
    ));
    assert!(matches!(transport.deregister_memory(ptr, 8), Err(TransportError::NotReady)));
}

#[test]
fn test_invalid_arguments_are_not_retried() {
    let mut ctx = listening_ctx();
    ctx.expect_query_instance_id().never();
    ctx.expect_exec_transfer().never();
    let transport = transport_with(ctx);
    transport.start(&opts(), &ParallelConfig::default()).unwrap();

    let mut buf = vec![0u8; 8];
    let ptr = buf.as_mut_ptr() as *mut c_void;
    let extend = ExtendInfo::from_remote_addr(0x1000);

    let err = transport.send(std::ptr::null_mut(), 8, &peer(), &extend).unwrap_err();
    assert!(matches!(err, TransportError::InvalidArgument(_)));
    let err = transport.receive(ptr, 0, &peer(), &extend).unwrap_err();
    assert!(matches!(err, TransportError::InvalidArgument(_)));
    let err = transport.send(ptr, 8, &peer(), &ExtendInfo::default()).unwrap_err();
    assert!(matches!(err, TransportError::InvalidArgument(_)));
    let err = transport.register_memory(std::ptr::null_mut(), 8, Device::Host).unwrap_err();
    assert!(matches!(err, TransportError::InvalidArgument(_)));
}

#[test]
fn test_send_exhausts_retries_and_releases_every_request() {
    let submitted = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(Mutex::new(Vec::new()));

    let mut ctx = listening_ctx();
    ctx.expect_query_instance_id()
        .withf(|host, port| host == "peer" && *port == 51999)
        .returning(|_, _| Ok(InstanceId(3)));
    let counter = submitted.clone();
    ctx.expect_exec_transfer().returning(move |desc, config| {
        assert_eq!(desc.opcode, TransferOpcode::Write);
        assert_eq!(desc.remote_addr, 0xabc000);
        assert_eq!(config.timeout_ms, 700);
        Some(RequestHandle(counter.fetch_add(1, SeqCst) as u64))
    });
    ctx.expect_request_status().return_const(-libc::ETIMEDOUT);
    let sink = released.clone();
    ctx.expect_release_request().returning(move |handle| sink.lock().unwrap().push(handle));
    let transport = transport_with(ctx);

    let opts = TransportOptions { send_retry_count: 3, write_timeout_ms: 700, ..opts() };
    transport.start(&opts, &ParallelConfig::default()).unwrap();

    let mut buf = vec![0u8; 128];
    let err = transport
        .send(
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            &peer(),
            &ExtendInfo::from_remote_addr(0xabc000),
        )
        .unwrap_err();
    match err {
        TransportError::Transfer(TransferFailure {
            kind: TransferFailureKind::Completion,
            status,
            instance_id,
            length,
            ..
        }) => {
            assert_eq!(status, Some(-libc::ETIMEDOUT));
            assert_eq!(instance_id, Some(InstanceId(3)));
            assert_eq!(length, 128);
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(submitted.load(SeqCst), 3);
    assert_eq!(
        *released.lock().unwrap(),
        [RequestHandle(0), RequestHandle(1), RequestHandle(2)]
    );
}

#[test]
fn test_receive_uses_read_settings() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut ctx = listening_ctx();
    ctx.expect_query_instance_id().returning(|_, _| Ok(InstanceId(3)));
    let sink = calls.clone();
    ctx.expect_exec_transfer().returning(move |desc, config| {
        sink.lock().unwrap().push((desc.opcode, config.timeout_ms));
        Some(RequestHandle(1))
    });
    ctx.expect_request_status().return_const(-1);
    ctx.expect_release_request().return_const(());
    let transport = transport_with(ctx);

    let opts = TransportOptions {
        receive_retry_count: 2,
        read_timeout_ms: 250,
        send_retry_count: 5,
        write_timeout_ms: 900,
        ..opts()
    };
    transport.start(&opts, &ParallelConfig::default()).unwrap();

    let mut buf = vec![0u8; 16];
    let result = transport.receive(
        buf.as_mut_ptr() as *mut c_void,
        buf.len(),
        &peer(),
        &ExtendInfo::from_remote_addr(0x5000),
    );
    assert!(matches!(result, Err(TransportError::Transfer(_))));
    assert_eq!(*calls.lock().unwrap(), [(TransferOpcode::Read, 250), (TransferOpcode::Read, 250)]);
}

#[test]
fn test_register_and_deregister() {
    let mut ctx = listening_ctx();
    ctx.expect_register_ram().times(1).returning(|_, _, _| Some(region(11)));
    ctx.expect_register_vram()
        .withf(|_, _, gpu| *gpu == 2)
        .times(1)
        .returning(|_, _, _| None);
    let deregistered = Arc::new(Mutex::new(Vec::new()));
    let sink = deregistered.clone();
    ctx.expect_deregister().returning(move |addr, len| {
        sink.lock().unwrap().push((addr, len));
        true
    });
    let transport = transport_with(ctx);
    transport.start(&opts(), &ParallelConfig::default()).unwrap();

    let mut host = vec![0u8; 256];
    let host_ptr = host.as_mut_ptr() as *mut c_void;
    transport.register_memory(host_ptr, 256, Device::Host).unwrap();
    transport.register_memory(host_ptr, 256, Device::Host).unwrap();
    assert_eq!(transport.registered_regions(), 1);

    let mut gpu = vec![0u8; 64];
    let err = transport
        .register_memory(gpu.as_mut_ptr() as *mut c_void, 64, Device::Cuda(CudaDeviceId(2)))
        .unwrap_err();
    assert!(matches!(err, TransportError::Registration(_)));
    assert_eq!(transport.registered_regions(), 1);

    let err = transport.deregister_memory(host_ptr, 128).unwrap_err();
    assert!(matches!(err, TransportError::UnknownRegion { len: 128, .. }));
    assert!(deregistered.lock().unwrap().is_empty());

    transport.deregister_memory(host_ptr, 256).unwrap();
    assert_eq!(transport.registered_regions(), 0);

    transport.stop();
    assert_eq!(*deregistered.lock().unwrap(), [(host_ptr as usize, 256)]);
}

#[test]
fn test_stop_releases_remaining_registrations() {
    let mut ctx = listening_ctx();
    ctx.expect_register_ram().times(2).returning(|addr, _, _| Some(region(addr as u64)));
    let deregistered = Arc::new(Mutex::new(Vec::new()));
    let sink = deregistered.clone();
    ctx.expect_deregister().returning(move |addr, len| {
        sink.lock().unwrap().push((addr, len));
        true
    });
    let transport = transport_with(ctx);
    transport.start(&opts(), &ParallelConfig::default()).unwrap();

    let mut a = vec![0u8; 16];
    let mut b = vec![0u8; 32];
    transport.register_memory(a.as_mut_ptr() as *mut c_void, 16, Device::Host).unwrap();
    transport.register_memory(b.as_mut_ptr() as *mut c_void, 32, Device::Host).unwrap();

    transport.stop();
    let mut released = deregistered.lock().unwrap().clone();
    released.sort();
    let mut expected = vec![(a.as_ptr() as usize, 16), (b.as_ptr() as usize, 32)];
    expected.sort();
    assert_eq!(released, expected);
    assert_eq!(transport.registered_regions(), 0);
}

#[test]
fn test_concurrent_stop_cleans_up_once() {
    let transport = Arc::new(transport_with(listening_ctx()));
    let opts = TransportOptions { enable_perf_metrics: true, perf_stats_interval_ms: 3_600_000, ..opts() };
    transport.start(&opts, &ParallelConfig::default()).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let transport = transport.clone();
            thread::spawn(move || transport.stop())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(transport.state(), TransportState::Stopped);
}

#[test]
fn test_stop_waits_for_in_flight_transfer() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

    let mut ctx = MockRdmaContext::new();
    ctx.expect_setup_rpc_server().times(1).returning(|_| Ok(()));
    ctx.expect_query_instance_id().returning(|_, _| Ok(InstanceId(3)));
    let sink = events.clone();
    ctx.expect_exec_transfer().times(1).returning(move |_, _| {
        sink.lock().unwrap().push("exec_start");
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        sink.lock().unwrap().push("exec_end");
        Some(RequestHandle(1))
    });
    ctx.expect_request_status().return_const(0);
    ctx.expect_release_request().return_const(());
    let sink = events.clone();
    ctx.expect_cleanup().times(1).returning(move || sink.lock().unwrap().push("cleanup"));
    let transport = Arc::new(transport_with(ctx));
    transport.start(&opts(), &ParallelConfig::default()).unwrap();

    let sender = {
        let transport = transport.clone();
        thread::spawn(move || {
            let mut buf = vec![0u8; 64];
            transport.send(
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                &peer(),
                &ExtendInfo::from_remote_addr(0x1000),
            )
        })
    };
    started_rx.recv().unwrap();

    let stopper = {
        let transport = transport.clone();
        thread::spawn(move || transport.stop())
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!events.lock().unwrap().contains(&"cleanup"));
    assert_ne!(transport.state(), TransportState::Stopped);

    release_tx.send(()).unwrap();
    sender.join().unwrap().unwrap();
    stopper.join().unwrap();
    assert_eq!(*events.lock().unwrap(), ["exec_start", "exec_end", "cleanup"]);
    assert_eq!(transport.state(), TransportState::Stopped);
}

#[test]
fn test_stop_before_start() {
    let backend = MockRdmaBackend::new();
    let transport = RdmaTransport::new(Arc::new(backend), selector());
    transport.stop();
    assert_eq!(transport.state(), TransportState::Stopped);
    let err = transport.start(&opts(), &ParallelConfig::default()).unwrap_err();
    assert!(matches!(err, TransportError::Setup(_)));
}

#[test]
fn test_async_entry_points_are_not_implemented() {
    let backend = MockRdmaBackend::new();
    let transport = RdmaTransport::new(Arc::new(backend), selector());
    let mut buf = vec![0u8; 8];
    let ptr = buf.as_mut_ptr() as *mut c_void;
    let extend = ExtendInfo::from_remote_addr(0x1000);
    assert!(matches!(
        transport.async_send(ptr, 8, &peer(), &extend),
        Err(TransportError::NotImplemented("async_send"))
    ));
    assert!(matches!(
        transport.async_receive(ptr, 8, &peer(), &extend),
        Err(TransportError::NotImplemented("async_receive"))
    ));
}

#[test]
fn test_perf_reporter_dumps_after_activity() {
    let dumps = Arc::new(AtomicUsize::new(0));
    let mut ctx = listening_ctx();
    ctx.expect_query_instance_id().returning(|_, _| Ok(InstanceId(1)));
    ctx.expect_exec_transfer().returning(|_, _| Some(RequestHandle(1)));
    ctx.expect_request_status().return_const(0);
    ctx.expect_release_request().return_const(());
    let counter = dumps.clone();
    ctx.expect_print_perf_info().returning(move || {
        counter.fetch_add(1, SeqCst);
    });
    let transport = transport_with(ctx);

    let opts = TransportOptions { enable_perf_metrics: true, perf_stats_interval_ms: 10, ..opts() };
    transport.start(&opts, &ParallelConfig::default()).unwrap();

    let mut buf = vec![0u8; 8];
    let ptr = buf.as_mut_ptr() as *mut c_void;
    let deadline = Instant::now() + Duration::from_secs(10);
    while dumps.load(SeqCst) == 0 && Instant::now() < deadline {
        transport.send(ptr, 8, &peer(), &ExtendInfo::from_remote_addr(0x1000)).unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    transport.stop();
    assert!(dumps.load(SeqCst) > 0);
}
