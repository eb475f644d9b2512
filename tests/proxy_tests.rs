extern crate multicl;

use multicl::mock::{MockBackend, MockDevice, MockGraphicsObject, MockPlatform};
use multicl::{
    DeviceTypeFilter, DiscoveryError, EventGroup, ExecutionStatus, KernelArgument, KernelSource,
    MemFlags, NativeOp, ProxyError, RangeMode, Session, SessionConfig,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn backend() -> MockBackend {
    MockBackend::new()
        .with_platform(
            MockPlatform::new("Alpha")
                .with_device(MockDevice::gpu("alpha-gpu"))
                .with_device(MockDevice::cpu("alpha-cpu")),
        )
        .with_platform(MockPlatform::new("Beta").with_device(MockDevice::gpu("beta-gpu")))
        .with_kernel("fill", |launch| {
            let value: u32 = launch.scalar(1)?;
            let count = launch.global_size();
            launch.write(0, &vec![value; count])
        })
        .with_kernel("increment", |launch| {
            let values: Vec<u32> = launch.read(0)?;
            let next: Vec<u32> = values.iter().map(|v| v + 1).collect();
            launch.write(0, &next)
        })
}

fn names<B: multicl::ComputeBackend>(devices: &multicl::DeviceGroup<B>) -> Vec<String> {
    devices.devices().map(|device| device.label.device.clone()).collect()
}

#[test]
fn all_devices_are_cpu_then_gpu_per_platform() {
    init();
    let session = Session::new(backend());
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    assert_eq!(names(&devices), vec!["alpha-cpu", "alpha-gpu", "beta-gpu"]);
    let ids: Vec<usize> = devices.devices().map(|device| device.id().index()).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(devices.platforms().len(), 2);
}

#[test]
fn native_all_query_keeps_native_order() {
    let session = Session::new(backend().with_all_query());
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    assert_eq!(names(&devices), vec!["alpha-gpu", "alpha-cpu", "beta-gpu"]);
}

#[test]
fn platforms_without_matching_devices_are_skipped() {
    let session = Session::new(backend());
    let devices = session.discover(DeviceTypeFilter::Cpu).unwrap();
    assert_eq!(names(&devices), vec!["alpha-cpu"]);
    let infos = devices.platform_infos();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].name, "Alpha");

    let devices = session.discover(DeviceTypeFilter::Default).unwrap();
    assert_eq!(names(&devices), vec!["alpha-gpu", "beta-gpu"]);
}

#[test]
fn discovery_failures() {
    let session = Session::new(MockBackend::new());
    assert!(matches!(
        session.discover(DeviceTypeFilter::All),
        Err(ProxyError::Discovery(DiscoveryError::NoPlatforms))
    ));

    let session = Session::new(
        MockBackend::new().with_platform(MockPlatform::new("Empty").with_device(MockDevice::gpu("g"))),
    );
    assert!(matches!(
        session.discover(DeviceTypeFilter::Cpu),
        Err(ProxyError::Discovery(DiscoveryError::NoDevices(DeviceTypeFilter::Cpu)))
    ));
}

#[test]
fn one_context_per_platform() {
    let session = Session::new(backend());
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    let contexts = session.create_contexts(&devices, false).unwrap();
    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts.device_count(), 3);
    assert_eq!(session.backend().live_contexts(), 2);
    drop(contexts);
    assert_eq!(session.backend().live_contexts(), 0);
}

#[test]
fn failed_context_leaves_nothing_alive() {
    let backend = MockBackend::new()
        .with_platform(MockPlatform::new("Good").with_device(MockDevice::gpu("g")))
        .with_platform(
            MockPlatform::new("Bad")
                .with_device(MockDevice::gpu("b"))
                .failing_context("driver refused"),
        );
    let session = Session::new(backend);
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    match session.create_contexts(&devices, false).unwrap_err() {
        ProxyError::ContextCreation { platform, .. } => assert_eq!(platform, "Bad"),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(session.backend().live_contexts(), 0);
}

#[test]
fn interop_needs_every_platform() {
    let backend = MockBackend::new()
        .with_platform(
            MockPlatform::new("Shared")
                .with_device(MockDevice::gpu("g"))
                .with_interop(),
        )
        .with_platform(MockPlatform::new("Plain").with_device(MockDevice::gpu("p")));
    let session = Session::new(backend);
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    session.backend().reset_calls();
    match session.create_contexts(&devices, true).unwrap_err() {
        ProxyError::InteropUnsupported { platform } => assert_eq!(platform, "Plain"),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(session.backend().native_calls(), 0);
}

#[test]
fn write_then_read_round_trip() {
    let session = Session::new(backend());
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    let contexts = session.create_contexts(&devices, false).unwrap();
    let buffer = session
        .create_buffer(&contexts, MemFlags::ReadWrite, 32)
        .unwrap();
    let queues = session.create_command_queue(&contexts).unwrap();

    let data: Vec<f32> = vec![0.5, 1.5, 2.5, 3.5];
    session
        .write_buffer(&queues, &buffer, true, 8, 16, &data, &[])
        .unwrap();
    let mut result = [0.0f32; 4];
    session
        .read_buffer(&queues, &buffer, true, 8, 16, &mut result, &[])
        .unwrap();
    assert_eq!(result.to_vec(), data);

    let mut head = [1.0f32; 2];
    session
        .read_buffer(&queues, &buffer, true, 0, 8, &mut head, &[])
        .unwrap();
    assert_eq!(head, [0.0, 0.0]);
}

#[test]
fn copy_is_idempotent() {
    let session = Session::new(backend());
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    let contexts = session.create_contexts(&devices, false).unwrap();
    let src = session
        .create_buffer(&contexts, MemFlags::ReadOnly, 16)
        .unwrap();
    let dst = session
        .create_buffer(&contexts, MemFlags::WriteOnly, 16)
        .unwrap();
    let queues = session.create_command_queue(&contexts).unwrap();

    session
        .write_buffer(&queues, &src, true, 0, 16, &[1u32, 2, 3, 4], &[])
        .unwrap();
    for _ in 0..2 {
        session
            .copy_buffer(&queues, &src, &dst, 4, 0, 8, &[])
            .unwrap();
        let mut result = [0u32; 4];
        session
            .read_buffer(&queues, &dst, true, 0, 16, &mut result, &[])
            .unwrap();
        assert_eq!(result, [2, 3, 0, 0]);
    }
}

#[test]
fn invalid_arguments_never_reach_the_devices() {
    let session = Session::new(backend());
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    let contexts = session.create_contexts(&devices, false).unwrap();
    let buffer = session
        .create_buffer(&contexts, MemFlags::ReadWrite, 16)
        .unwrap();
    let small = session
        .create_buffer(&contexts, MemFlags::ReadWrite, 4)
        .unwrap();
    let mut program = session
        .create_program(&contexts, &KernelSource::from("fill"))
        .unwrap();
    session.build(&mut program).unwrap();
    let kernel = session.create_kernel(&program, "fill").unwrap();
    let queues = session.create_command_queue(&contexts).unwrap();
    session.backend().reset_calls();

    let field = |result: multicl::Result<()>| match result {
        Err(ProxyError::InvalidArgument { field, .. }) => field,
        other => panic!("expected an invalid argument, got {other:?}"),
    };

    assert_eq!(
        field(session.write_buffer(&queues, &buffer, true, 0, 0, &[1u32], &[])),
        "num_bytes"
    );
    assert_eq!(
        field(session.write_buffer(&queues, &buffer, true, 0, 8, &[1u32], &[])),
        "data"
    );
    assert_eq!(
        field(session.write_buffer(&queues, &buffer, true, 12, 8, &[1u32, 2], &[])),
        "num_bytes"
    );
    let mut out = [0u32; 2];
    assert_eq!(
        field(session.read_buffer(&queues, &buffer, true, 0, 6, &mut out, &[])),
        "num_bytes"
    );
    assert_eq!(
        field(session.read_buffer(&queues, &buffer, true, 0, 16, &mut out, &[])),
        "data"
    );
    assert_eq!(
        field(session.copy_buffer(&queues, &buffer, &small, 0, 0, 8, &[])),
        "dst_offset"
    );
    assert_eq!(
        field(session.enqueue_range(&queues, &kernel, None, &[4, 4, 4, 4], None, &[])),
        "global_size"
    );
    assert_eq!(
        field(session.enqueue_range(&queues, &kernel, None, &[6], Some(&[4]), &[])),
        "local_size"
    );
    assert_eq!(
        field(session.acquire_graphics_objects(&queues, &[&buffer], &[])),
        "buffers"
    );

    assert_eq!(session.backend().native_calls(), 0);
}

#[test]
fn factories_validate_their_input() {
    let session = Session::new(backend());
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    let contexts = session.create_contexts(&devices, false).unwrap();
    session.backend().reset_calls();

    assert!(matches!(
        session.create_buffer(&contexts, MemFlags::ReadWrite, 0),
        Err(ProxyError::InvalidArgument { field: "size", .. })
    ));
    assert!(matches!(
        session.create_program(&contexts, &KernelSource::from("  \n")),
        Err(ProxyError::InvalidArgument { field: "source", .. })
    ));
    assert!(matches!(
        session.create_buffer_from_graphics(
            &contexts,
            MemFlags::ReadWrite,
            &MockGraphicsObject::zeroed(16)
        ),
        Err(ProxyError::InvalidArgument { field: "contexts", .. })
    ));
    assert_eq!(session.backend().native_calls(), 0);

    let program = session
        .create_program(&contexts, &KernelSource::from("fill"))
        .unwrap();
    assert!(matches!(
        session.create_kernel(&program, "fill"),
        Err(ProxyError::InvalidArgument { field: "program", .. })
    ));
}

#[test]
fn build_failure_carries_the_log() {
    let backend = MockBackend::new()
        .with_platform(
            MockPlatform::new("Mock")
                .with_device(MockDevice::cpu("c"))
                .with_device(MockDevice::gpu("g").failing_build("error: unknown identifier `x`")),
        )
        .with_kernel("fill", |_| Ok(()));
    let session = Session::new(backend);
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    let contexts = session.create_contexts(&devices, false).unwrap();
    let mut program = session
        .create_program(&contexts, &KernelSource::from("fill"))
        .unwrap();

    match session.build(&mut program).unwrap_err() {
        ProxyError::ProgramBuild { device, log } => {
            assert_eq!(device.device, "g");
            assert!(log.contains("unknown identifier"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!program.is_built());
}

#[test]
fn kernels_run_with_scalar_arguments() {
    let session = Session::new(backend());
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    let contexts = session.create_contexts(&devices, false).unwrap();
    let buffer = session
        .create_buffer(&contexts, MemFlags::ReadWrite, 16)
        .unwrap();
    let mut program = session
        .create_program(&contexts, &KernelSource::from("fill increment"))
        .unwrap();
    session.build(&mut program).unwrap();
    let mut fill = session.create_kernel(&program, "fill").unwrap();
    session
        .set_kernel_arg(&mut fill, 0, KernelArgument::Buffer(&buffer))
        .unwrap();
    session
        .set_kernel_arg(&mut fill, 1, KernelArgument::scalar(&41u32))
        .unwrap();
    let mut increment = session.create_kernel(&program, "increment").unwrap();
    session
        .set_kernel_arg(&mut increment, 0, KernelArgument::Buffer(&buffer))
        .unwrap();
    let queues = session.create_command_queue(&contexts).unwrap();

    session
        .enqueue_range(&queues, &fill, None, &[2, 2], Some(&[1, 2]), &[])
        .unwrap();
    session
        .enqueue_range(&queues, &increment, None, &[4], None, &[])
        .unwrap();
    let mut result = [0u32; 4];
    session
        .read_buffer(&queues, &buffer, true, 0, 16, &mut result, &[])
        .unwrap();
    assert_eq!(result, [42; 4]);

    let infos = session.work_group_info(&fill).unwrap();
    assert_eq!(infos.len(), 3);
    assert!(infos.iter().all(|(_, info)| info.work_group_size == 256));
}

#[test]
fn paired_and_broadcast_ranges() {
    let run = |mode: RangeMode| {
        let session = Session::with_config(
            MockBackend::new()
                .with_platform(
                    MockPlatform::new("Mock")
                        .with_device(MockDevice::gpu("g0"))
                        .with_device(MockDevice::gpu("g1")),
                )
                .with_kernel("noop", |_| Ok(())),
            SessionConfig {
                label: Some("ranges".to_string()),
                range_mode: mode,
            },
        );
        let devices = session.discover(DeviceTypeFilter::Gpu).unwrap();
        let contexts = session.create_contexts(&devices, false).unwrap();
        let mut program = session
            .create_program(&contexts, &KernelSource::from("noop"))
            .unwrap();
        session.build(&mut program).unwrap();
        let kernel = session.create_kernel(&program, "noop").unwrap();
        let queues = session.create_command_queue(&contexts).unwrap();
        session.backend().reset_calls();
        session
            .enqueue_range(&queues, &kernel, None, &[1], None, &[])
            .unwrap();
        session
            .backend()
            .calls()
            .into_iter()
            .filter(|call| call.op == "range")
            .filter_map(|call| call.device)
            .collect::<Vec<_>>()
    };

    assert_eq!(run(RangeMode::Paired), vec!["g0", "g1"]);
    assert_eq!(run(RangeMode::Broadcast), vec!["g0", "g1", "g0", "g1"]);
}

#[test]
fn buffers_from_other_contexts_are_rejected() {
    let session = Session::new(backend());
    let all = session.discover(DeviceTypeFilter::All).unwrap();
    let gpus = session.discover(DeviceTypeFilter::Gpu).unwrap();
    let all_contexts = session.create_contexts(&all, false).unwrap();
    let gpu_contexts = session.create_contexts(&gpus, false).unwrap();
    let buffer = session
        .create_buffer(&gpu_contexts, MemFlags::ReadWrite, 4)
        .unwrap();
    let queues = session.create_command_queue(&all_contexts).unwrap();
    session.backend().reset_calls();

    assert!(matches!(
        session.write_buffer(&queues, &buffer, true, 0, 4, &[1u32], &[]),
        Err(ProxyError::GroupMismatch { .. })
    ));
    assert_eq!(session.backend().native_calls(), 0);
}

#[test]
fn same_sized_groups_of_two_discoveries_do_not_pair() {
    let backend = MockBackend::new()
        .with_platform(MockPlatform::new("P1").with_device(MockDevice::gpu("g")))
        .with_platform(
            MockPlatform::new("P2")
                .with_device(MockDevice::cpu("c"))
                .with_device(MockDevice::gpu("h")),
        );
    let session = Session::new(backend);
    let gpus = session.discover(DeviceTypeFilter::Gpu).unwrap();
    let defaults = session.discover(DeviceTypeFilter::Default).unwrap();
    assert_eq!(names(&gpus), vec!["g", "h"]);
    assert_eq!(names(&defaults), vec!["g", "c"]);

    let gpu_contexts = session.create_contexts(&gpus, false).unwrap();
    let default_contexts = session.create_contexts(&defaults, false).unwrap();
    let buffer = session
        .create_buffer(&gpu_contexts, MemFlags::ReadWrite, 16)
        .unwrap();
    let queues = session.create_command_queue(&default_contexts).unwrap();
    session.backend().reset_calls();

    assert!(matches!(
        session.write_buffer(&queues, &buffer, true, 0, 16, &[7u32, 0, 0, 0], &[]),
        Err(ProxyError::GroupMismatch { .. })
    ));
    assert_eq!(session.backend().native_calls(), 0);
    for replica in buffer.replicas() {
        assert_eq!(replica.native().contents(), vec![0; 16]);
    }
}

#[test]
fn copy_between_groups_of_different_sizes_is_rejected() {
    let session = Session::new(backend());
    let all = session.discover(DeviceTypeFilter::All).unwrap();
    let gpus = session.discover(DeviceTypeFilter::Gpu).unwrap();
    let all_contexts = session.create_contexts(&all, false).unwrap();
    let gpu_contexts = session.create_contexts(&gpus, false).unwrap();
    let src = session
        .create_buffer(&all_contexts, MemFlags::ReadWrite, 8)
        .unwrap();
    let dst = session
        .create_buffer(&gpu_contexts, MemFlags::ReadWrite, 8)
        .unwrap();
    let queues = session.create_command_queue(&all_contexts).unwrap();
    session.backend().reset_calls();

    match session.copy_buffer(&queues, &src, &dst, 0, 0, 8, &[]) {
        Err(ProxyError::GroupMismatch { group, .. }) => assert_eq!(group, "destination buffer"),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(session.backend().native_calls(), 0);
}

#[test]
fn kernel_argument_needs_a_replica_on_every_device() {
    let session = Session::new(backend());
    let all = session.discover(DeviceTypeFilter::All).unwrap();
    let gpus = session.discover(DeviceTypeFilter::Gpu).unwrap();
    let all_contexts = session.create_contexts(&all, false).unwrap();
    let gpu_contexts = session.create_contexts(&gpus, false).unwrap();
    let buffer = session
        .create_buffer(&gpu_contexts, MemFlags::ReadWrite, 16)
        .unwrap();
    let mut program = session
        .create_program(&all_contexts, &KernelSource::from("increment"))
        .unwrap();
    session.build(&mut program).unwrap();
    let mut kernel = session.create_kernel(&program, "increment").unwrap();
    session.backend().reset_calls();

    match session.set_kernel_arg(&mut kernel, 0, KernelArgument::Buffer(&buffer)) {
        Err(ProxyError::InvalidArgument { field, .. }) => assert_eq!(field, "arg"),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(session.backend().native_calls(), 0);
}

#[test]
fn graphics_buffers_must_be_acquired() {
    let backend = MockBackend::new()
        .with_platform(
            MockPlatform::new("Shared")
                .with_device(MockDevice::gpu("g0"))
                .with_device(MockDevice::gpu("g1"))
                .with_interop(),
        )
        .with_kernel("increment", |launch| {
            let values: Vec<u32> = launch.read(0)?;
            let next: Vec<u32> = values.iter().map(|v| v + 1).collect();
            launch.write(0, &next)
        });
    let session = Session::new(backend);
    let devices = session.discover(DeviceTypeFilter::Gpu).unwrap();
    let contexts = session.create_contexts(&devices, true).unwrap();
    let vertices = MockGraphicsObject::new(bytemuck::cast_slice::<u32, u8>(&[1, 2]).to_vec());
    let buffer = session
        .create_buffer_from_graphics(&contexts, MemFlags::ReadWrite, &vertices)
        .unwrap();
    assert!(buffer.is_graphics());
    assert_eq!(buffer.size(), 8);

    let mut program = session
        .create_program(&contexts, &KernelSource::from("increment"))
        .unwrap();
    session.build(&mut program).unwrap();
    let mut kernel = session.create_kernel(&program, "increment").unwrap();
    session
        .set_kernel_arg(&mut kernel, 0, KernelArgument::Buffer(&buffer))
        .unwrap();
    let queues = session.create_command_queue(&contexts).unwrap();

    let err = session
        .enqueue_range(&queues, &kernel, None, &[2], None, &[])
        .unwrap_err();
    assert_eq!(err.native_op(), Some(NativeOp::EnqueueRange));

    session
        .acquire_graphics_objects(&queues, &[&buffer], &[])
        .unwrap();
    session
        .enqueue_range(&queues, &kernel, None, &[2], None, &[])
        .unwrap();
    session
        .release_graphics_objects(&queues, &[&buffer], &[])
        .unwrap();

    // both devices share the same graphics object
    assert_eq!(
        vertices.contents(),
        bytemuck::cast_slice::<u32, u8>(&[3, 4]).to_vec()
    );
    assert!(session
        .release_graphics_objects(&queues, &[&buffer], &[])
        .is_err());
}

#[test]
fn wait_lists_pass_each_device_its_own_event() {
    let session = Session::new(backend());
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    let contexts = session.create_contexts(&devices, false).unwrap();
    let buffer = session
        .create_buffer(&contexts, MemFlags::ReadWrite, 4)
        .unwrap();
    let queues = session.create_command_queue(&contexts).unwrap();
    let first: EventGroup = session.create_user_event(&contexts);
    let second: EventGroup = session.create_user_event(&contexts);

    session.backend().reset_calls();
    assert!(matches!(
        session.write_buffer(&queues, &buffer, true, 0, 4, &[9u32], &[&first]),
        Err(ProxyError::InvalidArgument { field: "wait", .. })
    ));
    assert_eq!(session.backend().native_calls(), 0);

    first.set_status(ExecutionStatus::Complete).unwrap();
    second.set_status(ExecutionStatus::Complete).unwrap();
    session
        .write_buffer(&queues, &buffer, true, 0, 4, &[9u32], &[&first, &second])
        .unwrap();
    let calls = session.backend().calls();
    assert_eq!(calls.len(), 3);
    for (call, device) in calls.iter().zip(devices.devices()) {
        assert_eq!(call.op, "write");
        assert_eq!(call.waited_on, vec![device.id(), device.id()]);
    }
}

#[test]
fn failed_events_abort_the_dispatch() {
    let session = Session::new(backend());
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    let contexts = session.create_contexts(&devices, false).unwrap();
    let queues = session.create_command_queue(&contexts).unwrap();
    let buffer = session
        .create_buffer(&contexts, MemFlags::ReadWrite, 4)
        .unwrap();
    let event = session.create_user_event(&contexts);
    event.set_status(ExecutionStatus::Failed(-14)).unwrap();

    let mut out = [0u32; 1];
    match session.read_buffer(&queues, &buffer, true, 0, 4, &mut out, &[&event]) {
        Err(ProxyError::EventFailed { device, code }) => {
            assert_eq!(device.index(), 0);
            assert_eq!(code, -14);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn callbacks_fire_once_per_device() {
    use std::sync::{Arc, Mutex};

    let session = Session::new(backend());
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    let contexts = session.create_contexts(&devices, false).unwrap();
    let event = session.create_user_event(&contexts);

    let seen = Arc::new(Mutex::new(Vec::new()));
    event.set_callback(
        ExecutionStatus::Running,
        |device, status, seen: &Arc<Mutex<Vec<_>>>| {
            seen.lock().unwrap().push((device.index(), status));
        },
        Arc::clone(&seen),
    );
    event.set_status(ExecutionStatus::Running).unwrap();
    event.set_status(ExecutionStatus::Complete).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (0, ExecutionStatus::Running),
            (1, ExecutionStatus::Running),
            (2, ExecutionStatus::Running)
        ]
    );
}
