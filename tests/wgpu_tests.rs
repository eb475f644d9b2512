extern crate multicl;

use multicl::interface::{WgpuBackend, WgpuBackendOptions};
use multicl::{DeviceTypeFilter, KernelArgument, KernelSource, MemFlags, ProxyError, Session};

fn session() -> Session<WgpuBackend> {
    let _ = env_logger::builder().is_test(true).try_init();
    Session::new(WgpuBackend::with_options(WgpuBackendOptions {
        backends: wgpu::Backends::PRIMARY,
        ..Default::default()
    }))
}

#[test]
fn square_on_every_adapter() {
    let session = session();
    let devices = match session.discover(DeviceTypeFilter::All) {
        Ok(devices) => devices,
        Err(ProxyError::Discovery(e)) => {
            println!("skipping, no adapter: {e}");
            return;
        }
        Err(e) => panic!("{e}"),
    };
    let contexts = match session.create_contexts(&devices, false) {
        Ok(contexts) => contexts,
        Err(e) => {
            println!("skipping, no usable device: {e}");
            return;
        }
    };

    let source = KernelSource::from_file_path("./tests/shaders/square.wgsl").unwrap();
    let input = session
        .create_buffer(&contexts, MemFlags::ReadOnly, 16)
        .unwrap();
    let output = session
        .create_buffer(&contexts, MemFlags::WriteOnly, 16)
        .unwrap();
    let mut program = session.create_program(&contexts, &source).unwrap();
    session.build(&mut program).unwrap();
    let mut kernel = session.create_kernel(&program, "square").unwrap();
    session
        .set_kernel_arg(&mut kernel, 0, KernelArgument::Buffer(&input))
        .unwrap();
    session
        .set_kernel_arg(&mut kernel, 1, KernelArgument::Buffer(&output))
        .unwrap();
    let queues = session.create_command_queue(&contexts).unwrap();

    session
        .write_buffer(&queues, &input, true, 0, 16, &[1i32, 2, 3, 4], &[])
        .unwrap();
    session
        .enqueue_range(&queues, &kernel, None, &[4], None, &[])
        .unwrap();
    session.finish(&queues).unwrap();

    let mut result = [0i32; 4];
    session
        .read_buffer(&queues, &output, true, 0, 16, &mut result, &[])
        .unwrap();
    assert_eq!(result, [1, 4, 9, 16]);
}

#[test]
fn broken_wgsl_reports_a_build_log() {
    let session = session();
    let Ok(devices) = session.discover(DeviceTypeFilter::Default) else {
        return;
    };
    let Ok(contexts) = session.create_contexts(&devices, false) else {
        return;
    };

    let source = KernelSource::from_content("@compute @workgroup_size(1) fn broken() { let x: u32 = y; }");
    let mut program = session.create_program(&contexts, &source).unwrap();
    match session.build(&mut program) {
        Err(ProxyError::ProgramBuild { log, .. }) => assert!(!log.is_empty()),
        other => panic!("unexpected result {other:?}"),
    }
}
