//! Squares a small vector on every device of the machine, frame after frame.
//!
//! Runs on the wgpu adapters when there are any, on two simulated devices otherwise.
//! Set `RUST_LOG=multicl=debug` to follow the fan-out.

use anyhow::Context;
use multicl::interface::WgpuBackend;
use multicl::mock::{MockBackend, MockDevice, MockPlatform};
use multicl::{
    ComputeBackend, DeviceTypeFilter, KernelArgument, KernelSource, MemFlags, Session,
    SessionConfig,
};

const FRAMES: usize = 3;

fn run<B: ComputeBackend>(session: &Session<B>, source: &KernelSource) -> anyhow::Result<()> {
    let devices = session.discover(DeviceTypeFilter::All)?;
    for (id, info) in devices.device_infos() {
        println!("device {id}: {} ({:?})", info.name, info.kind);
    }
    let contexts = session.create_contexts(&devices, false)?;

    let data = [1i32, 2, 3, 4];
    let bytes = std::mem::size_of_val(&data) as u64;
    let input = session.create_buffer(&contexts, MemFlags::ReadWrite, bytes)?;
    let output = session.create_buffer(&contexts, MemFlags::ReadWrite, bytes)?;

    let mut program = session.create_program(&contexts, source)?;
    session.build(&mut program)?;
    let mut kernel = session.create_kernel(&program, "square")?;
    session.set_kernel_arg(&mut kernel, 0, KernelArgument::Buffer(&input))?;
    session.set_kernel_arg(&mut kernel, 1, KernelArgument::Buffer(&output))?;
    let queues = session.create_command_queue(&contexts)?;

    let mut result = [0i32; 4];
    for frame in 0..FRAMES {
        if frame == 0 {
            session.write_buffer(&queues, &input, true, 0, bytes, &data, &[])?;
        }
        session.enqueue_range(&queues, &kernel, None, &[data.len()], None, &[])?;
        session.finish(&queues)?;
        session.read_buffer(&queues, &output, true, 0, bytes, &mut result, &[])?;
        println!("frame {frame}: {result:?}");
        // next frame squares this frame's result
        session.copy_buffer(&queues, &output, &input, 0, 0, bytes, &[])?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let source = KernelSource::from_file_path("./tests/shaders/square.wgsl")
        .context("reading the square shader")?;
    let config = SessionConfig {
        label: Some("square".to_string()),
        ..Default::default()
    };

    let session = Session::with_config(WgpuBackend::new(), config.clone());
    match run(&session, &source) {
        Ok(()) => Ok(()),
        Err(e) => {
            log::warn!("wgpu run failed ({e:#}), running on simulated devices");
            let backend = MockBackend::new()
                .with_platform(
                    MockPlatform::new("Simulated")
                        .with_device(MockDevice::cpu("cpu0"))
                        .with_device(MockDevice::gpu("gpu0")),
                )
                .with_kernel("square", |launch| {
                    let input: Vec<i32> = launch.read(0)?;
                    let output: Vec<i32> = input.iter().map(|x| x * x).collect();
                    launch.write(1, &output)
                });
            run(&Session::with_config(backend, config), &source)
        }
    }
}
