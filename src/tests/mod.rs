use crate::errors::{NativeOp, ProxyError};
use crate::group::DeviceId;
use crate::mock::{MockBackend, MockDevice, MockPlatform};
use crate::resource::{BufferGroup, KernelArgument, QueueGroup};
use crate::source::KernelSource;
use crate::{DeviceTypeFilter, MemFlags, Session};

const SQUARE: &str = "square(input, output)";

fn square_backend(platform: MockPlatform) -> MockBackend {
    MockBackend::new()
        .with_platform(platform)
        .with_kernel("square", |launch| {
            let input: Vec<i32> = launch.read(0)?;
            let output: Vec<i32> = input.iter().map(|x| x * x).collect();
            launch.write(1, &output)
        })
}

struct Square {
    session: Session<MockBackend>,
    input: BufferGroup<MockBackend>,
    output: BufferGroup<MockBackend>,
    queues: QueueGroup<MockBackend>,
}

impl Square {
    /// Runs the square kernel over `data` on every device of `platform`
    fn run(platform: MockPlatform, data: &[i32]) -> Square {
        let session = Session::new(square_backend(platform));
        let bytes = std::mem::size_of_val(data) as u64;

        let devices = session.discover(DeviceTypeFilter::All).unwrap();
        let contexts = session.create_contexts(&devices, false).unwrap();
        let input = session
            .create_buffer(&contexts, MemFlags::ReadOnly, bytes)
            .unwrap();
        let output = session
            .create_buffer(&contexts, MemFlags::WriteOnly, bytes)
            .unwrap();
        let mut program = session
            .create_program(&contexts, &KernelSource::from(SQUARE))
            .unwrap();
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
            .write_buffer(&queues, &input, true, 0, bytes, data, &[])
            .unwrap();
        session
            .enqueue_range(&queues, &kernel, None, &[data.len()], None, &[])
            .unwrap();
        session.finish(&queues).unwrap();

        Square {
            session,
            input,
            output,
            queues,
        }
    }

    fn read(&self, data: &mut [i32]) -> crate::Result<()> {
        let bytes = std::mem::size_of_val(data) as u64;
        self.session
            .read_buffer(&self.queues, &self.output, true, 0, bytes, data, &[])
    }
}

fn two_devices() -> MockPlatform {
    MockPlatform::new("Mock")
        .with_device(MockDevice::cpu("cpu0"))
        .with_device(MockDevice::gpu("gpu0"))
}

#[test]
fn square_agrees_on_every_device() {
    let square = Square::run(two_devices(), &[1, 2, 3, 4]);
    let mut result = [0; 4];
    square.read(&mut result).unwrap();
    assert_eq!(result, [1, 4, 9, 16]);
    assert_eq!(square.input.len(), 2);
}

#[test]
fn disagreeing_device_is_reported() {
    let square = Square::run(two_devices(), &[1, 2, 3, 4]);
    let replica = square.output.replicas().get(DeviceId::new(0, 1)).unwrap();
    replica.native().overwrite(12, bytemuck::bytes_of(&17i32)).unwrap();

    let mut result = [0; 4];
    match square.read(&mut result).unwrap_err() {
        ProxyError::Consistency {
            first,
            second,
            index,
            first_value,
            second_value,
        } => {
            assert_eq!(first.id, DeviceId::new(0, 0));
            assert_eq!(second.id, DeviceId::new(0, 1));
            assert_eq!(index, 3);
            assert_eq!(first_value, "16");
            assert_eq!(second_value, "17");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn consistency_message_names_both_devices() {
    let square = Square::run(two_devices(), &[5, 6]);
    let replica = square.output.replicas().get(DeviceId::new(0, 1)).unwrap();
    replica.native().overwrite(0, bytemuck::bytes_of(&-1i32)).unwrap();

    let mut result = [0; 2];
    let message = square.read(&mut result).unwrap_err().to_string();
    assert_eq!(
        message,
        "(Platform Mock Device cpu0 (#0) value 25) != (Platform Mock Device gpu0 (#1) value -1) at element 0"
    );
}

#[test]
fn replicas_are_compared_with_their_predecessor() {
    let platform = two_devices().with_device(MockDevice::gpu("gpu1"));
    let square = Square::run(platform, &[2, 3]);
    let replica = square.output.replicas().get(DeviceId::new(0, 2)).unwrap();
    replica.native().overwrite(4, bytemuck::bytes_of(&10i32)).unwrap();

    let mut result = [0; 2];
    match square.read(&mut result).unwrap_err() {
        ProxyError::Consistency {
            first,
            second,
            index,
            ..
        } => {
            assert_eq!((first.id, second.id, index), (DeviceId::new(0, 1), DeviceId::new(0, 2), 1));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn failing_read_names_the_device() {
    let platform = MockPlatform::new("Mock")
        .with_device(MockDevice::cpu("cpu0"))
        .with_device(MockDevice::gpu("gpu0").failing_op("read"));
    let square = Square::run(platform, &[1, 2]);

    let mut result = [0; 2];
    let err = square.read(&mut result).unwrap_err();
    assert_eq!(err.native_op(), Some(NativeOp::ReadBuffer));
    match err {
        ProxyError::Native { device, .. } => assert_eq!(device.id, DeviceId::new(0, 1)),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn failing_write_stops_the_fan_out() {
    let platform = MockPlatform::new("Mock")
        .with_device(MockDevice::cpu("cpu0").failing_op("write"))
        .with_device(MockDevice::gpu("gpu0"));
    let session = Session::new(square_backend(platform));
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    let contexts = session.create_contexts(&devices, false).unwrap();
    let buffer = session
        .create_buffer(&contexts, MemFlags::ReadWrite, 8)
        .unwrap();
    let queues = session.create_command_queue(&contexts).unwrap();

    let err = session
        .write_buffer(&queues, &buffer, true, 0, 8, &[7i32, 8], &[])
        .unwrap_err();
    assert_eq!(err.native_op(), Some(NativeOp::WriteBuffer));
    let untouched = buffer.replicas().get(DeviceId::new(0, 1)).unwrap();
    assert_eq!(untouched.native().contents(), vec![0; 8]);
}
