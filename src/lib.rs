/*!
This crate aim is to run the same compute work on every device of every platform of the machine,
and to check that all of them agree on the result.

A compute API normally hands out one context, one buffer, one kernel per device. Here every call
is fanned out instead: [`Session::discover`] enumerates the devices once, and every resource created
afterwards ([`BufferGroup`], [`ProgramGroup`], [`KernelGroup`], [`QueueGroup`]) holds one replica
per device, tagged with the [`DeviceId`] of the device it lives on.
Writes go to every replica, kernels run on every device, and [`Session::read_buffer`] reads every
replica back, failing with [`ProxyError::Consistency`] as soon as two devices disagree.

The native API sits behind the [`ComputeBackend`] trait. Two backends ship with the crate:
- [`interface::WgpuBackend`], driving the GPU adapters of the machine through [`wgpu`]
- [`mock::MockBackend`], which simulates platforms and devices in memory with host closures as kernels

The whole dispatch is synchronous: every call returns once the native operation completed on
every device, and the first native failure stops the fan-out.

```
use multicl::mock::{MockBackend, MockDevice, MockPlatform};
use multicl::{DeviceTypeFilter, KernelArgument, KernelSource, MemFlags, Session};

let backend = MockBackend::new()
    .with_platform(
        MockPlatform::new("Host")
            .with_device(MockDevice::cpu("cpu0"))
            .with_device(MockDevice::gpu("gpu0")),
    )
    .with_kernel("double", |launch| {
        let values: Vec<f32> = launch.read(0)?;
        let doubled: Vec<f32> = values.iter().map(|v| v * 2.0).collect();
        launch.write(0, &doubled)
    });
let session = Session::new(backend);

let devices = session.discover(DeviceTypeFilter::All)?;
let contexts = session.create_contexts(&devices, false)?;
let buffer = session.create_buffer(&contexts, MemFlags::ReadWrite, 16)?;
let mut program = session.create_program(&contexts, &KernelSource::from("double"))?;
session.build(&mut program)?;
let mut kernel = session.create_kernel(&program, "double")?;
session.set_kernel_arg(&mut kernel, 0, KernelArgument::Buffer(&buffer))?;
let queues = session.create_command_queue(&contexts)?;

session.write_buffer(&queues, &buffer, true, 0, 16, &[1.0f32, 2.0, 3.0, 4.0], &[])?;
session.enqueue_range(&queues, &kernel, None, &[4], None, &[])?;
let mut result = [0.0f32; 4];
session.read_buffer(&queues, &buffer, true, 0, 16, &mut result, &[])?;
assert_eq!(result, [2.0, 4.0, 6.0, 8.0]);
# Ok::<(), multicl::ProxyError>(())
```
*/

pub mod backend;
pub mod context;
pub mod dispatch;
pub mod errors;
pub mod event;
pub mod group;
pub mod interface;
pub mod mock;
pub mod platform;
pub mod resource;
pub mod session;
pub mod source;

#[cfg(test)]
mod tests;

pub use crate::backend::{
    ComputeBackend, DeviceInfo, DeviceType, DeviceTypeFilter, MemFlags, NdRange, PlatformInfo,
    WorkGroupInfo,
};
pub use crate::context::ContextGroup;
pub use crate::dispatch::RangeMode;
pub use crate::errors::{DiscoveryError, NativeOp, ProxyError, Result};
pub use crate::event::{EventGroup, ExecutionStatus, HostEvent};
pub use crate::group::{DeviceId, DeviceLabel, Replica, ResourceGroup};
pub use crate::platform::DeviceGroup;
pub use crate::resource::{BufferGroup, KernelArgument, KernelGroup, ProgramGroup, QueueGroup};
pub use crate::session::{Session, SessionConfig};
pub use crate::source::KernelSource;
