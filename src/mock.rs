//! An in-memory [`ComputeBackend`] running host closures as kernels.
//!
//! The platforms and devices of a [`MockBackend`] are described up front with a small builder,
//! kernels are plain Rust closures registered by name, and buffers are byte vectors.
//! Every native call is counted and logged, so a caller can check what reached the
//! "driver" and in which order.
//!
//! ```
//! use multicl::mock::{MockBackend, MockDevice, MockPlatform};
//! use multicl::{DeviceTypeFilter, Session};
//!
//! let backend = MockBackend::new().with_platform(
//!     MockPlatform::new("Host").with_device(MockDevice::cpu("cpu0")),
//! );
//! let session = Session::new(backend);
//! let devices = session.discover(DeviceTypeFilter::All).unwrap();
//! assert_eq!(devices.len(), 1);
//! ```

use crate::backend::{
    ComputeBackend, DeviceInfo, DeviceType, DeviceTypeFilter, MemFlags, NativeArg, NdRange,
    PlatformInfo, WorkGroupInfo,
};
use crate::event::HostEvent;
use crate::group::DeviceId;
use anyhow::{anyhow, bail, ensure};
use bytemuck::Pod;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A kernel body, called once per range execution with the bound arguments
pub type KernelFn = Arc<dyn Fn(&MockLaunch<'_>) -> anyhow::Result<()> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Description of a simulated device
#[derive(Debug, Clone)]
pub struct MockDevice {
    name: String,
    kind: DeviceType,
    build_failure: Option<String>,
    failing_ops: Vec<&'static str>,
}

impl MockDevice {
    pub fn new(name: &str, kind: DeviceType) -> Self {
        MockDevice {
            name: name.to_string(),
            kind,
            build_failure: None,
            failing_ops: Vec::new(),
        }
    }

    pub fn cpu(name: &str) -> Self {
        MockDevice::new(name, DeviceType::Cpu)
    }

    pub fn gpu(name: &str) -> Self {
        MockDevice::new(name, DeviceType::Gpu)
    }

    /// Programs fail to build on this device, leaving `log` as build log
    pub fn failing_build(mut self, log: &str) -> Self {
        self.build_failure = Some(log.to_string());
        self
    }

    /// The native operation `op` fails on this device.
    ///
    /// `op` is one of the names recorded in [`MockCall::op`], e.g. `"write"` or `"range"`.
    pub fn failing_op(mut self, op: &'static str) -> Self {
        self.failing_ops.push(op);
        self
    }
}

/// Description of a simulated platform
#[derive(Debug, Clone)]
pub struct MockPlatform {
    name: String,
    vendor: String,
    devices: Vec<MockDevice>,
    interop: bool,
    context_failure: Option<String>,
}

impl MockPlatform {
    pub fn new(name: &str) -> Self {
        MockPlatform {
            name: name.to_string(),
            vendor: "multicl".to_string(),
            devices: Vec::new(),
            interop: false,
            context_failure: None,
        }
    }

    pub fn with_device(mut self, device: MockDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// The platform can share graphics objects
    pub fn with_interop(mut self) -> Self {
        self.interop = true;
        self
    }

    /// Context creation fails on this platform with `reason`
    pub fn failing_context(mut self, reason: &str) -> Self {
        self.context_failure = Some(reason.to_string());
        self
    }
}

/// One native call as seen by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: &'static str,
    /// Name of the device the call targeted, if any
    pub device: Option<String>,
    /// Devices of the events the call waited on
    pub waited_on: Vec<DeviceId>,
}

#[derive(Debug, Clone, Copy)]
pub struct MockPlatformHandle {
    index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockDeviceHandle {
    platform: usize,
    index: usize,
}

/// Keeps the live context counter of the backend up to date
#[derive(Debug)]
struct LiveContext(Arc<AtomicUsize>);

impl LiveContext {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        LiveContext(Arc::clone(counter))
    }
}

impl Drop for LiveContext {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockContext {
    platform: usize,
    devices: Vec<MockDeviceHandle>,
    interop: bool,
    _live: LiveContext,
}

/// A buffer replica. Clones share the same memory
#[derive(Debug, Clone)]
pub struct MockBuffer {
    device: MockDeviceHandle,
    flags: MemFlags,
    memory: Arc<Mutex<Vec<u8>>>,
    graphics: Option<Arc<AtomicBool>>,
}

impl MockBuffer {
    /// A copy of the bytes held by the replica
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.memory).clone()
    }

    /// Overwrites the replica's bytes at `offset` behind the proxy's back
    pub fn overwrite(&self, offset: u64, bytes: &[u8]) -> anyhow::Result<()> {
        let mut memory = lock(&self.memory);
        let range = span(offset, bytes.len(), memory.len())?;
        memory[range].copy_from_slice(bytes);
        Ok(())
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    fn check_usable(&self) -> anyhow::Result<()> {
        match &self.graphics {
            Some(acquired) if !acquired.load(Ordering::SeqCst) => {
                bail!("graphics buffer used while not acquired")
            }
            _ => Ok(()),
        }
    }
}

/// A graphics object owned outside the proxy, e.g. a vertex buffer
#[derive(Debug, Clone)]
pub struct MockGraphicsObject {
    memory: Arc<Mutex<Vec<u8>>>,
}

impl MockGraphicsObject {
    pub fn new(bytes: Vec<u8>) -> Self {
        MockGraphicsObject {
            memory: Arc::new(Mutex::new(bytes)),
        }
    }

    pub fn zeroed(size: usize) -> Self {
        MockGraphicsObject::new(vec![0; size])
    }

    pub fn contents(&self) -> Vec<u8> {
        lock(&self.memory).clone()
    }
}

#[derive(Debug)]
pub struct MockProgram {
    platform: usize,
    source: String,
    built: Vec<MockDeviceHandle>,
    logs: HashMap<usize, String>,
}

#[derive(Debug, Clone)]
enum MockArg {
    Buffer(MockBuffer),
    Scalar(Vec<u8>),
    Local(u64),
}

pub struct MockKernel {
    device: MockDeviceHandle,
    name: String,
    body: KernelFn,
    args: BTreeMap<u32, MockArg>,
}

impl fmt::Debug for MockKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockKernel")
            .field("device", &self.device)
            .field("name", &self.name)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct MockQueue {
    device: MockDeviceHandle,
}

/// What a kernel body sees of one range execution
pub struct MockLaunch<'a> {
    range: &'a NdRange,
    device: &'a str,
    args: &'a BTreeMap<u32, MockArg>,
}

impl MockLaunch<'_> {
    pub fn range(&self) -> &NdRange {
        self.range
    }

    /// Total number of work items
    pub fn global_size(&self) -> usize {
        self.range.work_items()
    }

    pub fn device_name(&self) -> &str {
        self.device
    }

    fn buffer(&self, index: u32) -> anyhow::Result<&MockBuffer> {
        match self.args.get(&index) {
            Some(MockArg::Buffer(buffer)) => Ok(buffer),
            Some(other) => Err(anyhow!("argument {index} is not a buffer: {other:?}")),
            None => Err(anyhow!("argument {index} is not set")),
        }
    }

    /// The whole content of the buffer bound at `index`, as `T` elements
    pub fn read<T: Pod>(&self, index: u32) -> anyhow::Result<Vec<T>> {
        let memory = lock(&self.buffer(index)?.memory);
        let size = std::mem::size_of::<T>();
        ensure!(
            size > 0 && memory.len() % size == 0,
            "buffer of {} bytes can't be read as {size} bytes elements",
            memory.len()
        );
        let mut values = vec![<T as bytemuck::Zeroable>::zeroed(); memory.len() / size];
        bytemuck::cast_slice_mut::<T, u8>(&mut values).copy_from_slice(&memory);
        Ok(values)
    }

    /// Writes `values` at the start of the buffer bound at `index`
    pub fn write<T: Pod>(&self, index: u32, values: &[T]) -> anyhow::Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let mut memory = lock(&self.buffer(index)?.memory);
        ensure!(
            bytes.len() <= memory.len(),
            "{} bytes don't fit a {} bytes buffer",
            bytes.len(),
            memory.len()
        );
        memory[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// The scalar bound at `index`
    pub fn scalar<T: Pod>(&self, index: u32) -> anyhow::Result<T> {
        match self.args.get(&index) {
            Some(MockArg::Scalar(bytes)) if bytes.len() == std::mem::size_of::<T>() => {
                Ok(bytemuck::pod_read_unaligned(bytes))
            }
            Some(MockArg::Scalar(bytes)) => bail!(
                "argument {index} has {} bytes, expected {}",
                bytes.len(),
                std::mem::size_of::<T>()
            ),
            _ => bail!("argument {index} is not a scalar"),
        }
    }

    /// Size of the local memory argument at `index`
    pub fn local_size(&self, index: u32) -> anyhow::Result<u64> {
        match self.args.get(&index) {
            Some(MockArg::Local(size)) => Ok(*size),
            _ => bail!("argument {index} is not a local memory argument"),
        }
    }
}

/// The simulated host compute API
#[derive(Default)]
pub struct MockBackend {
    platforms: Vec<MockPlatform>,
    kernels: HashMap<String, KernelFn>,
    all_query: bool,
    native_calls: AtomicUsize,
    calls: Mutex<Vec<MockCall>>,
    live_contexts: Arc<AtomicUsize>,
}

impl fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockBackend")
            .field("platforms", &self.platforms)
            .field("kernels", &self.kernels.keys().collect::<Vec<_>>())
            .field("native_calls", &self.native_calls())
            .finish_non_exhaustive()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        MockBackend::default()
    }

    pub fn with_platform(mut self, platform: MockPlatform) -> Self {
        self.platforms.push(platform);
        self
    }

    /// Registers the body of kernel `name`. Programs must still mention `name` in their source
    pub fn with_kernel<F>(mut self, name: &str, body: F) -> Self
    where
        F: Fn(&MockLaunch<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.kernels.insert(name.to_string(), Arc::new(body));
        self
    }

    /// Answers [`DeviceTypeFilter::All`] natively instead of letting the proxy emulate it
    pub fn with_all_query(mut self) -> Self {
        self.all_query = true;
        self
    }

    /// Number of native calls made so far, info queries excluded
    pub fn native_calls(&self) -> usize {
        self.native_calls.load(Ordering::SeqCst)
    }

    /// Every device-level call made so far, in order
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn reset_calls(&self) {
        self.native_calls.store(0, Ordering::SeqCst);
        lock(&self.calls).clear();
    }

    /// Number of contexts created and not dropped yet
    pub fn live_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::SeqCst)
    }

    fn device(&self, handle: MockDeviceHandle) -> anyhow::Result<&MockDevice> {
        self.platforms
            .get(handle.platform)
            .and_then(|platform| platform.devices.get(handle.index))
            .ok_or_else(|| anyhow!("unknown device {handle:?}"))
    }

    fn platform(&self, handle: MockPlatformHandle) -> anyhow::Result<&MockPlatform> {
        self.platforms
            .get(handle.index)
            .ok_or_else(|| anyhow!("unknown platform {handle:?}"))
    }

    /// Counts a native call and fails it if the device was told to
    fn call(
        &self,
        op: &'static str,
        device: Option<MockDeviceHandle>,
        wait: &[&HostEvent],
    ) -> anyhow::Result<()> {
        self.native_calls.fetch_add(1, Ordering::SeqCst);
        let device = device.map(|handle| self.device(handle)).transpose()?;
        log::trace!("mock {op} on {:?}", device.map(|d| d.name.as_str()));
        lock(&self.calls).push(MockCall {
            op,
            device: device.map(|d| d.name.clone()),
            waited_on: wait.iter().map(|event| event.device()).collect(),
        });
        if let Some(device) = device {
            if device.failing_ops.contains(&op) {
                bail!("injected {op} failure on {}", device.name);
            }
        }
        for event in wait {
            ensure!(event.is_complete(), "waited on an incomplete event");
        }
        Ok(())
    }

    fn check_membership(context: &MockContext, device: &MockDeviceHandle) -> anyhow::Result<()> {
        ensure!(
            context.devices.contains(device),
            "device {device:?} is not part of the context"
        );
        Ok(())
    }

    fn check_same_device(queue: &MockQueue, buffer: &MockBuffer) -> anyhow::Result<()> {
        ensure!(
            queue.device == buffer.device,
            "buffer of {:?} used on a queue of {:?}",
            buffer.device,
            queue.device
        );
        buffer.check_usable()
    }
}

fn span(offset: u64, len: usize, size: usize) -> anyhow::Result<std::ops::Range<usize>> {
    let start = offset as usize;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= size)
        .ok_or_else(|| anyhow!("{len} bytes at {offset} out of a {size} bytes buffer"))?;
    Ok(start..end)
}

impl ComputeBackend for MockBackend {
    type Platform = MockPlatformHandle;
    type Device = MockDeviceHandle;
    type Context = MockContext;
    type Buffer = MockBuffer;
    type Program = MockProgram;
    type Kernel = MockKernel;
    type Queue = MockQueue;
    type GraphicsResource = MockGraphicsObject;

    fn platforms(&self) -> anyhow::Result<Vec<MockPlatformHandle>> {
        self.call("platforms", None, &[])?;
        Ok((0..self.platforms.len())
            .map(|index| MockPlatformHandle { index })
            .collect())
    }

    fn platform_info(&self, platform: &MockPlatformHandle) -> PlatformInfo {
        match self.platform(*platform) {
            Ok(platform) => PlatformInfo {
                name: platform.name.clone(),
                vendor: platform.vendor.clone(),
                version: "Mock 1.0".to_string(),
            },
            Err(_) => PlatformInfo {
                name: "unknown".to_string(),
                vendor: String::new(),
                version: String::new(),
            },
        }
    }

    fn devices(
        &self,
        platform: &MockPlatformHandle,
        filter: DeviceTypeFilter,
    ) -> anyhow::Result<Vec<MockDeviceHandle>> {
        self.call("devices", None, &[])?;
        let description = self.platform(*platform)?;
        let handles = description
            .devices
            .iter()
            .enumerate()
            .filter(|(_, device)| match filter {
                DeviceTypeFilter::Cpu => device.kind == DeviceType::Cpu,
                DeviceTypeFilter::Gpu => device.kind == DeviceType::Gpu,
                DeviceTypeFilter::Default | DeviceTypeFilter::All => true,
            })
            .map(|(index, _)| MockDeviceHandle {
                platform: platform.index,
                index,
            });
        Ok(match filter {
            DeviceTypeFilter::Default => handles.take(1).collect(),
            _ => handles.collect(),
        })
    }

    fn supports_all_query(&self) -> bool {
        self.all_query
    }

    fn device_info(&self, device: &MockDeviceHandle) -> DeviceInfo {
        match self.device(*device) {
            Ok(description) => DeviceInfo {
                name: description.name.clone(),
                vendor: "multicl".to_string(),
                kind: description.kind,
            },
            Err(_) => DeviceInfo {
                name: "unknown".to_string(),
                vendor: String::new(),
                kind: DeviceType::Other,
            },
        }
    }

    fn supports_interop(&self, platform: &MockPlatformHandle) -> bool {
        self.platform(*platform)
            .map(|platform| platform.interop)
            .unwrap_or(false)
    }

    fn create_context(
        &self,
        platform: &MockPlatformHandle,
        devices: &[MockDeviceHandle],
        interop: bool,
    ) -> anyhow::Result<MockContext> {
        self.call("create_context", None, &[])?;
        let description = self.platform(*platform)?;
        if let Some(reason) = &description.context_failure {
            bail!("{reason}");
        }
        ensure!(
            !interop || description.interop,
            "platform {} can't share graphics objects",
            description.name
        );
        ensure!(
            devices.iter().all(|device| device.platform == platform.index),
            "devices from another platform"
        );
        Ok(MockContext {
            platform: platform.index,
            devices: devices.to_vec(),
            interop,
            _live: LiveContext::new(&self.live_contexts),
        })
    }

    fn create_buffer(
        &self,
        context: &MockContext,
        device: &MockDeviceHandle,
        flags: MemFlags,
        size: u64,
    ) -> anyhow::Result<MockBuffer> {
        self.call("create_buffer", Some(*device), &[])?;
        MockBackend::check_membership(context, device)?;
        Ok(MockBuffer {
            device: *device,
            flags,
            memory: Arc::new(Mutex::new(vec![0; size as usize])),
            graphics: None,
        })
    }

    fn create_buffer_from_graphics(
        &self,
        context: &MockContext,
        device: &MockDeviceHandle,
        flags: MemFlags,
        resource: &MockGraphicsObject,
    ) -> anyhow::Result<MockBuffer> {
        self.call("create_buffer_from_graphics", Some(*device), &[])?;
        MockBackend::check_membership(context, device)?;
        ensure!(context.interop, "context was created without interop");
        Ok(MockBuffer {
            device: *device,
            flags,
            memory: Arc::clone(&resource.memory),
            graphics: Some(Arc::new(AtomicBool::new(false))),
        })
    }

    fn buffer_size(&self, buffer: &MockBuffer) -> u64 {
        lock(&buffer.memory).len() as u64
    }

    fn create_program(&self, context: &MockContext, source: &str) -> anyhow::Result<MockProgram> {
        self.call("create_program", None, &[])?;
        Ok(MockProgram {
            platform: context.platform,
            source: source.to_string(),
            built: Vec::new(),
            logs: HashMap::new(),
        })
    }

    fn build_program(
        &self,
        program: &mut MockProgram,
        devices: &[MockDeviceHandle],
    ) -> anyhow::Result<()> {
        self.call("build_program", None, &[])?;
        program.built.clear();
        program.logs.clear();
        let mut failed = 0;
        for handle in devices {
            ensure!(
                handle.platform == program.platform,
                "device from another platform"
            );
            match &self.device(*handle)?.build_failure {
                Some(log) => {
                    program.logs.insert(handle.index, log.clone());
                    failed += 1;
                }
                None => program.built.push(*handle),
            }
        }
        if failed > 0 {
            program.built.clear();
            bail!("build failed on {failed} devices");
        }
        Ok(())
    }

    fn build_log(&self, program: &MockProgram, device: &MockDeviceHandle) -> String {
        program.logs.get(&device.index).cloned().unwrap_or_default()
    }

    fn create_kernel(
        &self,
        program: &MockProgram,
        device: &MockDeviceHandle,
        name: &str,
    ) -> anyhow::Result<MockKernel> {
        self.call("create_kernel", Some(*device), &[])?;
        ensure!(
            program.built.contains(device),
            "program is not built for {device:?}"
        );
        ensure!(
            program.source.contains(name),
            "no kernel named {name} in the program"
        );
        let body = self
            .kernels
            .get(name)
            .ok_or_else(|| anyhow!("no body registered for kernel {name}"))?;
        Ok(MockKernel {
            device: *device,
            name: name.to_string(),
            body: Arc::clone(body),
            args: BTreeMap::new(),
        })
    }

    fn set_kernel_arg(
        &self,
        kernel: &mut MockKernel,
        index: u32,
        arg: NativeArg<'_, MockBuffer>,
    ) -> anyhow::Result<()> {
        self.call("set_arg", Some(kernel.device), &[])?;
        let arg = match arg {
            NativeArg::Buffer(buffer) => {
                ensure!(
                    buffer.device == kernel.device,
                    "buffer of {:?} bound to a kernel of {:?}",
                    buffer.device,
                    kernel.device
                );
                MockArg::Buffer(buffer.clone())
            }
            NativeArg::Scalar(bytes) => MockArg::Scalar(bytes.to_vec()),
            NativeArg::Local(size) => MockArg::Local(size),
        };
        kernel.args.insert(index, arg);
        Ok(())
    }

    fn work_group_info(
        &self,
        kernel: &MockKernel,
        device: &MockDeviceHandle,
    ) -> anyhow::Result<WorkGroupInfo> {
        self.call("work_group_info", Some(*device), &[])?;
        ensure!(kernel.device == *device, "kernel queried on another device");
        let multiple = match self.device(*device)?.kind {
            DeviceType::Gpu => 32,
            _ => 1,
        };
        Ok(WorkGroupInfo {
            work_group_size: 256,
            compile_work_group_size: [0; 3],
            local_mem_size: 32 * 1024,
            preferred_work_group_size_multiple: multiple,
            private_mem_size: 0,
        })
    }

    fn create_queue(
        &self,
        context: &MockContext,
        device: &MockDeviceHandle,
    ) -> anyhow::Result<MockQueue> {
        self.call("create_queue", Some(*device), &[])?;
        MockBackend::check_membership(context, device)?;
        Ok(MockQueue { device: *device })
    }

    fn enqueue_write(
        &self,
        queue: &MockQueue,
        buffer: &MockBuffer,
        _blocking: bool,
        offset: u64,
        data: &[u8],
        wait: &[&HostEvent],
    ) -> anyhow::Result<()> {
        self.call("write", Some(queue.device), wait)?;
        MockBackend::check_same_device(queue, buffer)?;
        let mut memory = lock(&buffer.memory);
        let range = span(offset, data.len(), memory.len())?;
        memory[range].copy_from_slice(data);
        Ok(())
    }

    fn enqueue_read(
        &self,
        queue: &MockQueue,
        buffer: &MockBuffer,
        _blocking: bool,
        offset: u64,
        data: &mut [u8],
        wait: &[&HostEvent],
    ) -> anyhow::Result<()> {
        self.call("read", Some(queue.device), wait)?;
        MockBackend::check_same_device(queue, buffer)?;
        let memory = lock(&buffer.memory);
        let range = span(offset, data.len(), memory.len())?;
        data.copy_from_slice(&memory[range]);
        Ok(())
    }

    fn enqueue_copy(
        &self,
        queue: &MockQueue,
        src: &MockBuffer,
        dst: &MockBuffer,
        src_offset: u64,
        dst_offset: u64,
        num_bytes: u64,
        wait: &[&HostEvent],
    ) -> anyhow::Result<()> {
        self.call("copy", Some(queue.device), wait)?;
        MockBackend::check_same_device(queue, src)?;
        MockBackend::check_same_device(queue, dst)?;
        let len = num_bytes as usize;
        if Arc::ptr_eq(&src.memory, &dst.memory) {
            let mut memory = lock(&src.memory);
            let from = span(src_offset, len, memory.len())?;
            let to = span(dst_offset, len, memory.len())?;
            memory.copy_within(from, to.start);
        } else {
            let source = lock(&src.memory);
            let mut destination = lock(&dst.memory);
            let from = span(src_offset, len, source.len())?;
            let to = span(dst_offset, len, destination.len())?;
            destination[to].copy_from_slice(&source[from]);
        }
        Ok(())
    }

    fn enqueue_range(
        &self,
        queue: &MockQueue,
        kernel: &MockKernel,
        range: &NdRange,
        wait: &[&HostEvent],
    ) -> anyhow::Result<()> {
        self.call("range", Some(queue.device), wait)?;
        ensure!(
            kernel.device.platform == queue.device.platform,
            "kernel of platform {} enqueued on platform {}",
            kernel.device.platform,
            queue.device.platform
        );
        for arg in kernel.args.values() {
            if let MockArg::Buffer(buffer) = arg {
                buffer.check_usable()?;
            }
        }
        let device = self.device(queue.device)?;
        let launch = MockLaunch {
            range,
            device: &device.name,
            args: &kernel.args,
        };
        (kernel.body)(&launch)
    }

    fn enqueue_acquire_graphics(
        &self,
        queue: &MockQueue,
        buffers: &[&MockBuffer],
        wait: &[&HostEvent],
    ) -> anyhow::Result<()> {
        self.call("acquire", Some(queue.device), wait)?;
        for buffer in buffers {
            let acquired = buffer
                .graphics
                .as_ref()
                .ok_or_else(|| anyhow!("buffer is not backed by a graphics object"))?;
            ensure!(
                !acquired.swap(true, Ordering::SeqCst),
                "graphics object already acquired"
            );
        }
        Ok(())
    }

    fn enqueue_release_graphics(
        &self,
        queue: &MockQueue,
        buffers: &[&MockBuffer],
        wait: &[&HostEvent],
    ) -> anyhow::Result<()> {
        self.call("release", Some(queue.device), wait)?;
        for buffer in buffers {
            let acquired = buffer
                .graphics
                .as_ref()
                .ok_or_else(|| anyhow!("buffer is not backed by a graphics object"))?;
            ensure!(
                acquired.swap(false, Ordering::SeqCst),
                "graphics object was not acquired"
            );
        }
        Ok(())
    }

    fn finish(&self, queue: &MockQueue) -> anyhow::Result<()> {
        self.call("finish", Some(queue.device), &[])
    }
}

#[cfg(test)]
mod mock_tests {
    use super::*;

    fn backend() -> MockBackend {
        MockBackend::new().with_platform(
            MockPlatform::new("p")
                .with_device(MockDevice::cpu("c"))
                .with_device(MockDevice::gpu("g0"))
                .with_device(MockDevice::gpu("g1")),
        )
    }

    #[test]
    fn device_filters() {
        let backend = backend();
        let platform = MockPlatformHandle { index: 0 };
        assert_eq!(backend.devices(&platform, DeviceTypeFilter::Cpu).unwrap().len(), 1);
        assert_eq!(backend.devices(&platform, DeviceTypeFilter::Gpu).unwrap().len(), 2);
        assert_eq!(
            backend.devices(&platform, DeviceTypeFilter::Default).unwrap(),
            vec![MockDeviceHandle { platform: 0, index: 0 }]
        );
    }

    #[test]
    fn contexts_are_counted_while_alive() {
        let backend = backend();
        let platform = MockPlatformHandle { index: 0 };
        let devices = backend.devices(&platform, DeviceTypeFilter::Gpu).unwrap();
        let context = backend.create_context(&platform, &devices, false).unwrap();
        assert_eq!(backend.live_contexts(), 1);
        drop(context);
        assert_eq!(backend.live_contexts(), 0);
    }

    #[test]
    fn injected_failures_are_reported() {
        let backend = MockBackend::new().with_platform(
            MockPlatform::new("p").with_device(MockDevice::cpu("c").failing_op("write")),
        );
        let platform = MockPlatformHandle { index: 0 };
        let device = MockDeviceHandle { platform: 0, index: 0 };
        let context = backend.create_context(&platform, &[device], false).unwrap();
        let buffer = backend
            .create_buffer(&context, &device, MemFlags::ReadWrite, 4)
            .unwrap();
        let queue = backend.create_queue(&context, &device).unwrap();
        let err = backend
            .enqueue_write(&queue, &buffer, true, 0, &[1, 2, 3, 4], &[])
            .unwrap_err();
        assert!(err.to_string().contains("injected write failure"));
        assert_eq!(buffer.contents(), vec![0; 4]);
    }

    #[test]
    fn overwrite_stays_inside_the_buffer() {
        let backend = backend();
        let platform = MockPlatformHandle { index: 0 };
        let device = MockDeviceHandle { platform: 0, index: 0 };
        let context = backend.create_context(&platform, &[device], false).unwrap();
        let buffer = backend
            .create_buffer(&context, &device, MemFlags::ReadWrite, 4)
            .unwrap();

        buffer.overwrite(2, &[7, 8]).unwrap();
        assert_eq!(buffer.contents(), vec![0, 0, 7, 8]);
        assert!(buffer.overwrite(3, &[1, 2]).is_err());
        assert!(buffer.overwrite(u64::MAX, &[1]).is_err());
        assert_eq!(buffer.contents(), vec![0, 0, 7, 8]);
    }
}
