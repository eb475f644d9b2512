//! This module contains the code to interface with the GPU devices of the machine.
//!
//! [`WgpuBackend`] implements [`ComputeBackend`] on top of the [`wgpu`] crate:
//! - every wgpu backend (Vulkan, Metal, DX12, GL...) with at least one adapter is a platform
//! - every adapter is a device
//! - a context opens one [`wgpu::Device`] and [`wgpu::Queue`] per adapter
//! - programs are WGSL modules, compiled once per device, and kernels are compute pipelines
//!   whose entry point is the kernel name
//!
//! Kernel arguments are bindings of bind group `0`, the argument index being the binding number.
//! WGSL fixes the work group size in the shader (`@workgroup_size`), so the local size given to a
//! range only decides the number of work groups dispatched: `global / local` per dimension.
//!
//! Every wgpu call is made inside an error scope, so validation and out of memory errors
//! come back as [`anyhow::Error`] instead of reaching the uncaptured error handler.

use crate::backend::{
    ComputeBackend, DeviceInfo, DeviceType, DeviceTypeFilter, MemFlags, NativeArg, NdRange,
    PlatformInfo, WorkGroupInfo,
};
use crate::event::HostEvent;
use anyhow::{anyhow, bail, ensure};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use wgpu::util::DeviceExt;

/// Options used to open the wgpu instance and its devices
#[derive(Debug, Clone)]
pub struct WgpuBackendOptions {
    /// Backends enumerated as platforms. Defaults to `WGPU_BACKEND` when set, all of them otherwise
    pub backends: wgpu::Backends,
    /// Limits requested for every device opened by a context
    pub limits: wgpu::Limits,
}

impl Default for WgpuBackendOptions {
    fn default() -> Self {
        WgpuBackendOptions {
            backends: wgpu::util::backend_bits_from_env().unwrap_or_else(wgpu::Backends::all),
            limits: wgpu::Limits::downlevel_defaults(),
        }
    }
}

/// An adapter, together with its position in the enumeration
#[derive(Clone)]
pub struct WgpuAdapter {
    ordinal: usize,
    info: wgpu::AdapterInfo,
    adapter: Arc<wgpu::Adapter>,
}

impl fmt::Debug for WgpuAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuAdapter")
            .field("ordinal", &self.ordinal)
            .field("name", &self.info.name)
            .field("backend", &self.info.backend)
            .finish()
    }
}

impl WgpuAdapter {
    pub fn info(&self) -> &wgpu::AdapterInfo {
        &self.info
    }
}

/// A logical device opened on one adapter
#[derive(Clone)]
struct OpenDevice {
    ordinal: usize,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
}

pub struct WgpuContext {
    backend: wgpu::Backend,
    devices: Vec<OpenDevice>,
}

impl WgpuContext {
    fn open(&self, adapter: &WgpuAdapter) -> anyhow::Result<&OpenDevice> {
        self.devices
            .iter()
            .find(|open| open.ordinal == adapter.ordinal)
            .ok_or_else(|| anyhow!("adapter {} is not part of the context", adapter.info.name))
    }
}

pub struct WgpuBuffer {
    ordinal: usize,
    buffer: Arc<wgpu::Buffer>,
    flags: MemFlags,
}

impl WgpuBuffer {
    pub fn flags(&self) -> MemFlags {
        self.flags
    }
}

pub struct WgpuProgram {
    source: String,
    devices: Vec<OpenDevice>,
    modules: HashMap<usize, wgpu::ShaderModule>,
    logs: HashMap<usize, String>,
}

pub struct WgpuKernel {
    ordinal: usize,
    name: String,
    device: Arc<wgpu::Device>,
    pipeline: wgpu::ComputePipeline,
    args: BTreeMap<u32, Arc<wgpu::Buffer>>,
}

pub struct WgpuQueue {
    ordinal: usize,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
}

/// Runs `operation` inside validation and out of memory error scopes of `device`
fn scoped<T>(device: &wgpu::Device, operation: impl FnOnce() -> T) -> anyhow::Result<T> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = operation();
    let validation = pollster::block_on(device.pop_error_scope());
    let out_of_memory = pollster::block_on(device.pop_error_scope());
    match validation.or(out_of_memory) {
        Some(error) => Err(anyhow!("{error}")),
        None => Ok(value),
    }
}

fn check_alignment(what: &str, value: u64) -> anyhow::Result<()> {
    ensure!(
        value % wgpu::COPY_BUFFER_ALIGNMENT == 0,
        "{what} {value} is not a multiple of {}",
        wgpu::COPY_BUFFER_ALIGNMENT
    );
    Ok(())
}

fn device_type(kind: wgpu::DeviceType) -> DeviceType {
    match kind {
        wgpu::DeviceType::Cpu => DeviceType::Cpu,
        wgpu::DeviceType::IntegratedGpu
        | wgpu::DeviceType::DiscreteGpu
        | wgpu::DeviceType::VirtualGpu => DeviceType::Gpu,
        wgpu::DeviceType::Other => DeviceType::Other,
    }
}

/// Contains all the functions to interact with the GPU devices in the machine.
///
/// A range dispatches `global / local` work groups per dimension, the local size defaulting to 1.
/// It covers exactly `global` invocations only when the local size given to the range equals the
/// shader's `@workgroup_size`: with `@workgroup_size(64)` and no local size, every work item runs
/// 64 times.
pub struct WgpuBackend {
    instance: wgpu::Instance,
    options: WgpuBackendOptions,
}

impl WgpuBackend {
    pub fn new() -> Self {
        WgpuBackend::with_options(WgpuBackendOptions::default())
    }

    pub fn with_options(options: WgpuBackendOptions) -> Self {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: options.backends,
            ..Default::default()
        });
        WgpuBackend { instance, options }
    }

    pub fn options(&self) -> &WgpuBackendOptions {
        &self.options
    }

    fn adapters(&self) -> Vec<WgpuAdapter> {
        self.instance
            .enumerate_adapters(self.options.backends)
            .into_iter()
            .enumerate()
            .map(|(ordinal, adapter)| WgpuAdapter {
                ordinal,
                info: adapter.get_info(),
                adapter: Arc::new(adapter),
            })
            .collect()
    }
}

impl Default for WgpuBackend {
    fn default() -> Self {
        WgpuBackend::new()
    }
}

impl fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ComputeBackend for WgpuBackend {
    type Platform = wgpu::Backend;
    type Device = WgpuAdapter;
    type Context = WgpuContext;
    type Buffer = WgpuBuffer;
    type Program = WgpuProgram;
    type Kernel = WgpuKernel;
    type Queue = WgpuQueue;
    /// No graphics API is shared with wgpu
    type GraphicsResource = std::convert::Infallible;

    fn platforms(&self) -> anyhow::Result<Vec<wgpu::Backend>> {
        let mut backends: Vec<wgpu::Backend> = Vec::new();
        for adapter in self.adapters() {
            if !backends.contains(&adapter.info.backend) {
                backends.push(adapter.info.backend);
            }
        }
        log::debug!("wgpu backends with adapters: {backends:?}");
        Ok(backends)
    }

    fn platform_info(&self, platform: &wgpu::Backend) -> PlatformInfo {
        PlatformInfo {
            name: format!("{platform:?}"),
            vendor: "wgpu".to_string(),
            version: "0.19".to_string(),
        }
    }

    fn devices(
        &self,
        platform: &wgpu::Backend,
        filter: DeviceTypeFilter,
    ) -> anyhow::Result<Vec<WgpuAdapter>> {
        let adapters = self
            .adapters()
            .into_iter()
            .filter(|adapter| adapter.info.backend == *platform);
        let selected: Vec<WgpuAdapter> = match filter {
            DeviceTypeFilter::Cpu => adapters
                .filter(|adapter| device_type(adapter.info.device_type) == DeviceType::Cpu)
                .collect(),
            DeviceTypeFilter::Gpu => adapters
                .filter(|adapter| device_type(adapter.info.device_type) == DeviceType::Gpu)
                .collect(),
            DeviceTypeFilter::All => adapters.collect(),
            DeviceTypeFilter::Default => {
                let adapters: Vec<WgpuAdapter> = adapters.collect();
                let position = adapters
                    .iter()
                    .position(|adapter| device_type(adapter.info.device_type) == DeviceType::Gpu)
                    .unwrap_or(0);
                adapters.into_iter().skip(position).take(1).collect()
            }
        };
        Ok(selected)
    }

    fn supports_all_query(&self) -> bool {
        true
    }

    fn device_info(&self, device: &WgpuAdapter) -> DeviceInfo {
        DeviceInfo {
            name: device.info.name.clone(),
            vendor: format!("{:#06x}", device.info.vendor),
            kind: device_type(device.info.device_type),
        }
    }

    fn supports_interop(&self, _platform: &wgpu::Backend) -> bool {
        false
    }

    fn create_context(
        &self,
        platform: &wgpu::Backend,
        devices: &[WgpuAdapter],
        interop: bool,
    ) -> anyhow::Result<WgpuContext> {
        ensure!(!interop, "wgpu contexts can't share graphics objects");
        let mut opened = Vec::with_capacity(devices.len());
        for adapter in devices {
            ensure!(
                adapter.info.backend == *platform,
                "adapter {} belongs to {:?}",
                adapter.info.name,
                adapter.info.backend
            );
            let (device, queue) = pollster::block_on(adapter.adapter.request_device(
                &wgpu::DeviceDescriptor {
                    label: Some(adapter.info.name.as_str()),
                    required_features: wgpu::Features::empty(),
                    required_limits: self.options.limits.clone(),
                },
                None,
            ))?;
            opened.push(OpenDevice {
                ordinal: adapter.ordinal,
                device: Arc::new(device),
                queue: Arc::new(queue),
            });
        }
        Ok(WgpuContext {
            backend: *platform,
            devices: opened,
        })
    }

    fn create_buffer(
        &self,
        context: &WgpuContext,
        device: &WgpuAdapter,
        flags: MemFlags,
        size: u64,
    ) -> anyhow::Result<WgpuBuffer> {
        let open = context.open(device)?;
        check_alignment("buffer size", size)?;
        let buffer = scoped(&open.device, || {
            open.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("multicl buffer"),
                size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        })?;
        Ok(WgpuBuffer {
            ordinal: open.ordinal,
            buffer: Arc::new(buffer),
            flags,
        })
    }

    fn create_buffer_from_graphics(
        &self,
        _context: &WgpuContext,
        _device: &WgpuAdapter,
        _flags: MemFlags,
        resource: &std::convert::Infallible,
    ) -> anyhow::Result<WgpuBuffer> {
        match *resource {}
    }

    fn buffer_size(&self, buffer: &WgpuBuffer) -> u64 {
        buffer.buffer.size()
    }

    fn create_program(&self, context: &WgpuContext, source: &str) -> anyhow::Result<WgpuProgram> {
        log::trace!("program created on {:?}", context.backend);
        Ok(WgpuProgram {
            source: source.to_string(),
            devices: context.devices.clone(),
            modules: HashMap::new(),
            logs: HashMap::new(),
        })
    }

    fn build_program(
        &self,
        program: &mut WgpuProgram,
        devices: &[WgpuAdapter],
    ) -> anyhow::Result<()> {
        program.modules.clear();
        program.logs.clear();
        for adapter in devices {
            let open = program
                .devices
                .iter()
                .find(|open| open.ordinal == adapter.ordinal)
                .ok_or_else(|| anyhow!("adapter {} is not part of the program", adapter.info.name))?;
            let compiled = scoped(&open.device, || {
                open.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("multicl program"),
                    source: wgpu::ShaderSource::Wgsl(std::borrow::Cow::Borrowed(&program.source)),
                })
            });
            match compiled {
                Ok(module) => {
                    program.modules.insert(adapter.ordinal, module);
                }
                Err(e) => {
                    program.logs.insert(adapter.ordinal, format!("{e:#}"));
                }
            }
        }
        if !program.logs.is_empty() {
            program.modules.clear();
            bail!("WGSL compilation failed on {} devices", program.logs.len());
        }
        Ok(())
    }

    fn build_log(&self, program: &WgpuProgram, device: &WgpuAdapter) -> String {
        program
            .logs
            .get(&device.ordinal)
            .cloned()
            .unwrap_or_default()
    }

    fn create_kernel(
        &self,
        program: &WgpuProgram,
        device: &WgpuAdapter,
        name: &str,
    ) -> anyhow::Result<WgpuKernel> {
        let module = program
            .modules
            .get(&device.ordinal)
            .ok_or_else(|| anyhow!("program is not built for {}", device.info.name))?;
        let open = program
            .devices
            .iter()
            .find(|open| open.ordinal == device.ordinal)
            .ok_or_else(|| anyhow!("adapter {} is not part of the program", device.info.name))?;
        let pipeline = scoped(&open.device, || {
            open.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(name),
                    layout: None,
                    module,
                    entry_point: name,
                })
        })?;
        Ok(WgpuKernel {
            ordinal: device.ordinal,
            name: name.to_string(),
            device: Arc::clone(&open.device),
            pipeline,
            args: BTreeMap::new(),
        })
    }

    fn set_kernel_arg(
        &self,
        kernel: &mut WgpuKernel,
        index: u32,
        arg: NativeArg<'_, WgpuBuffer>,
    ) -> anyhow::Result<()> {
        let buffer = match arg {
            NativeArg::Buffer(buffer) => {
                ensure!(
                    buffer.ordinal == kernel.ordinal,
                    "buffer of another device bound to kernel {}",
                    kernel.name
                );
                Arc::clone(&buffer.buffer)
            }
            NativeArg::Scalar(bytes) => {
                // uniform bindings are at least 16 bytes wide
                let padded = (bytes.len().max(16) + 3) & !3;
                let mut contents = bytes.to_vec();
                contents.resize(padded, 0);
                let buffer = scoped(&kernel.device, || {
                    kernel
                        .device
                        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                            label: Some("multicl scalar argument"),
                            contents: &contents,
                            usage: wgpu::BufferUsages::UNIFORM
                                | wgpu::BufferUsages::STORAGE
                                | wgpu::BufferUsages::COPY_DST,
                        })
                })?;
                Arc::new(buffer)
            }
            NativeArg::Local(_) => {
                bail!("WGSL workgroup memory is declared in the shader, it can't be an argument")
            }
        };
        kernel.args.insert(index, buffer);
        Ok(())
    }

    fn work_group_info(
        &self,
        kernel: &WgpuKernel,
        device: &WgpuAdapter,
    ) -> anyhow::Result<WorkGroupInfo> {
        ensure!(
            kernel.ordinal == device.ordinal,
            "kernel {} queried on another device",
            kernel.name
        );
        let limits = kernel.device.limits();
        let multiple = match device_type(device.info.device_type) {
            DeviceType::Gpu => 32,
            _ => 1,
        };
        Ok(WorkGroupInfo {
            work_group_size: limits.max_compute_invocations_per_workgroup as usize,
            compile_work_group_size: [0; 3],
            local_mem_size: u64::from(limits.max_compute_workgroup_storage_size),
            preferred_work_group_size_multiple: multiple,
            private_mem_size: 0,
        })
    }

    fn create_queue(&self, context: &WgpuContext, device: &WgpuAdapter) -> anyhow::Result<WgpuQueue> {
        let open = context.open(device)?;
        Ok(WgpuQueue {
            ordinal: open.ordinal,
            device: Arc::clone(&open.device),
            queue: Arc::clone(&open.queue),
        })
    }

    fn enqueue_write(
        &self,
        queue: &WgpuQueue,
        buffer: &WgpuBuffer,
        blocking: bool,
        offset: u64,
        data: &[u8],
        _wait: &[&HostEvent],
    ) -> anyhow::Result<()> {
        ensure!(buffer.ordinal == queue.ordinal, "buffer of another device");
        check_alignment("offset", offset)?;
        check_alignment("size", data.len() as u64)?;
        scoped(&queue.device, || {
            queue.queue.write_buffer(&buffer.buffer, offset, data);
            queue.queue.submit(std::iter::empty());
        })?;
        if blocking {
            queue.device.poll(wgpu::Maintain::Wait);
        }
        Ok(())
    }

    fn enqueue_read(
        &self,
        queue: &WgpuQueue,
        buffer: &WgpuBuffer,
        _blocking: bool,
        offset: u64,
        data: &mut [u8],
        _wait: &[&HostEvent],
    ) -> anyhow::Result<()> {
        ensure!(buffer.ordinal == queue.ordinal, "buffer of another device");
        let size = data.len() as u64;
        check_alignment("offset", offset)?;
        check_alignment("size", size)?;

        let staging = scoped(&queue.device, || {
            let staging = queue.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("multicl staging buffer"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = queue
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("multicl read"),
                });
            encoder.copy_buffer_to_buffer(&buffer.buffer, offset, &staging, 0, size);
            queue.queue.submit(Some(encoder.finish()));
            staging
        })?;

        // reads always block, the bytes are needed before returning
        let slice = staging.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        queue.device.poll(wgpu::Maintain::Wait);
        match pollster::block_on(receiver.receive()) {
            Some(Ok(())) => {}
            Some(Err(e)) => bail!("mapping the staging buffer failed: {e}"),
            None => bail!("staging buffer mapping was dropped"),
        }
        data.copy_from_slice(&slice.get_mapped_range());
        staging.unmap();
        Ok(())
    }

    fn enqueue_copy(
        &self,
        queue: &WgpuQueue,
        src: &WgpuBuffer,
        dst: &WgpuBuffer,
        src_offset: u64,
        dst_offset: u64,
        num_bytes: u64,
        _wait: &[&HostEvent],
    ) -> anyhow::Result<()> {
        ensure!(
            src.ordinal == queue.ordinal && dst.ordinal == queue.ordinal,
            "buffer of another device"
        );
        check_alignment("source offset", src_offset)?;
        check_alignment("destination offset", dst_offset)?;
        check_alignment("size", num_bytes)?;
        scoped(&queue.device, || {
            let mut encoder = queue
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("multicl copy"),
                });
            encoder.copy_buffer_to_buffer(&src.buffer, src_offset, &dst.buffer, dst_offset, num_bytes);
            queue.queue.submit(Some(encoder.finish()));
        })?;
        queue.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn enqueue_range(
        &self,
        queue: &WgpuQueue,
        kernel: &WgpuKernel,
        range: &NdRange,
        _wait: &[&HostEvent],
    ) -> anyhow::Result<()> {
        ensure!(
            kernel.ordinal == queue.ordinal,
            "pipelines can't run on another device's queue"
        );
        ensure!(range.offset == [0; 3], "wgpu has no global offset");
        let groups = range.work_groups();
        let [x, y, z] = [
            u32::try_from(groups[0])?,
            u32::try_from(groups[1])?,
            u32::try_from(groups[2])?,
        ];

        scoped(&queue.device, || {
            let bind_group = (!kernel.args.is_empty()).then(|| {
                let layout = kernel.pipeline.get_bind_group_layout(0);
                let entries: Vec<wgpu::BindGroupEntry> = kernel
                    .args
                    .iter()
                    .map(|(binding, buffer)| wgpu::BindGroupEntry {
                        binding: *binding,
                        resource: buffer.as_entire_binding(),
                    })
                    .collect();
                queue.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(kernel.name.as_str()),
                    layout: &layout,
                    entries: &entries,
                })
            });

            let mut encoder = queue
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some(kernel.name.as_str()),
                });
            {
                let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(kernel.name.as_str()),
                    timestamp_writes: None,
                });
                compute_pass.set_pipeline(&kernel.pipeline);
                if let Some(bind_group) = &bind_group {
                    compute_pass.set_bind_group(0, bind_group, &[]);
                }
                compute_pass.dispatch_workgroups(x, y, z);
            }
            queue.queue.submit(Some(encoder.finish()));
        })?;
        queue.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn enqueue_acquire_graphics(
        &self,
        _queue: &WgpuQueue,
        _buffers: &[&WgpuBuffer],
        _wait: &[&HostEvent],
    ) -> anyhow::Result<()> {
        bail!("wgpu buffers are never backed by graphics objects")
    }

    fn enqueue_release_graphics(
        &self,
        _queue: &WgpuQueue,
        _buffers: &[&WgpuBuffer],
        _wait: &[&HostEvent],
    ) -> anyhow::Result<()> {
        bail!("wgpu buffers are never backed by graphics objects")
    }

    fn finish(&self, queue: &WgpuQueue) -> anyhow::Result<()> {
        queue.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

#[cfg(test)]
mod interface_test {
    use super::*;

    #[test]
    fn adapter_types_map_to_device_types() {
        assert_eq!(device_type(wgpu::DeviceType::DiscreteGpu), DeviceType::Gpu);
        assert_eq!(device_type(wgpu::DeviceType::IntegratedGpu), DeviceType::Gpu);
        assert_eq!(device_type(wgpu::DeviceType::Cpu), DeviceType::Cpu);
        assert_eq!(device_type(wgpu::DeviceType::Other), DeviceType::Other);
    }

    #[test]
    fn copies_must_be_aligned() {
        assert!(check_alignment("size", 16).is_ok());
        assert!(check_alignment("size", 6).is_err());
    }
}
