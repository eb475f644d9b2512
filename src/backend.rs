//! This module contains the seam between the proxy and a native compute API.
//!
//! A [`ComputeBackend`] exposes the primitives of a host compute API (platforms, devices,
//! contexts, programs, kernels, command queues and buffers) as plain synchronous calls.
//! The proxy never talks to a device in any other way, so every backend is
//! interchangeable: [`crate::interface::WgpuBackend`] drives real adapters through [`wgpu`],
//! while [`crate::mock::MockBackend`] runs host closures on in-memory buffers.

use crate::event::HostEvent;
use std::fmt::Debug;

/// The kind of a compute device, as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Accelerator,
    Other,
}

/// The device type filter used to enumerate devices
///
/// [`DeviceTypeFilter::All`] is emulated by querying [`DeviceTypeFilter::Cpu`] and
/// [`DeviceTypeFilter::Gpu`] separately when the backend has no native "all" query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceTypeFilter {
    Cpu,
    Gpu,
    Default,
    #[default]
    All,
}

/// Access flags of a buffer, identical across all the replicas of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemFlags {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub name: String,
    pub vendor: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub kind: DeviceType,
}

/// Work group limits of a kernel on a given device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkGroupInfo {
    pub work_group_size: usize,
    pub compile_work_group_size: [usize; 3],
    pub local_mem_size: u64,
    pub preferred_work_group_size_multiple: usize,
    pub private_mem_size: u64,
}

/// A kernel argument as handed to the native API, already resolved to a single replica
#[derive(Debug)]
pub enum NativeArg<'a, B> {
    Buffer(&'a B),
    Scalar(&'a [u8]),
    Local(u64),
}

/// A validated N-dimensional range, with unused dimensions set to `0` offset and `1` size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub dimensions: usize,
    pub offset: [usize; 3],
    pub global: [usize; 3],
    pub local: Option<[usize; 3]>,
}

impl NdRange {
    /// Number of work groups per dimension, a missing local size counts as `1`
    pub fn work_groups(&self) -> [usize; 3] {
        let local = self.local.unwrap_or([1; 3]);
        [
            self.global[0] / local[0],
            self.global[1] / local[1],
            self.global[2] / local[2],
        ]
    }

    /// Total number of work items in the range
    pub fn work_items(&self) -> usize {
        self.global.iter().product()
    }
}

/// The host compute API the proxy fans out to.
///
/// All the calls are blocking: when they return the native operation either completed or failed.
/// Handles are released when dropped. Failures are reported as [`anyhow::Error`] and are wrapped
/// by the proxy together with the device they happened on.
pub trait ComputeBackend {
    type Platform: Clone + Debug;
    type Device: Clone + Debug;
    type Context;
    type Buffer;
    type Program;
    type Kernel;
    type Queue;
    /// An externally owned graphics object a buffer can be created from
    type GraphicsResource: ?Sized;

    fn platforms(&self) -> anyhow::Result<Vec<Self::Platform>>;

    fn platform_info(&self, platform: &Self::Platform) -> PlatformInfo;

    /// Devices of `platform` matching `filter`.
    ///
    /// [`DeviceTypeFilter::All`] is only requested when [`ComputeBackend::supports_all_query`] is true.
    fn devices(
        &self,
        platform: &Self::Platform,
        filter: DeviceTypeFilter,
    ) -> anyhow::Result<Vec<Self::Device>>;

    /// Whether the native API answers [`DeviceTypeFilter::All`] correctly
    fn supports_all_query(&self) -> bool {
        false
    }

    fn device_info(&self, device: &Self::Device) -> DeviceInfo;

    fn supports_interop(&self, platform: &Self::Platform) -> bool;

    fn create_context(
        &self,
        platform: &Self::Platform,
        devices: &[Self::Device],
        interop: bool,
    ) -> anyhow::Result<Self::Context>;

    fn create_buffer(
        &self,
        context: &Self::Context,
        device: &Self::Device,
        flags: MemFlags,
        size: u64,
    ) -> anyhow::Result<Self::Buffer>;

    fn create_buffer_from_graphics(
        &self,
        context: &Self::Context,
        device: &Self::Device,
        flags: MemFlags,
        resource: &Self::GraphicsResource,
    ) -> anyhow::Result<Self::Buffer>;

    fn buffer_size(&self, buffer: &Self::Buffer) -> u64;

    fn create_program(&self, context: &Self::Context, source: &str)
        -> anyhow::Result<Self::Program>;

    fn build_program(
        &self,
        program: &mut Self::Program,
        devices: &[Self::Device],
    ) -> anyhow::Result<()>;

    /// The build log of `program` for `device`, empty when nothing was logged
    fn build_log(&self, program: &Self::Program, device: &Self::Device) -> String;

    fn create_kernel(
        &self,
        program: &Self::Program,
        device: &Self::Device,
        name: &str,
    ) -> anyhow::Result<Self::Kernel>;

    fn set_kernel_arg(
        &self,
        kernel: &mut Self::Kernel,
        index: u32,
        arg: NativeArg<'_, Self::Buffer>,
    ) -> anyhow::Result<()>;

    fn work_group_info(
        &self,
        kernel: &Self::Kernel,
        device: &Self::Device,
    ) -> anyhow::Result<WorkGroupInfo>;

    fn create_queue(
        &self,
        context: &Self::Context,
        device: &Self::Device,
    ) -> anyhow::Result<Self::Queue>;

    fn enqueue_write(
        &self,
        queue: &Self::Queue,
        buffer: &Self::Buffer,
        blocking: bool,
        offset: u64,
        data: &[u8],
        wait: &[&HostEvent],
    ) -> anyhow::Result<()>;

    fn enqueue_read(
        &self,
        queue: &Self::Queue,
        buffer: &Self::Buffer,
        blocking: bool,
        offset: u64,
        data: &mut [u8],
        wait: &[&HostEvent],
    ) -> anyhow::Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn enqueue_copy(
        &self,
        queue: &Self::Queue,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        src_offset: u64,
        dst_offset: u64,
        num_bytes: u64,
        wait: &[&HostEvent],
    ) -> anyhow::Result<()>;

    fn enqueue_range(
        &self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        range: &NdRange,
        wait: &[&HostEvent],
    ) -> anyhow::Result<()>;

    fn enqueue_acquire_graphics(
        &self,
        queue: &Self::Queue,
        buffers: &[&Self::Buffer],
        wait: &[&HostEvent],
    ) -> anyhow::Result<()>;

    fn enqueue_release_graphics(
        &self,
        queue: &Self::Queue,
        buffers: &[&Self::Buffer],
        wait: &[&HostEvent],
    ) -> anyhow::Result<()>;

    fn finish(&self, queue: &Self::Queue) -> anyhow::Result<()>;
}
