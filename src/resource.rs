//! Buffer, program, kernel and command queue factories.
//!
//! Each factory replicates a native resource once per device of a [`ContextGroup`] and
//! returns the replicas as a single group. A failure on any device aborts the whole group:
//! the replicas created so far are dropped and the error is returned, never a partial group.

use crate::backend::{ComputeBackend, MemFlags, NativeArg, WorkGroupInfo};
use crate::context::ContextGroup;
use crate::errors::{NativeOp, ProxyError, Result};
use crate::group::{DeviceId, DeviceLabel, Replica, ResourceGroup};
use crate::platform::DeviceEntry;
use crate::session::Session;
use crate::source::KernelSource;
use std::fmt;

/// A buffer replicated on every device, all replicas with the same size and flags
pub struct BufferGroup<B: ComputeBackend> {
    replicas: ResourceGroup<B::Buffer>,
    flags: MemFlags,
    size: u64,
    graphics: bool,
}

impl<B: ComputeBackend> BufferGroup<B> {
    pub fn replicas(&self) -> &ResourceGroup<B::Buffer> {
        &self.replicas
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    /// Size in bytes of every replica
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the replicas are backed by a graphics object
    pub fn is_graphics(&self) -> bool {
        self.graphics
    }
}

impl<B: ComputeBackend> fmt::Debug for BufferGroup<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferGroup")
            .field("devices", &self.replicas.device_ids())
            .field("flags", &self.flags)
            .field("size", &self.size)
            .field("graphics", &self.graphics)
            .finish()
    }
}

/// A program compiled once per context, covering all the devices of that context
pub struct ProgramEntry<B: ComputeBackend> {
    devices: Vec<DeviceEntry<B>>,
    native: B::Program,
}

impl<B: ComputeBackend> ProgramEntry<B> {
    pub fn devices(&self) -> &[DeviceEntry<B>] {
        &self.devices
    }

    pub fn native(&self) -> &B::Program {
        &self.native
    }
}

pub struct ProgramGroup<B: ComputeBackend> {
    entries: Vec<ProgramEntry<B>>,
    built: bool,
}

impl<B: ComputeBackend> ProgramGroup<B> {
    pub fn entries(&self) -> &[ProgramEntry<B>] {
        &self.entries
    }

    /// True once [`Session::build`] succeeded on every context
    pub fn is_built(&self) -> bool {
        self.built
    }
}

impl<B: ComputeBackend> fmt::Debug for ProgramGroup<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramGroup")
            .field("contexts", &self.entries.len())
            .field("built", &self.built)
            .finish()
    }
}

/// One kernel object per device, so that arguments can be bound per device
pub struct KernelGroup<B: ComputeBackend> {
    name: String,
    replicas: ResourceGroup<B::Kernel>,
    devices: Vec<DeviceEntry<B>>,
}

impl<B: ComputeBackend> KernelGroup<B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn replicas(&self) -> &ResourceGroup<B::Kernel> {
        &self.replicas
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    fn device(&self, id: DeviceId) -> Option<&DeviceEntry<B>> {
        self.devices.iter().find(|device| device.id() == id)
    }
}

impl<B: ComputeBackend> fmt::Debug for KernelGroup<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelGroup")
            .field("name", &self.name)
            .field("devices", &self.replicas.device_ids())
            .finish()
    }
}

/// One command queue per device
pub struct QueueGroup<B: ComputeBackend> {
    replicas: ResourceGroup<B::Queue>,
}

impl<B: ComputeBackend> QueueGroup<B> {
    pub fn replicas(&self) -> &ResourceGroup<B::Queue> {
        &self.replicas
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

impl<B: ComputeBackend> fmt::Debug for QueueGroup<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueGroup")
            .field("devices", &self.replicas.device_ids())
            .finish()
    }
}

/// An argument bound to every replica of a [`KernelGroup`]
pub enum KernelArgument<'a, B: ComputeBackend> {
    /// Each kernel replica gets the buffer replica of its own device
    Buffer(&'a BufferGroup<B>),
    /// Raw bytes of a scalar value, identical for every replica
    Scalar(&'a [u8]),
    /// Size in bytes of a local memory argument
    Local(u64),
}

impl<'a, B: ComputeBackend> KernelArgument<'a, B> {
    /// A scalar argument from any plain value
    pub fn scalar<T: bytemuck::Pod>(value: &'a T) -> Self {
        KernelArgument::Scalar(bytemuck::bytes_of(value))
    }
}

impl<B: ComputeBackend> Session<B> {
    /// Creates one buffer of `size` bytes per device under each context.
    ///
    /// # Errors
    /// - [`ProxyError::InvalidArgument`] if `size` is zero
    /// - [`ProxyError::Native`] for the first device failing the creation
    pub fn create_buffer(
        &self,
        contexts: &ContextGroup<B>,
        flags: MemFlags,
        size: u64,
    ) -> Result<BufferGroup<B>> {
        if size == 0 {
            return Err(ProxyError::invalid("size", "buffers can't be empty"));
        }
        let mut replicas = Vec::with_capacity(contexts.device_count());
        for (context, device) in contexts.device_entries() {
            let native = self
                .backend()
                .create_buffer(context.native(), device.native(), flags, size)
                .map_err(|e| ProxyError::native(NativeOp::CreateBuffer, &device.label, e))?;
            replicas.push(Replica::new(device.label.clone(), native));
        }
        log::debug!(
            "{}created {size} bytes {flags:?} buffer on {} devices",
            self.log_prefix(),
            replicas.len()
        );
        Ok(BufferGroup {
            replicas: ResourceGroup::new(replicas),
            flags,
            size,
            graphics: false,
        })
    }

    /// Creates one buffer per device backed by the externally owned graphics object `resource`.
    ///
    /// # Errors
    /// - [`ProxyError::InvalidArgument`] if `contexts` were created without interop
    /// - [`ProxyError::Native`] for the first device failing the creation
    pub fn create_buffer_from_graphics(
        &self,
        contexts: &ContextGroup<B>,
        flags: MemFlags,
        resource: &B::GraphicsResource,
    ) -> Result<BufferGroup<B>> {
        if !contexts.interop() {
            return Err(ProxyError::invalid(
                "contexts",
                "graphics buffers need contexts created with interop",
            ));
        }
        let mut replicas = Vec::with_capacity(contexts.device_count());
        let mut size = None;
        for (context, device) in contexts.device_entries() {
            let native = self
                .backend()
                .create_buffer_from_graphics(context.native(), device.native(), flags, resource)
                .map_err(|e| {
                    ProxyError::native(NativeOp::CreateBufferFromGraphics, &device.label, e)
                })?;
            size.get_or_insert(self.backend().buffer_size(&native));
            replicas.push(Replica::new(device.label.clone(), native));
        }
        log::debug!(
            "{}created graphics buffer on {} devices",
            self.log_prefix(),
            replicas.len()
        );
        Ok(BufferGroup {
            replicas: ResourceGroup::new(replicas),
            flags,
            size: size.unwrap_or_default(),
            graphics: true,
        })
    }

    /// Creates one program per context from the same source. The program still needs [`Session::build`].
    ///
    /// # Errors
    /// - [`ProxyError::InvalidArgument`] if the source is empty
    pub fn create_program(
        &self,
        contexts: &ContextGroup<B>,
        source: &KernelSource,
    ) -> Result<ProgramGroup<B>> {
        if source.is_empty() {
            return Err(ProxyError::invalid("source", "program source can't be empty"));
        }
        let mut entries = Vec::with_capacity(contexts.len());
        for context in contexts.iter() {
            let native = self
                .backend()
                .create_program(context.native(), source.get_content())
                .map_err(|e| {
                    ProxyError::native(NativeOp::CreateProgram, first_label(context.devices()), e)
                })?;
            entries.push(ProgramEntry {
                devices: context.devices().to_vec(),
                native,
            });
        }
        log::debug!("{}created program on {} contexts", self.log_prefix(), entries.len());
        Ok(ProgramGroup {
            entries,
            built: false,
        })
    }

    /// Builds every replica of `program` for the devices of its context.
    ///
    /// # Errors
    /// - [`ProxyError::ProgramBuild`] with the build log of the first replica failing to build.
    ///   The program stays unbuilt and no kernel can be created from it
    pub fn build(&self, program: &mut ProgramGroup<B>) -> Result<()> {
        program.built = false;
        for entry in program.entries.iter_mut() {
            let natives: Vec<B::Device> = entry
                .devices
                .iter()
                .map(|device| device.native().clone())
                .collect();
            if let Err(e) = self.backend().build_program(&mut entry.native, &natives) {
                // report the device which logged something, the first one otherwise
                let (device, log) = entry
                    .devices
                    .iter()
                    .map(|device| (device, self.backend().build_log(&entry.native, device.native())))
                    .find(|(_, log)| !log.trim().is_empty())
                    .map(|(device, log)| (device.label.clone(), log))
                    .unwrap_or_else(|| (first_label(&entry.devices).clone(), format!("{e:#}")));
                log::warn!("{}program build failed on {}", self.log_prefix(), device);
                return Err(ProxyError::ProgramBuild { device, log });
            }
        }
        program.built = true;
        log::debug!("{}program built", self.log_prefix());
        Ok(())
    }

    /// Creates the kernel `name` once per device of every program replica.
    ///
    /// # Errors
    /// - [`ProxyError::InvalidArgument`] if `name` is empty or the program was not built
    /// - [`ProxyError::Native`] for the first device failing the creation
    pub fn create_kernel(&self, program: &ProgramGroup<B>, name: &str) -> Result<KernelGroup<B>> {
        if name.is_empty() {
            return Err(ProxyError::invalid("name", "kernel name can't be empty"));
        }
        if !program.built {
            return Err(ProxyError::invalid("program", "program has not been built"));
        }
        let mut replicas = Vec::new();
        let mut devices = Vec::new();
        for entry in &program.entries {
            for device in &entry.devices {
                let native = self
                    .backend()
                    .create_kernel(&entry.native, device.native(), name)
                    .map_err(|e| ProxyError::native(NativeOp::CreateKernel, &device.label, e))?;
                replicas.push(Replica::new(device.label.clone(), native));
                devices.push(device.clone());
            }
        }
        log::debug!(
            "{}created kernel {name} on {} devices",
            self.log_prefix(),
            replicas.len()
        );
        Ok(KernelGroup {
            name: name.to_string(),
            replicas: ResourceGroup::new(replicas),
            devices,
        })
    }

    /// Binds `arg` at `index` on every kernel replica.
    ///
    /// Buffer arguments are resolved per device: every kernel replica gets the buffer replica
    /// living on its own device.
    ///
    /// # Errors
    /// - [`ProxyError::InvalidArgument`] if the argument is empty or a buffer replica is missing,
    ///   before any native call
    /// - [`ProxyError::Native`] for the first replica refusing the argument
    pub fn set_kernel_arg(
        &self,
        kernels: &mut KernelGroup<B>,
        index: u32,
        arg: KernelArgument<'_, B>,
    ) -> Result<()> {
        match &arg {
            KernelArgument::Buffer(buffers) => {
                if let Some(missing) = kernels
                    .replicas
                    .iter()
                    .find(|kernel| buffers.replicas.get(kernel.id()).is_none())
                {
                    return Err(ProxyError::invalid(
                        "arg",
                        format!("buffer has no replica on {}", missing.label()),
                    ));
                }
            }
            KernelArgument::Scalar(bytes) if bytes.is_empty() => {
                return Err(ProxyError::invalid("arg", "scalar argument has no bytes"));
            }
            KernelArgument::Local(0) => {
                return Err(ProxyError::invalid("arg", "local memory size can't be zero"));
            }
            _ => {}
        }

        for kernel in kernels.replicas.iter_mut() {
            let id = kernel.id();
            let native = match &arg {
                KernelArgument::Buffer(buffers) => {
                    NativeArg::Buffer(buffers.replicas.require(id, "buffer")?.native())
                }
                KernelArgument::Scalar(bytes) => NativeArg::Scalar(bytes),
                KernelArgument::Local(size) => NativeArg::Local(*size),
            };
            let label = kernel.label().clone();
            self.backend()
                .set_kernel_arg(kernel.native_mut(), index, native)
                .map_err(|e| ProxyError::native(NativeOp::SetKernelArg, &label, e))?;
        }
        log::trace!(
            "{}kernel {} argument {index} bound on {} devices",
            self.log_prefix(),
            kernels.name,
            kernels.replicas.len()
        );
        Ok(())
    }

    /// Work group limits of every kernel replica, in replica order
    pub fn work_group_info(&self, kernels: &KernelGroup<B>) -> Result<Vec<(DeviceId, WorkGroupInfo)>> {
        kernels
            .replicas
            .iter()
            .map(|kernel| {
                let device = kernels.device(kernel.id()).ok_or_else(|| ProxyError::GroupMismatch {
                    group: "kernel",
                    detail: format!("no device entry for {}", kernel.label()),
                })?;
                let info = self
                    .backend()
                    .work_group_info(kernel.native(), device.native())
                    .map_err(|e| ProxyError::native(NativeOp::KernelInfo, kernel.label(), e))?;
                Ok((kernel.id(), info))
            })
            .collect()
    }

    /// Creates one command queue per device.
    pub fn create_command_queue(&self, contexts: &ContextGroup<B>) -> Result<QueueGroup<B>> {
        let mut replicas = Vec::with_capacity(contexts.device_count());
        for (context, device) in contexts.device_entries() {
            let native = self
                .backend()
                .create_queue(context.native(), device.native())
                .map_err(|e| ProxyError::native(NativeOp::CreateQueue, &device.label, e))?;
            replicas.push(Replica::new(device.label.clone(), native));
        }
        log::debug!("{}created {} command queues", self.log_prefix(), replicas.len());
        Ok(QueueGroup {
            replicas: ResourceGroup::new(replicas),
        })
    }
}

fn first_label<B: ComputeBackend>(devices: &[DeviceEntry<B>]) -> &DeviceLabel {
    // contexts are only created for platforms with at least one device
    &devices[0].label
}
