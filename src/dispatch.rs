//! Fan-out of the enqueue operations, with cross-device agreement on reads.
//!
//! Every operation runs in two phases. First all the arguments are validated and every
//! replica involved is resolved by [`crate::group::DeviceId`]: a malformed call fails here without any
//! native call. Then the native calls are issued device after device, in queue order.
//! A native failure stops the fan-out: replicas visited before keep their new state, the
//! following ones are left untouched.

use crate::backend::{ComputeBackend, NdRange};
use crate::errors::{NativeOp, ProxyError, Result};
use crate::event::{wait_list, EventGroup, HostEvent};
use crate::group::{DeviceLabel, Replica, ResourceGroup};
use crate::resource::{BufferGroup, KernelGroup, QueueGroup};
use crate::session::Session;
use bytemuck::Pod;
use std::fmt::Debug;

/// How kernel replicas are paired with queue replicas by [`Session::enqueue_range`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeMode {
    /// Each queue runs the kernel replica of its own device
    #[default]
    Paired,
    /// Every kernel replica runs on every queue
    Broadcast,
}

/// A queue replica together with the replica it operates on and its wait list
struct Step<'a, Q, T> {
    queue: &'a Replica<Q>,
    target: &'a Replica<T>,
    wait: Vec<&'a HostEvent>,
}

impl<'a, Q, T> Step<'a, Q, T> {
    fn label(&self) -> &'a DeviceLabel {
        self.queue.label()
    }
}

fn check_group_len(group: &'static str, len: usize, queues: usize) -> Result<()> {
    if len != queues {
        return Err(ProxyError::GroupMismatch {
            group,
            detail: format!("{len} replicas for {queues} queues"),
        });
    }
    Ok(())
}

fn check_span(field: &'static str, offset: u64, num_bytes: u64, size: u64) -> Result<()> {
    match offset.checked_add(num_bytes) {
        Some(end) if end <= size => Ok(()),
        _ => Err(ProxyError::invalid(
            field,
            format!("{num_bytes} bytes at offset {offset} overflow a {size} bytes buffer"),
        )),
    }
}

fn check_num_bytes(num_bytes: u64) -> Result<()> {
    if num_bytes == 0 {
        return Err(ProxyError::invalid("num_bytes", "no bytes to transfer"));
    }
    Ok(())
}

/// Normalizes the range arguments to three dimensions.
fn nd_range(
    global_offset: Option<&[usize]>,
    global_size: &[usize],
    local_size: Option<&[usize]>,
) -> Result<NdRange> {
    let dimensions = global_size.len();
    if !(1..=3).contains(&dimensions) {
        return Err(ProxyError::invalid(
            "global_size",
            format!("{dimensions} dimensions, expected 1 to 3"),
        ));
    }
    if global_size.contains(&0) {
        return Err(ProxyError::invalid("global_size", "sizes can't be zero"));
    }

    let mut offset = [0; 3];
    if let Some(values) = global_offset {
        if values.len() != dimensions {
            return Err(ProxyError::invalid(
                "global_offset",
                format!("{} dimensions for a {dimensions} dimensions range", values.len()),
            ));
        }
        offset[..dimensions].copy_from_slice(values);
    }

    let mut global = [1; 3];
    global[..dimensions].copy_from_slice(global_size);

    let local = match local_size {
        None => None,
        Some(values) => {
            if values.len() != dimensions {
                return Err(ProxyError::invalid(
                    "local_size",
                    format!("{} dimensions for a {dimensions} dimensions range", values.len()),
                ));
            }
            let mut local = [1; 3];
            local[..dimensions].copy_from_slice(values);
            if let Some(dim) = (0..dimensions).find(|&d| local[d] == 0 || global[d] % local[d] != 0) {
                return Err(ProxyError::invalid(
                    "local_size",
                    format!(
                        "local size {} doesn't divide global size {} in dimension {dim}",
                        local[dim], global[dim]
                    ),
                ));
            }
            Some(local)
        }
    };

    Ok(NdRange {
        dimensions,
        offset,
        global,
        local,
    })
}

impl<B: ComputeBackend> Session<B> {
    /// Resolves, for every queue replica, the replica of `targets` on the same device and its wait list.
    fn plan<'a, T>(
        &self,
        queues: &'a QueueGroup<B>,
        group: &'static str,
        targets: &'a ResourceGroup<T>,
        wait: &[&'a EventGroup],
    ) -> Result<Vec<Step<'a, B::Queue, T>>> {
        check_group_len(group, targets.len(), queues.len())?;
        queues
            .replicas()
            .iter()
            .map(|queue| {
                Ok(Step {
                    queue,
                    target: targets.require(queue.id(), group)?,
                    wait: wait_list(wait, queue.id())?,
                })
            })
            .collect()
    }

    /// Writes the first `num_bytes` bytes of `data` at `offset` into every replica of `buffer`.
    ///
    /// # Errors
    /// - [`ProxyError::InvalidArgument`] / [`ProxyError::GroupMismatch`] before any native call
    /// - [`ProxyError::Native`] with [`NativeOp::WriteBuffer`] on the first failing device; the
    ///   buffer content is then undefined and should be written again
    #[allow(clippy::too_many_arguments)]
    pub fn write_buffer<T: Pod>(
        &self,
        queues: &QueueGroup<B>,
        buffer: &BufferGroup<B>,
        blocking: bool,
        offset: u64,
        num_bytes: u64,
        data: &[T],
        wait: &[&EventGroup],
    ) -> Result<()> {
        check_num_bytes(num_bytes)?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if (bytes.len() as u64) < num_bytes {
            return Err(ProxyError::invalid(
                "data",
                format!("{} bytes available, {num_bytes} requested", bytes.len()),
            ));
        }
        check_span("num_bytes", offset, num_bytes, buffer.size())?;
        let steps = self.plan(queues, "buffer", buffer.replicas(), wait)?;
        let bytes = &bytes[..num_bytes as usize];

        for step in &steps {
            log::trace!("{}write {num_bytes} bytes on {}", self.log_prefix(), step.label());
            self.backend()
                .enqueue_write(
                    step.queue.native(),
                    step.target.native(),
                    blocking,
                    offset,
                    bytes,
                    &step.wait,
                )
                .map_err(|e| ProxyError::native(NativeOp::WriteBuffer, step.label(), e))?;
        }
        Ok(())
    }

    /// Reads `num_bytes` bytes at `offset` from every replica of `buffer` and checks they all agree.
    ///
    /// The first replica is read into `data`, every following one into a scratch copy which
    /// is compared element by element with the previous replica, bit for bit.
    ///
    /// # Errors
    /// - [`ProxyError::InvalidArgument`] / [`ProxyError::GroupMismatch`] before any native call
    /// - [`ProxyError::Consistency`] naming the two disagreeing devices, the element index and both values
    /// - [`ProxyError::Native`] with [`NativeOp::ReadBuffer`] on the first failing device
    #[allow(clippy::too_many_arguments)]
    pub fn read_buffer<T: Pod + Debug>(
        &self,
        queues: &QueueGroup<B>,
        buffer: &BufferGroup<B>,
        blocking: bool,
        offset: u64,
        num_bytes: u64,
        data: &mut [T],
        wait: &[&EventGroup],
    ) -> Result<()> {
        check_num_bytes(num_bytes)?;
        let element = std::mem::size_of::<T>() as u64;
        if element == 0 || num_bytes % element != 0 {
            return Err(ProxyError::invalid(
                "num_bytes",
                format!("{num_bytes} bytes is not a whole number of {element} bytes elements"),
            ));
        }
        let count = (num_bytes / element) as usize;
        if data.len() < count {
            return Err(ProxyError::invalid(
                "data",
                format!("room for {} elements, {count} requested", data.len()),
            ));
        }
        check_span("num_bytes", offset, num_bytes, buffer.size())?;
        let steps = self.plan(queues, "buffer", buffer.replicas(), wait)?;
        let target = &mut data[..count];

        let mut previous: Option<(&DeviceLabel, Vec<T>)> = None;
        for step in &steps {
            log::trace!("{}read {num_bytes} bytes on {}", self.log_prefix(), step.label());
            let mut values = match previous {
                None => Vec::new(),
                Some(_) => vec![<T as bytemuck::Zeroable>::zeroed(); count],
            };
            let destination: &mut [T] = if previous.is_none() {
                &mut *target
            } else {
                &mut values
            };
            self.backend()
                .enqueue_read(
                    step.queue.native(),
                    step.target.native(),
                    blocking,
                    offset,
                    bytemuck::cast_slice_mut(destination),
                    &step.wait,
                )
                .map_err(|e| ProxyError::native(NativeOp::ReadBuffer, step.label(), e))?;

            let values = match previous.take() {
                None => target.to_vec(),
                Some((last_label, last_values)) => {
                    if let Some(index) = last_values
                        .iter()
                        .zip(values.iter())
                        .position(|(a, b)| bytemuck::bytes_of(a) != bytemuck::bytes_of(b))
                    {
                        log::warn!(
                            "{}devices disagree at element {index}: {} and {}",
                            self.log_prefix(),
                            last_label,
                            step.label()
                        );
                        return Err(ProxyError::Consistency {
                            first: last_label.clone(),
                            second: step.label().clone(),
                            index,
                            first_value: format!("{:?}", last_values[index]),
                            second_value: format!("{:?}", values[index]),
                        });
                    }
                    values
                }
            };
            previous = Some((step.label(), values));
        }
        Ok(())
    }

    /// Copies `num_bytes` bytes from every replica of `src` to the replica of `dst` on the same device.
    ///
    /// # Errors
    /// - [`ProxyError::GroupMismatch`] if `src` and `dst` don't have the same replicas
    /// - [`ProxyError::InvalidArgument`] before any native call
    /// - [`ProxyError::Native`] with [`NativeOp::CopyBuffer`] on the first failing device
    #[allow(clippy::too_many_arguments)]
    pub fn copy_buffer(
        &self,
        queues: &QueueGroup<B>,
        src: &BufferGroup<B>,
        dst: &BufferGroup<B>,
        src_offset: u64,
        dst_offset: u64,
        num_bytes: u64,
        wait: &[&EventGroup],
    ) -> Result<()> {
        if src.len() != dst.len() {
            return Err(ProxyError::GroupMismatch {
                group: "destination buffer",
                detail: format!("{} replicas, source has {}", dst.len(), src.len()),
            });
        }
        check_num_bytes(num_bytes)?;
        check_span("src_offset", src_offset, num_bytes, src.size())?;
        check_span("dst_offset", dst_offset, num_bytes, dst.size())?;
        let steps = self.plan(queues, "source buffer", src.replicas(), wait)?;
        let destinations = steps
            .iter()
            .map(|step| dst.replicas().require(step.queue.id(), "destination buffer"))
            .collect::<Result<Vec<_>>>()?;

        for (step, destination) in steps.iter().zip(destinations) {
            log::trace!("{}copy {num_bytes} bytes on {}", self.log_prefix(), step.label());
            self.backend()
                .enqueue_copy(
                    step.queue.native(),
                    step.target.native(),
                    destination.native(),
                    src_offset,
                    dst_offset,
                    num_bytes,
                    &step.wait,
                )
                .map_err(|e| ProxyError::native(NativeOp::CopyBuffer, step.label(), e))?;
        }
        Ok(())
    }

    /// Executes `kernels` over the given range.
    ///
    /// With [`RangeMode::Paired`] (the default) each queue runs the kernel replica of its own
    /// device. With [`RangeMode::Broadcast`] every kernel replica runs on every queue.
    ///
    /// # Errors
    /// - [`ProxyError::InvalidArgument`] / [`ProxyError::GroupMismatch`] before any native call
    /// - [`ProxyError::Native`] with [`NativeOp::EnqueueRange`] on the first failing device
    pub fn enqueue_range(
        &self,
        queues: &QueueGroup<B>,
        kernels: &KernelGroup<B>,
        global_offset: Option<&[usize]>,
        global_size: &[usize],
        local_size: Option<&[usize]>,
        wait: &[&EventGroup],
    ) -> Result<()> {
        let range = nd_range(global_offset, global_size, local_size)?;
        let runs: Vec<(&Replica<B::Kernel>, &Replica<B::Queue>, Vec<&HostEvent>)> =
            match self.config().range_mode {
                RangeMode::Paired => self
                    .plan(queues, "kernel", kernels.replicas(), wait)?
                    .into_iter()
                    .map(|step| (step.target, step.queue, step.wait))
                    .collect(),
                RangeMode::Broadcast => {
                    let mut runs = Vec::with_capacity(kernels.len() * queues.len());
                    for kernel in kernels.replicas() {
                        for queue in queues.replicas() {
                            runs.push((kernel, queue, wait_list(wait, queue.id())?));
                        }
                    }
                    runs
                }
            };

        for (kernel, queue, events) in &runs {
            log::trace!(
                "{}run {} ({}) on {}",
                self.log_prefix(),
                kernels.name(),
                kernel.id(),
                queue.label()
            );
            self.backend()
                .enqueue_range(queue.native(), kernel.native(), &range, events)
                .map_err(|e| ProxyError::native(NativeOp::EnqueueRange, queue.label(), e))?;
        }
        Ok(())
    }

    /// Hands the graphics objects behind `buffers` over to the compute devices.
    ///
    /// Must bracket, together with [`Session::release_graphics_objects`], every kernel execution
    /// touching those buffers.
    pub fn acquire_graphics_objects(
        &self,
        queues: &QueueGroup<B>,
        buffers: &[&BufferGroup<B>],
        wait: &[&EventGroup],
    ) -> Result<()> {
        self.graphics_objects(queues, buffers, wait, NativeOp::AcquireGraphics)
    }

    /// Gives the graphics objects behind `buffers` back to the graphics API.
    pub fn release_graphics_objects(
        &self,
        queues: &QueueGroup<B>,
        buffers: &[&BufferGroup<B>],
        wait: &[&EventGroup],
    ) -> Result<()> {
        self.graphics_objects(queues, buffers, wait, NativeOp::ReleaseGraphics)
    }

    fn graphics_objects(
        &self,
        queues: &QueueGroup<B>,
        buffers: &[&BufferGroup<B>],
        wait: &[&EventGroup],
        op: NativeOp,
    ) -> Result<()> {
        if buffers.is_empty() {
            return Err(ProxyError::invalid("buffers", "no buffer to hand over"));
        }
        if buffers.iter().any(|buffer| !buffer.is_graphics()) {
            return Err(ProxyError::invalid(
                "buffers",
                "only buffers created from graphics objects can be acquired or released",
            ));
        }

        let mut steps = Vec::with_capacity(queues.len());
        for queue in queues.replicas() {
            let natives = buffers
                .iter()
                .map(|buffer| {
                    check_group_len("buffer", buffer.len(), queues.len())?;
                    Ok(buffer.replicas().require(queue.id(), "buffer")?.native())
                })
                .collect::<Result<Vec<_>>>()?;
            steps.push((queue, natives, wait_list(wait, queue.id())?));
        }

        for (queue, natives, events) in &steps {
            log::trace!("{}{op} on {}", self.log_prefix(), queue.label());
            let result = match op {
                NativeOp::AcquireGraphics => {
                    self.backend()
                        .enqueue_acquire_graphics(queue.native(), natives, events)
                }
                _ => self
                    .backend()
                    .enqueue_release_graphics(queue.native(), natives, events),
            };
            result.map_err(|e| ProxyError::native(op, queue.label(), e))?;
        }
        Ok(())
    }

    /// Blocks until every queue of the group drained its work.
    pub fn finish(&self, queues: &QueueGroup<B>) -> Result<()> {
        for queue in queues.replicas() {
            self.backend()
                .finish(queue.native())
                .map_err(|e| ProxyError::native(NativeOp::Finish, queue.label(), e))?;
        }
        log::trace!("{}{} queues finished", self.log_prefix(), queues.len());
        Ok(())
    }
}

#[cfg(test)]
mod dispatch_tests {
    use super::*;

    #[test]
    fn range_is_padded_to_three_dimensions() {
        let range = nd_range(None, &[8, 4], Some(&[2, 2])).unwrap();
        assert_eq!(range.dimensions, 2);
        assert_eq!(range.global, [8, 4, 1]);
        assert_eq!(range.local, Some([2, 2, 1]));
        assert_eq!(range.work_groups(), [4, 2, 1]);
    }

    #[test]
    fn range_rejects_bad_shapes() {
        assert!(matches!(
            nd_range(None, &[], None),
            Err(ProxyError::InvalidArgument { field: "global_size", .. })
        ));
        assert!(matches!(
            nd_range(Some(&[0, 0]), &[4], None),
            Err(ProxyError::InvalidArgument { field: "global_offset", .. })
        ));
        assert!(matches!(
            nd_range(None, &[10], Some(&[3])),
            Err(ProxyError::InvalidArgument { field: "local_size", .. })
        ));
    }

    #[test]
    fn span_must_fit_the_buffer() {
        assert!(check_span("num_bytes", 8, 8, 16).is_ok());
        assert!(check_span("num_bytes", 12, 8, 16).is_err());
        assert!(check_span("num_bytes", u64::MAX, 1, 16).is_err());
    }
}
