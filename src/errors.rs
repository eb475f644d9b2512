//! This module contains all the specific error implementation for the crate
//!
//! Hopefully like this errors are easier to catch and manage from another crate.
//! Every fallible proxy operation returns [`Result`], and failures coming from the
//! native backend are wrapped in [`ProxyError::Native`] keeping the original cause.

use crate::backend::DeviceTypeFilter;
use crate::group::{DeviceId, DeviceLabel};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Boxed cause of a native failure, as handed back by a backend.
pub type NativeCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// These errors deal with the device enumeration phase
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("No compute platform is available on this machine")]
    NoPlatforms,
    #[error("No device matches the {0:?} filter on any platform")]
    NoDevices(DeviceTypeFilter),
    #[error("Native device enumeration failed: {0}")]
    Enumeration(#[source] NativeCause),
}

/// The native operation which failed, reported inside [`ProxyError::Native`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeOp {
    CreateBuffer,
    CreateBufferFromGraphics,
    CreateProgram,
    CreateKernel,
    SetKernelArg,
    KernelInfo,
    CreateQueue,
    WriteBuffer,
    ReadBuffer,
    CopyBuffer,
    EnqueueRange,
    AcquireGraphics,
    ReleaseGraphics,
    Finish,
}

impl fmt::Display for NativeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NativeOp::CreateBuffer => "buffer creation",
            NativeOp::CreateBufferFromGraphics => "graphics buffer creation",
            NativeOp::CreateProgram => "program creation",
            NativeOp::CreateKernel => "kernel creation",
            NativeOp::SetKernelArg => "kernel argument binding",
            NativeOp::KernelInfo => "kernel info query",
            NativeOp::CreateQueue => "command queue creation",
            NativeOp::WriteBuffer => "buffer write",
            NativeOp::ReadBuffer => "buffer read",
            NativeOp::CopyBuffer => "buffer copy",
            NativeOp::EnqueueRange => "range execution",
            NativeOp::AcquireGraphics => "graphics object acquire",
            NativeOp::ReleaseGraphics => "graphics object release",
            NativeOp::Finish => "queue finish",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Could not create a native context for platform {platform}")]
    ContextCreation {
        platform: String,
        #[source]
        source: NativeCause,
    },

    #[error("Platform {platform} has no graphics interop support")]
    InteropUnsupported { platform: String },

    #[error("Program build failed on {device}:\n{log}")]
    ProgramBuild { device: DeviceLabel, log: String },

    #[error("Invalid argument `{field}`: {reason}")]
    InvalidArgument { field: &'static str, reason: String },

    #[error("{group} group is not aligned with the groups it is dispatched with: {detail}")]
    GroupMismatch { group: &'static str, detail: String },

    #[error("Native {op} failed on {device}")]
    Native {
        op: NativeOp,
        device: DeviceLabel,
        #[source]
        source: NativeCause,
    },

    #[error("({first} value {first_value}) != ({second} value {second_value}) at element {index}")]
    Consistency {
        first: DeviceLabel,
        second: DeviceLabel,
        index: usize,
        first_value: String,
        second_value: String,
    },

    #[error("Event on device {device} terminated with error code {code}")]
    EventFailed { device: DeviceId, code: i32 },
}

impl ProxyError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ProxyError::InvalidArgument {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn native(op: NativeOp, device: &DeviceLabel, source: anyhow::Error) -> Self {
        ProxyError::Native {
            op,
            device: device.clone(),
            source: source.into(),
        }
    }

    /// The native operation behind a [`ProxyError::Native`], if this is one
    pub fn native_op(&self) -> Option<NativeOp> {
        match self {
            ProxyError::Native { op, .. } => Some(*op),
            _ => None,
        }
    }
}
