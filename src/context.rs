//! One native context per platform of a [`DeviceGroup`].

use crate::backend::{ComputeBackend, PlatformInfo};
use crate::errors::{ProxyError, Result};
use crate::platform::{DeviceEntry, DeviceGroup};
use crate::session::Session;
use std::fmt;

/// A native context covering the selected devices of one platform
pub struct ContextEntry<B: ComputeBackend> {
    platform: B::Platform,
    info: PlatformInfo,
    devices: Vec<DeviceEntry<B>>,
    native: B::Context,
}

impl<B: ComputeBackend> ContextEntry<B> {
    pub fn platform(&self) -> &B::Platform {
        &self.platform
    }

    pub fn platform_info(&self) -> &PlatformInfo {
        &self.info
    }

    pub fn devices(&self) -> &[DeviceEntry<B>] {
        &self.devices
    }

    pub fn native(&self) -> &B::Context {
        &self.native
    }
}

impl<B: ComputeBackend> fmt::Debug for ContextEntry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextEntry")
            .field("platform", &self.info.name)
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

/// The contexts of a session, in platform order
pub struct ContextGroup<B: ComputeBackend> {
    entries: Vec<ContextEntry<B>>,
    interop: bool,
}

impl<B: ComputeBackend> ContextGroup<B> {
    pub fn iter(&self) -> std::slice::Iter<'_, ContextEntry<B>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the contexts were created with graphics interop
    pub fn interop(&self) -> bool {
        self.interop
    }

    pub fn device_count(&self) -> usize {
        self.entries.iter().map(|entry| entry.devices.len()).sum()
    }

    /// Every (context, device) pair, in discovery order
    pub(crate) fn device_entries(
        &self,
    ) -> impl Iterator<Item = (&ContextEntry<B>, &DeviceEntry<B>)> {
        self.entries
            .iter()
            .flat_map(|entry| entry.devices.iter().map(move |device| (entry, device)))
    }
}

impl<B: ComputeBackend> fmt::Debug for ContextGroup<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGroup")
            .field("entries", &self.entries)
            .field("interop", &self.interop)
            .finish()
    }
}

impl<B: ComputeBackend> Session<B> {
    /// Creates one native context for every platform of `devices`, scoped to that platform's devices.
    ///
    /// Either every context is created or none is left alive: on failure the contexts
    /// already created are dropped before returning.
    ///
    /// # Errors
    /// - [`ProxyError::InteropUnsupported`] if `interop` is requested and a platform can't share
    ///   graphics objects; checked for every platform before any context is created
    /// - [`ProxyError::ContextCreation`] naming the first platform whose context failed
    pub fn create_contexts(
        &self,
        devices: &DeviceGroup<B>,
        interop: bool,
    ) -> Result<ContextGroup<B>> {
        let backend = self.backend();
        if interop {
            if let Some(platform) = devices
                .platforms()
                .iter()
                .find(|platform| !backend.supports_interop(platform.native()))
            {
                return Err(ProxyError::InteropUnsupported {
                    platform: platform.info.name.clone(),
                });
            }
        }

        let mut entries = Vec::with_capacity(devices.platforms().len());
        for platform in devices.platforms() {
            let natives: Vec<B::Device> = platform
                .devices()
                .iter()
                .map(|device| device.native().clone())
                .collect();
            let native = backend
                .create_context(platform.native(), &natives, interop)
                .map_err(|e| ProxyError::ContextCreation {
                    platform: platform.info.name.clone(),
                    source: e.into(),
                })?;
            log::trace!(
                "{}context created for platform {} with {} devices",
                self.log_prefix(),
                platform.info.name,
                natives.len()
            );
            entries.push(ContextEntry {
                platform: platform.native().clone(),
                info: platform.info.clone(),
                devices: platform.devices().to_vec(),
                native,
            });
        }

        log::debug!(
            "{}created {} contexts (interop: {})",
            self.log_prefix(),
            entries.len(),
            interop
        );
        Ok(ContextGroup { entries, interop })
    }
}
