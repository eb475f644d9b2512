//! Platform and device enumeration.
//!
//! [`Session::discover`] is the first step of every proxy session: it fixes the device
//! ordering every group created afterwards is aligned with.

use crate::backend::{ComputeBackend, DeviceInfo, DeviceTypeFilter, PlatformInfo};
use crate::errors::{DiscoveryError, Result};
use crate::group::{DeviceId, DeviceLabel};
use crate::session::Session;
use std::fmt;

/// A discovered device: its identity plus the native device handle
pub struct DeviceEntry<B: ComputeBackend> {
    pub label: DeviceLabel,
    pub info: DeviceInfo,
    native: B::Device,
}

impl<B: ComputeBackend> DeviceEntry<B> {
    pub fn id(&self) -> DeviceId {
        self.label.id
    }

    pub fn native(&self) -> &B::Device {
        &self.native
    }
}

impl<B: ComputeBackend> Clone for DeviceEntry<B> {
    fn clone(&self) -> Self {
        DeviceEntry {
            label: self.label.clone(),
            info: self.info.clone(),
            native: self.native.clone(),
        }
    }
}

impl<B: ComputeBackend> fmt::Debug for DeviceEntry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceEntry")
            .field("label", &self.label)
            .field("native", &self.native)
            .finish()
    }
}

/// A platform together with the devices selected on it
pub struct PlatformEntry<B: ComputeBackend> {
    pub info: PlatformInfo,
    native: B::Platform,
    devices: Vec<DeviceEntry<B>>,
}

impl<B: ComputeBackend> PlatformEntry<B> {
    pub fn native(&self) -> &B::Platform {
        &self.native
    }

    pub fn devices(&self) -> &[DeviceEntry<B>] {
        &self.devices
    }
}

impl<B: ComputeBackend> fmt::Debug for PlatformEntry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformEntry")
            .field("info", &self.info)
            .field("devices", &self.devices)
            .finish()
    }
}

/// Every selected device of every platform, platform by platform.
///
/// The order is never changed after discovery: it is the alignment key of all the groups.
pub struct DeviceGroup<B: ComputeBackend> {
    filter: DeviceTypeFilter,
    platforms: Vec<PlatformEntry<B>>,
}

impl<B: ComputeBackend> fmt::Debug for DeviceGroup<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceGroup")
            .field("filter", &self.filter)
            .field("platforms", &self.platforms)
            .finish()
    }
}

impl<B: ComputeBackend> DeviceGroup<B> {
    pub fn filter(&self) -> DeviceTypeFilter {
        self.filter
    }

    pub fn platforms(&self) -> &[PlatformEntry<B>] {
        &self.platforms
    }

    /// All the devices in discovery order
    pub fn devices(&self) -> impl Iterator<Item = &DeviceEntry<B>> {
        self.platforms.iter().flat_map(|platform| platform.devices.iter())
    }

    pub fn len(&self) -> usize {
        self.platforms.iter().map(|platform| platform.devices.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn platform_infos(&self) -> Vec<PlatformInfo> {
        self.platforms.iter().map(|platform| platform.info.clone()).collect()
    }

    pub fn device_infos(&self) -> Vec<(DeviceId, DeviceInfo)> {
        self.devices()
            .map(|device| (device.id(), device.info.clone()))
            .collect()
    }
}

impl<B: ComputeBackend> Session<B> {
    /// Enumerates every platform and the devices matching `filter` on each of them.
    ///
    /// When [`DeviceTypeFilter::All`] is requested and the backend can't answer it natively,
    /// CPU and GPU devices are queried separately and concatenated, CPU first.
    /// Platforms without any matching device are left out.
    ///
    /// # Errors
    /// - [`DiscoveryError::NoPlatforms`] if the backend exposes no platform
    /// - [`DiscoveryError::NoDevices`] if no platform has a matching device
    pub fn discover(&self, filter: DeviceTypeFilter) -> Result<DeviceGroup<B>> {
        let backend = self.backend();
        let natives = backend
            .platforms()
            .map_err(|e| DiscoveryError::Enumeration(e.into()))?;
        if natives.is_empty() {
            return Err(DiscoveryError::NoPlatforms.into());
        }

        let queries = match filter {
            DeviceTypeFilter::All if !backend.supports_all_query() => {
                vec![DeviceTypeFilter::Cpu, DeviceTypeFilter::Gpu]
            }
            other => vec![other],
        };

        let discovery = self.next_discovery();
        let mut next_id = 0;
        let mut platforms = Vec::new();
        for native in natives {
            let info = backend.platform_info(&native);
            let mut devices = Vec::new();
            for query in &queries {
                let found = backend
                    .devices(&native, *query)
                    .map_err(|e| DiscoveryError::Enumeration(e.into()))?;
                for device in found {
                    let device_info = backend.device_info(&device);
                    let label = DeviceLabel {
                        id: DeviceId::new(discovery, next_id),
                        platform: info.name.clone(),
                        device: device_info.name.clone(),
                    };
                    next_id += 1;
                    devices.push(DeviceEntry {
                        label,
                        info: device_info,
                        native: device,
                    });
                }
            }

            if devices.is_empty() {
                log::debug!(
                    "{}platform {} has no {:?} device, skipping it",
                    self.log_prefix(),
                    info.name,
                    filter
                );
                continue;
            }
            platforms.push(PlatformEntry {
                info,
                native,
                devices,
            });
        }

        if platforms.is_empty() {
            return Err(DiscoveryError::NoDevices(filter).into());
        }

        let group = DeviceGroup { filter, platforms };
        log::debug!(
            "{}discovered {} devices on {} platforms",
            self.log_prefix(),
            group.len(),
            group.platforms.len()
        );
        for device in group.devices() {
            log::trace!("{}  {} ({:?})", self.log_prefix(), device.label, device.info.kind);
        }
        Ok(group)
    }
}
