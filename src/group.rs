//! Device identity and the generic "one native handle per device" container.
//!
//! Every group built by the proxy is a [`ResourceGroup`]: an ordered list of [`Replica`]s,
//! each one tagged with the [`DeviceId`] of the device owning the native handle.
//! Groups derived from the same discovery share the same ids, so the dispatch code
//! pairs a buffer, a kernel and a queue by looking the id up instead of trusting positions.
//! Ids carry the discovery they come from: groups of two discoveries never pair up.

use crate::errors::{ProxyError, Result};
use std::fmt;

/// A device of one discovery: the discovery number and the device ordinal in it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    discovery: usize,
    ordinal: usize,
}

impl DeviceId {
    pub(crate) fn new(discovery: usize, ordinal: usize) -> Self {
        DeviceId { discovery, ordinal }
    }

    /// Position of the device in its discovery
    pub fn index(self) -> usize {
        self.ordinal
    }

    pub fn discovery(self) -> usize {
        self.discovery
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.ordinal)
    }
}

/// Human readable identity of a device, used in diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLabel {
    pub id: DeviceId,
    pub platform: String,
    pub device: String,
}

impl fmt::Display for DeviceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Platform {} Device {} ({})",
            self.platform, self.device, self.id
        )
    }
}

/// The per-device instance of a logically single resource
#[derive(Debug)]
pub struct Replica<T> {
    label: DeviceLabel,
    native: T,
}

impl<T> Replica<T> {
    pub(crate) fn new(label: DeviceLabel, native: T) -> Self {
        Replica { label, native }
    }

    pub fn id(&self) -> DeviceId {
        self.label.id
    }

    pub fn label(&self) -> &DeviceLabel {
        &self.label
    }

    /// The native handle, for callers which need to reach below the proxy
    pub fn native(&self) -> &T {
        &self.native
    }

    pub(crate) fn native_mut(&mut self) -> &mut T {
        &mut self.native
    }
}

/// Ordered replicas of one resource, in discovery order
#[derive(Debug)]
pub struct ResourceGroup<T> {
    replicas: Vec<Replica<T>>,
}

impl<T> ResourceGroup<T> {
    pub(crate) fn new(replicas: Vec<Replica<T>>) -> Self {
        ResourceGroup { replicas }
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Replica<T>> {
        self.replicas.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> std::slice::IterMut<'_, Replica<T>> {
        self.replicas.iter_mut()
    }

    pub fn get(&self, id: DeviceId) -> Option<&Replica<T>> {
        self.replicas.iter().find(|replica| replica.id() == id)
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.replicas.iter().map(Replica::id).collect()
    }

    /// Looks the replica of `id` up, failing with a [`ProxyError::GroupMismatch`] naming `group`
    pub(crate) fn require(&self, id: DeviceId, group: &'static str) -> Result<&Replica<T>> {
        self.get(id).ok_or_else(|| ProxyError::GroupMismatch {
            group,
            detail: format!("no replica for device {id}"),
        })
    }
}

impl<'a, T> IntoIterator for &'a ResourceGroup<T> {
    type Item = &'a Replica<T>;
    type IntoIter = std::slice::Iter<'a, Replica<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.replicas.iter()
    }
}

#[cfg(test)]
mod group_tests {
    use super::*;

    fn label(id: usize) -> DeviceLabel {
        DeviceLabel {
            id: DeviceId::new(0, id),
            platform: "p".to_string(),
            device: format!("d{id}"),
        }
    }

    #[test]
    fn lookup_is_by_device_not_position() {
        let group = ResourceGroup::new(vec![
            Replica::new(label(2), "two"),
            Replica::new(label(0), "zero"),
        ]);
        assert_eq!(group.get(DeviceId::new(0, 0)).map(|r| *r.native()), Some("zero"));
        assert_eq!(group.device_ids(), vec![DeviceId::new(0, 2), DeviceId::new(0, 0)]);
    }

    #[test]
    fn missing_replica_is_a_group_mismatch() {
        let group = ResourceGroup::new(vec![Replica::new(label(0), ())]);
        let err = group.require(DeviceId::new(0, 1), "buffer").unwrap_err();
        assert!(matches!(err, ProxyError::GroupMismatch { group: "buffer", .. }));
    }

    #[test]
    fn same_ordinal_of_another_discovery_is_another_device() {
        let group = ResourceGroup::new(vec![Replica::new(label(0), ())]);
        assert!(group.get(DeviceId::new(1, 0)).is_none());
        assert_eq!(DeviceId::new(1, 0).to_string(), "#0");
    }
}
