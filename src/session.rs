//! The proxy session: the single owner of the native backend.
//!
//! There is no process wide state: every proxy operation is a method of [`Session`],
//! and the groups it returns are only meaningful together with the session which created them.

use crate::backend::ComputeBackend;
use crate::dispatch::RangeMode;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Settings of a [`Session`]
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Optional label, prefixed to every log line of the session
    pub label: Option<String>,
    /// How [`Session::enqueue_range`] pairs kernel replicas with queue replicas
    pub range_mode: RangeMode,
}

pub struct Session<B: ComputeBackend> {
    backend: B,
    config: SessionConfig,
    discoveries: AtomicUsize,
}

impl<B: ComputeBackend> Session<B> {
    /// Creates a session over `backend` with the default [`SessionConfig`]
    pub fn new(backend: B) -> Self {
        Session::with_config(backend, SessionConfig::default())
    }

    pub fn with_config(backend: B, config: SessionConfig) -> Self {
        Session {
            backend,
            config,
            discoveries: AtomicUsize::new(0),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of the next discovery, stamped in the ids of its devices
    pub(crate) fn next_discovery(&self) -> usize {
        self.discoveries.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn log_prefix(&self) -> String {
        match &self.config.label {
            Some(label) => format!("[{label}] "),
            None => String::new(),
        }
    }
}
