//! Per-device events, used for wait lists and completion callbacks.
//!
//! The dispatch model is synchronous: every enqueue returns once its native call completed,
//! so the only events which can still be pending are user events created with
//! [`crate::session::Session::create_user_event`]. Their status is driven by the caller
//! through [`EventGroup::set_status`], and [`EventGroup::wait`] gives a future resolving
//! once every device's event completed.

use crate::backend::ComputeBackend;
use crate::context::ContextGroup;
use crate::errors::{ProxyError, Result};
use crate::group::{DeviceId, Replica, ResourceGroup};
use crate::session::Session;
use futures_channel::oneshot;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Execution status of an event.
///
/// Statuses are ordered the way a command progresses backwards: `Queued` > `Submitted` >
/// `Running` > `Complete` > `Failed`. A status is reached when the event is at it or below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExecutionStatus {
    Failed(i32),
    Complete,
    Running,
    Submitted,
    Queued,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Complete | ExecutionStatus::Failed(_))
    }

    /// True when an event in status `self` has reached or passed `target`
    pub fn reaches(self, target: ExecutionStatus) -> bool {
        self <= target
    }
}

type Callback = Box<dyn FnOnce(DeviceId, ExecutionStatus) + Send>;

struct EventState {
    status: ExecutionStatus,
    callbacks: Vec<(ExecutionStatus, Callback)>,
    /// Futures waiting for the event to terminate
    waiters: Vec<oneshot::Sender<ExecutionStatus>>,
}

/// An event owned by the host, bound to one device
#[derive(Clone)]
pub struct HostEvent {
    device: DeviceId,
    state: Arc<Mutex<EventState>>,
}

impl fmt::Debug for HostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostEvent")
            .field("device", &self.device)
            .field("status", &self.status())
            .finish()
    }
}

impl HostEvent {
    /// A user event, starting as [`ExecutionStatus::Submitted`]
    pub fn new(device: DeviceId) -> Self {
        HostEvent {
            device,
            state: Arc::new(Mutex::new(EventState {
                status: ExecutionStatus::Submitted,
                callbacks: Vec::new(),
                waiters: Vec::new(),
            })),
        }
    }

    /// An event which already completed
    pub fn completed(device: DeviceId) -> Self {
        let event = HostEvent::new(device);
        event.lock().status = ExecutionStatus::Complete;
        event
    }

    fn lock(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn status(&self) -> ExecutionStatus {
        self.lock().status
    }

    pub fn is_complete(&self) -> bool {
        self.status() == ExecutionStatus::Complete
    }

    /// Moves the event to `status`, firing every callback whose status is now reached.
    ///
    /// # Errors
    /// - if the event already terminated, or `status` would move it backwards
    pub fn set_status(&self, status: ExecutionStatus) -> Result<()> {
        let (fired, waiters) = {
            let mut state = self.lock();
            if state.status.is_terminal() {
                return Err(ProxyError::invalid(
                    "status",
                    format!("event on device {} already terminated", self.device),
                ));
            }
            if status > state.status {
                return Err(ProxyError::invalid(
                    "status",
                    format!("cannot move an event from {:?} back to {:?}", state.status, status),
                ));
            }
            state.status = status;
            let (fired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.callbacks)
                .into_iter()
                .partition(|(target, _)| status.reaches(*target));
            state.callbacks = kept;
            let waiters = if status.is_terminal() {
                std::mem::take(&mut state.waiters)
            } else {
                Vec::new()
            };
            (fired, waiters)
        };
        // callbacks run without the lock held, they may query the event
        for (_, callback) in fired {
            callback(self.device, status);
        }
        for waiter in waiters {
            let _ = waiter.send(status);
        }
        Ok(())
    }

    /// Receives the terminal status of the event.
    ///
    /// Waiters whose receiver was dropped are pruned on every registration.
    pub(crate) fn termination(&self) -> oneshot::Receiver<ExecutionStatus> {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.lock();
        if state.status.is_terminal() {
            let _ = sender.send(state.status);
        } else {
            state.waiters.retain(|waiter| !waiter.is_canceled());
            state.waiters.push(sender);
        }
        receiver
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Runs `callback` once the event reaches `status`, right away if it already did
    pub fn on_status<F>(&self, status: ExecutionStatus, callback: F)
    where
        F: FnOnce(DeviceId, ExecutionStatus) + Send + 'static,
    {
        let current = {
            let mut state = self.lock();
            if !state.status.reaches(status) {
                state.callbacks.push((status, Box::new(callback)));
                return;
            }
            state.status
        };
        callback(self.device, current);
    }
}

/// One [`HostEvent`] per device, aligned with the other groups of the session
#[derive(Debug)]
pub struct EventGroup {
    events: ResourceGroup<HostEvent>,
}

impl EventGroup {
    pub(crate) fn new(events: ResourceGroup<HostEvent>) -> Self {
        EventGroup { events }
    }

    pub fn replicas(&self) -> &ResourceGroup<HostEvent> {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, device: DeviceId) -> Option<&HostEvent> {
        self.events.get(device).map(Replica::native)
    }

    /// Sets the status of the event of every device.
    ///
    /// Stops at the first event refusing the transition.
    pub fn set_status(&self, status: ExecutionStatus) -> Result<()> {
        for replica in &self.events {
            replica.native().set_status(status)?;
        }
        Ok(())
    }

    /// Attaches `handler` to the event of every device.
    ///
    /// The handler is called once per device, when that device's event reaches `status`,
    /// with the device id, the status the event moved to and `user_data`.
    pub fn set_callback<U, F>(&self, status: ExecutionStatus, handler: F, user_data: U)
    where
        U: Send + Sync + 'static,
        F: Fn(DeviceId, ExecutionStatus, &U) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let user_data = Arc::new(user_data);
        for replica in &self.events {
            let handler = Arc::clone(&handler);
            let user_data = Arc::clone(&user_data);
            replica
                .native()
                .on_status(status, move |device, reached| {
                    handler(device, reached, &user_data)
                });
        }
    }

    /// Resolves once the event of every device completed.
    ///
    /// # Errors
    /// - [`ProxyError::EventFailed`] for the first device whose event failed
    pub async fn wait(&self) -> Result<()> {
        let mut pending = Vec::with_capacity(self.events.len());
        for replica in &self.events {
            pending.push((replica.id(), replica.native().termination()));
        }

        for (device, receiver) in pending {
            match receiver.await {
                Ok(ExecutionStatus::Failed(code)) => {
                    return Err(ProxyError::EventFailed { device, code })
                }
                Ok(_) => {}
                Err(_) => {
                    return Err(ProxyError::invalid(
                        "wait",
                        format!("event on device {device} was dropped before completing"),
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Resolves the wait list of the replica on `device`: the event of `device` from every group.
///
/// Under the synchronous dispatch model a pending event could never resolve while the
/// call blocks, so only completed events are accepted.
pub(crate) fn wait_list<'a>(groups: &[&'a EventGroup], device: DeviceId) -> Result<Vec<&'a HostEvent>> {
    groups
        .iter()
        .map(|group| {
            let event = group.events.require(device, "event")?.native();
            match event.status() {
                ExecutionStatus::Complete => Ok(event),
                ExecutionStatus::Failed(code) => Err(ProxyError::EventFailed { device, code }),
                pending => Err(ProxyError::invalid(
                    "wait",
                    format!("event on device {device} is still {pending:?}"),
                )),
            }
        })
        .collect()
}

impl<B: ComputeBackend> Session<B> {
    /// Creates a user event for every device of every context.
    pub fn create_user_event(&self, contexts: &ContextGroup<B>) -> EventGroup {
        let events = contexts
            .iter()
            .flat_map(|entry| entry.devices())
            .map(|device| Replica::new(device.label.clone(), HostEvent::new(device.id())))
            .collect();
        log::debug!("{}created {} user events", self.log_prefix(), contexts.device_count());
        EventGroup::new(ResourceGroup::new(events))
    }
}
