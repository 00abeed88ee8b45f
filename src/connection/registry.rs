//! Listener registry with isolated fan-out

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

/// Callback interested in every decoded event
pub type Observer = Arc<dyn Fn(&Value) + Send + Sync>;

/// Opaque handle returned by `register`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerHandle(u64);

impl ListenerHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Observer that panicked during dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverFault {
    pub handle: ListenerHandle,
    pub message: String,
}

/// Outcome of one fan-out
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Observers that returned normally
    pub delivered: usize,
    pub faults: Vec<ObserverFault>,
}

/// Ordered handle -> observer mapping
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: u64,
    listeners: Vec<(ListenerHandle, Observer)>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("next_id", &self.next_id)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observer; it will run after every observer registered before it
    pub fn register<F>(&mut self, observer: F) -> ListenerHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register_shared(Arc::new(observer))
    }

    /// Append an already shared observer
    ///
    /// Registering the same `Arc` twice yields two independent handles.
    pub fn register_shared(&mut self, observer: Observer) -> ListenerHandle {
        self.next_id += 1;
        let handle = ListenerHandle(self.next_id);
        self.listeners.push((handle, observer));
        handle
    }

    /// Remove an observer; returns false if it was not registered
    pub fn unregister(&mut self, handle: ListenerHandle) -> bool {
        match self.listeners.iter().position(|(h, _)| *h == handle) {
            Some(pos) => {
                self.listeners.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Remove every observer
    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    /// Handle that the next registration will receive
    ///
    /// Paired with [`clear_before`](Self::clear_before) so a clear requested at
    /// one point in time spares observers registered afterwards.
    pub fn mark(&self) -> ListenerHandle {
        ListenerHandle(self.next_id + 1)
    }

    /// Remove every observer registered before `mark` was taken
    pub fn clear_before(&mut self, mark: ListenerHandle) -> usize {
        let before = self.listeners.len();
        self.listeners.retain(|(handle, _)| *handle >= mark);
        before - self.listeners.len()
    }

    pub fn contains(&self, handle: ListenerHandle) -> bool {
        self.listeners.iter().any(|(h, _)| *h == handle)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Copy of the current observers in registration order
    pub fn snapshot(&self) -> Vec<(ListenerHandle, Observer)> {
        self.listeners.clone()
    }

    /// Invoke every observer with `event`
    pub fn dispatch(&self, event: &Value) -> DispatchReport {
        dispatch_to(&self.listeners, event)
    }
}

/// Invoke each observer in order, isolating panics per invocation
pub fn dispatch_to(listeners: &[(ListenerHandle, Observer)], event: &Value) -> DispatchReport {
    let mut report = DispatchReport::default();

    for (handle, observer) in listeners {
        match catch_unwind(AssertUnwindSafe(|| observer(event))) {
            Ok(()) => report.delivered += 1,
            Err(payload) => report.faults.push(ObserverFault {
                handle: *handle,
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    report
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
