//! Event recording for image acquisition.
//!
//! Events are fire-and-forget observations attached to a container
//! reference. Recorders must never block the caller: the puller emits events
//! from inside a reconciliation pass.
//!
//! The puller always goes through an [`EventTarget`], which carries an
//! optional reference. When no reference could be built for a container, the
//! target swallows events instead of failing the pull.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::pod::ObjectReference;

/// Event reasons emitted by the image puller.
pub mod reason {
    /// A pull is about to start.
    pub const PULLING: &str = "Pulling";
    /// The image is available, either pulled now or already present.
    pub const PULLED: &str = "Pulled";
    /// The pull failed.
    pub const FAILED: &str = "Failed";
    /// The pull was skipped because the image is in back-off.
    pub const BACK_OFF: &str = "BackOff";
    /// The image is missing and the policy forbids pulling it.
    pub const ERR_IMAGE_NEVER_PULL: &str = "ErrImageNeverPull";
    /// The runtime could not tell whether the image is present.
    pub const INSPECT_FAILED: &str = "InspectFailed";
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    Normal,
    Warning,
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub involved_object: ObjectReference,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Sink for events.
pub trait EventRecorder: Send + Sync {
    /// Record an event about `object`. Must not block.
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: String);
}

/// An optional event destination bound to one container.
pub struct EventTarget<'a> {
    recorder: &'a dyn EventRecorder,
    object: Option<ObjectReference>,
}

impl<'a> EventTarget<'a> {
    /// Bind `recorder` to `object`. With no object every event is dropped.
    pub fn new(recorder: &'a dyn EventRecorder, object: Option<ObjectReference>) -> Self {
        Self { recorder, object }
    }

    /// Returns true if events will actually be recorded.
    pub fn is_attached(&self) -> bool {
        self.object.is_some()
    }

    /// Emit a `Normal` event.
    pub fn normal(&self, reason: &str, message: String) {
        self.emit(EventType::Normal, reason, message);
    }

    /// Emit a `Warning` event.
    pub fn warning(&self, reason: &str, message: String) {
        self.emit(EventType::Warning, reason, message);
    }

    fn emit(&self, event_type: EventType, reason: &str, message: String) {
        if let Some(object) = &self.object {
            self.recorder.record(object, event_type, reason, message);
        }
    }
}

/// Recorder that writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: String) {
        match event_type {
            EventType::Normal => info!(
                object = %object,
                reason,
                message = %message,
                "Event"
            ),
            EventType::Warning => warn!(
                object = %object,
                reason,
                message = %message,
                "Event"
            ),
        }
    }
}

/// Recorder that forwards events over a bounded channel.
///
/// A full or closed channel drops the event.
#[derive(Debug, Clone)]
pub struct ChannelRecorder {
    tx: mpsc::Sender<Event>,
}

impl ChannelRecorder {
    /// Create a recorder and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl EventRecorder for ChannelRecorder {
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: String) {
        let event = Event {
            involved_object: object.clone(),
            event_type,
            reason: reason.to_string(),
            message,
            timestamp: Utc::now(),
        };

        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    object = %event.involved_object,
                    reason = %event.reason,
                    "Event channel full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(
                    object = %event.involved_object,
                    reason = %event.reason,
                    "Event channel closed, dropping event"
                );
            }
        }
    }
}

/// In-memory recorder for tests.
#[derive(Debug, Default)]
pub struct FakeRecorder {
    events: Mutex<Vec<Event>>,
}

impl FakeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reasons of all events recorded so far, in order.
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    /// Number of events recorded with `reason`.
    pub fn count(&self, reason: &str) -> usize {
        self.events().iter().filter(|e| e.reason == reason).count()
    }

    /// Forget all recorded events.
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventRecorder for FakeRecorder {
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: String) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Event {
                involved_object: object.clone(),
                event_type,
                reason: reason.to_string(),
                message,
                timestamp: Utc::now(),
            });
    }
}
