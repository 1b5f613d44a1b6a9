//! Deferred listener notifications.
//!
//! The reactor never calls user code while holding its lock. State changes
//! queue [`Notification`]s, which are delivered after the lock is released.
//! Each listener has a [`Gate`]: once it is closed nothing more is delivered,
//! and a versioned value older than one already delivered is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tessel_sync_core::{CallbackSlot, ConnectionStatus, PresenceView, QueryState};

use crate::streams::StreamEvent;
use crate::TopicMessage;

/// Per-listener delivery guard.
#[derive(Debug)]
pub(crate) struct Gate {
    open: AtomicBool,
    delivered: AtomicU64,
}

impl Gate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
        })
    }

    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Admit `version` if the gate is open and nothing newer went through.
    /// Version 0 marks unversioned values (topic messages, stream events).
    fn admit(&self, version: u64) -> bool {
        if !self.is_open() {
            return false;
        }
        if version == 0 {
            return true;
        }
        self.delivered.fetch_max(version, Ordering::AcqRel) < version
    }
}

/// A value bound for one listener.
pub(crate) struct Delivery<T> {
    pub(crate) slot: CallbackSlot<T>,
    pub(crate) gate: Arc<Gate>,
    pub(crate) version: u64,
    pub(crate) value: T,
}

impl<T> Delivery<T> {
    fn deliver(self) {
        if self.gate.admit(self.version) {
            self.slot.call(&self.value);
        }
    }
}

/// Something to tell a listener once the reactor lock is released.
pub(crate) enum Notification {
    Query(Delivery<QueryState>),
    Presence(Delivery<PresenceView>),
    Topic(Delivery<TopicMessage>),
    Status(Delivery<ConnectionStatus>),
    Stream(Delivery<StreamEvent>),
}

impl Notification {
    pub(crate) fn deliver(self) {
        match self {
            Notification::Query(d) => d.deliver(),
            Notification::Presence(d) => d.deliver(),
            Notification::Topic(d) => d.deliver(),
            Notification::Status(d) => d.deliver(),
            Notification::Stream(d) => d.deliver(),
        }
    }
}

/// Deliver in order.
pub(crate) fn deliver_all(notes: Vec<Notification>) {
    for note in notes {
        note.deliver();
    }
}
