//! Async channels between the USB side and the session controller
//!
//! Every device lifecycle event travels as one tagged [`SessionEvent`] over a
//! single channel, so events for one device are observed in the order they
//! were produced. The hot-plug thread and the permission broker send from
//! blocking contexts; the controller receives on the Tokio runtime.

use crate::transport::ControlBlock;
use async_channel::{Receiver, Sender, bounded};
use protocol::{DeviceIdentity, StreamFormat};
use thiserror::Error;
use tracing::warn;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Device lifecycle events consumed by the session controller
#[derive(Debug)]
pub enum SessionEvent {
    /// A matching device appeared
    Attached(DeviceIdentity),

    /// A device disappeared
    Detached(DeviceIdentity),

    /// Permission granted and the device opened
    Connected {
        device: DeviceIdentity,
        /// Ownership moves to the session on connect
        block: ControlBlock,
    },

    /// The user or policy refused access
    Denied(DeviceIdentity),

    /// The request was abandoned before it resolved
    Cancelled(DeviceIdentity),
}

impl SessionEvent {
    /// The device this event is about
    pub fn device(&self) -> &DeviceIdentity {
        match self {
            SessionEvent::Attached(device)
            | SessionEvent::Detached(device)
            | SessionEvent::Denied(device)
            | SessionEvent::Cancelled(device) => device,
            SessionEvent::Connected { device, .. } => device,
        }
    }

    /// Short tag for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Attached(_) => "attached",
            SessionEvent::Detached(_) => "detached",
            SessionEvent::Connected { .. } => "connected",
            SessionEvent::Denied(_) => "denied",
            SessionEvent::Cancelled(_) => "cancelled",
        }
    }
}

/// Why a preview ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Released,
    Detached,
}

/// Notices from the session to whoever renders its status
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    PreviewStarted {
        device: DeviceIdentity,
        format: StreamFormat,
    },
    PreviewStopped {
        device: DeviceIdentity,
        reason: StopReason,
    },
}

/// An event the bus refused because the controller is gone
///
/// The event is handed back so the sender can close a `Connected` block
/// instead of leaking it.
#[derive(Debug, Error)]
#[error("event bus closed, {} event not delivered", .0.kind())]
pub struct Undelivered(pub SessionEvent);

impl Undelivered {
    pub fn into_event(self) -> SessionEvent {
        self.0
    }
}

/// Sending half of the event bus
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<SessionEvent>,
}

impl EventSender {
    /// Send from async code
    pub async fn send(&self, event: SessionEvent) -> Result<(), Undelivered> {
        self.tx
            .send(event)
            .await
            .map_err(|e| Undelivered(e.into_inner()))
    }

    /// Send from a blocking thread (hot-plug worker, blocking pool)
    pub fn send_blocking(&self, event: SessionEvent) -> Result<(), Undelivered> {
        self.tx
            .send_blocking(event)
            .map_err(|e| Undelivered(e.into_inner()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of the event bus
pub struct EventReceiver {
    rx: Receiver<SessionEvent>,
}

impl EventReceiver {
    /// Wait for the next event
    pub async fn recv(&self) -> crate::Result<SessionEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Take an event if one is queued
    pub fn try_recv(&self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Refuse further sends; events already queued can still be taken
    ///
    /// Returns false if the bus was already closed.
    pub fn close(&self) -> bool {
        self.rx.close()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the event bus
///
/// Returns (EventSender for producers, EventReceiver for the controller)
pub fn create_event_bus() -> (EventSender, EventReceiver) {
    let (tx, rx) = bounded(EVENT_CHANNEL_CAPACITY);
    (EventSender { tx }, EventReceiver { rx })
}

/// Sending half for session notices
///
/// Notices are advisory: a full or closed channel drops them with a warning
/// instead of blocking the session.
#[derive(Clone)]
pub struct NoticeSender {
    tx: Sender<SessionNotice>,
}

impl NoticeSender {
    pub fn notify(&self, notice: SessionNotice) {
        if let Err(e) = self.tx.try_send(notice) {
            warn!("Dropping session notice: {}", e);
        }
    }
}

/// Create a notice channel for session status updates
pub fn create_notice_channel() -> (NoticeSender, Receiver<SessionNotice>) {
    let (tx, rx) = bounded(EVENT_CHANNEL_CAPACITY);
    (NoticeSender { tx }, rx)
}
