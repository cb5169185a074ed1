//! Permission broker
//!
//! Mediates access to a device: asks a [`ConsentProvider`], opens the
//! device on consent and announces the outcome on the event bus. Each
//! request ends in exactly one of `Connected`, `Denied` or `Cancelled`.
//!
//! Requests are tracked per device key with a ticket. Resolution is a
//! compare-and-set on (state == Requested, ticket): whichever of consent,
//! `cancel` or `forget` gets there first wins, and a late loser's opened
//! block is closed instead of being announced.

use crate::config::ConsentMode;
use common::{ControlBlock, EventSender, SessionEvent, Undelivered, UsbTransport};
use protocol::{DeviceIdentity, PermissionError, PermissionState};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Decides whether a device may be opened
///
/// Called on the blocking pool, so implementations may block on user input.
pub trait ConsentProvider: Send + Sync {
    fn decide(&self, device: &DeviceIdentity) -> Result<(), PermissionError>;
}

/// Grants every request
pub struct AutoGrant;

impl ConsentProvider for AutoGrant {
    fn decide(&self, _device: &DeviceIdentity) -> Result<(), PermissionError> {
        Ok(())
    }
}

/// Refuses every request
pub struct DenyAll;

impl ConsentProvider for DenyAll {
    fn decide(&self, _device: &DeviceIdentity) -> Result<(), PermissionError> {
        Err(PermissionError::Denied)
    }
}

/// Asks `y/N` on the controlling terminal
///
/// End of input or a read error counts as the user walking away.
pub struct TerminalPrompt;

impl ConsentProvider for TerminalPrompt {
    fn decide(&self, device: &DeviceIdentity) -> Result<(), PermissionError> {
        let stdin = std::io::stdin();
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "Allow access to {}? [y/N] ", device);
        let _ = stderr.flush();

        let mut answer = String::new();
        match stdin.lock().read_line(&mut answer) {
            Ok(0) | Err(_) => Err(PermissionError::Cancelled),
            Ok(_) => match answer.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => Ok(()),
                _ => Err(PermissionError::Denied),
            },
        }
    }
}

/// Consent provider for a configured mode
pub fn consent_provider(mode: ConsentMode) -> Arc<dyn ConsentProvider> {
    match mode {
        ConsentMode::Auto => Arc::new(AutoGrant),
        ConsentMode::Prompt => Arc::new(TerminalPrompt),
        ConsentMode::Deny => Arc::new(DenyAll),
    }
}

/// What `request_permission` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new request is being resolved
    Started,
    /// A request for this device was already pending
    Coalesced,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: PermissionState,
    ticket: u64,
}

#[derive(Default)]
struct BrokerState {
    entries: HashMap<(u8, u8), Entry>,
    next_ticket: u64,
}

/// Permission broker
#[derive(Clone)]
pub struct PermissionBroker {
    transport: Arc<dyn UsbTransport>,
    consent: Arc<dyn ConsentProvider>,
    events: EventSender,
    state: Arc<Mutex<BrokerState>>,
}

impl PermissionBroker {
    pub fn new(
        transport: Arc<dyn UsbTransport>,
        consent: Arc<dyn ConsentProvider>,
        events: EventSender,
    ) -> Self {
        Self {
            transport,
            consent,
            events,
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current permission state of a device
    pub fn state(&self, device: &DeviceIdentity) -> PermissionState {
        self.lock()
            .entries
            .get(&device.key())
            .map(|e| e.state)
            .unwrap_or_default()
    }

    /// Ask for access to `device`
    ///
    /// Must be called from within a Tokio runtime. While a request for the
    /// same device is pending this is a no-op. A device granted earlier is
    /// reopened without asking again.
    pub fn request_permission(&self, device: &DeviceIdentity) -> RequestOutcome {
        let (ticket, remembered) = {
            let mut state = self.lock();
            let ticket = state.next_ticket;
            let entry = state.entries.entry(device.key()).or_insert(Entry {
                state: PermissionState::Unrequested,
                ticket,
            });

            if entry.state.is_pending() {
                debug!("Permission request for {} already pending", device);
                return RequestOutcome::Coalesced;
            }

            let remembered = entry.state == PermissionState::Granted;
            entry.state = PermissionState::Requested;
            entry.ticket = ticket;
            state.next_ticket += 1;
            (ticket, remembered)
        };

        info!("Requesting permission for {}", device);

        let broker = self.clone();
        let device = device.clone();
        tokio::task::spawn_blocking(move || broker.resolve_request(device, ticket, remembered));

        RequestOutcome::Started
    }

    /// Consent, open, then publish. Runs on the blocking pool.
    fn resolve_request(&self, device: DeviceIdentity, ticket: u64, remembered: bool) {
        let consent = if remembered {
            Ok(())
        } else {
            self.consent.decide(&device)
        };

        let (state, event) = match consent {
            Ok(()) => match self.transport.open_control_block(&device) {
                Ok(block) => (
                    PermissionState::Granted,
                    SessionEvent::Connected {
                        device: device.clone(),
                        block,
                    },
                ),
                Err(e) => {
                    warn!("Failed to open {} after consent: {}", device, e);
                    (PermissionState::Denied, SessionEvent::Denied(device.clone()))
                }
            },
            Err(PermissionError::Denied) => {
                (PermissionState::Denied, SessionEvent::Denied(device.clone()))
            }
            Err(PermissionError::Cancelled) => (
                PermissionState::Cancelled,
                SessionEvent::Cancelled(device.clone()),
            ),
        };

        if self.settle(&device, Some(ticket), state) {
            self.publish_blocking(event);
        } else {
            debug!("Permission request for {} was superseded", device);
            if let SessionEvent::Connected { block, .. } = event {
                self.discard(block);
            }
        }
    }

    /// The single compare-and-set that ends a request
    ///
    /// With `Some(ticket)` only that request may settle; `None` settles any
    /// pending request for the device.
    fn settle(&self, device: &DeviceIdentity, ticket: Option<u64>, to: PermissionState) -> bool {
        let mut state = self.lock();
        match state.entries.get_mut(&device.key()) {
            Some(entry)
                if entry.state.is_pending() && ticket.is_none_or(|t| t == entry.ticket) =>
            {
                entry.state = to;
                true
            }
            _ => false,
        }
    }

    /// Close a block that will never reach a session
    pub fn discard(&self, block: ControlBlock) {
        debug!("Closing unused block for {}", block.device());
        self.transport.close_control_block(block);
    }

    /// Close the block of a `Connected` event nobody received
    fn reclaim(&self, undelivered: Undelivered) {
        error!("Failed to publish: {}", undelivered);
        if let SessionEvent::Connected { block, .. } = undelivered.into_event() {
            self.discard(block);
        }
    }

    fn publish_blocking(&self, event: SessionEvent) {
        if let Err(undelivered) = self.events.send_blocking(event) {
            self.reclaim(undelivered);
        }
    }

    async fn publish(&self, event: SessionEvent) {
        if let Err(undelivered) = self.events.send(event).await {
            self.reclaim(undelivered);
        }
    }

    /// User cancellation of a pending request
    ///
    /// Returns true if a pending request was cancelled.
    pub async fn cancel(&self, device: &DeviceIdentity) -> bool {
        if !self.settle(device, None, PermissionState::Cancelled) {
            return false;
        }
        info!("Permission request for {} cancelled", device);
        self.publish(SessionEvent::Cancelled(device.clone())).await;
        true
    }

    /// Drop everything known about a device that went away
    ///
    /// A request still pending for it resolves as `Cancelled`.
    pub async fn forget(&self, device: &DeviceIdentity) {
        // One guard: a request started after this point gets a fresh entry
        let was_pending = self
            .lock()
            .entries
            .remove(&device.key())
            .is_some_and(|entry| entry.state.is_pending());

        if was_pending {
            info!("Pending permission request for {} cancelled by detach", device);
            self.publish(SessionEvent::Cancelled(device.clone())).await;
        }
    }
}
