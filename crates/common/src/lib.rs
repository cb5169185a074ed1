//! Common utilities for uvc-thermal-probe
//!
//! This crate provides shared plumbing between the USB side and the session
//! logic: the transport trait and its control block, the session event bus,
//! logging setup, the common error type, and test utilities.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod transport;

pub use channel::{
    EventReceiver, EventSender, NoticeSender, SessionEvent, SessionNotice, StopReason,
    Undelivered, create_event_bus, create_notice_channel,
};
pub use error::{Error, Result};
pub use logging::{LogFormat, LogOptions, setup_logging};
pub use transport::{BlockRef, ControlBlock, UsbTransport};
