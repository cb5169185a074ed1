//! Error taxonomy shared by the session, broker and prober
//!
//! Every failure a caller can observe is a typed variant; human-readable
//! rendering is left to `Display` and the presentation layer.

use crate::types::SessionState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Low-level transport failure
///
/// Mirrors the libusb error codes the transport can surface, plus `Stale`
/// for operations attempted on an invalidated control block.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransportError {
    #[error("transfer timed out")]
    Timeout,
    #[error("endpoint stalled (request not supported)")]
    Pipe,
    #[error("device has been disconnected")]
    NoDevice,
    #[error("entity not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("overflow")]
    Overflow,
    #[error("input/output error")]
    Io,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("access denied (insufficient permissions)")]
    Access,
    #[error("control block has been released")]
    Stale,
    #[error("{message}")]
    Other { message: String },
}

impl TransportError {
    /// True when the failure means the underlying handle is gone for good
    pub fn is_stale(&self) -> bool {
        matches!(self, TransportError::Stale | TransportError::NoDevice)
    }
}

/// Configuration descriptor parsing failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// A descriptor claims more bytes than the buffer holds
    #[error("descriptor at offset {offset} truncated: needed {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A bLength field is impossible for its descriptor type
    #[error("invalid descriptor length {length} at offset {offset}")]
    InvalidLength { offset: usize, length: u8 },

    /// The buffer does not start with a configuration descriptor
    #[error("not a configuration descriptor (type {descriptor_type:#04x})")]
    NotConfiguration { descriptor_type: u8 },

    /// No video-control interface was found in the configuration
    #[error("configuration has no video control interface")]
    NoVideoControlInterface,
}

/// Permission request outcome other than a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PermissionError {
    #[error("permission denied")]
    Denied,
    #[error("permission request cancelled")]
    Cancelled,
}

/// Camera session failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// A session already holds a control block; release it first
    #[error("a camera session is already active")]
    AlreadyActive,

    /// Neither the preferred nor the fallback format was accepted
    #[error("device accepted none of the supported stream formats")]
    NoSupportedFormat,

    /// Preview was requested without a surface; format stays negotiated
    #[error("no preview surface available")]
    NoSurface,

    /// The control block was released or the device detached
    #[error("control block is stale (released or detached)")]
    StaleHandle,

    /// Operation not valid in the current state
    #[error("operation not valid in state {state:?}")]
    InvalidState { state: SessionState },

    /// Opening the camera failed at the transport level
    #[error("failed to open camera: {0}")]
    OpenFailed(TransportError),

    /// The configuration descriptor could not be parsed
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// A control transfer failed after the camera was opened
    #[error("transport error: {0}")]
    Transport(TransportError),
}

/// Extension unit probe failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// No extension unit with the thermal GUID exists
    #[error("no matching extension unit")]
    NoExtensionUnit,

    /// Descriptor data was malformed or truncated
    #[error("descriptor parse error: {0}")]
    DescriptorParseError(#[from] DescriptorError),

    /// The control transfer failed for a reason other than a timeout
    #[error("control transfer failed: {0}")]
    TransferFailed(TransportError),

    /// The control transfer did not complete within its timeout
    #[error("control transfer timed out")]
    Timeout,

    /// The device answered with a short or implausible payload
    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },

    /// The probe ran against a released control block
    #[error("device handle is stale")]
    StaleHandle,
}

impl ProbeError {
    /// The device does not offer the capability (as opposed to being faulty)
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ProbeError::NoExtensionUnit)
    }

    /// The capability exists but the device misbehaved answering it
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            ProbeError::Timeout | ProbeError::MalformedResponse { .. } | ProbeError::TransferFailed(_)
        )
    }
}

impl From<TransportError> for ProbeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => ProbeError::Timeout,
            e if e.is_stale() => ProbeError::StaleHandle,
            e => ProbeError::TransferFailed(e),
        }
    }
}
