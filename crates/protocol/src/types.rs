//! Device, permission and session type definitions
//!
//! Plain data shared by every layer: the identity of a physical device,
//! the per-device permission state, the camera session state and the
//! stream formats the session negotiates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default preview width used for format negotiation
pub const DEFAULT_PREVIEW_WIDTH: u16 = 640;

/// Default preview height used for format negotiation
pub const DEFAULT_PREVIEW_HEIGHT: u16 = 480;

/// Identity of a physical USB device instance
///
/// Immutable once discovered. Two identities refer to the same device
/// instance when their (bus, address) keys are equal; a re-plugged device
/// gets a new address and therefore a new identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Bus number on the host
    pub bus_number: u8,
    /// Device address on the bus
    pub device_address: u8,
    /// Human-readable name (product string or bus/address fallback)
    pub name: String,
}

impl DeviceIdentity {
    /// Key identifying the physical device instance
    pub fn key(&self) -> (u8, u8) {
        (self.bus_number, self.device_address)
    }

    /// usbfs device node path
    pub fn path(&self) -> String {
        format!(
            "/dev/bus/usb/{:03}/{:03}",
            self.bus_number, self.device_address
        )
    }

    /// Whether `other` is the same physical device instance
    pub fn same_device(&self, other: &DeviceIdentity) -> bool {
        self.key() == other.key()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:04x}:{:04x}] at {}",
            self.name,
            self.vendor_id,
            self.product_id,
            self.path()
        )
    }
}

/// Permission state of a single device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PermissionState {
    /// No request has been made
    #[default]
    Unrequested,
    /// A consent flow is pending
    Requested,
    /// Access granted and a control block handed out
    Granted,
    /// Access refused
    Denied,
    /// The consent flow was cancelled
    Cancelled,
}

impl PermissionState {
    /// True when a request is in flight
    pub fn is_pending(&self) -> bool {
        matches!(self, PermissionState::Requested)
    }
}

/// Camera session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionState {
    /// No control block held
    #[default]
    Idle,
    /// Control block accepted, reading the device topology
    Opening,
    /// Negotiating (or holding a negotiated) stream format
    FormatNegotiating,
    /// Stream committed and preview running
    PreviewActive,
    /// Tearing down
    Closing,
}

/// Pixel formats the session knows how to request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Motion-JPEG (compressed)
    Mjpeg,
    /// YUY2 4:2:2 (uncompressed)
    Yuyv,
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Mjpeg => write!(f, "MJPEG"),
            PixelFormat::Yuyv => write!(f, "YUYV"),
        }
    }
}

/// A stream format: resolution plus pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamFormat {
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
}

impl StreamFormat {
    pub fn new(width: u16, height: u16, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
        }
    }

    /// The fixed two-tier negotiation order for a resolution
    ///
    /// Compressed first, then exactly one uncompressed fallback at the same
    /// resolution. There is no third tier.
    pub fn negotiation_order(width: u16, height: u16) -> [StreamFormat; 2] {
        [
            StreamFormat::new(width, height, PixelFormat::Mjpeg),
            StreamFormat::new(width, height, PixelFormat::Yuyv),
        ]
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self::new(
            DEFAULT_PREVIEW_WIDTH,
            DEFAULT_PREVIEW_HEIGHT,
            PixelFormat::Mjpeg,
        )
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.pixel_format)
    }
}

/// Opaque rendering surface handle
///
/// The session never inspects it; it only has to be present for preview
/// to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceHandle(pub u64);
