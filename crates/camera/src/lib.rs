//! UVC camera session and thermal extension-unit prober
//!
//! - [`usb`]: libusb context, device registry, hot-plug pump and the
//!   rusb-backed control transport
//! - [`permission`]: consent flow that hands out control blocks
//! - [`session`]: the single-camera state machine
//! - [`prober`]: thermal extension unit reads
//! - [`controller`]: event loop tying the above together

pub mod config;
pub mod controller;
pub mod permission;
pub mod prober;
pub mod session;
pub mod usb;
pub mod uvc;

pub use config::ProbeConfig;
pub use controller::{ControllerConfig, ProbeOutcome, SessionController};
pub use permission::{ConsentProvider, PermissionBroker, RequestOutcome, consent_provider};
pub use prober::ExtensionUnitProber;
pub use session::{CameraSession, SessionConfig};
