//! USB subsystem
//!
//! Wraps libusb (via rusb) for the rest of the crate:
//! - Process-wide context, initialized once
//! - Device discovery and hot-plug notification ([`DeviceRegistry`])
//! - Control-transfer transport over opened devices ([`RusbTransport`])
//! - The hot-plug event pump thread ([`spawn_hotplug_worker`])

pub mod device;
pub mod manager;
pub mod worker;

use rusb::Context;
use std::sync::OnceLock;
use tracing::{error, info};

pub use device::{RusbTransport, map_rusb_error};
pub use manager::DeviceRegistry;
pub use worker::{HotplugWorker, HotplugWorkerHandle, spawn_hotplug_worker};

static USB_CONTEXT: OnceLock<Result<Context, rusb::Error>> = OnceLock::new();

/// The process-wide libusb context
///
/// Created on first use; the outcome (success or the libusb error) is
/// logged once and returned to every later caller.
pub fn usb_context() -> Result<&'static Context, rusb::Error> {
    USB_CONTEXT
        .get_or_init(|| match Context::new() {
            Ok(context) => {
                let version = rusb::version();
                info!(
                    "libusb {}.{}.{} initialized",
                    version.major(),
                    version.minor(),
                    version.micro()
                );
                Ok(context)
            }
            Err(e) => {
                error!("Failed to initialize libusb: {}", e);
                Err(e)
            }
        })
        .as_ref()
        .map_err(|e| *e)
}
