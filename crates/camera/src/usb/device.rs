//! rusb-backed transport
//!
//! Opening a camera detaches the kernel video driver from its video-class
//! interfaces and claims them, so class requests reach the device without
//! contention. Closing releases the interfaces and gives them back to the
//! kernel.

use common::{BlockRef, ControlBlock, UsbTransport};
use protocol::{ControlRequest, DeviceIdentity, TransportError, USB_CLASS_VIDEO};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// An opened device and the interfaces taken from the kernel
struct OpenCamera {
    handle: DeviceHandle<Context>,
    claimed_interfaces: Vec<u8>,
    detached_interfaces: Vec<u8>,
}

impl OpenCamera {
    fn release(&self, id: u64) {
        debug!("Releasing interfaces of control block {}", id);
        release_interfaces(
            &self.handle,
            &self.claimed_interfaces,
            &self.detached_interfaces,
        );
    }
}

/// Release claimed interfaces and hand detached ones back to the kernel
fn release_interfaces(handle: &DeviceHandle<Context>, claimed: &[u8], detached: &[u8]) {
    for interface in claimed {
        if let Err(e) = handle.release_interface(*interface) {
            warn!("Failed to release interface {}: {}", interface, e);
        }
    }

    for interface in detached {
        if let Err(e) = handle.attach_kernel_driver(*interface) {
            debug!(
                "Could not reattach kernel driver to interface {}: {}",
                interface, e
            );
        } else {
            debug!("Reattached kernel driver to interface {}", interface);
        }
    }
}

/// [`UsbTransport`] over libusb
pub struct RusbTransport {
    context: Context,
    open: Mutex<HashMap<u64, Arc<OpenCamera>>>,
    next_id: AtomicU64,
}

impl RusbTransport {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            open: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn open_map(&self) -> MutexGuard<'_, HashMap<u64, Arc<OpenCamera>>> {
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn find_device(&self, identity: &DeviceIdentity) -> Result<Device<Context>, TransportError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        devices
            .iter()
            .find(|d| d.bus_number() == identity.bus_number && d.address() == identity.device_address)
            .ok_or(TransportError::NoDevice)
    }

    /// Detach and claim every video-class interface of the active configuration
    fn claim_video_interfaces(
        device: &Device<Context>,
        handle: &DeviceHandle<Context>,
    ) -> Result<(Vec<u8>, Vec<u8>), TransportError> {
        let config = device.active_config_descriptor().map_err(map_rusb_error)?;
        let mut claimed = Vec::new();
        let mut detached = Vec::new();

        for interface in config.interfaces() {
            let is_video = interface
                .descriptors()
                .next()
                .is_some_and(|d| d.class_code() == USB_CLASS_VIDEO);
            if !is_video {
                continue;
            }
            let number = interface.number();

            match handle.kernel_driver_active(number) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {}", number);
                    match handle.detach_kernel_driver(number) {
                        Ok(()) => detached.push(number),
                        Err(e) => warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            number, e
                        ),
                    }
                }
                Ok(false) => {}
                Err(e) => debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    number, e
                ),
            }

            if let Err(e) = handle.claim_interface(number) {
                warn!("Failed to claim interface {}: {}", number, e);
                // Unwind what was taken so far
                release_interfaces(handle, &claimed, &detached);
                return Err(map_rusb_error(e));
            }
            claimed.push(number);
        }

        Ok((claimed, detached))
    }
}

impl UsbTransport for RusbTransport {
    fn open_control_block(&self, identity: &DeviceIdentity) -> Result<ControlBlock, TransportError> {
        let device = self.find_device(identity)?;
        let handle = device.open().map_err(|e| {
            warn!("Failed to open {}: {}", identity, e);
            map_rusb_error(e)
        })?;

        let (claimed_interfaces, detached_interfaces) =
            Self::claim_video_interfaces(&device, &handle)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.open_map().insert(
            id,
            Arc::new(OpenCamera {
                handle,
                claimed_interfaces,
                detached_interfaces,
            }),
        );

        info!("Opened {} as control block {}", identity, id);
        Ok(ControlBlock::new(id, identity.clone()))
    }

    fn control_transfer(
        &self,
        block: &BlockRef,
        request: &ControlRequest,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        block.ensure_valid()?;
        let camera = self
            .open_map()
            .get(&block.id())
            .cloned()
            .ok_or(TransportError::Stale)?;

        debug!(
            "Control transfer on block {}: type={:#04x} req={:#04x} value={:#06x} index={:#06x} len={}",
            block.id(),
            request.request_type,
            request.request,
            request.value,
            request.index,
            request.length
        );

        if request.is_in() {
            let mut buf = vec![0u8; request.length as usize];
            let n = camera
                .handle
                .read_control(
                    request.request_type,
                    request.request,
                    request.value,
                    request.index,
                    &mut buf,
                    timeout,
                )
                .map_err(map_rusb_error)?;
            buf.truncate(n);
            Ok(buf)
        } else {
            camera
                .handle
                .write_control(
                    request.request_type,
                    request.request,
                    request.value,
                    request.index,
                    &request.data,
                    timeout,
                )
                .map_err(map_rusb_error)?;
            Ok(Vec::new())
        }
    }

    fn close_control_block(&self, block: ControlBlock) {
        block.invalidate();
        let camera = self.open_map().remove(&block.id());
        match camera {
            Some(camera) => {
                camera.release(block.id());
                info!("Closed control block {} for {}", block.id(), block.device());
            }
            None => debug!("Control block {} already closed", block.id()),
        }
    }
}

/// Map rusb errors to transport errors
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Pipe => TransportError::Pipe,
        rusb::Error::NoDevice => TransportError::NoDevice,
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Overflow => TransportError::Overflow,
        rusb::Error::Io => TransportError::Io,
        rusb::Error::InvalidParam => TransportError::InvalidParam,
        rusb::Error::Access => TransportError::Access,
        _ => TransportError::Other {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), TransportError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), TransportError::Pipe);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), TransportError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::Access), TransportError::Access);
        assert!(matches!(
            map_rusb_error(rusb::Error::NoMem),
            TransportError::Other { .. }
        ));
    }
}
