//! USB transport abstraction
//!
//! The session and the prober never talk to libusb directly. They hold a
//! [`ControlBlock`] (or a [`BlockRef`] derived from it) and issue control
//! transfers through a [`UsbTransport`]. The camera crate provides the rusb
//! implementation; [`crate::test_utils::MockTransport`] scripts devices in
//! tests.

use protocol::{ControlRequest, DeviceIdentity, TransportError};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Owned handle to an opened USB connection
///
/// Deliberately not `Clone`: exactly one owner may close it. Every
/// [`BlockRef`] linked from it shares the validity flag and observes
/// [`ControlBlock::invalidate`].
pub struct ControlBlock {
    id: u64,
    device: DeviceIdentity,
    valid: Arc<AtomicBool>,
}

impl ControlBlock {
    /// Wrap a freshly opened connection. Only transports should call this.
    pub fn new(id: u64, device: DeviceIdentity) -> Self {
        Self {
            id,
            device,
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    /// Cloneable reference used for transfers
    pub fn link(&self) -> BlockRef {
        BlockRef {
            id: self.id,
            device: self.device.clone(),
            valid: Arc::clone(&self.valid),
        }
    }

    /// Mark the connection dead for every linked reference
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("id", &self.id)
            .field("device", &self.device.key())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Borrowed view of a [`ControlBlock`] for issuing transfers
#[derive(Clone)]
pub struct BlockRef {
    id: u64,
    device: DeviceIdentity,
    valid: Arc<AtomicBool>,
}

impl BlockRef {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Mark the owning block dead, e.g. when its device went away while
    /// the block was still on its way to a session
    ///
    /// The block itself must still be closed by its owner.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    /// `Err(Stale)` once the owning block was invalidated
    pub fn ensure_valid(&self) -> Result<(), TransportError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(TransportError::Stale)
        }
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRef")
            .field("id", &self.id)
            .field("device", &self.device.key())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Control-transfer level access to USB devices
///
/// Implementations are blocking; async callers go through
/// `tokio::task::spawn_blocking`.
pub trait UsbTransport: Send + Sync {
    /// Open the device and claim what is needed for control transfers
    fn open_control_block(&self, device: &DeviceIdentity) -> Result<ControlBlock, TransportError>;

    /// Issue one control transfer; IN requests return the bytes read, OUT
    /// requests return an empty buffer
    fn control_transfer(
        &self,
        block: &BlockRef,
        request: &ControlRequest,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Release the device. Consumes the block so it can only happen once.
    fn close_control_block(&self, block: ControlBlock);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: 0x0bda,
            product_id: 0x5830,
            bus_number: 1,
            device_address: 4,
            name: "Thermal".to_string(),
        }
    }

    #[test]
    fn test_links_observe_invalidation() {
        let block = ControlBlock::new(7, identity());
        let a = block.link();
        let b = a.clone();
        assert!(a.is_valid() && b.is_valid());
        assert_eq!(a.id(), 7);

        block.invalidate();
        assert!(!block.is_valid());
        assert!(!a.is_valid());
        assert_eq!(b.ensure_valid(), Err(TransportError::Stale));
    }

    #[test]
    fn test_link_can_invalidate_its_block() {
        let block = ControlBlock::new(3, identity());
        block.link().invalidate();
        assert!(!block.is_valid());
    }

    #[test]
    fn test_link_outlives_block() {
        let block = ControlBlock::new(1, identity());
        let link = block.link();
        block.invalidate();
        drop(block);
        assert!(!link.is_valid());
        assert_eq!(link.device().key(), (1, 4));
    }
}
