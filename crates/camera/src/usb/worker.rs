//! Hot-plug worker thread
//!
//! libusb only invokes hot-plug callbacks from inside `handle_events`, so a
//! dedicated blocking thread pumps the context with a short timeout and
//! checks for shutdown between rounds.

use crate::usb::manager::DeviceRegistry;
use rusb::UsbContext;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const EVENT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Hot-plug event pump
///
/// Owns the registry so its hot-plug registration lives exactly as long as
/// the pump.
pub struct HotplugWorker {
    registry: DeviceRegistry,
    shutdown: Arc<AtomicBool>,
}

impl HotplugWorker {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self {
            registry,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the loop after the current round
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run the event loop until shutdown is requested
    pub fn run(self) -> Result<(), rusb::Error> {
        info!("Hot-plug worker started");

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.registry.context().handle_events(Some(EVENT_POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    // Transient failures must not kill the pump
                    std::thread::sleep(EVENT_POLL_TIMEOUT);
                }
            }
        }

        info!("Hot-plug worker stopped");
        Ok(())
    }
}

/// Running hot-plug worker
pub struct HotplugWorkerHandle {
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<Result<(), rusb::Error>>,
}

impl HotplugWorkerHandle {
    /// Stop the pump and wait for the thread to exit
    pub fn shutdown(self) -> Result<(), rusb::Error> {
        self.shutdown.store(true, Ordering::SeqCst);
        match self.thread.join() {
            Ok(result) => result,
            Err(e) => {
                warn!("Hot-plug worker thread panicked: {:?}", e);
                Err(rusb::Error::Other)
            }
        }
    }
}

/// Spawn the hot-plug worker on its own named thread
pub fn spawn_hotplug_worker(registry: DeviceRegistry) -> std::io::Result<HotplugWorkerHandle> {
    let worker = HotplugWorker::new(registry);
    let shutdown = worker.shutdown_flag();

    let thread = std::thread::Builder::new()
        .name("usb-hotplug".to_string())
        .spawn(move || worker.run())?;

    Ok(HotplugWorkerHandle { shutdown, thread })
}
