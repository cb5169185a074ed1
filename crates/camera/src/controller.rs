//! Session controller
//!
//! Consumes the event bus in order and drives the broker, the session and
//! the prober. Anything that touches the device runs on the blocking pool
//! so a `Detached` event is never stuck behind a slow transfer.
//!
//! A block handed out by `Connected` is tracked until its session task has
//! taken it. `Detached` and shutdown invalidate tracked blocks before
//! touching the session, so a connect that has not started yet refuses the
//! block and one that has started is torn down.

use crate::config::ProbeConfig;
use crate::permission::PermissionBroker;
use crate::prober::ExtensionUnitProber;
use crate::session::CameraSession;
use common::{BlockRef, ControlBlock, EventReceiver, SessionEvent};
use protocol::{
    DeviceIdentity, ProbeError, ProbeResult, SessionState, SurfaceHandle, ThermalScan,
    TransportError,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

/// Controller behaviour
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerConfig {
    /// Request permission for matching devices as they appear
    pub auto_connect: bool,
    /// Surface handed to `start_preview` after connecting
    pub surface: Option<SurfaceHandle>,
    /// Probe the thermal unit once preview is running
    pub probe_on_connect: bool,
    /// Sweep every selector instead of reading the configured one
    pub full_scan: bool,
}

impl ControllerConfig {
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self {
            auto_connect: config.preview.auto_connect,
            surface: config.preview.surface.map(SurfaceHandle),
            probe_on_connect: config.probe.probe_on_connect,
            full_scan: config.probe.full_scan,
        }
    }
}

/// Result of a probe the controller ran on its own
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Quick(ProbeResult),
    Scan(Result<ThermalScan, ProbeError>),
}

fn join_failure(err: JoinError) -> ProbeError {
    ProbeError::TransferFailed(TransportError::Other {
        message: format!("probe task failed: {}", err),
    })
}

/// Event-driven owner of one camera session
#[derive(Clone)]
pub struct SessionController {
    session: Arc<CameraSession>,
    broker: PermissionBroker,
    prober: ExtensionUnitProber,
    config: ControllerConfig,
    probe_results: Option<async_channel::Sender<ProbeOutcome>>,
    /// Blocks handed to session tasks that have not finished connecting
    in_flight: Arc<Mutex<HashMap<u64, BlockRef>>>,
}

impl SessionController {
    pub fn new(
        session: Arc<CameraSession>,
        broker: PermissionBroker,
        prober: ExtensionUnitProber,
        config: ControllerConfig,
    ) -> Self {
        Self {
            session,
            broker,
            prober,
            config,
            probe_results: None,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Deliver automatic probe outcomes on `results`
    pub fn with_probe_results(mut self, results: async_channel::Sender<ProbeOutcome>) -> Self {
        self.probe_results = Some(results);
        self
    }

    pub fn session(&self) -> &Arc<CameraSession> {
        &self.session
    }

    pub fn broker(&self) -> &PermissionBroker {
        &self.broker
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<u64, BlockRef>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Invalidate in-flight blocks, all of them or those of `device`
    fn invalidate_in_flight(&self, device: Option<&DeviceIdentity>) -> usize {
        let in_flight = self.in_flight();
        let mut count = 0;
        for link in in_flight.values() {
            if device.is_none_or(|d| link.device().same_device(d)) {
                link.invalidate();
                count += 1;
            }
        }
        count
    }

    /// Process events until the bus closes or `shutdown` completes
    ///
    /// The session is released on the way out, and blocks of `Connected`
    /// events still queued are closed.
    pub async fn run<F>(&self, events: EventReceiver, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("Session controller started");

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            self.handle_event(event).await;
                        }
                        Err(e) => {
                            debug!("Event bus closed: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        events.close();
        let mut undelivered = Vec::new();
        while let Some(event) = events.try_recv() {
            match event {
                SessionEvent::Connected { device, block } => {
                    info!("Closing block for {} received after shutdown", device);
                    undelivered.push(block);
                }
                other => debug!("Dropping {} event for {}", other.kind(), other.device()),
            }
        }

        let stale = self.invalidate_in_flight(None);
        if stale > 0 {
            debug!("Invalidated {} block(s) still connecting", stale);
        }

        let session = Arc::clone(&self.session);
        let broker = self.broker.clone();
        let cleanup = tokio::task::spawn_blocking(move || {
            session.release();
            for block in undelivered {
                broker.discard(block);
            }
        });
        if let Err(e) = cleanup.await {
            error!("Failed to release session on shutdown: {}", e);
        }
        info!("Session controller stopped");
    }

    /// Handle one event
    ///
    /// `Connected` work continues in the background; its handle is returned
    /// so callers can wait for it.
    pub async fn handle_event(&self, event: SessionEvent) -> Option<JoinHandle<()>> {
        match event {
            SessionEvent::Attached(device) => {
                info!("Camera attached: {}", device);
                if !self.config.auto_connect {
                    return None;
                }
                if self.session.state() != SessionState::Idle {
                    debug!("Session busy, not requesting {}", device);
                    return None;
                }
                self.broker.request_permission(&device);
                None
            }
            SessionEvent::Connected { device, block } => {
                info!("Access granted to {}", device);
                self.in_flight().insert(block.id(), block.link());
                Some(self.spawn_session(device, block))
            }
            SessionEvent::Denied(device) => {
                warn!("Access to {} denied", device);
                None
            }
            SessionEvent::Cancelled(device) => {
                info!("Access request for {} cancelled", device);
                None
            }
            SessionEvent::Detached(device) => {
                info!("Camera detached: {}", device);
                if self.invalidate_in_flight(Some(&device)) > 0 {
                    info!("Connect to {} abandoned", device);
                }
                let session = Arc::clone(&self.session);
                let target = device.clone();
                match tokio::task::spawn_blocking(move || session.handle_detached(&target)).await {
                    Ok(true) => info!("Session for {} released", device),
                    Ok(false) => {}
                    Err(e) => error!("Detach handling failed: {}", e),
                }
                self.broker.forget(&device).await;
                None
            }
        }
    }

    fn spawn_session(&self, device: DeviceIdentity, block: ControlBlock) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let worker = controller.clone();
            let id = block.id();
            let opened =
                tokio::task::spawn_blocking(move || worker.open_and_preview(&device, block)).await;
            controller.in_flight().remove(&id);
            match opened {
                Ok(true) if controller.config.probe_on_connect => controller.auto_probe().await,
                Ok(_) => {}
                Err(e) => error!("Session task failed: {}", e),
            }
        })
    }

    /// Replace any current session with one on `block`
    ///
    /// Returns true once preview is running. A block invalidated by a
    /// detach or shutdown is closed without disturbing the session.
    fn open_and_preview(&self, device: &DeviceIdentity, block: ControlBlock) -> bool {
        if !block.is_valid() {
            info!("{} went away before its session started", device);
            self.broker.discard(block);
            return false;
        }
        self.session.release();

        if let Err(e) = self.session.connect(block) {
            warn!("Could not open {}: {}", device, e);
            return false;
        }
        match self.session.start_preview(self.config.surface) {
            Ok(()) => true,
            Err(e) => {
                warn!("Preview on {} not started: {}", device, e);
                false
            }
        }
    }

    async fn auto_probe(&self) {
        let outcome = if self.config.full_scan {
            ProbeOutcome::Scan(self.scan_thermal_unit().await)
        } else {
            ProbeOutcome::Quick(self.scan_thermal_data().await)
        };

        match &outcome {
            ProbeOutcome::Quick(Ok(report)) => info!(
                "Thermal reading: {:.1} C (unit {} selector {})",
                report.celsius, report.unit_id, report.selector
            ),
            ProbeOutcome::Scan(Ok(scan)) => info!(
                "Thermal scan: {} of {} selectors readable",
                scan.total_reads,
                scan.selectors.len()
            ),
            ProbeOutcome::Quick(Err(e)) | ProbeOutcome::Scan(Err(e)) if e.is_unsupported() => {
                info!("Camera has no thermal unit")
            }
            ProbeOutcome::Quick(Err(e)) | ProbeOutcome::Scan(Err(e)) => {
                warn!("Thermal probe failed: {}", e)
            }
        }

        if let Some(results) = &self.probe_results
            && let Err(e) = results.send(outcome).await
        {
            debug!("Probe result dropped: {}", e);
        }
    }

    /// Read the thermal unit of the current camera
    ///
    /// `StaleHandle` when no camera is open.
    pub async fn scan_thermal_data(&self) -> ProbeResult {
        let handle = self
            .session
            .device_handle()
            .map_err(|_| ProbeError::StaleHandle)?;
        let prober = self.prober.clone();
        tokio::task::spawn_blocking(move || prober.quick_thermal_probe(&handle))
            .await
            .unwrap_or_else(|e| Err(join_failure(e)))
    }

    /// Sweep every selector of the current camera's thermal unit
    pub async fn scan_thermal_unit(&self) -> Result<ThermalScan, ProbeError> {
        let handle = self
            .session
            .device_handle()
            .map_err(|_| ProbeError::StaleHandle)?;
        let prober = self.prober.clone();
        tokio::task::spawn_blocking(move || prober.scan_thermal_unit(&handle))
            .await
            .unwrap_or_else(|e| Err(join_failure(e)))
    }
}
