//! Camera session state machine
//!
//! ```text
//! Idle -> Opening -> FormatNegotiating -> PreviewActive -> Closing -> Idle
//!           |               |
//!           +---------------+--> Idle (failure)
//! ```
//!
//! At most one control block is held. Every state transition happens under
//! one mutex, but descriptor reads and probe/commit transfers run outside
//! it. A generation counter, bumped by every teardown and every accepted
//! connect, tells an in-flight operation that `release()` or a detach
//! overtook it; such an operation returns `StaleHandle` without touching
//! the (already closed) block again.
//!
//! Teardown closes the block while holding the lock, so `Closing` is never
//! observable from outside and a new `connect` cannot start until the old
//! block is gone.

use crate::config::ProbeConfig;
use crate::uvc::{NegotiatedStream, UvcCamera};
use common::{BlockRef, ControlBlock, NoticeSender, SessionNotice, StopReason, UsbTransport};
use protocol::{
    DeviceIdentity, SessionError, SessionState, StreamFormat, SurfaceHandle, TransportError,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Session parameters
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Resolution offered in both negotiation tiers
    pub width: u16,
    pub height: u16,
    /// Timeout for descriptor and probe/commit transfers
    pub control_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            width: protocol::DEFAULT_PREVIEW_WIDTH,
            height: protocol::DEFAULT_PREVIEW_HEIGHT,
            control_timeout: Duration::from_millis(1000),
        }
    }
}

impl SessionConfig {
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self {
            width: config.preview.width,
            height: config.preview.height,
            control_timeout: config.probe.timeout(),
        }
    }
}

#[derive(Default)]
struct SessionInner {
    state: SessionState,
    block: Option<ControlBlock>,
    camera: Option<Arc<UvcCamera>>,
    stream: Option<NegotiatedStream>,
    surface: Option<SurfaceHandle>,
    generation: u64,
    /// A VS_COMMIT is in flight for the current generation
    committing: bool,
}

/// A single camera session
pub struct CameraSession {
    transport: Arc<dyn UsbTransport>,
    config: SessionConfig,
    inner: Mutex<SessionInner>,
    notices: Option<NoticeSender>,
}

fn transport_failure(err: TransportError) -> SessionError {
    if err.is_stale() {
        SessionError::StaleHandle
    } else {
        SessionError::Transport(err)
    }
}

impl CameraSession {
    pub fn new(transport: Arc<dyn UsbTransport>, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            inner: Mutex::new(SessionInner::default()),
            notices: None,
        }
    }

    /// Report preview start/stop on `notices`
    pub fn with_notices(mut self, notices: NoticeSender) -> Self {
        self.notices = Some(notices);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, notice: SessionNotice) {
        if let Some(notices) = &self.notices {
            notices.notify(notice);
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Format accepted by the device, once negotiation succeeded
    pub fn negotiated_format(&self) -> Option<StreamFormat> {
        self.lock().stream.map(|s| s.format)
    }

    /// Device whose block the session holds
    pub fn device(&self) -> Option<DeviceIdentity> {
        self.lock().block.as_ref().map(|b| b.device().clone())
    }

    pub fn surface(&self) -> Option<SurfaceHandle> {
        self.lock().surface
    }

    /// Link to the opened camera for extension-unit probing
    ///
    /// `StaleHandle` unless a camera was opened and negotiated.
    pub fn device_handle(&self) -> Result<BlockRef, SessionError> {
        let inner = self.lock();
        match (&inner.camera, &inner.block) {
            (Some(camera), Some(block)) if block.is_valid() => Ok(camera.link().clone()),
            _ => Err(SessionError::StaleHandle),
        }
    }

    /// Take ownership of `block`, open the camera and negotiate a format
    ///
    /// On success the session is in `FormatNegotiating` with an accepted
    /// format. On any failure the block is closed and the session is
    /// `Idle`. A block offered while the session is busy is closed and
    /// refused with `AlreadyActive`.
    pub fn connect(&self, block: ControlBlock) -> Result<(), SessionError> {
        let (link, generation, device) = {
            let mut inner = self.lock();
            if inner.state != SessionState::Idle {
                warn!(
                    "Refusing {}: session is {:?}",
                    block.device(),
                    inner.state
                );
                drop(inner);
                self.transport.close_control_block(block);
                return Err(SessionError::AlreadyActive);
            }
            if !block.is_valid() {
                drop(inner);
                self.transport.close_control_block(block);
                return Err(SessionError::StaleHandle);
            }

            inner.generation += 1;
            inner.state = SessionState::Opening;
            let link = block.link();
            let device = block.device().clone();
            inner.block = Some(block);
            (link, inner.generation, device)
        };

        info!("Opening {}", device);
        let camera = UvcCamera::open(self.transport.as_ref(), link, self.config.control_timeout)
            .map_err(|e| self.fail(generation, e.into()))?;

        {
            let mut inner = self.lock();
            if inner.generation != generation {
                return Err(SessionError::StaleHandle);
            }
            inner.state = SessionState::FormatNegotiating;
        }

        let negotiated = camera
            .negotiate(self.transport.as_ref(), self.config.width, self.config.height)
            .map_err(|e| self.fail(generation, transport_failure(e)))?;

        let Some(stream) = negotiated else {
            warn!("{} accepted no supported format", device);
            return Err(self.fail(generation, SessionError::NoSupportedFormat));
        };

        let mut inner = self.lock();
        if inner.generation != generation {
            return Err(SessionError::StaleHandle);
        }
        inner.camera = Some(Arc::new(camera));
        inner.stream = Some(stream);
        info!("{} negotiated {}", device, stream.format);
        Ok(())
    }

    /// Commit the negotiated format and start preview on `surface`
    ///
    /// Without a surface this fails with `NoSurface` and leaves the
    /// negotiated format in place so the call can be retried. Only one
    /// caller commits; a concurrent call gets `InvalidState`.
    pub fn start_preview(&self, surface: Option<SurfaceHandle>) -> Result<(), SessionError> {
        let (camera, stream, generation, surface) = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Idle => return Err(SessionError::StaleHandle),
                SessionState::PreviewActive => {
                    debug!("Preview already active");
                    return Ok(());
                }
                SessionState::Opening | SessionState::Closing => {
                    return Err(SessionError::InvalidState { state: inner.state });
                }
                SessionState::FormatNegotiating => {}
            }

            let (Some(camera), Some(stream)) = (inner.camera.clone(), inner.stream) else {
                return Err(SessionError::InvalidState { state: inner.state });
            };
            let Some(surface) = surface else {
                warn!("Cannot start preview without a surface");
                return Err(SessionError::NoSurface);
            };
            if inner.committing {
                debug!("Preview already being started");
                return Err(SessionError::InvalidState { state: inner.state });
            }
            inner.committing = true;
            (camera, stream, inner.generation, surface)
        };

        camera
            .commit(self.transport.as_ref(), &stream)
            .map_err(|e| self.fail(generation, transport_failure(e)))?;

        let mut inner = self.lock();
        if inner.generation != generation {
            return Err(SessionError::StaleHandle);
        }
        inner.state = SessionState::PreviewActive;
        inner.committing = false;
        inner.surface = Some(surface);
        let device = camera.link().device().clone();
        drop(inner);

        info!("Preview started on {} ({})", device, stream.format);
        self.notify(SessionNotice::PreviewStarted {
            device,
            format: stream.format,
        });
        Ok(())
    }

    /// Tear the session down to `Idle`
    ///
    /// No-op when already idle; safe to call at any time and from any
    /// thread, including while `connect` is in flight.
    pub fn release(&self) {
        let mut inner = self.lock();
        if inner.state == SessionState::Idle {
            debug!("Release on idle session");
            return;
        }
        self.teardown(&mut inner, StopReason::Released);
    }

    /// Force a release if the session holds `device`
    ///
    /// Returns true when the session was torn down.
    pub fn handle_detached(&self, device: &DeviceIdentity) -> bool {
        let mut inner = self.lock();
        let holds_device = inner
            .block
            .as_ref()
            .is_some_and(|b| b.device().same_device(device));
        if !holds_device {
            return false;
        }
        warn!("{} detached while session was {:?}", device, inner.state);
        self.teardown(&mut inner, StopReason::Detached);
        true
    }

    /// Failure path of `connect`/`start_preview`
    ///
    /// Tears down only if nothing else did since `generation` began.
    fn fail(&self, generation: u64, err: SessionError) -> SessionError {
        let mut inner = self.lock();
        if inner.generation != generation {
            return SessionError::StaleHandle;
        }
        warn!("Session failed in {:?}: {}", inner.state, err);
        self.teardown(&mut inner, StopReason::Released);
        err
    }

    fn teardown(&self, inner: &mut SessionInner, reason: StopReason) {
        let was_previewing = inner.state == SessionState::PreviewActive;
        inner.state = SessionState::Closing;
        inner.generation += 1;
        inner.camera = None;
        inner.stream = None;
        inner.surface = None;
        inner.committing = false;

        let device = inner.block.take().map(|block| {
            let device = block.device().clone();
            block.invalidate();
            self.transport.close_control_block(block);
            device
        });

        inner.state = SessionState::Idle;

        if let Some(device) = device {
            info!("Session for {} closed ({:?})", device, reason);
            if was_previewing {
                self.notify(SessionNotice::PreviewStopped { device, reason });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockTransport, create_mock_identity, thermal_camera_descriptor};

    fn session() -> (Arc<MockTransport>, CameraSession) {
        let transport = Arc::new(MockTransport::new(thermal_camera_descriptor()));
        let session = CameraSession::new(transport.clone(), SessionConfig::default());
        (transport, session)
    }

    #[test]
    fn test_new_session_is_idle() {
        let (_, session) = session();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.negotiated_format().is_none());
        assert!(session.device().is_none());
        assert_eq!(session.device_handle().unwrap_err(), SessionError::StaleHandle);
    }

    #[test]
    fn test_connect_negotiates() {
        let (transport, session) = session();
        let block = transport.open_control_block(&create_mock_identity(4)).unwrap();

        session.connect(block).unwrap();
        assert_eq!(session.state(), SessionState::FormatNegotiating);
        assert_eq!(session.negotiated_format(), Some(StreamFormat::default()));
        assert_eq!(session.device().unwrap().device_address, 4);
        assert!(session.device_handle().is_ok());
    }

    #[test]
    fn test_stale_block_is_refused_and_closed() {
        let (transport, session) = session();
        let block = transport.open_control_block(&create_mock_identity(4)).unwrap();
        block.invalidate();

        assert_eq!(session.connect(block), Err(SessionError::StaleHandle));
        assert_eq!(transport.live_blocks(), 0);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_commit_failure_returns_to_idle() {
        let transport = Arc::new(
            MockTransport::new(thermal_camera_descriptor())
                .with_commit_failure(TransportError::Io),
        );
        let session = CameraSession::new(transport.clone(), SessionConfig::default());
        let block = transport.open_control_block(&create_mock_identity(4)).unwrap();
        session.connect(block).unwrap();

        assert_eq!(
            session.start_preview(Some(SurfaceHandle(1))),
            Err(SessionError::Transport(TransportError::Io))
        );
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(transport.closed_count(), 1);
    }
}
