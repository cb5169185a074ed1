//! Camera session state machine tests
//!
//! Runs the session against the scripted mock transport:
//! - Block ownership (never two live blocks, close exactly once)
//! - Two-tier format negotiation
//! - Preview start, release and detach
//! - Releases racing an in-flight connect

use camera::{CameraSession, SessionConfig};
use common::test_utils::{
    CameraDescriptorBuilder, MockTransport, create_mock_identity, plain_camera_descriptor,
    thermal_camera_descriptor,
};
use common::{SessionNotice, StopReason, UsbTransport, create_notice_channel};
use protocol::{
    PixelFormat, SessionError, SessionState, StreamFormat, SurfaceHandle, TransportError,
};
use std::sync::Arc;
use std::time::Duration;

fn session_with(transport: MockTransport) -> (Arc<MockTransport>, Arc<CameraSession>) {
    let transport = Arc::new(transport);
    let session = Arc::new(CameraSession::new(
        transport.clone(),
        SessionConfig::default(),
    ));
    (transport, session)
}

fn connect(transport: &MockTransport, session: &CameraSession, address: u8) -> Result<(), SessionError> {
    let block = transport
        .open_control_block(&create_mock_identity(address))
        .unwrap();
    session.connect(block)
}

mod ownership {
    use super::*;

    #[test]
    fn test_never_two_live_blocks() {
        let (transport, session) = session_with(MockTransport::new(thermal_camera_descriptor()));

        for cycle in 0..5 {
            connect(&transport, &session, 4).unwrap();
            session.start_preview(Some(SurfaceHandle(cycle))).unwrap();
            session.release();
            assert_eq!(transport.live_blocks(), 0);
        }

        assert_eq!(transport.opened_count(), 5);
        assert_eq!(transport.closed_count(), 5);
        assert!(transport.max_live_blocks() <= 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let (transport, session) = session_with(MockTransport::new(thermal_camera_descriptor()));

        session.release();
        assert_eq!(session.state(), SessionState::Idle);

        connect(&transport, &session, 4).unwrap();
        session.release();
        session.release();
        session.release();

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(transport.closed_count(), 1);
    }

    #[test]
    fn test_second_block_is_refused_and_closed() {
        let (transport, session) = session_with(MockTransport::new(thermal_camera_descriptor()));
        connect(&transport, &session, 4).unwrap();

        assert_eq!(
            connect(&transport, &session, 5),
            Err(SessionError::AlreadyActive)
        );
        // The refused block is gone, the session keeps its own
        assert_eq!(transport.live_blocks(), 1);
        assert_eq!(session.device().unwrap().device_address, 4);
        assert_eq!(session.state(), SessionState::FormatNegotiating);
    }

    #[test]
    fn test_open_failure_leaves_idle() {
        let (transport, session) = session_with(MockTransport::new(vec![0x00; 4]));

        let err = connect(&transport, &session, 4).unwrap_err();
        assert!(matches!(err, SessionError::Descriptor(_)));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(transport.closed_count(), 1);
        assert_eq!(transport.live_blocks(), 0);
    }
}

mod negotiation {
    use super::*;

    #[test]
    fn test_preferred_format_accepted() {
        let (transport, session) = session_with(MockTransport::new(thermal_camera_descriptor()));
        connect(&transport, &session, 4).unwrap();

        assert_eq!(
            session.negotiated_format(),
            Some(StreamFormat::new(640, 480, PixelFormat::Mjpeg))
        );
        assert_eq!(transport.probed_formats(), vec![1]);
    }

    #[test]
    fn test_reject_first_accept_second() {
        let (transport, session) =
            session_with(MockTransport::new(thermal_camera_descriptor()).with_rejected_format(1));
        connect(&transport, &session, 4).unwrap();

        assert_eq!(
            session.negotiated_format(),
            Some(StreamFormat::new(640, 480, PixelFormat::Yuyv))
        );
        assert_eq!(transport.probed_formats(), vec![1, 2]);
    }

    #[test]
    fn test_reject_both_is_no_supported_format() {
        let (transport, session) = session_with(
            MockTransport::new(thermal_camera_descriptor())
                .with_rejected_format(1)
                .with_rejected_format(2),
        );

        assert_eq!(
            connect(&transport, &session, 4),
            Err(SessionError::NoSupportedFormat)
        );
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(transport.closed_count(), 1);
        assert_eq!(transport.live_blocks(), 0);
        // Never a third attempt
        assert_eq!(transport.probed_formats(), vec![1, 2]);
    }

    #[test]
    fn test_unlisted_resolution_is_no_supported_format() {
        let data = CameraDescriptorBuilder::new()
            .mjpeg_frame(1920, 1080)
            .yuyv_frame(320, 240)
            .build();
        let (transport, session) = session_with(MockTransport::new(data));

        assert_eq!(
            connect(&transport, &session, 4),
            Err(SessionError::NoSupportedFormat)
        );
        assert!(transport.probed_formats().is_empty());
        assert_eq!(transport.closed_count(), 1);
    }

    #[test]
    fn test_configured_resolution() {
        let transport = Arc::new(MockTransport::new(thermal_camera_descriptor()));
        let session = CameraSession::new(
            transport.clone(),
            SessionConfig {
                width: 1280,
                height: 720,
                control_timeout: Duration::from_millis(100),
            },
        );
        connect(&transport, &session, 4).unwrap();
        assert_eq!(
            session.negotiated_format(),
            Some(StreamFormat::new(1280, 720, PixelFormat::Mjpeg))
        );
    }
}

mod preview {
    use super::*;

    #[test]
    fn test_start_preview_commits() {
        let (notices, rx) = create_notice_channel();
        let transport = Arc::new(MockTransport::new(thermal_camera_descriptor()));
        let session =
            CameraSession::new(transport.clone(), SessionConfig::default()).with_notices(notices);

        connect(&transport, &session, 4).unwrap();
        session.start_preview(Some(SurfaceHandle(3))).unwrap();

        assert_eq!(session.state(), SessionState::PreviewActive);
        assert_eq!(session.surface(), Some(SurfaceHandle(3)));
        assert_eq!(transport.commit_count(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionNotice::PreviewStarted {
                device: create_mock_identity(4),
                format: StreamFormat::default(),
            }
        );

        // Repeated start is a no-op
        session.start_preview(Some(SurfaceHandle(3))).unwrap();
        assert_eq!(transport.commit_count(), 1);

        session.release();
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionNotice::PreviewStopped {
                device: create_mock_identity(4),
                reason: StopReason::Released,
            }
        );
    }

    #[test]
    fn test_no_surface_keeps_negotiated_format() {
        let (transport, session) = session_with(MockTransport::new(plain_camera_descriptor()));
        connect(&transport, &session, 4).unwrap();

        assert_eq!(session.start_preview(None), Err(SessionError::NoSurface));
        assert_eq!(session.state(), SessionState::FormatNegotiating);
        assert!(session.negotiated_format().is_some());
        assert_eq!(transport.commit_count(), 0);

        session.start_preview(Some(SurfaceHandle(1))).unwrap();
        assert_eq!(session.state(), SessionState::PreviewActive);
    }

    #[test]
    fn test_start_preview_when_idle_is_stale() {
        let (_, session) = session_with(MockTransport::new(thermal_camera_descriptor()));
        assert_eq!(
            session.start_preview(Some(SurfaceHandle(1))),
            Err(SessionError::StaleHandle)
        );
    }

    #[test]
    fn test_start_preview_after_release_is_stale() {
        let (transport, session) = session_with(MockTransport::new(thermal_camera_descriptor()));
        connect(&transport, &session, 4).unwrap();
        let handle = session.device_handle().unwrap();
        session.release();

        assert!(!handle.is_valid());
        assert_eq!(
            session.start_preview(Some(SurfaceHandle(1))),
            Err(SessionError::StaleHandle)
        );
    }
}

mod detach {
    use super::*;

    #[test]
    fn test_detach_during_preview() {
        let (notices, rx) = create_notice_channel();
        let transport = Arc::new(MockTransport::new(thermal_camera_descriptor()));
        let session =
            CameraSession::new(transport.clone(), SessionConfig::default()).with_notices(notices);

        connect(&transport, &session, 4).unwrap();
        session.start_preview(Some(SurfaceHandle(1))).unwrap();
        let _ = rx.try_recv();

        let device = create_mock_identity(4);
        transport.detach(&device);
        assert!(session.handle_detached(&device));

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(transport.live_blocks(), 0);
        assert_eq!(
            session.start_preview(Some(SurfaceHandle(1))),
            Err(SessionError::StaleHandle)
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionNotice::PreviewStopped {
                device,
                reason: StopReason::Detached,
            }
        );
    }

    #[test]
    fn test_detach_of_other_device_is_ignored() {
        let (transport, session) = session_with(MockTransport::new(thermal_camera_descriptor()));
        connect(&transport, &session, 4).unwrap();

        assert!(!session.handle_detached(&create_mock_identity(9)));
        assert_eq!(session.state(), SessionState::FormatNegotiating);
    }

    #[test]
    fn test_device_gone_before_commit() {
        let (transport, session) = session_with(MockTransport::new(thermal_camera_descriptor()));
        connect(&transport, &session, 4).unwrap();
        transport.detach(&create_mock_identity(4));

        assert_eq!(
            session.start_preview(Some(SurfaceHandle(1))),
            Err(SessionError::StaleHandle)
        );
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(transport.closed_count(), 1);
    }
}

mod races {
    use super::*;

    #[test]
    fn test_release_during_connect() {
        let (transport, session) = session_with(
            MockTransport::new(thermal_camera_descriptor())
                .with_latency(Duration::from_millis(50)),
        );
        let block = transport
            .open_control_block(&create_mock_identity(4))
            .unwrap();

        let connecting = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || session.connect(block))
        };

        std::thread::sleep(Duration::from_millis(20));
        session.release();

        assert_eq!(connecting.join().unwrap(), Err(SessionError::StaleHandle));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(transport.closed_count(), 1);
        assert_eq!(transport.live_blocks(), 0);
    }

    #[test]
    fn test_concurrent_connects_hold_one_block() {
        let (transport, session) = session_with(
            MockTransport::new(thermal_camera_descriptor())
                .with_latency(Duration::from_millis(5)),
        );

        let handles: Vec<_> = (1..=4)
            .map(|address| {
                let block = transport
                    .open_control_block(&create_mock_identity(address))
                    .unwrap();
                let session = Arc::clone(&session);
                std::thread::spawn(move || session.connect(block))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(accepted, 1);
        assert!(
            results
                .iter()
                .filter(|r| r.is_err())
                .all(|r| matches!(r, Err(SessionError::AlreadyActive)))
        );

        assert_eq!(transport.live_blocks(), 1);
        session.release();
        assert_eq!(transport.live_blocks(), 0);
    }

    #[test]
    fn test_concurrent_start_preview_commits_once() {
        let (transport, session) = session_with(
            MockTransport::new(thermal_camera_descriptor())
                .with_latency(Duration::from_millis(30)),
        );
        connect(&transport, &session, 4).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|surface| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || session.start_preview(Some(SurfaceHandle(surface))))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(results.iter().any(|r| r.is_ok()));
        assert!(results.iter().all(|r| matches!(
            r,
            Ok(()) | Err(SessionError::InvalidState {
                state: SessionState::FormatNegotiating
            })
        )));
        assert_eq!(transport.commit_count(), 1);
        assert_eq!(session.state(), SessionState::PreviewActive);
    }

    #[test]
    fn test_failed_commit_allows_new_session() {
        let (transport, session) = session_with(
            MockTransport::new(thermal_camera_descriptor()).with_commit_failure(TransportError::Io),
        );
        connect(&transport, &session, 4).unwrap();
        assert!(session.start_preview(Some(SurfaceHandle(1))).is_err());
        assert_eq!(session.state(), SessionState::Idle);

        // The marker from the failed commit does not leak into the next session
        connect(&transport, &session, 5).unwrap();
        assert_eq!(
            session.start_preview(Some(SurfaceHandle(1))),
            Err(SessionError::Transport(TransportError::Io))
        );
    }

    #[test]
    fn test_transfer_error_is_reported() {
        let (transport, session) = session_with(
            MockTransport::new(thermal_camera_descriptor()).with_commit_failure(TransportError::Busy),
        );
        connect(&transport, &session, 4).unwrap();
        assert_eq!(
            session.start_preview(Some(SurfaceHandle(1))),
            Err(SessionError::Transport(TransportError::Busy))
        );
        assert_eq!(transport.live_blocks(), 0);
    }
}
