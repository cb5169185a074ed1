//! Property tests for the session lifecycle
//!
//! Arbitrary sequences of connect / preview / release / detach must never
//! leave two blocks alive, and a released session must hold nothing.

use camera::{CameraSession, SessionConfig};
use common::UsbTransport;
use common::test_utils::{MockTransport, create_mock_identity, thermal_camera_descriptor};
use proptest::prelude::*;
use protocol::{SessionError, SessionState, SurfaceHandle};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Connect(u8),
    Preview(Option<u64>),
    Release,
    Detach(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u8..4).prop_map(Op::Connect),
        proptest::option::of(0u64..4).prop_map(Op::Preview),
        Just(Op::Release),
        (1u8..4).prop_map(Op::Detach),
    ]
}

proptest! {
    #[test]
    fn session_never_holds_two_blocks(ops in proptest::collection::vec(op(), 1..40)) {
        let transport = Arc::new(MockTransport::new(thermal_camera_descriptor()));
        let session = CameraSession::new(transport.clone(), SessionConfig::default());

        for op in ops {
            match op {
                Op::Connect(address) => {
                    let device = create_mock_identity(address);
                    // A detached device cannot be opened again. A block
                    // offered to a busy session is live only until refused.
                    if let Ok(block) = transport.open_control_block(&device) {
                        let was_idle = session.state() == SessionState::Idle;
                        let result = session.connect(block);
                        if !was_idle {
                            prop_assert_eq!(result, Err(SessionError::AlreadyActive));
                        }
                    }
                }
                Op::Preview(surface) => {
                    let _ = session.start_preview(surface.map(SurfaceHandle));
                }
                Op::Release => session.release(),
                Op::Detach(address) => {
                    let device = create_mock_identity(address);
                    transport.detach(&device);
                    session.handle_detached(&device);
                }
            }

            prop_assert!(transport.live_blocks() <= 1);
            match session.state() {
                SessionState::Idle => {
                    prop_assert_eq!(transport.live_blocks(), 0);
                    prop_assert!(session.device_handle().is_err());
                }
                SessionState::FormatNegotiating | SessionState::PreviewActive => {
                    prop_assert_eq!(transport.live_blocks(), 1);
                    prop_assert!(session.negotiated_format().is_some());
                }
                other => prop_assert!(false, "transient state {:?} observed", other),
            }
        }

        session.release();
        prop_assert_eq!(transport.live_blocks(), 0);
        prop_assert_eq!(transport.opened_count(), transport.closed_count());
    }
}
