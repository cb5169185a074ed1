//! Extension unit prober tests
//!
//! Exercises quick probes and full scans against scripted extension-unit
//! replies, and checks that released blocks are never touched.

use camera::ExtensionUnitProber;
use common::test_utils::{
    CameraDescriptorBuilder, MockTransport, VENDOR_XU_GUID, XuReply, create_mock_identity,
    plain_camera_descriptor, thermal_camera_descriptor,
};
use common::{ControlBlock, UsbTransport};
use protocol::{ProbeError, SelectorOutcome, THERMAL_XU_GUID, TransportError};
use std::sync::Arc;
use std::time::Duration;

fn setup(transport: MockTransport) -> (Arc<MockTransport>, ControlBlock, ExtensionUnitProber) {
    let transport = Arc::new(transport);
    let block = transport
        .open_control_block(&create_mock_identity(2))
        .unwrap();
    let prober = ExtensionUnitProber::new(transport.clone(), Duration::from_millis(200));
    (transport, block, prober)
}

mod quick_probe {
    use super::*;

    #[test]
    fn test_reads_temperature() {
        let (transport, block, prober) = setup(
            MockTransport::new(thermal_camera_descriptor())
                .with_xu_reply(4, 1, XuReply::Data(vec![0x6d, 0x01])),
        );

        let report = prober.quick_thermal_probe(&block.link()).unwrap();
        assert_eq!(report.unit_id, 4);
        assert_eq!(report.selector, 1);
        assert_eq!(report.guid, THERMAL_XU_GUID);
        assert_eq!(report.reading.deci_celsius, 365);
        assert!((report.celsius - 36.5).abs() < 0.001);
        assert_eq!(transport.xu_transfer_count(), 1);
    }

    #[test]
    fn test_no_thermal_unit_issues_no_xu_transfer() {
        let (transport, block, prober) = setup(MockTransport::new(plain_camera_descriptor()));

        assert_eq!(
            prober.quick_thermal_probe(&block.link()),
            Err(ProbeError::NoExtensionUnit)
        );
        assert_eq!(transport.xu_transfer_count(), 0);
        assert!(
            transport
                .transfers()
                .iter()
                .all(|request| request.entity_id() == 0)
        );
    }

    #[test]
    fn test_timeout() {
        let (_, block, prober) = setup(
            MockTransport::new(thermal_camera_descriptor()).with_xu_reply(4, 1, XuReply::Timeout),
        );
        let err = prober.quick_thermal_probe(&block.link()).unwrap_err();
        assert_eq!(err, ProbeError::Timeout);
        assert!(err.is_device_fault());
    }

    #[test]
    fn test_truncated_reply_is_malformed() {
        let (_, block, prober) = setup(
            MockTransport::new(thermal_camera_descriptor())
                .with_xu_reply(4, 1, XuReply::Data(vec![0x6d])),
        );
        assert!(matches!(
            prober.quick_thermal_probe(&block.link()),
            Err(ProbeError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_empty_reply_is_malformed() {
        let (_, block, prober) = setup(
            MockTransport::new(thermal_camera_descriptor()).with_xu_reply(4, 1, XuReply::Data(vec![])),
        );
        assert!(matches!(
            prober.quick_thermal_probe(&block.link()),
            Err(ProbeError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_transfer_failure() {
        let (_, block, prober) = setup(
            MockTransport::new(thermal_camera_descriptor())
                .with_xu_reply(4, 1, XuReply::Error(TransportError::Io)),
        );
        assert_eq!(
            prober.quick_thermal_probe(&block.link()),
            Err(ProbeError::TransferFailed(TransportError::Io))
        );
    }

    #[test]
    fn test_bad_descriptor() {
        let (_, block, prober) = setup(MockTransport::new(vec![0x09, 0x02, 0xff, 0x00]));
        assert!(matches!(
            prober.quick_thermal_probe(&block.link()),
            Err(ProbeError::DescriptorParseError(_))
        ));
    }
}

mod stale {
    use super::*;

    #[test]
    fn test_released_block_is_stale() {
        let (transport, block, prober) = setup(
            MockTransport::new(thermal_camera_descriptor())
                .with_xu_reply(4, 1, XuReply::Data(vec![0x6d, 0x01])),
        );
        let link = block.link();
        transport.close_control_block(block);
        let before = transport.transfers().len();

        assert_eq!(prober.quick_thermal_probe(&link), Err(ProbeError::StaleHandle));
        assert_eq!(
            prober.enumerate_extension_units(&link),
            Err(ProbeError::StaleHandle)
        );
        assert_eq!(prober.scan_thermal_unit(&link), Err(ProbeError::StaleHandle));
        assert_eq!(transport.transfers().len(), before);
    }

    #[test]
    fn test_detached_device_is_stale() {
        let (transport, block, prober) = setup(MockTransport::new(thermal_camera_descriptor()));
        transport.detach(&create_mock_identity(2));
        assert_eq!(
            prober.quick_thermal_probe(&block.link()),
            Err(ProbeError::StaleHandle)
        );
    }

    #[test]
    fn test_release_during_transfer_wins() {
        let (transport, block, prober) = setup(
            MockTransport::new(thermal_camera_descriptor())
                .with_xu_reply(4, 1, XuReply::Data(vec![0x6d, 0x01]))
                .with_latency(Duration::from_millis(40)),
        );
        let link = block.link();

        let probing = std::thread::spawn(move || prober.quick_thermal_probe(&link));
        std::thread::sleep(Duration::from_millis(10));
        transport.close_control_block(block);

        assert_eq!(probing.join().unwrap(), Err(ProbeError::StaleHandle));
    }
}

mod enumerate {
    use super::*;

    #[test]
    fn test_lists_all_units() {
        let (transport, block, prober) = setup(MockTransport::new(thermal_camera_descriptor()));
        let units = prober.enumerate_extension_units(&block.link()).unwrap();

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].unit_id, 3);
        assert_eq!(units[0].guid, VENDOR_XU_GUID);
        assert_eq!(units[1].unit_id, 4);
        assert_eq!(units[1].guid, THERMAL_XU_GUID);
        assert_eq!(units[1].supported_selectors(), vec![1, 2]);
        assert_eq!(transport.xu_transfer_count(), 0);
    }

    #[test]
    fn test_units_serialize() {
        let (_, block, prober) = setup(MockTransport::new(thermal_camera_descriptor()));
        let units = prober.enumerate_extension_units(&block.link()).unwrap();
        let json = serde_json::to_value(&units).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert_eq!(json[1]["unit_id"], 4);
    }
}

mod scan {
    use super::*;

    #[test]
    fn test_scan_advertised_selectors() {
        let (transport, block, prober) = setup(
            MockTransport::new(thermal_camera_descriptor())
                .with_xu_reply(4, 1, XuReply::Data(vec![0xfd, 0x00]))
                .with_xu_reply(4, 2, XuReply::Timeout),
        );

        let scan = prober.scan_thermal_unit(&block.link()).unwrap();
        assert_eq!(scan.unit_id, 4);
        assert_eq!(scan.total_reads, 1);
        assert_eq!(scan.selectors.len(), 2);
        assert!(matches!(
            scan.selectors[0].outcome,
            SelectorOutcome::Reading { .. }
        ));
        assert_eq!(scan.selectors[1].outcome, SelectorOutcome::Timeout);
        assert_eq!(transport.xu_transfer_count(), 2);
    }

    #[test]
    fn test_scan_empty_bitmap_sweeps_fallback_range() {
        let data = CameraDescriptorBuilder::new()
            .extension_unit(4, THERMAL_XU_GUID, &[])
            .mjpeg_frame(640, 480)
            .build();
        let (transport, block, prober) = setup(
            MockTransport::new(data)
                .with_xu_reply(4, 3, XuReply::Data(vec![0xfd, 0x00]))
                .with_xu_reply(4, 5, XuReply::Data(vec![0xff, 0x7f])),
        );

        let scan = prober.scan_thermal_unit(&block.link()).unwrap();
        assert_eq!(scan.selectors.len(), 16);
        assert_eq!(scan.total_reads, 1);
        assert!(matches!(
            scan.selectors[4].outcome,
            SelectorOutcome::Malformed { .. }
        ));
        assert!(matches!(
            scan.selectors[0].outcome,
            SelectorOutcome::Failed { .. }
        ));
        assert_eq!(transport.xu_transfer_count(), 16);
    }

    #[test]
    fn test_scan_without_thermal_unit() {
        let (transport, block, prober) = setup(MockTransport::new(plain_camera_descriptor()));
        assert_eq!(
            prober.scan_thermal_unit(&block.link()),
            Err(ProbeError::NoExtensionUnit)
        );
        assert_eq!(transport.xu_transfer_count(), 0);
    }

    #[test]
    fn test_scan_serializes_with_status_tags() {
        let (_, block, prober) = setup(
            MockTransport::new(thermal_camera_descriptor())
                .with_xu_reply(4, 1, XuReply::Data(vec![0xfd, 0x00])),
        );
        let scan = prober.scan_thermal_unit(&block.link()).unwrap();
        let json = serde_json::to_value(&scan).unwrap();

        assert_eq!(json["selectors"][0]["selector"], 1);
        assert_eq!(json["selectors"][0]["status"], "reading");
        assert_eq!(json["selectors"][1]["status"], "failed");
        assert_eq!(json["total_reads"], 1);
    }
}
