//! Test utilities for uvc-thermal-probe
//!
//! Provides a scriptable [`MockTransport`], UVC descriptor builders and
//! helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::UsbTransport;
//! use common::test_utils::{MockTransport, create_mock_identity, thermal_camera_descriptor};
//!
//! let transport = MockTransport::new(thermal_camera_descriptor());
//! let block = transport.open_control_block(&create_mock_identity(4)).unwrap();
//! assert_eq!(transport.live_blocks(), 1);
//! transport.close_control_block(block);
//! assert_eq!(transport.closed_count(), 1);
//! ```

use crate::transport::{BlockRef, ControlBlock, UsbTransport};
use protocol::descriptors::{descriptor_type, subclass, vc_subtype, vs_subtype};
use protocol::requests::{GET_DESCRIPTOR, REQUEST_TYPE_CLASS_IN, REQUEST_TYPE_CLASS_OUT};
use protocol::{
    ControlRequest, DeviceIdentity, Guid, THERMAL_XU_GUID, TransportError, UvcRequest,
    VS_COMMIT_CONTROL, VS_PROBE_CONTROL, YUY2_FORMAT_GUID,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor XU GUID used alongside the thermal unit in mock cameras
pub const VENDOR_XU_GUID: Guid = Guid([
    0x28, 0x8f, 0x57, 0xa9, 0x07, 0xc0, 0x8b, 0x4c, 0x88, 0x27, 0x53, 0x11, 0x50, 0x1e, 0x56, 0x42,
]);

/// Create a mock camera identity on bus 1 at `address`
///
/// # Example
/// ```
/// use common::test_utils::create_mock_identity;
///
/// let device = create_mock_identity(4);
/// assert_eq!(device.key(), (1, 4));
/// ```
pub fn create_mock_identity(address: u8) -> DeviceIdentity {
    create_mock_identity_with_ids(address, 0x0bda, 0x5830)
}

/// Create a mock identity with explicit vendor/product IDs
pub fn create_mock_identity_with_ids(address: u8, vendor_id: u16, product_id: u16) -> DeviceIdentity {
    DeviceIdentity {
        vendor_id,
        product_id,
        bus_number: 1,
        device_address: address,
        name: format!("Test Camera {}", address),
    }
}

/// Scripted reply for an extension-unit GET request
#[derive(Debug, Clone)]
pub enum XuReply {
    /// Return these bytes (truncated to wLength)
    Data(Vec<u8>),
    /// Fail with this transport error
    Error(TransportError),
    /// Fail with `TransportError::Timeout`
    Timeout,
}

#[derive(Default)]
struct MockState {
    descriptor: Vec<u8>,
    rejected_formats: HashSet<u8>,
    substituted_frames: HashMap<u8, u8>,
    xu_replies: HashMap<(u8, u8), XuReply>,
    open_failure: Option<TransportError>,
    commit_failure: Option<TransportError>,
    latency: Option<Duration>,
    detached: HashSet<(u8, u8)>,
    open_blocks: HashSet<u64>,
    last_probe: Option<Vec<u8>>,
    next_id: u64,
    opened: usize,
    closed: usize,
    max_live: usize,
    probed_formats: Vec<u8>,
    commits: usize,
    xu_transfers: usize,
    transfers: Vec<ControlRequest>,
}

/// In-memory [`UsbTransport`] that plays a scripted UVC camera
///
/// Configuration descriptor reads return the given bytes, VS_PROBE_CONTROL
/// SET_CUR is accepted unless the format index was rejected, GET_CUR echoes
/// the last probe, and extension-unit GETs return scripted [`XuReply`]s
/// (`Pipe` when nothing is scripted). Open/close counters let tests assert
/// that control blocks never leak.
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Create a transport whose devices report `descriptor`
    pub fn new(descriptor: Vec<u8>) -> Self {
        Self {
            state: Mutex::new(MockState {
                descriptor,
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the counters from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stall VS_PROBE_CONTROL SET_CUR for this format index
    pub fn with_rejected_format(self, format_index: u8) -> Self {
        self.state().rejected_formats.insert(format_index);
        self
    }

    /// Accept probes for `format_index` but echo `frame_index` back in GET_CUR
    pub fn with_substituted_frame(self, format_index: u8, frame_index: u8) -> Self {
        self.state()
            .substituted_frames
            .insert(format_index, frame_index);
        self
    }

    /// Script the reply for GET requests on (unit, selector)
    pub fn with_xu_reply(self, unit_id: u8, selector: u8, reply: XuReply) -> Self {
        self.state().xu_replies.insert((unit_id, selector), reply);
        self
    }

    /// Make every open fail
    pub fn with_open_failure(self, error: TransportError) -> Self {
        self.state().open_failure = Some(error);
        self
    }

    /// Make VS_COMMIT_CONTROL SET_CUR fail
    pub fn with_commit_failure(self, error: TransportError) -> Self {
        self.state().commit_failure = Some(error);
        self
    }

    /// Delay every control transfer
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = Some(latency);
        self
    }

    /// Simulate unplugging: further opens and transfers report `NoDevice`
    pub fn detach(&self, device: &DeviceIdentity) {
        self.state().detached.insert(device.key());
    }

    /// Number of successful opens
    pub fn opened_count(&self) -> usize {
        self.state().opened
    }

    /// Number of blocks closed (each block counts once)
    pub fn closed_count(&self) -> usize {
        self.state().closed
    }

    /// Blocks currently open
    pub fn live_blocks(&self) -> usize {
        self.state().open_blocks.len()
    }

    /// Highest number of blocks that were open at the same time
    pub fn max_live_blocks(&self) -> usize {
        self.state().max_live
    }

    /// Format indices offered through VS_PROBE_CONTROL SET_CUR, in order
    pub fn probed_formats(&self) -> Vec<u8> {
        self.state().probed_formats.clone()
    }

    /// Successful VS_COMMIT_CONTROL SET_CUR requests
    pub fn commit_count(&self) -> usize {
        self.state().commits
    }

    /// Transfers addressed to a unit (extension-unit traffic)
    pub fn xu_transfer_count(&self) -> usize {
        self.state().xu_transfers
    }

    /// Every transfer issued on a live block, in order
    pub fn transfers(&self) -> Vec<ControlRequest> {
        self.state().transfers.clone()
    }

    fn handle_transfer(
        state: &mut MockState,
        request: &ControlRequest,
    ) -> Result<Vec<u8>, TransportError> {
        let wanted = request.length as usize;

        if request.request == GET_DESCRIPTOR && request.is_in() {
            let len = wanted.min(state.descriptor.len());
            return Ok(state.descriptor[..len].to_vec());
        }

        if request.entity_id() != 0 {
            state.xu_transfers += 1;
            let key = (request.entity_id(), request.selector());
            return match state.xu_replies.get(&key) {
                Some(XuReply::Data(bytes)) => Ok(bytes[..bytes.len().min(wanted)].to_vec()),
                Some(XuReply::Error(e)) => Err(e.clone()),
                Some(XuReply::Timeout) => Err(TransportError::Timeout),
                None => Err(TransportError::Pipe),
            };
        }

        match (request.request_type, request.selector()) {
            (REQUEST_TYPE_CLASS_OUT, VS_PROBE_CONTROL) => {
                let format_index = request.data.get(2).copied().unwrap_or(0);
                state.probed_formats.push(format_index);
                if state.rejected_formats.contains(&format_index) {
                    return Err(TransportError::Pipe);
                }
                let mut echo = request.data.clone();
                if let Some(&frame) = state.substituted_frames.get(&format_index)
                    && echo.len() > 3
                {
                    echo[3] = frame;
                }
                state.last_probe = Some(echo);
                Ok(Vec::new())
            }
            (REQUEST_TYPE_CLASS_OUT, VS_COMMIT_CONTROL) => {
                if let Some(e) = &state.commit_failure {
                    return Err(e.clone());
                }
                state.commits += 1;
                Ok(Vec::new())
            }
            (REQUEST_TYPE_CLASS_IN, VS_PROBE_CONTROL)
                if request.request == UvcRequest::GetCur.code() =>
            {
                match &state.last_probe {
                    Some(block) => Ok(block[..block.len().min(wanted)].to_vec()),
                    None => Err(TransportError::Pipe),
                }
            }
            _ => Err(TransportError::Pipe),
        }
    }
}

impl UsbTransport for MockTransport {
    fn open_control_block(&self, device: &DeviceIdentity) -> Result<ControlBlock, TransportError> {
        let mut state = self.state();
        if let Some(e) = &state.open_failure {
            return Err(e.clone());
        }
        if state.detached.contains(&device.key()) {
            return Err(TransportError::NoDevice);
        }

        let id = state.next_id;
        state.next_id += 1;
        state.opened += 1;
        state.open_blocks.insert(id);
        state.max_live = state.max_live.max(state.open_blocks.len());

        Ok(ControlBlock::new(id, device.clone()))
    }

    fn control_transfer(
        &self,
        block: &BlockRef,
        request: &ControlRequest,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let latency = {
            let mut state = self.state();
            block.ensure_valid()?;
            if !state.open_blocks.contains(&block.id()) {
                return Err(TransportError::Stale);
            }
            if state.detached.contains(&block.device().key()) {
                return Err(TransportError::NoDevice);
            }
            state.transfers.push(request.clone());
            state.latency
        };

        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }

        let mut state = self.state();
        if !state.open_blocks.contains(&block.id()) {
            return Err(TransportError::Stale);
        }
        Self::handle_transfer(&mut state, request)
    }

    fn close_control_block(&self, block: ControlBlock) {
        block.invalidate();
        let mut state = self.state();
        if state.open_blocks.remove(&block.id()) {
            state.closed += 1;
        }
    }
}

/// Builder for UVC configuration descriptors
///
/// Produces a single-configuration camera with one video-control interface
/// (interface 0) and one video-streaming interface (interface 1).
#[derive(Debug, Clone)]
pub struct CameraDescriptorBuilder {
    uvc_version: u16,
    extension_units: Vec<(u8, Guid, Vec<u8>)>,
    mjpeg_frames: Vec<(u16, u16)>,
    yuyv_frames: Vec<(u16, u16)>,
}

impl Default for CameraDescriptorBuilder {
    fn default() -> Self {
        Self {
            uvc_version: 0x0100,
            extension_units: Vec::new(),
            mjpeg_frames: Vec::new(),
            yuyv_frames: Vec::new(),
        }
    }
}

impl CameraDescriptorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uvc_version(mut self, version: u16) -> Self {
        self.uvc_version = version;
        self
    }

    /// Add an extension unit; `bitmap` is bmControls
    pub fn extension_unit(mut self, unit_id: u8, guid: Guid, bitmap: &[u8]) -> Self {
        self.extension_units.push((unit_id, guid, bitmap.to_vec()));
        self
    }

    pub fn mjpeg_frame(mut self, width: u16, height: u16) -> Self {
        self.mjpeg_frames.push((width, height));
        self
    }

    pub fn yuyv_frame(mut self, width: u16, height: u16) -> Self {
        self.yuyv_frames.push((width, height));
        self
    }

    /// Serialize with a correct wTotalLength
    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![
            9,
            descriptor_type::CONFIGURATION,
            0,
            0, // wTotalLength, patched below
            2,
            1,
            0,
            0x80,
            0xfa,
        ];

        // Video control
        out.extend_from_slice(&interface(0, subclass::VIDEO_CONTROL));
        let version = self.uvc_version.to_le_bytes();
        out.extend_from_slice(&[
            13,
            descriptor_type::CS_INTERFACE,
            vc_subtype::HEADER,
            version[0],
            version[1],
            0,
            0,
            0x00,
            0x6c,
            0xdc,
            0x02,
            1,
            1,
        ]);
        out.extend_from_slice(&[
            18,
            descriptor_type::CS_INTERFACE,
            vc_subtype::INPUT_TERMINAL,
            1,
            0x01,
            0x02,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
            3,
            0,
            0,
        ]);
        let mut source = 1;
        for (unit_id, guid, bitmap) in &self.extension_units {
            out.extend_from_slice(&extension_unit(*unit_id, guid, bitmap, source));
            source = *unit_id;
        }
        out.extend_from_slice(&[
            9,
            descriptor_type::CS_INTERFACE,
            vc_subtype::OUTPUT_TERMINAL,
            0x20,
            0x01,
            0x01,
            0,
            source,
            0,
        ]);

        // Video streaming
        out.extend_from_slice(&interface(1, subclass::VIDEO_STREAMING));
        let num_formats =
            (!self.mjpeg_frames.is_empty()) as u8 + (!self.yuyv_frames.is_empty()) as u8;
        // bControlSize 1, one bmaControls byte per format
        out.extend_from_slice(&[
            13 + num_formats,
            descriptor_type::CS_INTERFACE,
            vs_subtype::INPUT_HEADER,
            num_formats,
            0,
            0,
            0x81,
            0,
            0x20,
            0,
            0,
            0,
            1,
        ]);
        out.extend(std::iter::repeat_n(0u8, num_formats as usize));

        let mut format_index = 0u8;
        if !self.mjpeg_frames.is_empty() {
            format_index += 1;
            out.extend_from_slice(&[
                11,
                descriptor_type::CS_INTERFACE,
                vs_subtype::FORMAT_MJPEG,
                format_index,
                self.mjpeg_frames.len() as u8,
                1,
                1,
                0,
                0,
                0,
                0,
            ]);
            for (i, (w, h)) in self.mjpeg_frames.iter().enumerate() {
                out.extend_from_slice(&frame(vs_subtype::FRAME_MJPEG, i as u8 + 1, *w, *h, 333_333));
            }
        }
        if !self.yuyv_frames.is_empty() {
            format_index += 1;
            out.extend_from_slice(&[
                27,
                descriptor_type::CS_INTERFACE,
                vs_subtype::FORMAT_UNCOMPRESSED,
                format_index,
                self.yuyv_frames.len() as u8,
            ]);
            out.extend_from_slice(&YUY2_FORMAT_GUID.0);
            out.extend_from_slice(&[16, 1, 0, 0, 0, 0]);
            for (i, (w, h)) in self.yuyv_frames.iter().enumerate() {
                out.extend_from_slice(&frame(
                    vs_subtype::FRAME_UNCOMPRESSED,
                    i as u8 + 1,
                    *w,
                    *h,
                    666_666,
                ));
            }
        }

        let total = out.len() as u16;
        out[2..4].copy_from_slice(&total.to_le_bytes());
        out
    }
}

fn interface(number: u8, sub: u8) -> [u8; 9] {
    [
        9,
        descriptor_type::INTERFACE,
        number,
        0,
        0,
        protocol::USB_CLASS_VIDEO,
        sub,
        0,
        0,
    ]
}

fn extension_unit(unit_id: u8, guid: &Guid, bitmap: &[u8], source: u8) -> Vec<u8> {
    let mut d = vec![0, descriptor_type::CS_INTERFACE, vc_subtype::EXTENSION_UNIT, unit_id];
    d.extend_from_slice(&guid.0);
    d.push(bitmap.iter().map(|b| b.count_ones() as u8).sum());
    d.push(1);
    d.push(source);
    d.push(bitmap.len() as u8);
    d.extend_from_slice(bitmap);
    d.push(0);
    d[0] = d.len() as u8;
    d
}

fn frame(subtype: u8, index: u8, width: u16, height: u16, interval: u32) -> Vec<u8> {
    let mut d = vec![30, descriptor_type::CS_INTERFACE, subtype, index, 0];
    d.extend_from_slice(&width.to_le_bytes());
    d.extend_from_slice(&height.to_le_bytes());
    d.extend_from_slice(&[0u8; 12]);
    d.extend_from_slice(&interval.to_le_bytes());
    d.push(1);
    d.extend_from_slice(&interval.to_le_bytes());
    d
}

/// Camera with a vendor XU (unit 3), the thermal XU (unit 4, selectors 1-2)
/// and 640x480 in both MJPEG (format 1) and YUYV (format 2)
pub fn thermal_camera_descriptor() -> Vec<u8> {
    CameraDescriptorBuilder::new()
        .uvc_version(0x0110)
        .extension_unit(3, VENDOR_XU_GUID, &[0xff, 0x01])
        .extension_unit(4, THERMAL_XU_GUID, &[0x03])
        .mjpeg_frame(1280, 720)
        .mjpeg_frame(640, 480)
        .yuyv_frame(640, 480)
        .build()
}

/// Ordinary webcam: vendor XU only, 640x480 MJPEG and YUYV
pub fn plain_camera_descriptor() -> Vec<u8> {
    CameraDescriptorBuilder::new()
        .extension_unit(3, VENDOR_XU_GUID, &[0xff, 0x01])
        .mjpeg_frame(640, 480)
        .yuyv_frame(640, 480)
        .build()
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
