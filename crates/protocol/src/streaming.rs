//! Video-streaming probe/commit control block
//!
//! UVC negotiates stream parameters by writing a probe control block
//! (VS_PROBE_CONTROL SET_CUR), reading back what the device accepted
//! (GET_CUR), and finally committing it (VS_COMMIT_CONTROL SET_CUR).
//! The block is 26 bytes for UVC 1.0, 34 for 1.1 and 48 for 1.5.

use byteorder::{ByteOrder, LittleEndian};

/// VS_PROBE_CONTROL selector
pub const VS_PROBE_CONTROL: u8 = 0x01;
/// VS_COMMIT_CONTROL selector
pub const VS_COMMIT_CONTROL: u8 = 0x02;

/// bmHint bit: keep dwFrameInterval fixed
const HINT_FRAME_INTERVAL: u16 = 0x0001;

/// Size of the probe/commit block for a given bcdUVC
pub fn control_block_len(uvc_version: u16) -> usize {
    match uvc_version {
        v if v >= 0x0150 => 48,
        v if v >= 0x0110 => 34,
        _ => 26,
    }
}

/// The fields of a probe/commit block the session cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamControl {
    pub hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    pub frame_interval: u32,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
}

impl StreamControl {
    /// Probe request for a (format, frame) pair at a fixed interval
    pub fn request(format_index: u8, frame_index: u8, frame_interval: u32) -> Self {
        Self {
            hint: HINT_FRAME_INTERVAL,
            format_index,
            frame_index,
            frame_interval,
            ..Default::default()
        }
    }

    /// Encode into a zero-padded block of `len` bytes (at least 26)
    pub fn encode(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len.max(26)];
        LittleEndian::write_u16(&mut buf[0..2], self.hint);
        buf[2] = self.format_index;
        buf[3] = self.frame_index;
        LittleEndian::write_u32(&mut buf[4..8], self.frame_interval);
        LittleEndian::write_u32(&mut buf[18..22], self.max_video_frame_size);
        LittleEndian::write_u32(&mut buf[22..26], self.max_payload_transfer_size);
        buf
    }

    /// Decode a block returned by GET_CUR; `None` if shorter than 26 bytes
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 26 {
            return None;
        }
        Some(Self {
            hint: LittleEndian::read_u16(&buf[0..2]),
            format_index: buf[2],
            frame_index: buf[3],
            frame_interval: LittleEndian::read_u32(&buf[4..8]),
            max_video_frame_size: LittleEndian::read_u32(&buf[18..22]),
            max_payload_transfer_size: LittleEndian::read_u32(&buf[22..26]),
        })
    }

    /// Whether the device kept the requested format and frame
    pub fn accepts(&self, requested: &StreamControl) -> bool {
        self.format_index == requested.format_index && self.frame_index == requested.frame_index
    }
}
