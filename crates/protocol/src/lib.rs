//! Protocol library for uvc-thermal-probe
//!
//! This crate holds the I/O-free half of the system: device identities and
//! filters, the UVC configuration descriptor parser, control request
//! encoding, the streaming probe/commit block codec, thermal reading
//! decoding, and the error taxonomy every other crate reports in.
//!
//! # Example
//!
//! ```
//! use protocol::{ControlRequest, UvcRequest, decode_reading};
//!
//! // GET_CUR on selector 1 of extension unit 4 behind interface 0
//! let req = ControlRequest::unit_get(UvcRequest::GetCur, 4, 0, 1, 2);
//! assert_eq!(req.index, 0x0400);
//!
//! let reading = decode_reading(&[0xfd, 0x00]).unwrap();
//! assert_eq!(reading.deci_celsius, 253);
//! ```

pub mod descriptors;
pub mod error;
pub mod filter;
pub mod requests;
pub mod streaming;
pub mod thermal;
pub mod types;

pub use descriptors::{
    CONFIG_HEADER_LEN, ExtensionUnitDescriptor, FormatDescriptor, FormatKind, FormatMatch,
    FrameDescriptor, Guid, StreamingInterface, UvcTopology, YUY2_FORMAT_GUID, config_total_length,
    parse_configuration,
};
pub use error::{DescriptorError, PermissionError, ProbeError, SessionError, TransportError};
pub use filter::{DeviceFilter, FilterParseError, USB_CLASS_VIDEO};
pub use requests::{ControlRequest, UvcRequest};
pub use streaming::{StreamControl, VS_COMMIT_CONTROL, VS_PROBE_CONTROL, control_block_len};
pub use thermal::{
    DEFAULT_THERMAL_SELECTOR, ReadingDefect, SelectorOutcome, SelectorResult, THERMAL_READING_LEN,
    THERMAL_XU_GUID, ThermalReading, ThermalReport, ThermalScan, decode_reading,
};
pub use types::{
    DEFAULT_PREVIEW_HEIGHT, DEFAULT_PREVIEW_WIDTH, DeviceIdentity, PermissionState, PixelFormat,
    SessionState, StreamFormat, SurfaceHandle,
};

/// Result of a thermal probe: a report or a typed failure
pub type ProbeResult = std::result::Result<ThermalReport, ProbeError>;
