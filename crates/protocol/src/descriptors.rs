//! UVC configuration descriptor parsing
//!
//! Walks a raw configuration descriptor (as returned by
//! GET_DESCRIPTOR(CONFIGURATION)) and extracts the parts of the UVC topology
//! the session and prober need: the video-control interface, its extension
//! units, and the formats/frames of each video-streaming interface.
//!
//! Every `bLength` is validated against the remaining buffer before any
//! field is read, so truncated or hostile data yields a
//! [`DescriptorError`] instead of a panic.

use crate::error::DescriptorError;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Standard descriptor types
pub mod descriptor_type {
    pub const CONFIGURATION: u8 = 0x02;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const INTERFACE_ASSOCIATION: u8 = 0x0b;
    pub const CS_INTERFACE: u8 = 0x24;
}

/// Video interface subclasses
pub mod subclass {
    pub const VIDEO_CONTROL: u8 = 0x01;
    pub const VIDEO_STREAMING: u8 = 0x02;
}

/// Video-control class-specific descriptor subtypes
pub mod vc_subtype {
    pub const HEADER: u8 = 0x01;
    pub const INPUT_TERMINAL: u8 = 0x02;
    pub const OUTPUT_TERMINAL: u8 = 0x03;
    pub const SELECTOR_UNIT: u8 = 0x04;
    pub const PROCESSING_UNIT: u8 = 0x05;
    pub const EXTENSION_UNIT: u8 = 0x06;
}

/// Video-streaming class-specific descriptor subtypes
pub mod vs_subtype {
    pub const INPUT_HEADER: u8 = 0x01;
    pub const FORMAT_UNCOMPRESSED: u8 = 0x04;
    pub const FRAME_UNCOMPRESSED: u8 = 0x05;
    pub const FORMAT_MJPEG: u8 = 0x06;
    pub const FRAME_MJPEG: u8 = 0x07;
}

/// Length of the standard configuration descriptor header
pub const CONFIG_HEADER_LEN: usize = 9;

const INTERFACE_DESC_LEN: usize = 9;
const VC_HEADER_MIN_LEN: usize = 12;
const XU_MIN_LEN: usize = 24;
const VS_FORMAT_MJPEG_MIN_LEN: usize = 11;
const VS_FORMAT_UNCOMPRESSED_MIN_LEN: usize = 27;
const VS_FRAME_MIN_LEN: usize = 26;

/// A 16-byte GUID as stored in USB descriptors
///
/// The first three groups are little-endian on the wire; `Display` renders
/// the canonical `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// Build from a descriptor slice of at least 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.get(..16)?.try_into().ok()?;
        Some(Guid(arr))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            g[3], g[2], g[1], g[0], g[5], g[4], g[7], g[6], g[8], g[9], g[10], g[11], g[12], g[13],
            g[14], g[15]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self)
    }
}

impl Serialize for Guid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let hex: String = s
            .trim_matches(|c| c == '{' || c == '}')
            .chars()
            .filter(|c| *c != '-')
            .collect();
        if hex.len() != 32 || !hex.is_ascii() {
            return Err(serde::de::Error::custom(format!("invalid GUID '{}'", s)));
        }
        let mut canonical = [0u8; 16];
        for (i, byte) in canonical.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| serde::de::Error::custom(format!("invalid GUID '{}'", s)))?;
        }
        // Canonical order back to wire order
        let c = canonical;
        Ok(Guid([
            c[3], c[2], c[1], c[0], c[5], c[4], c[7], c[6], c[8], c[9], c[10], c[11], c[12], c[13],
            c[14], c[15],
        ]))
    }
}

/// YUY2 uncompressed format GUID (32595559-0000-0010-8000-00aa00389b71)
pub const YUY2_FORMAT_GUID: Guid = Guid([
    0x59, 0x55, 0x59, 0x32, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xaa, 0x00, 0x38, 0x9b, 0x71,
]);

/// Extension unit descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionUnitDescriptor {
    /// bUnitID
    pub unit_id: u8,
    /// guidExtensionCode
    pub guid: Guid,
    /// bNumControls
    pub num_controls: u8,
    /// baSourceID
    pub source_ids: Vec<u8>,
    /// bmControls
    pub controls_bitmap: Vec<u8>,
    /// iExtension
    pub string_index: u8,
}

impl ExtensionUnitDescriptor {
    /// Control selectors implemented by the unit (bit n => selector n + 1)
    pub fn supported_selectors(&self) -> Vec<u8> {
        let mut selectors = Vec::new();
        for (byte_idx, byte) in self.controls_bitmap.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    let selector = byte_idx * 8 + bit + 1;
                    if let Ok(s) = u8::try_from(selector) {
                        selectors.push(s);
                    }
                }
            }
        }
        selectors
    }
}

/// Video-streaming format kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatKind {
    Mjpeg,
    Uncompressed(Guid),
}

/// Frame (resolution) descriptor belonging to a format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDescriptor {
    pub index: u8,
    pub width: u16,
    pub height: u16,
    /// dwDefaultFrameInterval in 100 ns units
    pub default_interval: u32,
}

/// Format descriptor with its frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub index: u8,
    pub kind: FormatKind,
    pub frames: Vec<FrameDescriptor>,
}

impl FormatDescriptor {
    /// Pixel format this descriptor represents, if the session knows it
    pub fn pixel_format(&self) -> Option<crate::PixelFormat> {
        match self.kind {
            FormatKind::Mjpeg => Some(crate::PixelFormat::Mjpeg),
            FormatKind::Uncompressed(guid) if guid == YUY2_FORMAT_GUID => {
                Some(crate::PixelFormat::Yuyv)
            }
            FormatKind::Uncompressed(_) => None,
        }
    }
}

/// A video-streaming interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingInterface {
    pub interface_number: u8,
    pub formats: Vec<FormatDescriptor>,
}

/// Parsed UVC topology of a configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UvcTopology {
    /// bcdUVC from the video-control header (0 if no header was seen)
    pub uvc_version: u16,
    /// bInterfaceNumber of the video-control interface
    pub control_interface: u8,
    pub extension_units: Vec<ExtensionUnitDescriptor>,
    pub streaming_interfaces: Vec<StreamingInterface>,
}

/// Location of a negotiable (format, frame) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatMatch {
    pub interface_number: u8,
    pub format_index: u8,
    pub frame_index: u8,
    pub frame_interval: u32,
}

impl UvcTopology {
    /// Find the descriptor indices for a stream format
    pub fn find_format(&self, format: &crate::StreamFormat) -> Option<FormatMatch> {
        self.streaming_interfaces.iter().find_map(|intf| {
            intf.formats
                .iter()
                .filter(|f| f.pixel_format() == Some(format.pixel_format))
                .find_map(|f| {
                    f.frames
                        .iter()
                        .find(|fr| fr.width == format.width && fr.height == format.height)
                        .map(|fr| FormatMatch {
                            interface_number: intf.interface_number,
                            format_index: f.index,
                            frame_index: fr.index,
                            frame_interval: fr.default_interval,
                        })
                })
        })
    }

    /// Find an extension unit by GUID
    pub fn find_extension_unit(&self, guid: &Guid) -> Option<&ExtensionUnitDescriptor> {
        self.extension_units.iter().find(|xu| xu.guid == *guid)
    }
}

/// Read wTotalLength from a configuration descriptor header
pub fn config_total_length(header: &[u8]) -> Result<u16, DescriptorError> {
    if header.len() < CONFIG_HEADER_LEN {
        return Err(DescriptorError::Truncated {
            offset: 0,
            needed: CONFIG_HEADER_LEN,
            available: header.len(),
        });
    }
    if header[1] != descriptor_type::CONFIGURATION {
        return Err(DescriptorError::NotConfiguration {
            descriptor_type: header[1],
        });
    }
    if (header[0] as usize) < CONFIG_HEADER_LEN {
        return Err(DescriptorError::InvalidLength {
            offset: 0,
            length: header[0],
        });
    }
    Ok(LittleEndian::read_u16(&header[2..4]))
}

/// Which kind of interface the walker is currently inside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Other,
    VideoControl,
    /// Index into `UvcTopology::streaming_interfaces`
    VideoStreaming(usize),
}

/// Parse a full configuration descriptor into a [`UvcTopology`]
pub fn parse_configuration(data: &[u8]) -> Result<UvcTopology, DescriptorError> {
    let total = config_total_length(data)? as usize;
    if data.len() < total {
        return Err(DescriptorError::Truncated {
            offset: 0,
            needed: total,
            available: data.len(),
        });
    }
    let data = &data[..total.max(CONFIG_HEADER_LEN)];

    let mut topology = UvcTopology {
        uvc_version: 0,
        control_interface: 0,
        extension_units: Vec::new(),
        streaming_interfaces: Vec::new(),
    };
    let mut found_control = false;
    let mut context = Context::Other;
    let mut pos = 0usize;

    while pos < data.len() {
        let remaining = data.len() - pos;
        if remaining < 2 {
            return Err(DescriptorError::Truncated {
                offset: pos,
                needed: 2,
                available: remaining,
            });
        }

        let length = data[pos] as usize;
        let desc_type = data[pos + 1];
        if length < 2 {
            return Err(DescriptorError::InvalidLength {
                offset: pos,
                length: data[pos],
            });
        }
        if length > remaining {
            return Err(DescriptorError::Truncated {
                offset: pos,
                needed: length,
                available: remaining,
            });
        }

        let desc = &data[pos..pos + length];

        match desc_type {
            descriptor_type::INTERFACE => {
                require_len(desc, pos, INTERFACE_DESC_LEN)?;
                let number = desc[2];
                let class = desc[5];
                let sub = desc[6];
                context = if class != crate::filter::USB_CLASS_VIDEO {
                    Context::Other
                } else if sub == subclass::VIDEO_CONTROL {
                    if !found_control {
                        topology.control_interface = number;
                        found_control = true;
                    }
                    Context::VideoControl
                } else if sub == subclass::VIDEO_STREAMING {
                    // Alternate settings repeat the interface descriptor
                    let idx = match topology
                        .streaming_interfaces
                        .iter()
                        .position(|s| s.interface_number == number)
                    {
                        Some(idx) => idx,
                        None => {
                            topology.streaming_interfaces.push(StreamingInterface {
                                interface_number: number,
                                formats: Vec::new(),
                            });
                            topology.streaming_interfaces.len() - 1
                        }
                    };
                    Context::VideoStreaming(idx)
                } else {
                    Context::Other
                };
            }
            descriptor_type::CS_INTERFACE if length >= 3 => match context {
                Context::VideoControl => parse_vc_descriptor(desc, pos, &mut topology)?,
                Context::VideoStreaming(idx) => {
                    parse_vs_descriptor(desc, pos, &mut topology.streaming_interfaces[idx])?
                }
                Context::Other => {}
            },
            _ => {}
        }

        pos += length;
    }

    if !found_control {
        return Err(DescriptorError::NoVideoControlInterface);
    }

    debug!(
        "Parsed UVC topology: version {:#06x}, control interface {}, {} extension unit(s), {} streaming interface(s)",
        topology.uvc_version,
        topology.control_interface,
        topology.extension_units.len(),
        topology.streaming_interfaces.len()
    );

    Ok(topology)
}

fn require_len(desc: &[u8], offset: usize, needed: usize) -> Result<(), DescriptorError> {
    if desc.len() < needed {
        Err(DescriptorError::InvalidLength {
            offset,
            length: desc.len() as u8,
        })
    } else {
        Ok(())
    }
}

fn parse_vc_descriptor(
    desc: &[u8],
    offset: usize,
    topology: &mut UvcTopology,
) -> Result<(), DescriptorError> {
    match desc[2] {
        vc_subtype::HEADER => {
            require_len(desc, offset, VC_HEADER_MIN_LEN)?;
            topology.uvc_version = LittleEndian::read_u16(&desc[3..5]);
        }
        vc_subtype::EXTENSION_UNIT => {
            let xu = parse_extension_unit(desc, offset)?;
            debug!(
                "Found extension unit {} with GUID {} ({} controls)",
                xu.unit_id, xu.guid, xu.num_controls
            );
            topology.extension_units.push(xu);
        }
        _ => {}
    }
    Ok(())
}

/// Parse a VC_EXTENSION_UNIT descriptor
///
/// Layout: bLength, bDescriptorType, bDescriptorSubtype, bUnitID,
/// guidExtensionCode[16], bNumControls, bNrInPins (p), baSourceID[p],
/// bControlSize (n), bmControls[n], iExtension.
fn parse_extension_unit(desc: &[u8], offset: usize) -> Result<ExtensionUnitDescriptor, DescriptorError> {
    require_len(desc, offset, XU_MIN_LEN)?;

    let unit_id = desc[3];
    let guid = Guid::from_slice(&desc[4..20]).ok_or(DescriptorError::InvalidLength {
        offset,
        length: desc.len() as u8,
    })?;
    let num_controls = desc[20];
    let nr_in_pins = desc[21] as usize;

    let control_size_at = 22 + nr_in_pins;
    require_len(desc, offset, control_size_at + 1)?;
    let source_ids = desc[22..control_size_at].to_vec();

    let control_size = desc[control_size_at] as usize;
    let controls_at = control_size_at + 1;
    let string_at = controls_at + control_size;
    require_len(desc, offset, string_at + 1)?;

    Ok(ExtensionUnitDescriptor {
        unit_id,
        guid,
        num_controls,
        source_ids,
        controls_bitmap: desc[controls_at..string_at].to_vec(),
        string_index: desc[string_at],
    })
}

fn parse_vs_descriptor(
    desc: &[u8],
    offset: usize,
    intf: &mut StreamingInterface,
) -> Result<(), DescriptorError> {
    match desc[2] {
        vs_subtype::FORMAT_MJPEG => {
            require_len(desc, offset, VS_FORMAT_MJPEG_MIN_LEN)?;
            intf.formats.push(FormatDescriptor {
                index: desc[3],
                kind: FormatKind::Mjpeg,
                frames: Vec::new(),
            });
        }
        vs_subtype::FORMAT_UNCOMPRESSED => {
            require_len(desc, offset, VS_FORMAT_UNCOMPRESSED_MIN_LEN)?;
            let guid = Guid::from_slice(&desc[5..21]).ok_or(DescriptorError::InvalidLength {
                offset,
                length: desc.len() as u8,
            })?;
            intf.formats.push(FormatDescriptor {
                index: desc[3],
                kind: FormatKind::Uncompressed(guid),
                frames: Vec::new(),
            });
        }
        subtype @ (vs_subtype::FRAME_MJPEG | vs_subtype::FRAME_UNCOMPRESSED) => {
            require_len(desc, offset, VS_FRAME_MIN_LEN)?;
            let frame = FrameDescriptor {
                index: desc[3],
                width: LittleEndian::read_u16(&desc[5..7]),
                height: LittleEndian::read_u16(&desc[7..9]),
                default_interval: LittleEndian::read_u32(&desc[21..25]),
            };
            let wants_mjpeg = subtype == vs_subtype::FRAME_MJPEG;
            // Frames always follow the format they belong to
            match intf.formats.last_mut() {
                Some(format) if matches!(format.kind, FormatKind::Mjpeg) == wants_mjpeg => {
                    format.frames.push(frame)
                }
                _ => debug!(
                    "Ignoring frame descriptor at offset {} without a matching format",
                    offset
                ),
            }
        }
        _ => {}
    }
    Ok(())
}
