//! UVC camera operations over a control block
//!
//! Reads and parses the configuration descriptor, and negotiates a stream
//! through VS_PROBE_CONTROL / VS_COMMIT_CONTROL. No video data is moved:
//! a committed stream only proves the device would start streaming.

use common::{BlockRef, UsbTransport};
use protocol::{
    CONFIG_HEADER_LEN, ControlRequest, DescriptorError, ProbeError, SessionError, StreamControl,
    StreamFormat, TransportError, UvcRequest, UvcTopology, VS_COMMIT_CONTROL, VS_PROBE_CONTROL,
    config_total_length, control_block_len, parse_configuration,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Failure to obtain the device topology
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("Failed to read configuration descriptor: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
}

impl From<TopologyError> for SessionError {
    fn from(err: TopologyError) -> Self {
        match err {
            TopologyError::Transport(e) if e.is_stale() => SessionError::StaleHandle,
            TopologyError::Transport(e) => SessionError::OpenFailed(e),
            TopologyError::Descriptor(e) => SessionError::Descriptor(e),
        }
    }
}

impl From<TopologyError> for ProbeError {
    fn from(err: TopologyError) -> Self {
        match err {
            TopologyError::Transport(e) => ProbeError::from(e),
            TopologyError::Descriptor(e) => ProbeError::DescriptorParseError(e),
        }
    }
}

/// Read the full configuration descriptor
///
/// Reads the 9-byte header first, then exactly `wTotalLength` bytes.
pub fn read_configuration_descriptor(
    transport: &dyn UsbTransport,
    link: &BlockRef,
    timeout: Duration,
) -> Result<Vec<u8>, TopologyError> {
    let header = transport.control_transfer(
        link,
        &ControlRequest::get_config_descriptor(0, CONFIG_HEADER_LEN as u16),
        timeout,
    )?;
    let total = config_total_length(&header)?;
    debug!("Configuration descriptor is {} bytes", total);

    let data = transport.control_transfer(
        link,
        &ControlRequest::get_config_descriptor(0, total),
        timeout,
    )?;
    Ok(data)
}

/// Read and parse the device topology
pub fn read_topology(
    transport: &dyn UsbTransport,
    link: &BlockRef,
    timeout: Duration,
) -> Result<UvcTopology, TopologyError> {
    let data = read_configuration_descriptor(transport, link, timeout)?;
    Ok(parse_configuration(&data)?)
}

/// A format the device accepted through VS_PROBE_CONTROL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedStream {
    pub format: StreamFormat,
    pub interface: u8,
    /// Probe block as echoed by the device; committed verbatim
    pub control: StreamControl,
}

/// An opened camera: its link and parsed topology
#[derive(Debug)]
pub struct UvcCamera {
    link: BlockRef,
    topology: UvcTopology,
    timeout: Duration,
}

impl UvcCamera {
    /// Read the topology of the device behind `link`
    pub fn open(
        transport: &dyn UsbTransport,
        link: BlockRef,
        timeout: Duration,
    ) -> Result<Self, TopologyError> {
        let topology = read_topology(transport, &link, timeout)?;
        Ok(Self {
            link,
            topology,
            timeout,
        })
    }

    pub fn link(&self) -> &BlockRef {
        &self.link
    }

    pub fn topology(&self) -> &UvcTopology {
        &self.topology
    }

    fn block_len(&self) -> usize {
        control_block_len(self.topology.uvc_version)
    }

    /// Offer one format to the device
    ///
    /// `Ok(None)` means the device rejected it: the format is not in its
    /// descriptors, VS_PROBE_CONTROL stalled, or GET_CUR came back with a
    /// different format or frame. Other transport failures are errors.
    pub fn try_format(
        &self,
        transport: &dyn UsbTransport,
        format: &StreamFormat,
    ) -> Result<Option<NegotiatedStream>, TransportError> {
        let Some(found) = self.topology.find_format(format) else {
            debug!("{} not offered by the device", format);
            return Ok(None);
        };

        let requested =
            StreamControl::request(found.format_index, found.frame_index, found.frame_interval);
        let len = self.block_len();

        let set = ControlRequest::interface_set_cur(
            found.interface_number,
            VS_PROBE_CONTROL,
            requested.encode(len),
        );
        match transport.control_transfer(&self.link, &set, self.timeout) {
            Ok(_) => {}
            Err(TransportError::Pipe) => {
                debug!("Device stalled probe for {}", format);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let get = ControlRequest::interface_get(
            UvcRequest::GetCur,
            found.interface_number,
            VS_PROBE_CONTROL,
            len as u16,
        );
        let echoed = match transport.control_transfer(&self.link, &get, self.timeout) {
            Ok(data) => data,
            Err(TransportError::Pipe) => {
                debug!("Device stalled probe read-back for {}", format);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match StreamControl::decode(&echoed) {
            Some(control) if control.accepts(&requested) => Ok(Some(NegotiatedStream {
                format: *format,
                interface: found.interface_number,
                control,
            })),
            Some(control) => {
                debug!(
                    "Device answered probe for {} with format {} frame {}",
                    format, control.format_index, control.frame_index
                );
                Ok(None)
            }
            None => {
                debug!("Probe read-back for {} was {} bytes", format, echoed.len());
                Ok(None)
            }
        }
    }

    /// Two-tier negotiation: MJPEG, then YUYV, at the given resolution
    ///
    /// Never tries a third format. `Ok(None)` when both were rejected.
    pub fn negotiate(
        &self,
        transport: &dyn UsbTransport,
        width: u16,
        height: u16,
    ) -> Result<Option<NegotiatedStream>, TransportError> {
        for (tier, format) in StreamFormat::negotiation_order(width, height)
            .iter()
            .enumerate()
        {
            if let Some(stream) = self.try_format(transport, format)? {
                info!("Negotiated {} (tier {})", stream.format, tier + 1);
                return Ok(Some(stream));
            }
            info!("Device rejected {}", format);
        }
        Ok(None)
    }

    /// Commit a negotiated stream with VS_COMMIT_CONTROL
    pub fn commit(
        &self,
        transport: &dyn UsbTransport,
        stream: &NegotiatedStream,
    ) -> Result<(), TransportError> {
        let set = ControlRequest::interface_set_cur(
            stream.interface,
            VS_COMMIT_CONTROL,
            stream.control.encode(self.block_len()),
        );
        transport.control_transfer(&self.link, &set, self.timeout)?;
        debug!("Committed {} on interface {}", stream.format, stream.interface);
        Ok(())
    }
}
