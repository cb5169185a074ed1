//! USB control request encoding
//!
//! Builders for the handful of setup packets the session and prober issue:
//! the standard GET_DESCRIPTOR(CONFIGURATION) read and UVC class requests
//! addressed to units (extension units) or interfaces (streaming controls).

use serde::{Deserialize, Serialize};

/// bmRequestType: device-to-host, standard, device
pub const REQUEST_TYPE_STANDARD_IN: u8 = 0x80;
/// bmRequestType: device-to-host, class, interface
pub const REQUEST_TYPE_CLASS_IN: u8 = 0xa1;
/// bmRequestType: host-to-device, class, interface
pub const REQUEST_TYPE_CLASS_OUT: u8 = 0x21;

/// Standard GET_DESCRIPTOR request
pub const GET_DESCRIPTOR: u8 = 0x06;
/// Configuration descriptor type for wValue high byte
pub const DESCRIPTOR_CONFIGURATION: u8 = 0x02;

/// UVC class request codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum UvcRequest {
    SetCur = 0x01,
    GetCur = 0x81,
    GetMin = 0x82,
    GetMax = 0x83,
    GetRes = 0x84,
    GetLen = 0x85,
    GetInfo = 0x86,
    GetDef = 0x87,
}

impl UvcRequest {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_get(self) -> bool {
        self.code() & 0x80 != 0
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => UvcRequest::SetCur,
            0x81 => UvcRequest::GetCur,
            0x82 => UvcRequest::GetMin,
            0x83 => UvcRequest::GetMax,
            0x84 => UvcRequest::GetRes,
            0x85 => UvcRequest::GetLen,
            0x86 => UvcRequest::GetInfo,
            0x87 => UvcRequest::GetDef,
            _ => return None,
        })
    }
}

/// A control transfer setup packet plus its OUT payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlRequest {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength for IN requests
    pub length: u16,
    /// Payload for OUT requests (empty for IN)
    pub data: Vec<u8>,
}

impl ControlRequest {
    /// Direction bit of bmRequestType
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    /// GET_DESCRIPTOR(CONFIGURATION, index) reading `length` bytes
    pub fn get_config_descriptor(config_index: u8, length: u16) -> Self {
        Self {
            request_type: REQUEST_TYPE_STANDARD_IN,
            request: GET_DESCRIPTOR,
            value: ((DESCRIPTOR_CONFIGURATION as u16) << 8) | config_index as u16,
            index: 0,
            length,
            data: Vec::new(),
        }
    }

    /// UVC GET_* request against a unit (wIndex = unit << 8 | interface)
    pub fn unit_get(
        request: UvcRequest,
        unit_id: u8,
        interface: u8,
        selector: u8,
        length: u16,
    ) -> Self {
        Self {
            request_type: REQUEST_TYPE_CLASS_IN,
            request: request.code(),
            value: (selector as u16) << 8,
            index: ((unit_id as u16) << 8) | interface as u16,
            length,
            data: Vec::new(),
        }
    }

    /// UVC GET_* request against an interface control (wIndex = interface)
    pub fn interface_get(request: UvcRequest, interface: u8, selector: u8, length: u16) -> Self {
        Self::unit_get(request, 0, interface, selector, length)
    }

    /// UVC SET_CUR against an interface control
    pub fn interface_set_cur(interface: u8, selector: u8, data: Vec<u8>) -> Self {
        Self {
            request_type: REQUEST_TYPE_CLASS_OUT,
            request: UvcRequest::SetCur.code(),
            value: (selector as u16) << 8,
            index: interface as u16,
            length: data.len() as u16,
            data,
        }
    }

    /// Control selector (wValue high byte) of a class request
    pub fn selector(&self) -> u8 {
        (self.value >> 8) as u8
    }

    /// Unit or terminal id (wIndex high byte) of a class request
    pub fn entity_id(&self) -> u8 {
        (self.index >> 8) as u8
    }

    /// Interface number (wIndex low byte) of a class request
    pub fn interface(&self) -> u8 {
        (self.index & 0xff) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_descriptor_request() {
        let req = ControlRequest::get_config_descriptor(0, 9);
        assert_eq!(req.request_type, 0x80);
        assert_eq!(req.request, 0x06);
        assert_eq!(req.value, 0x0200);
        assert_eq!(req.length, 9);
        assert!(req.is_in());
    }

    #[test]
    fn test_unit_get_cur_layout() {
        let req = ControlRequest::unit_get(UvcRequest::GetCur, 4, 0, 1, 2);
        assert_eq!(req.request_type, 0xa1);
        assert_eq!(req.request, 0x81);
        assert_eq!(req.value, 0x0100);
        assert_eq!(req.index, 0x0400);
        assert_eq!(req.selector(), 1);
        assert_eq!(req.entity_id(), 4);
        assert_eq!(req.interface(), 0);
    }

    #[test]
    fn test_interface_set_cur() {
        let req = ControlRequest::interface_set_cur(1, 2, vec![0; 26]);
        assert_eq!(req.request_type, 0x21);
        assert_eq!(req.request, 0x01);
        assert_eq!(req.index, 1);
        assert_eq!(req.length, 26);
        assert!(!req.is_in());
    }

    #[test]
    fn test_request_codes() {
        assert_eq!(UvcRequest::GetInfo.code(), 0x86);
        assert!(UvcRequest::GetCur.is_get());
        assert!(!UvcRequest::SetCur.is_get());
        assert_eq!(UvcRequest::from_code(0x85), Some(UvcRequest::GetLen));
        assert_eq!(UvcRequest::from_code(0x42), None);
    }
}
