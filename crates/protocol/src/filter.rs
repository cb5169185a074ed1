//! Device filter rules
//!
//! Filters are written as strings in configuration files:
//!
//! ```text
//! 0x0bda:0x5830     exact vendor/product
//! 0x0bda:*          any product of a vendor
//! *:*               anything
//! class=0x0e        any device exposing a video-class interface
//! class=0x0e:0x01   video control interfaces only
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// USB video device class code
pub const USB_CLASS_VIDEO: u8 = 0x0e;

/// A single device match rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceFilter {
    /// Vendor/product match; `None` is a wildcard
    VidPid {
        vendor: Option<u16>,
        product: Option<u16>,
    },
    /// Class/subclass match against the device or any of its interfaces
    Class { class: u8, subclass: Option<u8> },
}

/// Filter string could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid device filter '{filter}': {reason}")]
pub struct FilterParseError {
    pub filter: String,
    pub reason: String,
}

impl DeviceFilter {
    /// Filter matching every UVC video-control interface
    pub fn video_control() -> Self {
        DeviceFilter::Class {
            class: USB_CLASS_VIDEO,
            subclass: Some(0x01),
        }
    }

    /// Check a device against this rule
    ///
    /// `classes` holds (class, subclass) pairs for the device itself and for
    /// each interface of its configuration.
    pub fn matches(&self, vendor_id: u16, product_id: u16, classes: &[(u8, u8)]) -> bool {
        match *self {
            DeviceFilter::VidPid { vendor, product } => {
                vendor.is_none_or(|v| v == vendor_id) && product.is_none_or(|p| p == product_id)
            }
            DeviceFilter::Class { class, subclass } => classes
                .iter()
                .any(|&(c, s)| c == class && subclass.is_none_or(|want| want == s)),
        }
    }

    /// Check a device against a filter list; an empty list matches everything
    pub fn any_matches(
        filters: &[DeviceFilter],
        vendor_id: u16,
        product_id: u16,
        classes: &[(u8, u8)],
    ) -> bool {
        filters.is_empty()
            || filters
                .iter()
                .any(|f| f.matches(vendor_id, product_id, classes))
    }

    /// Parse a list of filter strings, failing on the first invalid one
    pub fn parse_all<S: AsRef<str>>(filters: &[S]) -> Result<Vec<DeviceFilter>, FilterParseError> {
        filters.iter().map(|f| f.as_ref().parse()).collect()
    }
}

impl FromStr for DeviceFilter {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let err = |reason: &str| FilterParseError {
            filter: s.to_string(),
            reason: reason.to_string(),
        };

        if let Some(rest) = s.strip_prefix("class=") {
            let mut parts = rest.split(':');
            let class = parts
                .next()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| err("missing class code"))?;
            let class = parse_hex_u8(class).ok_or_else(|| err("class must be a hex byte like 0x0e"))?;
            let subclass = match parts.next() {
                None | Some("*") => None,
                Some(p) => Some(
                    parse_hex_u8(p).ok_or_else(|| err("subclass must be a hex byte like 0x01"))?,
                ),
            };
            if parts.next().is_some() {
                return Err(err("expected class=0xCC or class=0xCC:0xSS"));
            }
            return Ok(DeviceFilter::Class { class, subclass });
        }

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 2 {
            return Err(err("expected VID:PID (e.g. '0x1234:0x5678' or '0x1234:*')"));
        }

        let vendor = match parts[0] {
            "*" => None,
            v => Some(parse_hex_u16(v).ok_or_else(|| err("VID must be 0x followed by 1-4 hex digits"))?),
        };
        let product = match parts[1] {
            "*" => None,
            p => Some(parse_hex_u16(p).ok_or_else(|| err("PID must be 0x followed by 1-4 hex digits"))?),
        };

        Ok(DeviceFilter::VidPid { vendor, product })
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFilter::VidPid { vendor, product } => {
                match vendor {
                    Some(v) => write!(f, "{:#06x}", v)?,
                    None => write!(f, "*")?,
                }
                write!(f, ":")?;
                match product {
                    Some(p) => write!(f, "{:#06x}", p),
                    None => write!(f, "*"),
                }
            }
            DeviceFilter::Class { class, subclass } => {
                write!(f, "class={:#04x}", class)?;
                if let Some(s) = subclass {
                    write!(f, ":{:#04x}", s)?;
                }
                Ok(())
            }
        }
    }
}

fn hex_digits(s: &str) -> Option<&str> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    (!digits.is_empty()).then_some(digits)
}

fn parse_hex_u16(s: &str) -> Option<u16> {
    let digits = hex_digits(s)?;
    if digits.len() > 4 {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

fn parse_hex_u8(s: &str) -> Option<u8> {
    let digits = hex_digits(s)?;
    if digits.len() > 2 {
        return None;
    }
    u8::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vid_pid() {
        assert_eq!(
            "0x1234:0x5678".parse::<DeviceFilter>().unwrap(),
            DeviceFilter::VidPid {
                vendor: Some(0x1234),
                product: Some(0x5678)
            }
        );
        assert_eq!(
            "0xABCD:*".parse::<DeviceFilter>().unwrap(),
            DeviceFilter::VidPid {
                vendor: Some(0xabcd),
                product: None
            }
        );
        assert_eq!(
            "*:*".parse::<DeviceFilter>().unwrap(),
            DeviceFilter::VidPid {
                vendor: None,
                product: None
            }
        );
    }

    #[test]
    fn test_parse_class() {
        assert_eq!(
            "class=0x0e".parse::<DeviceFilter>().unwrap(),
            DeviceFilter::Class {
                class: 0x0e,
                subclass: None
            }
        );
        assert_eq!(
            "class=0x0e:0x01".parse::<DeviceFilter>().unwrap(),
            DeviceFilter::video_control()
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!("1234:5678".parse::<DeviceFilter>().is_err());
        assert!("0x1234".parse::<DeviceFilter>().is_err());
        assert!("0x1234:0x5678:0x9abc".parse::<DeviceFilter>().is_err());
        assert!("0xGHIJ:0x5678".parse::<DeviceFilter>().is_err());
        assert!("0x12345:0x5678".parse::<DeviceFilter>().is_err());
        assert!("class=".parse::<DeviceFilter>().is_err());
        assert!("class=0x100".parse::<DeviceFilter>().is_err());
        assert!("class=0x0e:0x01:0x02".parse::<DeviceFilter>().is_err());
    }

    #[test]
    fn test_filter_logic() {
        let filters = DeviceFilter::parse_all(&["0x1234:0x5678", "0xABCD:*"]).unwrap();

        assert!(DeviceFilter::any_matches(&filters, 0x1234, 0x5678, &[]));
        assert!(DeviceFilter::any_matches(&filters, 0xABCD, 0x1111, &[]));
        assert!(!DeviceFilter::any_matches(&filters, 0x1234, 0x9999, &[]));
        assert!(!DeviceFilter::any_matches(&filters, 0x9999, 0x5678, &[]));

        // Empty filters = allow all
        assert!(DeviceFilter::any_matches(&[], 0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_class_matches_interfaces() {
        let filter = DeviceFilter::video_control();
        // Composite device: misc class at device level, video at interface level
        let classes = [(0xef, 0x02), (0x0e, 0x01), (0x0e, 0x02)];
        assert!(filter.matches(0x0bda, 0x5830, &classes));
        assert!(!filter.matches(0x0bda, 0x5830, &[(0xef, 0x02), (0x01, 0x01)]));

        let any_video = DeviceFilter::Class {
            class: USB_CLASS_VIDEO,
            subclass: None,
        };
        assert!(any_video.matches(0, 0, &[(0x0e, 0x02)]));
    }

    #[test]
    fn test_display_roundtrips() {
        for s in ["0x1234:0x5678", "0x04f9:*", "*:*", "class=0x0e", "class=0x0e:0x01"] {
            let parsed: DeviceFilter = s.parse().unwrap();
            let reparsed: DeviceFilter = parsed.to_string().parse().unwrap();
            assert_eq!(parsed, reparsed);
        }
    }
}
