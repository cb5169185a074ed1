//! Thermal extension unit definitions
//!
//! The thermal sensor is exposed through a vendor extension unit with GUID
//! `{1229a78c-47b4-4094-b0ce-db07386fb938}`. Its data controls return a
//! 16-bit little-endian temperature in deci-Celsius (0.1 °C units).

use crate::descriptors::Guid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Thermal extension unit GUID, wire byte order
pub const THERMAL_XU_GUID: Guid = Guid([
    0x8c, 0xa7, 0x29, 0x12, 0xb4, 0x47, 0x94, 0x40, 0xb0, 0xce, 0xdb, 0x07, 0x38, 0x6f, 0xb9, 0x38,
]);

/// Control selector carrying the current temperature
pub const DEFAULT_THERMAL_SELECTOR: u8 = 1;

/// Length of a thermal data control in bytes
pub const THERMAL_READING_LEN: u16 = 2;

/// Selectors swept when a unit advertises no controls
pub const FALLBACK_SCAN_SELECTORS: std::ops::RangeInclusive<u8> = 1..=16;

/// Lowest plausible reading (-40.0 °C)
pub const MIN_PLAUSIBLE_DECI_C: i16 = -400;
/// Highest plausible reading (120.0 °C)
pub const MAX_PLAUSIBLE_DECI_C: i16 = 1200;

/// A decoded temperature sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThermalReading {
    /// Raw bytes as received
    pub raw: [u8; 2],
    /// Temperature in 0.1 °C units
    pub deci_celsius: i16,
}

impl ThermalReading {
    pub fn celsius(&self) -> f32 {
        self.deci_celsius as f32 / 10.0
    }

    /// Raw bytes rendered as hex, in wire order
    pub fn hex(&self) -> String {
        format!("{:02x}{:02x}", self.raw[0], self.raw[1])
    }
}

/// Why a thermal payload was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadingDefect {
    /// Fewer bytes than a reading needs
    #[error("expected {expected} bytes, got {len}", expected = THERMAL_READING_LEN)]
    Short { len: usize },

    /// Decoded value outside the plausible sensor range
    #[error(
        "value {deci_celsius} deci-C outside plausible range {min}..={max}",
        min = MIN_PLAUSIBLE_DECI_C,
        max = MAX_PLAUSIBLE_DECI_C
    )]
    Implausible { deci_celsius: i16 },
}

/// Decode a GET_CUR payload into a reading
///
/// Extra trailing bytes are ignored; the transfer is bounded by wLength.
pub fn decode_reading(data: &[u8]) -> Result<ThermalReading, ReadingDefect> {
    let [lo, hi] = match data {
        [lo, hi, ..] => [*lo, *hi],
        _ => return Err(ReadingDefect::Short { len: data.len() }),
    };
    let deci_celsius = i16::from_le_bytes([lo, hi]);
    if !(MIN_PLAUSIBLE_DECI_C..=MAX_PLAUSIBLE_DECI_C).contains(&deci_celsius) {
        return Err(ReadingDefect::Implausible { deci_celsius });
    }
    Ok(ThermalReading {
        raw: [lo, hi],
        deci_celsius,
    })
}

/// Result of a successful thermal probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalReport {
    pub unit_id: u8,
    pub selector: u8,
    pub guid: Guid,
    pub reading: ThermalReading,
    pub celsius: f32,
}

impl ThermalReport {
    pub fn new(unit_id: u8, selector: u8, reading: ThermalReading) -> Self {
        Self {
            unit_id,
            selector,
            guid: THERMAL_XU_GUID,
            reading,
            celsius: reading.celsius(),
        }
    }
}

/// Outcome of reading one selector during a full scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SelectorOutcome {
    Reading {
        reading: ThermalReading,
        celsius: f32,
    },
    Malformed {
        reason: String,
    },
    Failed {
        error: String,
    },
    Timeout,
}

/// A selector and what reading it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorResult {
    pub selector: u8,
    #[serde(flatten)]
    pub outcome: SelectorOutcome,
}

/// Result of sweeping every selector of the thermal unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalScan {
    pub unit_id: u8,
    pub guid: Guid,
    pub selectors: Vec<SelectorResult>,
    pub total_reads: usize,
}
