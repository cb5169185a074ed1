//! Extension unit prober
//!
//! Finds the thermal extension unit in the configuration descriptor and
//! reads its data controls with GET_CUR. The prober holds no handle of its
//! own: every call takes the session's [`BlockRef`] and fails with
//! `StaleHandle` once that block was released.

use crate::uvc::read_topology;
use common::{BlockRef, UsbTransport};
use protocol::thermal::FALLBACK_SCAN_SELECTORS;
use protocol::{
    ControlRequest, DEFAULT_THERMAL_SELECTOR, ExtensionUnitDescriptor, ProbeError, ProbeResult,
    SelectorOutcome, SelectorResult, THERMAL_READING_LEN, THERMAL_XU_GUID, ThermalReading,
    ThermalReport, ThermalScan, TransportError, UvcRequest, UvcTopology, decode_reading,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reads vendor extension units over a session's control block
#[derive(Clone)]
pub struct ExtensionUnitProber {
    transport: Arc<dyn UsbTransport>,
    timeout: Duration,
    thermal_selector: u8,
}

impl ExtensionUnitProber {
    pub fn new(transport: Arc<dyn UsbTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            thermal_selector: DEFAULT_THERMAL_SELECTOR,
        }
    }

    /// Read the temperature from a selector other than the default
    pub fn with_thermal_selector(mut self, selector: u8) -> Self {
        self.thermal_selector = selector;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn topology(&self, handle: &BlockRef) -> Result<UvcTopology, ProbeError> {
        handle.ensure_valid()?;
        let topology = read_topology(self.transport.as_ref(), handle, self.timeout)?;
        handle.ensure_valid()?;
        Ok(topology)
    }

    /// List the extension units of the video-control interface
    pub fn enumerate_extension_units(
        &self,
        handle: &BlockRef,
    ) -> Result<Vec<ExtensionUnitDescriptor>, ProbeError> {
        let topology = self.topology(handle)?;
        for unit in &topology.extension_units {
            debug!(
                "Extension unit {} guid {} ({} controls)",
                unit.unit_id, unit.guid, unit.num_controls
            );
        }
        Ok(topology.extension_units)
    }

    /// Read the current temperature from the thermal extension unit
    pub fn quick_thermal_probe(&self, handle: &BlockRef) -> ProbeResult {
        let topology = self.topology(handle)?;
        let unit = thermal_unit(&topology)?;

        let data = self.get_cur(
            handle,
            topology.control_interface,
            unit.unit_id,
            self.thermal_selector,
        )?;
        let reading = decode(&data)?;

        info!(
            "Thermal unit {} selector {}: {:.1} C (0x{})",
            unit.unit_id,
            self.thermal_selector,
            reading.celsius(),
            reading.hex()
        );
        Ok(ThermalReport::new(unit.unit_id, self.thermal_selector, reading))
    }

    /// Read every selector the thermal unit advertises
    ///
    /// Per-selector failures are recorded, not returned. Only a stale handle
    /// aborts the sweep.
    pub fn scan_thermal_unit(&self, handle: &BlockRef) -> Result<ThermalScan, ProbeError> {
        let topology = self.topology(handle)?;
        let unit = thermal_unit(&topology)?;

        let mut selectors = unit.supported_selectors();
        if selectors.is_empty() {
            debug!("Unit {} advertises no controls, sweeping fallback range", unit.unit_id);
            selectors = FALLBACK_SCAN_SELECTORS.collect();
        }

        let mut results = Vec::with_capacity(selectors.len());
        let mut total_reads = 0;

        for selector in selectors {
            let outcome =
                match self.get_cur(handle, topology.control_interface, unit.unit_id, selector) {
                    Ok(data) => match decode(&data) {
                        Ok(reading) => {
                            total_reads += 1;
                            SelectorOutcome::Reading {
                                reading,
                                celsius: reading.celsius(),
                            }
                        }
                        Err(ProbeError::MalformedResponse { reason }) => {
                            SelectorOutcome::Malformed { reason }
                        }
                        Err(e) => SelectorOutcome::Failed {
                            error: e.to_string(),
                        },
                    },
                    Err(ProbeError::StaleHandle) => return Err(ProbeError::StaleHandle),
                    Err(ProbeError::Timeout) => SelectorOutcome::Timeout,
                    Err(e) => SelectorOutcome::Failed {
                        error: e.to_string(),
                    },
                };
            debug!("Selector {}: {:?}", selector, outcome);
            results.push(SelectorResult { selector, outcome });
        }

        info!(
            "Scanned thermal unit {}: {}/{} selectors readable",
            unit.unit_id,
            total_reads,
            results.len()
        );
        Ok(ThermalScan {
            unit_id: unit.unit_id,
            guid: unit.guid,
            selectors: results,
            total_reads,
        })
    }

    fn get_cur(
        &self,
        handle: &BlockRef,
        interface: u8,
        unit_id: u8,
        selector: u8,
    ) -> Result<Vec<u8>, ProbeError> {
        handle.ensure_valid()?;
        let request = ControlRequest::unit_get(
            UvcRequest::GetCur,
            unit_id,
            interface,
            selector,
            THERMAL_READING_LEN,
        );
        let result = self.transport.control_transfer(handle, &request, self.timeout);

        // A release that raced the transfer wins over whatever it returned
        if !handle.is_valid() {
            return Err(ProbeError::StaleHandle);
        }

        result.map_err(|e| {
            if e == TransportError::Timeout {
                warn!("GET_CUR unit {} selector {} timed out", unit_id, selector);
            } else {
                debug!("GET_CUR unit {} selector {} failed: {}", unit_id, selector, e);
            }
            ProbeError::from(e)
        })
    }
}

fn thermal_unit(topology: &UvcTopology) -> Result<&ExtensionUnitDescriptor, ProbeError> {
    topology.find_extension_unit(&THERMAL_XU_GUID).ok_or_else(|| {
        info!("No thermal extension unit ({})", THERMAL_XU_GUID);
        ProbeError::NoExtensionUnit
    })
}

fn decode(data: &[u8]) -> Result<ThermalReading, ProbeError> {
    decode_reading(data).map_err(|defect| ProbeError::MalformedResponse {
        reason: defect.to_string(),
    })
}
