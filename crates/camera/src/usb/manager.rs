//! USB device registry
//!
//! Tracks the currently attached devices that match the configured filters
//! and reports arrivals and removals as [`SessionEvent`]s. The hot-plug
//! callback and [`DeviceRegistry::announce_present`] share one
//! `(bus, address) -> DeviceIdentity` map, so a `Detached` event always
//! carries the identity its `Attached` event reported.
//!
//! There are no retries: a hot-plug event lost by libusb is never recovered.

use common::{EventSender, SessionEvent};
use protocol::{DeviceFilter, DeviceIdentity};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const USB_CLASS_HUB: u8 = 0x09;
const STRING_READ_TIMEOUT: Duration = Duration::from_millis(200);

type KnownDevices = Arc<Mutex<HashMap<(u8, u8), DeviceIdentity>>>;

/// Registry of matching USB devices
pub struct DeviceRegistry {
    context: Context,
    filters: Vec<DeviceFilter>,
    known: KnownDevices,
    _hotplug_registration: Option<Registration<Context>>,
}

impl DeviceRegistry {
    pub fn new(context: Context, filters: Vec<DeviceFilter>) -> Self {
        Self {
            context,
            filters,
            known: Arc::new(Mutex::new(HashMap::new())),
            _hotplug_registration: None,
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn filters(&self) -> &[DeviceFilter] {
        &self.filters
    }

    /// Snapshot of the attached devices matching `filters`
    ///
    /// Devices are opened briefly to read their product string; a device
    /// that cannot be opened is still listed under its bus/address name.
    pub fn list_matching(&self, filters: &[DeviceFilter]) -> Result<Vec<DeviceIdentity>, rusb::Error> {
        let devices = self.context.devices()?;
        let mut matching = Vec::new();

        for device in devices.iter() {
            if is_root_hub(&device) || !device_matches(&device, filters) {
                continue;
            }
            if let Some(identity) = identify(&device, true) {
                matching.push(identity);
            }
        }

        debug!("{} device(s) match {} filter(s)", matching.len(), filters.len());
        Ok(matching)
    }

    /// Register the libusb hot-plug callback
    ///
    /// Events are only delivered while something pumps
    /// `handle_events` on the context (see `spawn_hotplug_worker`).
    pub fn register_hotplug(&mut self, events: EventSender) -> Result<(), rusb::Error> {
        if !rusb::has_hotplug() {
            warn!("libusb has no hot-plug support on this platform");
            return Err(rusb::Error::NotSupported);
        }

        let callback = HotplugCallback {
            events,
            filters: self.filters.clone(),
            known: Arc::clone(&self.known),
        };

        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(callback))?;

        self._hotplug_registration = Some(registration);
        debug!("Hot-plug callbacks registered");
        Ok(())
    }

    /// Emit `Attached` for every matching device already present
    ///
    /// Devices the hot-plug callback already reported are skipped. Returns
    /// the number of events sent.
    pub fn announce_present(&self, events: &EventSender) -> Result<usize, rusb::Error> {
        let present = self.list_matching(&self.filters)?;
        let mut announced = 0;

        for identity in present {
            {
                let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
                if known.contains_key(&identity.key()) {
                    continue;
                }
                known.insert(identity.key(), identity.clone());
            }

            info!("Found {}", identity);
            if let Err(e) = events.send_blocking(SessionEvent::Attached(identity)) {
                error!("Failed to send Attached event: {}", e);
                break;
            }
            announced += 1;
        }

        Ok(announced)
    }
}

/// Root hubs sit on no port
fn is_root_hub<T: UsbContext>(device: &Device<T>) -> bool {
    device.port_number() == 0
        && device
            .device_descriptor()
            .is_ok_and(|d| d.class_code() == USB_CLASS_HUB)
}

/// (class, subclass) of the device and of every interface of its first
/// configuration
fn device_classes<T: UsbContext>(device: &Device<T>) -> Vec<(u8, u8)> {
    let mut classes = Vec::new();
    if let Ok(desc) = device.device_descriptor() {
        classes.push((desc.class_code(), desc.sub_class_code()));
    }
    if let Ok(config) = device.config_descriptor(0) {
        for interface in config.interfaces() {
            for alt in interface.descriptors() {
                classes.push((alt.class_code(), alt.sub_class_code()));
            }
        }
    }
    classes
}

fn device_matches<T: UsbContext>(device: &Device<T>, filters: &[DeviceFilter]) -> bool {
    match device.device_descriptor() {
        Ok(desc) => DeviceFilter::any_matches(
            filters,
            desc.vendor_id(),
            desc.product_id(),
            &device_classes(device),
        ),
        Err(e) => {
            debug!(
                "Skipping device at bus {} address {}: {}",
                device.bus_number(),
                device.address(),
                e
            );
            false
        }
    }
}

/// Build the identity of a device
///
/// `read_strings` opens the device for its product string; the hot-plug
/// callback passes false since blocking I/O is not allowed there.
fn identify<T: UsbContext>(device: &Device<T>, read_strings: bool) -> Option<DeviceIdentity> {
    let desc = device.device_descriptor().ok()?;
    let bus_number = device.bus_number();
    let device_address = device.address();

    let product = if read_strings {
        device.open().ok().and_then(|handle| {
            let language = handle
                .read_languages(STRING_READ_TIMEOUT)
                .ok()?
                .into_iter()
                .next()?;
            handle
                .read_product_string(language, &desc, STRING_READ_TIMEOUT)
                .ok()
        })
    } else {
        None
    };

    let name = product
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| format!("Bus {:03} Device {:03}", bus_number, device_address));

    Some(DeviceIdentity {
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        bus_number,
        device_address,
        name,
    })
}

/// Hot-plug callback handler
///
/// Runs on whichever thread pumps libusb events.
struct HotplugCallback {
    events: EventSender,
    filters: Vec<DeviceFilter>,
    known: KnownDevices,
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );

        if is_root_hub(&device) || !device_matches(&device, &self.filters) {
            return;
        }
        let Some(identity) = identify(&device, false) else {
            return;
        };

        self.known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identity.key(), identity.clone());

        info!("Device attached: {}", identity);
        if let Err(e) = self.events.send_blocking(SessionEvent::Attached(identity)) {
            error!("Failed to send Attached event: {}", e);
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        let key = (device.bus_number(), device.address());
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            key.0, key.1
        );

        let removed = self
            .known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);

        if let Some(identity) = removed {
            info!("Device detached: {}", identity);
            if let Err(e) = self.events.send_blocking(SessionEvent::Detached(identity)) {
                error!("Failed to send Detached event: {}", e);
            }
        }
    }
}
