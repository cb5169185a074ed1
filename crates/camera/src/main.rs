//! uvc-thermal-probe
//!
//! Watches for UVC cameras, opens one through the permission broker,
//! negotiates a preview stream and reads the thermal extension unit.

use anyhow::{Context, Result, anyhow, bail};
use camera::config::ProbeConfig;
use camera::usb::{DeviceRegistry, RusbTransport, spawn_hotplug_worker, usb_context};
use camera::{
    CameraSession, ControllerConfig, ExtensionUnitProber, PermissionBroker, SessionConfig,
    SessionController, consent_provider,
};
use clap::Parser;
use common::{
    ControlBlock, EventReceiver, SessionEvent, UsbTransport, create_event_bus, create_notice_channel,
    setup_logging,
};
use protocol::DeviceIdentity;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "uvc-thermal-probe")]
#[command(
    author,
    version,
    about = "UVC camera session manager and thermal extension-unit prober"
)]
#[command(long_about = "
Opens a UVC camera through a consent prompt, negotiates a preview stream
(MJPEG, falling back to YUYV) and reads the temperature exposed by the
camera's thermal extension unit.

EXAMPLES:
    # Run the hot-plug service until Ctrl+C
    uvc-thermal-probe --surface 1

    # List matching cameras
    uvc-thermal-probe --list-devices

    # Read the temperature once and print it as JSON
    uvc-thermal-probe --probe

    # Read every selector of the thermal unit
    uvc-thermal-probe --scan --log-level debug

CONFIGURATION:
    The configuration file is looked up in this order:
    1. Path specified with --config
    2. ~/.config/uvc-thermal-probe/probe.toml
    3. /etc/uvc-thermal-probe/probe.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// List matching cameras and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the extension units of the first camera and exit
    #[arg(long)]
    enumerate: bool,

    /// Read the thermal unit of the first camera once and exit
    #[arg(long, conflicts_with = "scan")]
    probe: bool,

    /// Read every selector of the thermal unit and exit
    #[arg(long)]
    scan: bool,

    /// Preview surface handle
    #[arg(long, value_name = "ID")]
    surface: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ProbeConfig::default();
        let path = ProbeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        ProbeConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ProbeConfig::load_or_default()
    };

    if let Some(level) = args.log_level {
        config.general.log_level = level;
    }
    if let Some(surface) = args.surface {
        config.preview.surface = Some(surface);
    }
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.general.log_level, config.log_options())
        .context("Failed to setup logging")?;

    info!("uvc-thermal-probe v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.general.log_level);

    let context = usb_context().context("Failed to initialize libusb")?;
    let filters = config.device_filters()?;
    let registry = DeviceRegistry::new(context.clone(), filters);
    let transport: Arc<dyn UsbTransport> = Arc::new(RusbTransport::new(context.clone()));

    if args.list_devices {
        return list_devices(&registry);
    }

    if args.enumerate || args.probe || args.scan {
        let mode = if args.enumerate {
            OneShot::Enumerate
        } else if args.scan {
            OneShot::Scan
        } else {
            OneShot::Probe
        };
        return run_once(&config, &registry, transport, mode).await;
    }

    run_service(config, registry, transport).await
}

fn list_devices(registry: &DeviceRegistry) -> Result<()> {
    let devices = registry
        .list_matching(registry.filters())
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No matching cameras found.");
        return Ok(());
    }

    println!("Found {} camera(s):\n", devices.len());
    for device in devices {
        println!(
            "  {:04x}:{:04x} - {}",
            device.vendor_id, device.product_id, device.name
        );
        println!(
            "      Bus {:03} Device {:03}",
            device.bus_number, device.device_address
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum OneShot {
    Enumerate,
    Probe,
    Scan,
}

/// Open the first matching camera, run one probe and print it as JSON
async fn run_once(
    config: &ProbeConfig,
    registry: &DeviceRegistry,
    transport: Arc<dyn UsbTransport>,
    mode: OneShot,
) -> Result<()> {
    let device = registry
        .list_matching(registry.filters())
        .context("Failed to enumerate USB devices")?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No matching camera found"))?;

    let session = Arc::new(CameraSession::new(
        Arc::clone(&transport),
        SessionConfig::from_config(config),
    ));
    let (events, receiver) = create_event_bus();
    let broker = PermissionBroker::new(
        Arc::clone(&transport),
        consent_provider(config.permission.consent),
        events,
    );

    broker.request_permission(&device);
    let block = match await_decision(&receiver, &device).await? {
        SessionEvent::Connected { block, .. } => block,
        SessionEvent::Denied(_) => bail!("Access to {} denied", device),
        other => bail!("Access to {} not granted ({})", device, other.kind()),
    };

    let prober = ExtensionUnitProber::new(Arc::clone(&transport), config.probe.timeout())
        .with_thermal_selector(config.probe.thermal_selector);
    let output = probe_once(&session, prober, block, &device, mode).await?;
    println!("{}", output);
    Ok(())
}

/// Run one prober operation on `block`, then release the session
///
/// The session is released on every path, including a failed or panicked
/// probe.
async fn probe_once(
    session: &Arc<CameraSession>,
    prober: ExtensionUnitProber,
    block: ControlBlock,
    device: &DeviceIdentity,
    mode: OneShot,
) -> Result<String> {
    let output = probe_block(session, prober, block, device, mode).await;

    let released = Arc::clone(session);
    if let Err(e) = tokio::task::spawn_blocking(move || released.release()).await {
        warn!("Release task failed: {}", e);
        session.release();
    }
    output
}

/// Connect `block` and run one prober operation, rendered as JSON
async fn probe_block(
    session: &Arc<CameraSession>,
    prober: ExtensionUnitProber,
    block: ControlBlock,
    device: &DeviceIdentity,
    mode: OneShot,
) -> Result<String> {
    let opened = Arc::clone(session);
    tokio::task::spawn_blocking(move || opened.connect(block))
        .await
        .context("Session task failed")?
        .with_context(|| format!("Failed to open {}", device))?;

    if let Some(format) = session.negotiated_format() {
        info!("Negotiated {}", format);
    }

    let handle = session.device_handle()?;
    tokio::task::spawn_blocking(move || -> Result<String> {
        let json = match mode {
            OneShot::Enumerate => {
                serde_json::to_string_pretty(&prober.enumerate_extension_units(&handle)?)?
            }
            OneShot::Probe => serde_json::to_string_pretty(&prober.quick_thermal_probe(&handle)?)?,
            OneShot::Scan => serde_json::to_string_pretty(&prober.scan_thermal_unit(&handle)?)?,
        };
        Ok(json)
    })
    .await
    .context("Probe task failed")?
}

/// Wait for the broker's verdict on `device`
async fn await_decision(receiver: &EventReceiver, device: &DeviceIdentity) -> Result<SessionEvent> {
    loop {
        let event = receiver.recv().await?;
        let decided = matches!(
            &event,
            SessionEvent::Connected { device: d, .. }
                | SessionEvent::Denied(d)
                | SessionEvent::Cancelled(d)
                if d.same_device(device)
        );
        if decided {
            return Ok(event);
        }
    }
}

/// Run the hot-plug driven session service until Ctrl+C
async fn run_service(
    config: ProbeConfig,
    mut registry: DeviceRegistry,
    transport: Arc<dyn UsbTransport>,
) -> Result<()> {
    let (events, receiver) = create_event_bus();
    let (notices, notice_rx) = create_notice_channel();

    let session = Arc::new(
        CameraSession::new(Arc::clone(&transport), SessionConfig::from_config(&config))
            .with_notices(notices),
    );
    let broker = PermissionBroker::new(
        Arc::clone(&transport),
        consent_provider(config.permission.consent),
        events.clone(),
    );
    let prober = ExtensionUnitProber::new(Arc::clone(&transport), config.probe.timeout())
        .with_thermal_selector(config.probe.thermal_selector);

    let controller_config = ControllerConfig::from_config(&config);
    if controller_config.surface.is_none() {
        warn!("No preview surface configured; cameras will stop after format negotiation");
    }
    let controller = SessionController::new(session, broker, prober, controller_config);

    if let Err(e) = registry.register_hotplug(events.clone()) {
        warn!("Hot-plug unavailable ({}), only present cameras are handled", e);
    }
    let present = registry
        .announce_present(&events)
        .context("Failed to enumerate USB devices")?;
    info!("{} camera(s) present", present);

    let worker = spawn_hotplug_worker(registry).context("Failed to spawn hot-plug worker")?;

    let notice_task = tokio::spawn(async move {
        while let Ok(notice) = notice_rx.recv().await {
            info!("{:?}", notice);
        }
    });

    info!("Press Ctrl+C to shutdown");

    controller
        .run(receiver, async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                Err(e) => error!("Error waiting for Ctrl+C: {}", e),
            }
        })
        .await;

    notice_task.abort();
    if let Err(e) = tokio::task::spawn_blocking(move || worker.shutdown())
        .await
        .context("Hot-plug worker join failed")?
    {
        error!("Hot-plug worker exited with error: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}
