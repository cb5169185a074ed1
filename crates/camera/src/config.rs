//! Probe configuration management

use anyhow::{Context, Result, anyhow};
use common::{LogFormat, LogOptions};
use protocol::{DEFAULT_PREVIEW_HEIGHT, DEFAULT_PREVIEW_WIDTH, DEFAULT_THERMAL_SELECTOR, DeviceFilter};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for a single probe control transfer
pub const MAX_PROBE_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProbeConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub permission: PermissionSettings,
    #[serde(default)]
    pub preview: PreviewSettings,
    #[serde(default)]
    pub probe: ProbeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(default = "GeneralSettings::default_log_level")]
    pub log_level: String,
    /// "compact" or "full"
    #[serde(default = "GeneralSettings::default_log_format")]
    pub log_format: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            log_format: Self::default_log_format(),
        }
    }
}

impl GeneralSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_log_format() -> String {
        "compact".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Device filters, e.g. "0x0bda:0x5830", "0x0bda:*" or "class=0x0e:0x01"
    #[serde(default = "UsbSettings::default_filters")]
    pub filters: Vec<String>,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Self::default_filters(),
        }
    }
}

impl UsbSettings {
    fn default_filters() -> Vec<String> {
        vec![DeviceFilter::video_control().to_string()]
    }
}

/// How access requests are decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsentMode {
    /// Grant every request
    Auto,
    /// Ask on the controlling terminal
    #[default]
    Prompt,
    /// Refuse every request
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PermissionSettings {
    #[serde(default)]
    pub consent: ConsentMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewSettings {
    #[serde(default = "PreviewSettings::default_width")]
    pub width: u16,
    #[serde(default = "PreviewSettings::default_height")]
    pub height: u16,
    /// Opaque rendering surface id; no surface means preview cannot start
    #[serde(default)]
    pub surface: Option<u64>,
    /// Request permission as soon as a matching camera appears
    #[serde(default = "PreviewSettings::default_auto_connect")]
    pub auto_connect: bool,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            width: Self::default_width(),
            height: Self::default_height(),
            surface: None,
            auto_connect: Self::default_auto_connect(),
        }
    }
}

impl PreviewSettings {
    fn default_width() -> u16 {
        DEFAULT_PREVIEW_WIDTH
    }

    fn default_height() -> u16 {
        DEFAULT_PREVIEW_HEIGHT
    }

    fn default_auto_connect() -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Timeout for each extension-unit transfer
    #[serde(default = "ProbeSettings::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Control selector read by the quick probe
    #[serde(default = "ProbeSettings::default_thermal_selector")]
    pub thermal_selector: u8,
    /// Run the quick probe after each successful connect
    #[serde(default)]
    pub probe_on_connect: bool,
    /// Sweep every advertised selector instead of the quick probe
    #[serde(default)]
    pub full_scan: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            thermal_selector: Self::default_thermal_selector(),
            probe_on_connect: false,
            full_scan: false,
        }
    }
}

impl ProbeSettings {
    fn default_timeout_ms() -> u64 {
        1000
    }

    fn default_thermal_selector() -> u8 {
        DEFAULT_THERMAL_SELECTOR
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ProbeConfig {
    /// Load configuration from file
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/uvc-thermal-probe/probe.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ProbeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("uvc-thermal-probe").join("probe.toml")
        } else {
            PathBuf::from(".config/uvc-thermal-probe/probe.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        self.general
            .log_format
            .parse::<LogFormat>()
            .map_err(|e| anyhow!("{}", e))?;

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        if self.preview.width == 0 || self.preview.height == 0 {
            return Err(anyhow!(
                "Invalid preview size {}x{}, width and height must be non-zero",
                self.preview.width,
                self.preview.height
            ));
        }

        if self.probe.timeout_ms == 0 || self.probe.timeout_ms > MAX_PROBE_TIMEOUT_MS {
            return Err(anyhow!(
                "Invalid probe timeout {} ms, must be between 1 and {}",
                self.probe.timeout_ms,
                MAX_PROBE_TIMEOUT_MS
            ));
        }

        if self.probe.thermal_selector == 0 {
            return Err(anyhow!("Invalid thermal selector 0, selectors start at 1"));
        }

        Ok(())
    }

    /// Validate a device filter pattern
    pub fn validate_filter(filter: &str) -> Result<()> {
        filter
            .parse::<DeviceFilter>()
            .map(|_| ())
            .map_err(|e| anyhow!("{}", e))
    }

    /// Parsed device filters
    pub fn device_filters(&self) -> Result<Vec<DeviceFilter>> {
        DeviceFilter::parse_all(&self.usb.filters).map_err(|e| anyhow!("{}", e))
    }

    /// Logging options for `common::setup_logging`
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            format: self.general.log_format.parse().unwrap_or_default(),
            ansi: std::io::IsTerminal::is_terminal(&std::io::stderr()),
        }
    }
}

/// Expand a leading `~` in a user-supplied path
pub fn expand_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).as_ref()),
        None => path.to_path_buf(),
    }
}
