//! Integration tests for configuration parsing
//!
//! Covers:
//! - Minimal and full TOML files
//! - Consent modes
//! - Validation of log level, filters, timeout, selector and preview size
//! - Save/load through a real file

use camera::config::{ConsentMode, MAX_PROBE_TIMEOUT_MS, ProbeConfig};
use camera::{ControllerConfig, SessionConfig};
use protocol::SurfaceHandle;
use std::time::Duration;
use tempfile::TempDir;

const MINIMAL_CONFIG: &str = r#"
[general]
log_level = "info"
"#;

const FULL_CONFIG: &str = r#"
[general]
log_level = "debug"
log_format = "full"

[usb]
filters = ["class=0x0e:0x01", "0x0bda:0x5830"]

[permission]
consent = "auto"

[preview]
width = 1280
height = 720
surface = 42
auto_connect = false

[probe]
timeout_ms = 250
thermal_selector = 2
probe_on_connect = true
full_scan = true
"#;

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("probe.toml");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_minimal_config_uses_defaults() {
    let config: ProbeConfig = toml::from_str(MINIMAL_CONFIG).unwrap();
    assert_eq!(config.general.log_format, "compact");
    assert_eq!(config.usb.filters, vec!["class=0x0e:0x01"]);
    assert_eq!(config.permission.consent, ConsentMode::Prompt);
    assert_eq!(config.preview.width, 640);
    assert_eq!(config.preview.height, 480);
    assert!(config.preview.surface.is_none());
    assert!(config.preview.auto_connect);
    assert_eq!(config.probe.timeout_ms, 1000);
    assert!(!config.probe.probe_on_connect);
    assert!(config.validate().is_ok());
}

#[test]
fn test_empty_file_is_default() {
    let config: ProbeConfig = toml::from_str("").unwrap();
    assert_eq!(config.general.log_level, "info");
    assert!(config.validate().is_ok());
}

#[test]
fn test_full_config() {
    let config: ProbeConfig = toml::from_str(FULL_CONFIG).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.device_filters().unwrap().len(), 2);
    assert_eq!(config.permission.consent, ConsentMode::Auto);

    let session = SessionConfig::from_config(&config);
    assert_eq!((session.width, session.height), (1280, 720));
    assert_eq!(session.control_timeout, Duration::from_millis(250));

    let controller = ControllerConfig::from_config(&config);
    assert!(!controller.auto_connect);
    assert_eq!(controller.surface, Some(SurfaceHandle(42)));
    assert!(controller.probe_on_connect);
    assert!(controller.full_scan);
}

#[test]
fn test_consent_modes() {
    for (text, mode) in [
        ("auto", ConsentMode::Auto),
        ("prompt", ConsentMode::Prompt),
        ("deny", ConsentMode::Deny),
    ] {
        let config: ProbeConfig =
            toml::from_str(&format!("[permission]\nconsent = \"{}\"\n", text)).unwrap();
        assert_eq!(config.permission.consent, mode);
    }

    assert!(toml::from_str::<ProbeConfig>("[permission]\nconsent = \"maybe\"\n").is_err());
}

mod validation {
    use super::*;

    #[test]
    fn test_invalid_log_level() {
        let mut config = ProbeConfig::default();
        config.general.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_format() {
        let mut config = ProbeConfig::default();
        config.general.log_format = "json".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_filter() {
        let mut config = ProbeConfig::default();
        config.usb.filters = vec!["not-a-filter".to_string()];
        assert!(config.validate().is_err());
        assert!(ProbeConfig::validate_filter("0x0bda:*").is_ok());
    }

    #[test]
    fn test_timeout_bounds() {
        let mut config = ProbeConfig::default();
        config.probe.timeout_ms = 0;
        assert!(config.validate().is_err());

        config.probe.timeout_ms = MAX_PROBE_TIMEOUT_MS;
        assert!(config.validate().is_ok());

        config.probe.timeout_ms = MAX_PROBE_TIMEOUT_MS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_selector() {
        let mut config = ProbeConfig::default();
        config.probe.thermal_selector = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_preview_size() {
        let mut config = ProbeConfig::default();
        config.preview.height = 0;
        assert!(config.validate().is_err());
    }
}

mod files {
    use super::*;

    #[test]
    fn test_load_from_path() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, FULL_CONFIG);

        let config = ProbeConfig::load(Some(path)).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.probe.thermal_selector, 2);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[probe]\ntimeout_ms = 60000\n");
        assert!(ProbeConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[probe\ntimeout_ms = ");
        assert!(ProbeConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(ProbeConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("probe.toml");

        let mut config = ProbeConfig::default();
        config.preview.surface = Some(9);
        config.permission.consent = ConsentMode::Deny;
        config.save(&path).unwrap();

        let loaded = ProbeConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.preview.surface, Some(9));
        assert_eq!(loaded.permission.consent, ConsentMode::Deny);
    }
}
