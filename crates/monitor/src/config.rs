//! Settings resolution: command line over TOML file over built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::Deserialize;
use soil_sensor::DEFAULT_DEVICE_PATH;

use crate::control::{LoopConfig, Simulation, WakeScope};
use crate::gpio::{DEFAULT_GPIO_ROOT, DEFAULT_PUMP_PIN};
use crate::telemetry::parse_broker_uri;
use crate::Cli;

pub(crate) const DEFAULT_TARGET_MOISTURE: u8 = 128;
pub(crate) const DEFAULT_POLL_INTERVAL_SEC: u64 = 3600;
pub(crate) const DEFAULT_PUMP_RUN_SEC: u64 = 5;

/// BCM pins broken out on the 40-pin header. 0 and 1 belong to the ID
/// EEPROM.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

/// Where moisture readings come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SensorSource {
    /// The privileged byte-stream device.
    #[default]
    Device,
    /// Talk to the sensor over I2C in-process (needs the `i2c` feature).
    I2c,
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// Every key is optional; anything left out falls through to the default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileConfig {
    pub(crate) foreground: Option<bool>,
    pub(crate) simulate: Option<bool>,
    pub(crate) sim_value: Option<i64>,
    pub(crate) target_moisture: Option<i64>,
    pub(crate) poll_interval_sec: Option<i64>,
    pub(crate) pump_run_sec: Option<i64>,
    pub(crate) broker: Option<String>,
    pub(crate) sensor: Option<SensorSource>,
    pub(crate) device: Option<PathBuf>,
    pub(crate) gpio_root: Option<PathBuf>,
    pub(crate) gpio_pin: Option<i64>,
    pub(crate) wake_scope: Option<WakeScope>,
}

pub(crate) fn load(path: &Path) -> Result<FileConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config: {}", path.display()))
}

// ---------------------------------------------------------------------------
// Resolved settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Settings {
    pub(crate) foreground: bool,
    pub(crate) simulation: Simulation,
    pub(crate) sensor: SensorSource,
    pub(crate) device: PathBuf,
    pub(crate) gpio_root: PathBuf,
    pub(crate) gpio_pin: u32,
    pub(crate) control: LoopConfig,
}

impl Settings {
    /// Merge `cli` over `file` over defaults, then validate. Every violation
    /// is reported, not just the first.
    pub(crate) fn resolve(cli: &Cli, file: FileConfig) -> Result<Self> {
        let target = cli
            .target
            .map(i64::from)
            .or(file.target_moisture)
            .unwrap_or(i64::from(DEFAULT_TARGET_MOISTURE));
        let poll_sec = cli
            .wait
            .map(saturating_i64)
            .or(file.poll_interval_sec)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SEC as i64);
        let pump_sec = cli
            .pump_time
            .map(saturating_i64)
            .or(file.pump_run_sec)
            .unwrap_or(DEFAULT_PUMP_RUN_SEC as i64);
        let sim_value = cli.sim_value.map(i64::from).or(file.sim_value);
        let simulate = cli.simulate || file.simulate.unwrap_or(false);
        let gpio_pin = file.gpio_pin.unwrap_or(i64::from(DEFAULT_PUMP_PIN));
        let device = cli
            .device
            .clone()
            .or(file.device)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE_PATH));
        let broker = cli.broker.clone().or(file.broker);

        let mut errors: Vec<String> = Vec::new();

        if !(0..=255).contains(&target) {
            errors.push(format!("target_moisture {target} is outside 0..=255"));
        }
        if poll_sec <= 0 {
            errors.push(format!("poll interval must be positive (got {poll_sec} s)"));
        }
        if pump_sec <= 0 {
            errors.push(format!("pump run time must be positive (got {pump_sec} s)"));
        }
        if let Some(v) = sim_value {
            if !(0..=255).contains(&v) {
                errors.push(format!("sim_value {v} is outside 0..=255"));
            }
            if !simulate {
                errors.push("sim_value given but simulation is not enabled".to_string());
            }
        }
        if !VALID_GPIO_PINS.contains(&gpio_pin) {
            errors.push(format!(
                "gpio_pin {gpio_pin} is not a usable header pin ({}..={})",
                VALID_GPIO_PINS.start(),
                VALID_GPIO_PINS.end()
            ));
        }
        if device.as_os_str().is_empty() {
            errors.push("device path is empty".to_string());
        }
        if let Some(uri) = &broker {
            if let Err(e) = parse_broker_uri(uri) {
                errors.push(e.to_string());
            }
        }

        if !errors.is_empty() {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }

        // Ranges were checked above.
        Ok(Self {
            foreground: cli.foreground || file.foreground.unwrap_or(false),
            simulation: Simulation {
                enabled: simulate,
                value: sim_value.map(|v| v as u8),
            },
            sensor: cli.sensor.or(file.sensor).unwrap_or_default(),
            device,
            gpio_root: file
                .gpio_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_GPIO_ROOT)),
            gpio_pin: gpio_pin as u32,
            control: LoopConfig {
                target_moisture: target as u8,
                poll_interval: Duration::from_secs(poll_sec as u64),
                pump_run_time: Duration::from_secs(pump_sec as u64),
                wake_scope: cli.wake_scope.or(file.wake_scope).unwrap_or_default(),
                telemetry_endpoint: broker,
            },
        })
    }
}

fn saturating_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

// ===========================================================================
// Tests
// ===========================================================================
