mod config;
mod control;
mod gpio;
mod signals;
mod status;
mod telemetry;
#[cfg(test)]
mod testing;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use soil_sensor::{CharDevice, SensorPort};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::{FileConfig, SensorSource, Settings};
use control::{ControlLoop, WakeScope};
use gpio::GpioActuator;
use telemetry::{RetryPolicy, TelemetryPublisher};

/// Keep the soil moist: read the sensor, run the pump when it is too dry.
#[derive(Debug, Parser)]
#[command(name = "soil-monitor", version)]
pub(crate) struct Cli {
    /// Stay attached to the terminal (coloured logs).
    #[arg(short, long)]
    foreground: bool,

    /// Put the sensor in simulation mode before the first read.
    #[arg(short, long)]
    simulate: bool,

    /// Water when moisture drops below this (0-255) [default: 128].
    #[arg(short, long)]
    target: Option<u8>,

    /// Seconds between readings [default: 3600].
    #[arg(short, long, value_name = "SEC")]
    wait: Option<u64>,

    /// Seconds to run the pump per watering [default: 5].
    #[arg(short, long, value_name = "SEC")]
    pump_time: Option<u64>,

    /// MQTT broker, `tcp://host[:port]`. Telemetry is off without it.
    #[arg(short = 'm', long, value_name = "URI")]
    broker: Option<String>,

    /// TOML settings file; flags given here take precedence.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Sensor device node [default: /dev/i2c-soil-drv].
    #[arg(long, value_name = "PATH")]
    device: Option<PathBuf>,

    #[arg(long, value_enum)]
    sensor: Option<SensorSource>,

    /// Simulated reading to seed right after enabling simulation.
    #[arg(long, value_name = "0-255")]
    sim_value: Option<u8>,

    /// Which sleeps SIGUSR1 interrupts [default: poll].
    #[arg(long, value_enum)]
    wake_scope: Option<WakeScope>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let file = match &cli.config {
        Some(path) => config::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(&cli, file)?;

    init_tracing(settings.foreground);
    info!(version = env!("CARGO_PKG_VERSION"), "soil-monitor starting");

    // ── Telemetry (optional, fatal if configured but unreachable) ────
    let publisher = match &settings.control.telemetry_endpoint {
        Some(uri) => Some(
            TelemetryPublisher::connect(uri, RetryPolicy::default())
                .await
                .context("telemetry setup failed")?,
        ),
        None => None,
    };

    let result = run(&settings, publisher.as_ref()).await;

    if let Some(publisher) = publisher {
        publisher.close().await;
    }
    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}

async fn run(settings: &Settings, reporter: Option<&TelemetryPublisher>) -> Result<()> {
    let sensor = open_sensor(settings)?;
    let signals = signals::install()?;
    let pump = GpioActuator::sysfs(&settings.gpio_root, settings.gpio_pin);

    let control = ControlLoop::start(
        settings.control.clone(),
        sensor,
        settings.simulation,
        pump,
        reporter,
        signals,
    )
    .context("initialisation failed")?;

    control.run().await.context("control loop failed")?;
    info!("exited cleanly");
    Ok(())
}

fn open_sensor(settings: &Settings) -> Result<Box<dyn SensorPort>> {
    match settings.sensor {
        SensorSource::Device => Ok(Box::new(CharDevice::open(&settings.device)?)),
        SensorSource::I2c => open_i2c(),
    }
}

#[cfg(feature = "i2c")]
fn open_i2c() -> Result<Box<dyn SensorPort>> {
    use soil_sensor::acquisition::{I2C_ADDR, I2C_BUS};
    use soil_sensor::{RppalBus, SoilSensor};

    let bus = RppalBus::open(I2C_BUS, I2C_ADDR).context("failed to open sensor bus")?;
    Ok(Box::new(SoilSensor::new(bus)))
}

#[cfg(not(feature = "i2c"))]
fn open_i2c() -> Result<Box<dyn SensorPort>> {
    anyhow::bail!("built without the `i2c` feature; use --sensor device")
}

fn init_tracing(foreground: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if foreground {
        builder.init();
    } else {
        // The supervisor stamps lines itself.
        builder.with_ansi(false).without_time().init();
    }
}
