//! The sense → decide → actuate → report loop.
//!
//! ## Phases
//!
//! ```text
//! Init ──[baseline + gpio enabled]──▶ Running ──[shutdown | fatal error]──▶ Terminating ──▶ Stopped
//! ```
//!
//! Each iteration reads the sensor, reports it, runs the pump for a fixed
//! time if the soil is drier than the target, then sleeps. A failed read
//! or pump write ends the loop: pump decisions are never made on missing
//! data. Every exit path tries to return the pin to input and unexport it.

use std::time::Duration;

use clap::ValueEnum;
use serde::Deserialize;
use soil_sensor::{SensorError, SensorPort, SIM_OFF_CMD, SIM_ON_CMD};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::gpio::{GpioActuator, GpioError, PinWriter};
use crate::signals::{LoopSignals, SleepOutcome};
use crate::status::StatusEvent;
use crate::telemetry::Reporter;

/// Which sleeps SIGUSR1 may cut short.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum WakeScope {
    /// Only the wait between readings.
    #[default]
    Poll,
    /// Only the pump run.
    Pump,
    Both,
}

impl WakeScope {
    fn wakes_poll(self) -> bool {
        matches!(self, Self::Poll | Self::Both)
    }

    fn wakes_pump(self) -> bool {
        matches!(self, Self::Pump | Self::Both)
    }
}

/// Fixed for the lifetime of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LoopConfig {
    pub(crate) target_moisture: u8,
    pub(crate) poll_interval: Duration,
    pub(crate) pump_run_time: Duration,
    pub(crate) wake_scope: WakeScope,
    pub(crate) telemetry_endpoint: Option<String>,
}

/// Simulation mode to put the sensor in before the first read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Simulation {
    pub(crate) enabled: bool,
    /// Seed for the simulated reading; only written when `enabled`.
    pub(crate) value: Option<u8>,
}

#[derive(Debug, Error)]
pub(crate) enum LoopError {
    #[error("moisture acquisition failed: {0}")]
    Sensor(#[from] SensorError),

    #[error("sensor accepted {consumed} of {expected} bytes of the simulation command")]
    Baseline { consumed: usize, expected: usize },

    #[error("pump control failed: {0}")]
    Gpio(#[from] GpioError),
}

enum Flow {
    Continue,
    Shutdown,
}

pub(crate) struct ControlLoop<S, W, R> {
    config: LoopConfig,
    sensor: S,
    pump: GpioActuator<W>,
    reporter: Option<R>,
    signals: LoopSignals,
}

impl<S, W, R> ControlLoop<S, W, R>
where
    S: SensorPort,
    W: PinWriter,
    R: Reporter,
{
    /// Init: put the sensor in a known simulation mode, then take the pump
    /// pin. On failure only what already succeeded is undone.
    pub(crate) fn start(
        config: LoopConfig,
        mut sensor: S,
        simulation: Simulation,
        mut pump: GpioActuator<W>,
        reporter: Option<R>,
        signals: LoopSignals,
    ) -> Result<Self, LoopError> {
        let cmd = if simulation.enabled {
            SIM_ON_CMD
        } else {
            SIM_OFF_CMD
        };
        write_all(&mut sensor, cmd)?;
        if let (true, Some(value)) = (simulation.enabled, simulation.value) {
            write_all(&mut sensor, &[value])?;
        }

        if let Err(e) = pump.enable() {
            if pump.state().exported {
                if let Err(cleanup) = pump.disable() {
                    warn!("gpio cleanup after failed enable: {cleanup}");
                }
            }
            return Err(e.into());
        }

        info!(
            target_moisture = config.target_moisture,
            pump_pin = pump.pin(),
            poll_sec = config.poll_interval.as_secs(),
            pump_sec = config.pump_run_time.as_secs(),
            simulation = simulation.enabled,
            wake_scope = ?config.wake_scope,
            telemetry = config.telemetry_endpoint.as_deref().unwrap_or("off"),
            "control loop initialised"
        );

        let mut this = Self {
            config,
            sensor,
            pump,
            reporter,
            signals,
        };
        this.status(StatusEvent::Started);
        Ok(this)
    }

    /// Run until shutdown (`Ok`) or a fatal error. The pump pin is released
    /// either way before this returns.
    pub(crate) async fn run(mut self) -> Result<(), LoopError> {
        let result = loop {
            if self.signals.is_shutdown() {
                break Ok(());
            }
            match self.iterate().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Shutdown) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.terminate(result.as_ref().err());
        result
    }

    async fn iterate(&mut self) -> Result<Flow, LoopError> {
        let moisture = self.sensor.read_byte()?;
        self.status(StatusEvent::Moisture(moisture));

        if moisture < self.config.target_moisture {
            if let Flow::Shutdown = self.water().await? {
                return Ok(Flow::Shutdown);
            }
        }

        let interval = self.config.poll_interval;
        self.status(StatusEvent::Sleeping { interval });
        match self
            .signals
            .sleep(interval, self.config.wake_scope.wakes_poll())
            .await
        {
            SleepOutcome::Shutdown => Ok(Flow::Shutdown),
            SleepOutcome::Woken => {
                info!("woken early, reading now");
                Ok(Flow::Continue)
            }
            SleepOutcome::Elapsed => Ok(Flow::Continue),
        }
    }

    /// One pump cycle. A shutdown mid-run skips the `off` write; the
    /// teardown's switch to input drops the drive.
    async fn water(&mut self) -> Result<Flow, LoopError> {
        let run_time = self.config.pump_run_time;

        self.pump.on()?;
        self.status(StatusEvent::PumpOn { run_time });

        match self
            .signals
            .sleep(run_time, self.config.wake_scope.wakes_pump())
            .await
        {
            SleepOutcome::Shutdown => return Ok(Flow::Shutdown),
            SleepOutcome::Woken => info!("pump run cut short"),
            SleepOutcome::Elapsed => {}
        }

        self.pump.off()?;
        self.status(StatusEvent::PumpOff);
        Ok(Flow::Continue)
    }

    fn terminate(&mut self, failure: Option<&LoopError>) {
        match failure {
            None => self.status(StatusEvent::ShuttingDown),
            Some(e) => error!("control loop stopped: {e}"),
        }

        // Already exiting; nothing more to do if this fails.
        if let Err(e) = self.pump.disable() {
            warn!("gpio disable during shutdown failed: {e}");
        }
    }

    fn status(&self, event: StatusEvent) {
        info!("{event}");
        if let Some(reporter) = &self.reporter {
            reporter.publish(&event.to_string());
        }
    }
}

fn write_all<S: SensorPort>(sensor: &mut S, bytes: &[u8]) -> Result<(), LoopError> {
    let consumed = sensor.write(bytes)?;
    if consumed != bytes.len() {
        return Err(LoopError::Baseline {
            consumed,
            expected: bytes.len(),
        });
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
