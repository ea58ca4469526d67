//! The sensor device's byte-stream command protocol.
//!
//! Reads return one normalized moisture byte (or the simulated byte).
//! Writes are in-band commands so the device can be driven from a shell:
//!
//! - a single byte stores a simulated reading (only while simulating),
//! - `sim-on` / `sim-off` toggle simulation,
//! - anything else is swallowed.
//!
//! Every write reports its full length as consumed.

use tracing::{debug, info};

use crate::acquisition::Acquisition;
use crate::bus::{Delay, RegisterBus, ThreadDelay};
use crate::error::SensorError;

/// Turns simulation on.
pub const SIM_ON_CMD: &[u8] = b"sim-on";
/// Turns simulation off.
pub const SIM_OFF_CMD: &[u8] = b"sim-off";
/// Longest payload still considered as a command.
pub const MAX_CMD_LEN: usize = 8;

/// Byte-stream view of a soil sensor, whether in-process or behind a device
/// file.
pub trait SensorPort {
    /// Read one moisture byte.
    fn read_byte(&mut self) -> Result<u8, SensorError>;
    /// Write a command or simulated value; returns bytes consumed.
    fn write(&mut self, bytes: &[u8]) -> Result<usize, SensorError>;
}

impl<P: SensorPort + ?Sized> SensorPort for Box<P> {
    fn read_byte(&mut self) -> Result<u8, SensorError> {
        (**self).read_byte()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, SensorError> {
        (**self).write(bytes)
    }
}

/// Per-session simulation state.
///
/// `simulated_value` survives toggling simulation off and back on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorState {
    pub simulation_enabled: bool,
    pub simulated_value: u8,
}

/// What a write did to the [`SensorState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEffect {
    SimulatedValue(u8),
    SimulationOn,
    SimulationOff,
    Ignored,
}

impl SensorState {
    /// Apply one write payload.
    pub fn apply_write(&mut self, payload: &[u8]) -> WriteEffect {
        match payload {
            [value] if self.simulation_enabled => {
                self.simulated_value = *value;
                WriteEffect::SimulatedValue(*value)
            }
            [_] => WriteEffect::Ignored,
            _ => match command(payload) {
                Some(SIM_ON_CMD) => {
                    self.simulation_enabled = true;
                    WriteEffect::SimulationOn
                }
                Some(SIM_OFF_CMD) => {
                    self.simulation_enabled = false;
                    WriteEffect::SimulationOff
                }
                _ => WriteEffect::Ignored,
            },
        }
    }
}

/// Strip trailing NUL/newline padding from a command-sized payload.
fn command(payload: &[u8]) -> Option<&[u8]> {
    if payload.len() > MAX_CMD_LEN {
        return None;
    }
    let end = payload
        .iter()
        .rposition(|&b| !matches!(b, b'\0' | b'\n' | b'\r'))
        .map_or(0, |i| i + 1);
    let cmd = &payload[..end];
    [SIM_ON_CMD, SIM_OFF_CMD].into_iter().find(|c| *c == cmd)
}

/// In-process sensor device: simulation state plus hardware acquisition.
pub struct SoilSensor<B, D = ThreadDelay> {
    state: SensorState,
    acquisition: Acquisition<B, D>,
}

impl<B: RegisterBus> SoilSensor<B> {
    pub fn new(bus: B) -> Self {
        Self::from_acquisition(Acquisition::new(bus))
    }
}

impl<B: RegisterBus, D: Delay> SoilSensor<B, D> {
    pub fn from_acquisition(acquisition: Acquisition<B, D>) -> Self {
        Self {
            state: SensorState::default(),
            acquisition,
        }
    }

    pub fn state(&self) -> SensorState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn acquisition(&self) -> &Acquisition<B, D> {
        &self.acquisition
    }
}

impl<B: RegisterBus, D: Delay> SensorPort for SoilSensor<B, D> {
    fn read_byte(&mut self) -> Result<u8, SensorError> {
        self.acquisition.acquire(&self.state)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, SensorError> {
        match self.state.apply_write(bytes) {
            WriteEffect::SimulationOn => info!("sensor simulation enabled"),
            WriteEffect::SimulationOff => info!("sensor simulation disabled"),
            WriteEffect::SimulatedValue(value) => debug!(value, "simulated reading stored"),
            WriteEffect::Ignored => debug!(len = bytes.len(), "sensor write ignored"),
        }
        Ok(bytes.len())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
