//! Moisture acquisition for the Adafruit seesaw capacitive soil sensor.
//!
//! One transaction writes the touch register address pair, waits for the
//! sensor to settle, then reads two bytes back as a big-endian raw count.
//! Implausible counts are re-read a fixed number of times; transport
//! failures are never retried.

use std::time::Duration;

use tracing::{debug, warn};

use crate::bus::{Delay, RegisterBus, ThreadDelay};
use crate::device::SensorState;
use crate::error::{SensorError, Stage};

// ── Sensor register map ─────────────────────────────────────────────────────

/// Fixed I2C address of the seesaw breakout.
pub const I2C_ADDR: u16 = 0x36;

/// `/dev/i2c-1` on a Raspberry Pi (GPIO 2/3).
pub const I2C_BUS: u8 = 1;

/// Touch module base (0x0F) followed by the touch channel offset (0x10).
pub const TOUCH_REGISTER: [u8; 2] = [0x0f, 0x10];

/// Time the sensor needs between the address write and a valid readback.
pub const SETTLE_DELAY: Duration = Duration::from_millis(10);

// ── Plausibility and calibration ────────────────────────────────────────────

/// Anything above this is garbage (including the 0xFFFF error sentinel).
pub const RAW_CEILING: u16 = 4095;

/// Extra transactions allowed after the first implausible value.
pub const MAX_REREADS: usize = 4;

/// Raw count at or below which the soil reads as bone dry (0).
pub const MIN_RAW: u16 = 0x2a0;

/// Raw count at or above which the soil reads as saturated (255).
pub const MAX_RAW: u16 = 0x39f;

/// Clamp `raw` into `[MIN_RAW, MAX_RAW]` and rescale linearly onto 0..=255.
pub fn normalize(raw: u16) -> u8 {
    let clamped = raw.clamp(MIN_RAW, MAX_RAW);
    let span = u32::from(MAX_RAW - MIN_RAW);
    let scaled = u32::from(clamped - MIN_RAW) * 255 / span;
    scaled as u8
}

fn in_bounds(raw: u16) -> bool {
    raw <= RAW_CEILING
}

/// Retry/outlier-rejection policy over a [`RegisterBus`].
pub struct Acquisition<B, D = ThreadDelay> {
    bus: B,
    delay: D,
}

impl<B: RegisterBus> Acquisition<B> {
    pub fn new(bus: B) -> Self {
        Self::with_delay(bus, ThreadDelay)
    }
}

impl<B: RegisterBus, D: Delay> Acquisition<B, D> {
    pub fn with_delay(bus: B, delay: D) -> Self {
        Self { bus, delay }
    }

    #[cfg(test)]
    pub(crate) fn bus(&self) -> &B {
        &self.bus
    }

    #[cfg(test)]
    pub(crate) fn delay(&self) -> &D {
        &self.delay
    }

    /// Produce one normalized reading.
    ///
    /// With simulation on this returns the stored byte without touching the
    /// bus. Otherwise up to `MAX_REREADS + 1` transactions are attempted.
    pub fn acquire(&mut self, state: &SensorState) -> Result<u8, SensorError> {
        if state.simulation_enabled {
            return Ok(state.simulated_value);
        }

        let mut raw = self.transact()?;
        let mut attempts = 1;

        while !in_bounds(raw) {
            if attempts > MAX_REREADS {
                warn!(attempts, raw, "soil sensor reading stayed out of range");
                return Err(SensorError::OutOfRange {
                    attempts,
                    last_raw: raw,
                });
            }
            debug!(attempt = attempts, raw, "out-of-range reading, re-reading");
            self.delay.delay(SETTLE_DELAY);
            raw = self.transact()?;
            attempts += 1;
        }

        let value = normalize(raw);
        debug!(raw, value, attempts, "soil sensor read");
        Ok(value)
    }

    /// Address write, settle, two-byte readback.
    fn transact(&mut self) -> Result<u16, SensorError> {
        let written = self
            .bus
            .write(&TOUCH_REGISTER)
            .map_err(|e| SensorError::transaction(Stage::Address, e))?;
        if written != TOUCH_REGISTER.len() {
            return Err(SensorError::short(
                Stage::Address,
                TOUCH_REGISTER.len(),
                written,
            ));
        }

        self.delay.delay(SETTLE_DELAY);

        let mut buf = [0u8; 2];
        let read = self
            .bus
            .read(&mut buf)
            .map_err(|e| SensorError::transaction(Stage::Readback, e))?;
        if read != buf.len() {
            return Err(SensorError::short(Stage::Readback, buf.len(), read));
        }

        Ok(u16::from_be_bytes(buf))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
