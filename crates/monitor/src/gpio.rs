//! Pump relay control through the sysfs GPIO interface.
//!
//! The pin goes through `export` → `direction=out` → `value=1/0` →
//! `direction=in` → `unexport`. Every step is a single blocking write with
//! no retry; the kernel rejects exporting an exported pin, unexporting an
//! unexported one, and any direction/value write while unexported.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

pub(crate) const DEFAULT_GPIO_ROOT: &str = "/sys/class/gpio";
pub(crate) const DEFAULT_PUMP_PIN: u32 = 17;

/// One of the per-pin sysfs control files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlFile {
    Export,
    Unexport,
    Direction,
    Value,
}

impl fmt::Display for ControlFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Export => write!(f, "export"),
            Self::Unexport => write!(f, "unexport"),
            Self::Direction => write!(f, "direction"),
            Self::Value => write!(f, "value"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

/// What this process believes about the pin, updated only after a write
/// succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GpioPinState {
    pub(crate) exported: bool,
    pub(crate) direction: Direction,
}

#[derive(Debug, Error)]
pub(crate) enum GpioError {
    #[error("gpio{pin}: writing {value:?} to {file} failed: {source}")]
    Write {
        pin: u32,
        file: ControlFile,
        value: String,
        #[source]
        source: io::Error,
    },

    #[error("gpio{pin}: short write to {file}: {written} of {expected} bytes")]
    ShortWrite {
        pin: u32,
        file: ControlFile,
        written: usize,
        expected: usize,
    },
}

/// Write-only access to a pin's control files.
pub(crate) trait PinWriter {
    /// Write `value` to `file`, returning the number of bytes accepted.
    fn write(&mut self, file: ControlFile, value: &str) -> io::Result<usize>;
}

/// Real sysfs tree, e.g. `/sys/class/gpio`.
#[derive(Debug, Clone)]
pub(crate) struct SysfsWriter {
    root: PathBuf,
    pin: u32,
}

impl SysfsWriter {
    pub(crate) fn new(root: impl AsRef<Path>, pin: u32) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            pin,
        }
    }

    pub(crate) fn path(&self, file: ControlFile) -> PathBuf {
        match file {
            ControlFile::Export => self.root.join("export"),
            ControlFile::Unexport => self.root.join("unexport"),
            ControlFile::Direction => self.pin_dir().join("direction"),
            ControlFile::Value => self.pin_dir().join("value"),
        }
    }

    fn pin_dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.pin))
    }
}

impl PinWriter for SysfsWriter {
    fn write(&mut self, file: ControlFile, value: &str) -> io::Result<usize> {
        // No create: a missing file means the pin is not exported.
        let mut f = OpenOptions::new().write(true).open(self.path(file))?;
        f.write(value.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

/// Single-pin pump relay. Cycles `Disabled → Output → Disabled`.
pub(crate) struct GpioActuator<W> {
    pin: u32,
    writer: W,
    state: GpioPinState,
}

impl GpioActuator<SysfsWriter> {
    pub(crate) fn sysfs(root: impl AsRef<Path>, pin: u32) -> Self {
        Self::new(pin, SysfsWriter::new(root, pin))
    }
}

impl<W: PinWriter> GpioActuator<W> {
    pub(crate) fn new(pin: u32, writer: W) -> Self {
        Self {
            pin,
            writer,
            state: GpioPinState {
                exported: false,
                direction: Direction::In,
            },
        }
    }

    pub(crate) fn pin(&self) -> u32 {
        self.pin
    }

    pub(crate) fn state(&self) -> GpioPinState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn writer(&self) -> &W {
        &self.writer
    }

    /// Export the pin and make it an output. Fails if it is already exported.
    pub(crate) fn enable(&mut self) -> Result<(), GpioError> {
        self.write(ControlFile::Export, &self.pin.to_string())?;
        self.state.exported = true;

        self.write(ControlFile::Direction, Direction::Out.as_str())?;
        self.state.direction = Direction::Out;

        info!(pin = self.pin, "pump gpio enabled");
        Ok(())
    }

    /// Drive the relay on.
    pub(crate) fn on(&mut self) -> Result<(), GpioError> {
        self.write(ControlFile::Value, "1")?;
        debug!(pin = self.pin, "pump gpio high");
        Ok(())
    }

    /// Drive the relay off.
    pub(crate) fn off(&mut self) -> Result<(), GpioError> {
        self.write(ControlFile::Value, "0")?;
        debug!(pin = self.pin, "pump gpio low");
        Ok(())
    }

    /// Switch to input (drops drive whatever the last value was), then
    /// unexport. Fails if the pin is not exported.
    pub(crate) fn disable(&mut self) -> Result<(), GpioError> {
        self.write(ControlFile::Direction, Direction::In.as_str())?;
        self.state.direction = Direction::In;

        self.write(ControlFile::Unexport, &self.pin.to_string())?;
        self.state.exported = false;

        info!(pin = self.pin, "pump gpio disabled");
        Ok(())
    }

    fn write(&mut self, file: ControlFile, value: &str) -> Result<(), GpioError> {
        let written = self
            .writer
            .write(file, value)
            .map_err(|source| GpioError::Write {
                pin: self.pin,
                file,
                value: value.to_string(),
                source,
            })?;

        if written != value.len() {
            return Err(GpioError::ShortWrite {
                pin: self.pin,
                file,
                written,
                expected: value.len(),
            });
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
