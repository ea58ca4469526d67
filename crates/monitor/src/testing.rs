//! In-memory stand-ins for the kernel interfaces, shared by unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Instant;

use soil_sensor::{SensorError, SensorPort, Stage};

use crate::gpio::{ControlFile, PinWriter};
use crate::telemetry::Reporter;

// ---------------------------------------------------------------------------
// Sysfs GPIO
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SysfsModel {
    exported: bool,
    writes: Vec<(ControlFile, String, Instant)>,
    short_on: Option<ControlFile>,
}

/// Models the kernel's export rules; clones share state so a test can keep
/// a handle after moving one into an actuator.
#[derive(Clone, Default)]
pub(crate) struct FakeSysfs {
    inner: Rc<RefCell<SysfsModel>>,
}

impl FakeSysfs {
    pub(crate) fn set_exported(&self, exported: bool) {
        self.inner.borrow_mut().exported = exported;
    }

    pub(crate) fn exported(&self) -> bool {
        self.inner.borrow().exported
    }

    /// The next write to `file` reports one byte fewer than given.
    pub(crate) fn short_write_on(&self, file: ControlFile) {
        self.inner.borrow_mut().short_on = Some(file);
    }

    pub(crate) fn writes(&self) -> Vec<(ControlFile, String)> {
        self.inner
            .borrow()
            .writes
            .iter()
            .map(|(f, v, _)| (*f, v.clone()))
            .collect()
    }

    /// Values written to the `value` file, in order.
    pub(crate) fn values(&self) -> Vec<String> {
        self.timed_values().into_iter().map(|(v, _)| v).collect()
    }

    pub(crate) fn timed_values(&self) -> Vec<(String, Instant)> {
        self.inner
            .borrow()
            .writes
            .iter()
            .filter(|(f, _, _)| *f == ControlFile::Value)
            .map(|(_, v, at)| (v.clone(), *at))
            .collect()
    }
}

impl PinWriter for FakeSysfs {
    fn write(&mut self, file: ControlFile, value: &str) -> io::Result<usize> {
        let mut m = self.inner.borrow_mut();
        match file {
            ControlFile::Export if m.exported => {
                return Err(io::Error::other("Device or resource busy"))
            }
            ControlFile::Export => m.exported = true,
            ControlFile::Unexport if !m.exported => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "Invalid argument"))
            }
            ControlFile::Unexport => m.exported = false,
            ControlFile::Direction | ControlFile::Value if !m.exported => {
                return Err(io::Error::new(io::ErrorKind::NotFound, "No such file or directory"))
            }
            ControlFile::Direction | ControlFile::Value => {}
        }
        m.writes.push((file, value.to_string(), Instant::now()));
        if m.short_on == Some(file) {
            m.short_on = None;
            return Ok(value.len() - 1);
        }
        Ok(value.len())
    }
}

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SensorModel {
    readings: VecDeque<Result<u8, Stage>>,
    writes: Vec<Vec<u8>>,
}

/// Replays scripted readings; a scripted `Err(stage)` becomes a transaction
/// error and an exhausted script reads as a short device read.
#[derive(Clone, Default)]
pub(crate) struct ScriptedSensor {
    inner: Rc<RefCell<SensorModel>>,
}

impl ScriptedSensor {
    pub(crate) fn new(readings: impl IntoIterator<Item = u8>) -> Self {
        let s = Self::default();
        s.inner.borrow_mut().readings = readings.into_iter().map(Ok).collect();
        s
    }

    pub(crate) fn push_failure(&self, stage: Stage) {
        self.inner.borrow_mut().readings.push_back(Err(stage));
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.borrow().writes.clone()
    }
}

impl SensorPort for ScriptedSensor {
    fn read_byte(&mut self) -> Result<u8, SensorError> {
        match self.inner.borrow_mut().readings.pop_front() {
            Some(Ok(v)) => Ok(v),
            Some(Err(stage)) => Err(SensorError::Transaction {
                stage,
                source: io::Error::other("scripted failure"),
            }),
            None => Err(SensorError::Transaction {
                stage: Stage::DeviceRead,
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "script exhausted"),
            }),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, SensorError> {
        self.inner.borrow_mut().writes.push(bytes.to_vec());
        Ok(bytes.len())
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub(crate) struct RecordingReporter {
    lines: Rc<RefCell<Vec<String>>>,
}

impl RecordingReporter {
    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }
}

impl Reporter for RecordingReporter {
    fn publish(&self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }
}
