//! Client for the privileged soil sensor byte-stream device.
//!
//! The device node is registered by a kernel driver that implements the
//! same command protocol as [`SoilSensor`](crate::SoilSensor); this side only
//! opens it and moves bytes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::device::SensorPort;
use crate::error::{SensorError, Stage};

pub const DEFAULT_DEVICE_PATH: &str = "/dev/i2c-soil-drv";

pub struct CharDevice {
    file: File,
    path: PathBuf,
}

impl CharDevice {
    /// Open the device read+write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SensorError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| SensorError::Open {
                path: path.clone(),
                source,
            })?;

        info!(path = %path.display(), "sensor device opened");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SensorPort for CharDevice {
    fn read_byte(&mut self) -> Result<u8, SensorError> {
        let mut buf = [0u8; 1];
        let n = self
            .file
            .read(&mut buf)
            .map_err(|e| SensorError::transaction(Stage::DeviceRead, e))?;
        if n != buf.len() {
            return Err(SensorError::short(Stage::DeviceRead, buf.len(), n));
        }
        Ok(buf[0])
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, SensorError> {
        self.file
            .write(bytes)
            .map_err(|e| SensorError::transaction(Stage::DeviceWrite, e))
    }
}
