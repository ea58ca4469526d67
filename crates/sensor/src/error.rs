use std::{fmt, io, path::PathBuf};

use thiserror::Error;

/// Which half of a register transaction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Writing the register-address pair.
    Address,
    /// Reading the two value bytes back.
    Readback,
    /// Single-byte read from the byte-stream device.
    DeviceRead,
    /// Command or value write to the byte-stream device.
    DeviceWrite,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address => write!(f, "register address write"),
            Self::Readback => write!(f, "register readback"),
            Self::DeviceRead => write!(f, "device read"),
            Self::DeviceWrite => write!(f, "device write"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SensorError {
    /// Transport failure or partial transfer. Never retried.
    #[error("hardware transaction failed during {stage}: {source}")]
    Transaction {
        stage: Stage,
        #[source]
        source: io::Error,
    },

    /// Every transaction succeeded but returned an implausible raw value.
    #[error("raw reading {last_raw} out of range after {attempts} attempts")]
    OutOfRange { attempts: usize, last_raw: u16 },

    #[error("failed to open sensor device {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SensorError {
    pub(crate) fn transaction(stage: Stage, source: io::Error) -> Self {
        Self::Transaction { stage, source }
    }

    /// A transfer that moved fewer bytes than requested.
    pub(crate) fn short(stage: Stage, expected: usize, actual: usize) -> Self {
        let kind = match stage {
            Stage::Address | Stage::DeviceWrite => io::ErrorKind::WriteZero,
            Stage::Readback | Stage::DeviceRead => io::ErrorKind::UnexpectedEof,
        };
        Self::transaction(
            stage,
            io::Error::new(kind, format!("partial transfer: {actual} of {expected} bytes")),
        )
    }
}
