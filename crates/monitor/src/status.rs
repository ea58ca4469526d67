//! Plain-text status lines, logged and published as telemetry payloads.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusEvent {
    Started,
    Moisture(u8),
    PumpOn { run_time: Duration },
    PumpOff,
    Sleeping { interval: Duration },
    ShuttingDown,
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "Init done, entering main loop"),
            Self::Moisture(v) => write!(f, "Current moisture={v}"),
            Self::PumpOn { run_time } => write!(f, "Pump on, runtime={} sec", run_time.as_secs()),
            Self::PumpOff => write!(f, "Pump off"),
            Self::Sleeping { interval } => write!(f, "Sleeping for {} sec", interval.as_secs()),
            Self::ShuttingDown => write!(f, "Shutting down"),
        }
    }
}
