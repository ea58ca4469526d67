//! Soil moisture sensor access: the seesaw register transaction, outlier
//! rejection and normalization, the in-band simulation command protocol, and
//! a client for the kernel-registered sensor device node.

pub mod acquisition;
pub mod bus;
pub mod chardev;
pub mod device;
pub mod error;

pub use acquisition::{normalize, Acquisition};
pub use bus::{Delay, RegisterBus, ThreadDelay};
#[cfg(feature = "i2c")]
pub use bus::RppalBus;
pub use chardev::{CharDevice, DEFAULT_DEVICE_PATH};
pub use device::{SensorPort, SensorState, SoilSensor, WriteEffect, SIM_OFF_CMD, SIM_ON_CMD};
pub use error::{SensorError, Stage};
