//! Transport seam between the acquisition algorithm and the physical sensor.
//!
//! The `i2c` feature gates the real rppal-backed bus; without it only the
//! trait is available and callers (or tests) provide their own transport.

use std::{io, thread, time::Duration};

#[cfg(feature = "i2c")]
use rppal::i2c::I2c;

/// Raw byte transport to the sensor's register file.
///
/// Both calls return how many bytes actually moved; the caller decides
/// whether a partial transfer is an error.
pub trait RegisterBus {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<B: RegisterBus + ?Sized> RegisterBus for Box<B> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        (**self).write(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }
}

/// Blocking wait used for the settle delay.
pub trait Delay {
    fn delay(&mut self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn delay(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

// ---------------------------------------------------------------------------
// Real I2C bus (needs rppal and Raspberry Pi hardware)
// ---------------------------------------------------------------------------

/// Seesaw soil sensor on a Raspberry Pi I2C bus.
#[cfg(feature = "i2c")]
pub struct RppalBus {
    i2c: I2c,
}

#[cfg(feature = "i2c")]
impl RppalBus {
    /// Open `/dev/i2c-<bus>` and address the sensor at `addr`.
    pub fn open(bus: u8, addr: u16) -> io::Result<Self> {
        let mut i2c = I2c::with_bus(bus).map_err(io::Error::other)?;
        i2c.set_slave_address(addr).map_err(io::Error::other)?;

        tracing::info!(
            bus,
            addr = format_args!("0x{addr:02x}"),
            "soil sensor bus opened"
        );

        Ok(Self { i2c })
    }
}

#[cfg(feature = "i2c")]
impl RegisterBus for RppalBus {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.i2c.write(bytes).map_err(io::Error::other)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.i2c.read(buf).map_err(io::Error::other)
    }
}
