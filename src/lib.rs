//! Software-defined I2C, SPI and GPIO over FTDI FT232H/FT232R USB bridges.
//!
//! The crate is the protocol translation layer: it turns bus-level
//! operations into the opcoded command stream of the FT232H's MPSSE shift
//! engine, or into synchronous bit-bang frames on the FT232R, which has no
//! shift engine. Talking USB is not its job - callers supply a
//! [`Transport`] implementation binding whatever driver they use (D2XX,
//! libftdi, a test double) and get back a verified [`Ft232x`] handle.
//!
//! # Capability tiers
//!
//! | | FT232H | FT232R |
//! |---|---|---|
//! | I2C | yes (MPSSE) | no |
//! | SPI | yes (MPSSE) | emulated, 2 bit-bang frames per bit |
//! | GPIO | 2 x 8 pins | 8 pins + 4-bit CBUS nibble |
//!
//! I2C, SPI and raw GPIO share the lower four pins of bank A, so at most
//! one of them is active per device at a time; see
//! [`BusClaim`].
//!
//! # Example
//!
//! ```no_run
//! use ft232x::{Ft232x, Result, Transport};
//!
//! fn read_chip_id<T: Transport>(transport: T) -> Result<u8> {
//!     let device = Ft232x::open(transport)?;
//!     let bus = device.i2c()?;
//!     let mut id = [0u8; 1];
//!     // register 0x0F of the peer at address 0x48
//!     bus.transfer(0x48, &[0x0F], &mut id)?;
//!     bus.close()?;
//!     Ok(id[0])
//! }
//! ```
//!
//! All calls are synchronous and blocking; a handle may be shared across
//! threads and serializes its operations internally.

pub mod error;
pub mod gpio;
pub mod i2c;
pub mod spi;
pub mod transport;

mod device;
mod mpsse;

pub use device::{BusClaim, Clock, Ft232x, SystemClock};
pub use error::{Error, Result};
pub use gpio::{Bank, Level, Pin, PinDirection};
pub use i2c::I2cBus;
pub use spi::{BitOrder, SpiConn, SpiMode, SpiPort, Transfer};
pub use transport::{BitMode, ChipModel, DeviceInfo, Transport, TransportError};
