//! Logical pins over the chip's two banks.
//!
//! A [`Pin`] is a stateless view into its bank's cached direction and value
//! bytes; all state lives in the device handle so I2C, SPI and GPIO users
//! of the same bank can never disagree about what was last driven.
//!
//! Reads of an output pin are answered from the cache. Reads of an input
//! pin issue a hardware read and pay a full USB round trip, so tight
//! polling loops should prefer driving known values over re-reading.

use std::fmt;

use crate::device::Ft232x;
use crate::error::Result;
use crate::transport::Transport;

/// One of the chip's two pin groups.
///
/// On the FT232H these are the AD and AC buses; on the FT232R, the
/// bit-bang byte and the 4-bit CBUS nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bank {
    A,
    B,
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bank::A => write!(f, "A"),
            Bank::B => write!(f, "B"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    #[inline]
    pub fn is_high(&self) -> bool {
        matches!(self, Level::High)
    }

    #[inline]
    pub(crate) fn from_bit(set: bool) -> Self {
        if set {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// Last-known direction and value bytes for one bank. Bit set means
/// output / high. The cache must always equal the bytes last written to
/// the device; every write path updates it before touching the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PinBank {
    pub direction: u8,
    pub value: u8,
}

impl PinBank {
    pub(crate) fn set_direction_bit(&mut self, mask: u8, output: bool) {
        if output {
            self.direction |= mask;
        } else {
            self.direction &= !mask;
        }
    }

    pub(crate) fn set_value_bit(&mut self, mask: u8, high: bool) {
        if high {
            self.value |= mask;
        } else {
            self.value &= !mask;
        }
    }
}

/// An independently addressable GPIO, obtained from
/// [`Ft232x::pin`](crate::Ft232x::pin).
///
/// Pins A0-A3 are shared with the I2C and SPI buses; touching their
/// direction or value takes the GPIO claim and fails while a bus holds
/// the pins.
pub struct Pin<'d, T: Transport> {
    pub(crate) device: &'d Ft232x<T>,
    pub(crate) bank: Bank,
    pub(crate) index: u8,
}

impl<T: Transport> Pin<'_, T> {
    #[inline]
    pub fn bank(&self) -> Bank {
        self.bank
    }

    #[inline]
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Bit mask of this pin within its bank.
    #[inline]
    pub fn mask(&self) -> u8 {
        1 << self.index
    }

    pub fn set_direction(&self, direction: PinDirection) -> Result<()> {
        self.device.pin_set_direction(self.bank, self.mask(), direction)
    }

    /// Drives the pin to `level`, switching it to output if necessary.
    pub fn write(&self, level: Level) -> Result<()> {
        self.device.pin_write(self.bank, self.mask(), level)
    }

    /// Returns the pin's level: the cached value for outputs, a fresh
    /// hardware read for inputs.
    pub fn read(&self) -> Result<Level> {
        self.device.pin_read(self.bank, self.mask())
    }
}

impl<T: Transport> fmt::Debug for Pin<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pin({}{})", self.bank, self.index)
    }
}
