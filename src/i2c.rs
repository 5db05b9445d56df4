//! I2C over the programmable shift engine (FT232H only).
//!
//! The bus uses three fixed pins on bank A: A0 = SCL, A1 = SDA out,
//! A2 = SDA in, with A1 and A2 wired together externally. Open-drain
//! behavior comes from the engine's tristate map, and three-phase clocking
//! holds SDA stable across the whole SCL-high phase.
//!
//! Start and stop conditions are built from repeated identical bank
//! frames: each frame consumes a fixed amount of engine time, which stands
//! in for a real hold-time timer. The repeat count is empirically derived;
//! new silicon revisions should be re-validated against the minimum hold
//! times rather than trusting it blindly.

use std::fmt;

use log::{debug, trace};

use crate::device::{BusClaim, Ft232x, Inner};
use crate::error::{self, Error, Result};
use crate::gpio::Bank;
use crate::mpsse::{self, ClockEdge, Command, ShiftFlags};
use crate::spi::BitOrder;
use crate::transport::Transport;

const SCL: u8 = 0x01;
const SDA_OUT: u8 = 0x02;
const SDA_IN: u8 = 0x04;

// Everything on the bank is driven except the SDA sense pin.
const BUS_DIR: u8 = !SDA_IN;
// SDA-out released so the peer can drive the acknowledgement bit.
const ACK_DIR: u8 = BUS_DIR & !SDA_OUT;

// Bank value frames. Bits outside the bus pins stay high.
const IDLE: u8 = 0xFF; // SCL and SDA both released high
const SDA_LOW: u8 = !SDA_OUT; // SCL still high
const BOTH_LOW: u8 = !(SCL | SDA_OUT);
const SCL_LOW: u8 = !SCL; // SDA released

// Frames repeated per line transition to approximate hold time.
const HOLD_FRAMES: usize = 4;

/// The clocked engine cannot stretch; a conservative default reduces the
/// chance a slow peer misses bits.
pub const DEFAULT_SCL_HZ: u32 = 100_000;

/// Fastest SCL rate the bus accepts.
pub const MAX_SCL_HZ: u32 = 10_000_000;

const MSB_OUT_FALLING: ShiftFlags = ShiftFlags {
    out_edge: Some(ClockEdge::Falling),
    in_edge: None,
    order: BitOrder::MsbFirst,
};
const MSB_IN_RISING: ShiftFlags = ShiftFlags {
    out_edge: None,
    in_edge: Some(ClockEdge::Rising),
    order: BitOrder::MsbFirst,
};

/// An open I2C bus, obtained from [`Ft232x::i2c`].
///
/// Holds the device's bus claim until [`I2cBus::close`] or drop.
pub struct I2cBus<'d, T: Transport> {
    device: &'d Ft232x<T>,
    closed: bool,
}

impl<'d, T: Transport> I2cBus<'d, T> {
    pub(crate) fn open(device: &'d Ft232x<T>) -> Result<Self> {
        if !device.model().has_mpsse() {
            return Err(error::i2c_unsupported(device.model()));
        }
        let mut inner = device.lock_inner();
        inner.take_claim(BusClaim::I2c)?;
        if let Err(e) = setup(&mut inner) {
            inner.release_claim(BusClaim::I2c);
            return Err(e);
        }
        drop(inner);
        debug!("I2C bus open at {DEFAULT_SCL_HZ} Hz");
        Ok(Self {
            device,
            closed: false,
        })
    }

    /// Reprograms the SCL rate. The achieved rate never exceeds `scl_hz`;
    /// requests above [`MAX_SCL_HZ`] are rejected.
    pub fn set_speed(&self, scl_hz: u32) -> Result<()> {
        if scl_hz > MAX_SCL_HZ {
            return Err(Error::ClockTooHigh {
                requested: scl_hz,
                maximum: MAX_SCL_HZ,
            });
        }
        let divisor = mpsse::three_phase_divisor(scl_hz)?;
        let mut inner = self.device.lock_inner();
        inner.send(&[Command::FastBaseClock, Command::ClockDivisor { divisor }])?;
        debug!("I2C clock set to {scl_hz} Hz");
        Ok(())
    }

    /// One atomic transaction: optional write phase, then an optional read
    /// phase behind a repeated start, then stop.
    ///
    /// The first NAK fails the whole transaction with [`Error::Nack`]; no
    /// further bytes are clocked after it. Per the receiver-terminated
    /// read convention, the final read byte is answered with NAK.
    pub fn transfer(&self, address: u8, write: &[u8], read: &mut [u8]) -> Result<()> {
        if address > 0x7F {
            return Err(Error::InvalidAddress(address));
        }
        let mut inner = self.device.lock_inner();
        trace!(
            "I2C transfer addr {address:#04X}: {} out, {} in",
            write.len(),
            read.len()
        );
        let result = transaction(&mut inner, address, write, read);
        if result.is_err() {
            // leave the wire in a defined state for the next transaction
            let _ = stop(&mut inner);
        }
        result
    }

    /// Restores two-phase clocking and clears the tristate map, then
    /// releases the claim.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut inner = self.device.lock_inner();
        let result = inner.send(&[
            Command::ThreePhaseClocking { enabled: false },
            Command::Tristate {
                bank_a: 0,
                bank_b: 0,
            },
        ]);
        inner.release_claim(BusClaim::I2c);
        debug!("I2C bus closed");
        result
    }
}

impl<T: Transport> fmt::Debug for I2cBus<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I2cBus({:?})", self.device)
    }
}

impl<T: Transport> Drop for I2cBus<'_, T> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn setup<T: Transport>(inner: &mut Inner<T>) -> Result<()> {
    inner.send(&[
        Command::FastBaseClock,
        Command::ClockDivisor {
            divisor: mpsse::three_phase_divisor(DEFAULT_SCL_HZ)?,
        },
        Command::ThreePhaseClocking { enabled: true },
        Command::Tristate {
            bank_a: SCL | SDA_OUT | SDA_IN,
            bank_b: 0,
        },
    ])?;
    lines_idle(inner)
}

fn transaction<T: Transport>(
    inner: &mut Inner<T>,
    address: u8,
    write: &[u8],
    read: &mut [u8],
) -> Result<()> {
    let mut byte_index = 0;
    if !write.is_empty() || read.is_empty() {
        start(inner)?;
        write_byte(inner, address << 1, byte_index)?;
        byte_index += 1;
        for &byte in write {
            write_byte(inner, byte, byte_index)?;
            byte_index += 1;
        }
    }
    if !read.is_empty() {
        // repeated start between the phases keeps the bus owned
        start(inner)?;
        write_byte(inner, (address << 1) | 1, byte_index)?;
        let last = read.len() - 1;
        for (i, slot) in read.iter_mut().enumerate() {
            *slot = read_byte(inner, i == last)?;
        }
    }
    stop(inner)
}

/// Emits one bank frame `HOLD_FRAMES` times.
fn hold<T: Transport>(inner: &mut Inner<T>, direction: u8, value: u8) -> Result<()> {
    let frame = Command::SetBank {
        bank: Bank::A,
        direction,
        value,
    };
    inner.send(&[frame; HOLD_FRAMES])
}

fn lines_idle<T: Transport>(inner: &mut Inner<T>) -> Result<()> {
    hold(inner, BUS_DIR, IDLE)
}

/// Start (or repeated start): both lines high, SDA falls while SCL stays
/// high, then SCL falls.
fn start<T: Transport>(inner: &mut Inner<T>) -> Result<()> {
    hold(inner, BUS_DIR, IDLE)?;
    hold(inner, BUS_DIR, SDA_LOW)?;
    hold(inner, BUS_DIR, BOTH_LOW)
}

/// Stop: SDA low while SCL is low, SCL rises, then SDA rises.
fn stop<T: Transport>(inner: &mut Inner<T>) -> Result<()> {
    hold(inner, BUS_DIR, BOTH_LOW)?;
    hold(inner, BUS_DIR, SDA_LOW)?;
    hold(inner, BUS_DIR, IDLE)
}

/// Clocks one byte out MSB first, then samples the acknowledgement bit
/// with SDA released. Low means ACK.
fn write_byte<T: Transport>(inner: &mut Inner<T>, byte: u8, byte_index: usize) -> Result<()> {
    inner.send(&[
        Command::ShiftBits {
            flags: MSB_OUT_FALLING,
            bits: 8,
            out: Some(byte),
        },
        Command::SetBank {
            bank: Bank::A,
            direction: ACK_DIR,
            value: SCL_LOW,
        },
        Command::ShiftBits {
            flags: MSB_IN_RISING,
            bits: 1,
            out: None,
        },
        Command::Flush,
    ])?;
    let mut ack = [0u8; 1];
    inner.read_exact(&mut ack)?;
    // retake SDA; SCL idles low between bytes
    inner.send(&[Command::SetBank {
        bank: Bank::A,
        direction: BUS_DIR,
        value: SCL_LOW,
    }])?;
    if ack[0] & 0x01 != 0 {
        debug!("NAK on byte {byte_index}");
        return Err(Error::Nack { byte_index });
    }
    Ok(())
}

/// Clocks one byte in MSB first, then answers with ACK, or NAK on the
/// final byte of the transaction.
fn read_byte<T: Transport>(inner: &mut Inner<T>, last: bool) -> Result<u8> {
    let ack_bit = if last { 0x80 } else { 0x00 };
    inner.send(&[
        Command::SetBank {
            bank: Bank::A,
            direction: ACK_DIR,
            value: SCL_LOW,
        },
        Command::ShiftBits {
            flags: MSB_IN_RISING,
            bits: 8,
            out: None,
        },
        Command::SetBank {
            bank: Bank::A,
            direction: BUS_DIR,
            value: SCL_LOW,
        },
        Command::ShiftBits {
            flags: MSB_OUT_FALLING,
            bits: 1,
            out: Some(ack_bit),
        },
        Command::Flush,
    ])?;
    let mut byte = [0u8; 1];
    inner.read_exact(&mut byte)?;
    Ok(byte[0])
}
