//! Command stream encoder for the FT232H's programmable shift engine.
//!
//! The engine consumes a byte stream of opcoded commands. Everything the
//! rich tier does - GPIO banks, clock programming, shift transfers,
//! open-drain setup - reduces to [`Command`] values encoded here, so the
//! bit-level contract is auditable in one place and testable without a
//! transport.

use crate::error::{Error, Result};
use crate::gpio::Bank;
use crate::spi::BitOrder;

const SET_BITS_LOW: u8 = 0x80;
const READ_BITS_LOW: u8 = 0x81;
const SET_BITS_HIGH: u8 = 0x82;
const READ_BITS_HIGH: u8 = 0x83;
const LOOPBACK_ON: u8 = 0x84;
const LOOPBACK_OFF: u8 = 0x85;
const TCK_DIVISOR: u8 = 0x86;
const SEND_IMMEDIATE: u8 = 0x87;
const DIVIDE_BY_5_OFF: u8 = 0x8A;
const DIVIDE_BY_5_ON: u8 = 0x8B;
const THREE_PHASE_ON: u8 = 0x8C;
const THREE_PHASE_OFF: u8 = 0x8D;
const ADAPTIVE_CLOCKING_OFF: u8 = 0x97;
const DATA_TRISTATE: u8 = 0x9E;

// A shift opcode is the OR of its flag bits; there is no separate opcode
// namespace for the 64 combinations.
const SHIFT_OUT_FALLING: u8 = 0x01;
const SHIFT_BIT_GRANULAR: u8 = 0x02;
const SHIFT_IN_FALLING: u8 = 0x04;
const SHIFT_LSB_FIRST: u8 = 0x08;
const SHIFT_WRITE: u8 = 0x10;
const SHIFT_READ: u8 = 0x20;

/// Deliberately invalid opcodes used for liveness verification. The engine
/// answers any opcode it does not recognize with [`BAD_OPCODE_ECHO`]
/// followed by the offending byte.
pub(crate) const BAD_OPCODE_A: u8 = 0xAA;
pub(crate) const BAD_OPCODE_B: u8 = 0xAB;
pub(crate) const BAD_OPCODE_ECHO: u8 = 0xFA;

/// Longest byte-granular shift one opcode can carry.
pub(crate) const MAX_SHIFT_LEN: usize = 65536;

/// Shift clock ceiling with the divide-by-5 prescaler off.
pub(crate) const BASE_CLOCK_FAST_HZ: u32 = 30_000_000;
/// Shift clock ceiling with the divide-by-5 prescaler on.
pub(crate) const BASE_CLOCK_SLOW_HZ: u32 = 6_000_000;

const MAX_DIVISOR: u64 = 65536;

/// Clock edge a shift transfer drives or samples on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClockEdge {
    Rising,
    Falling,
}

/// Edge and bit-order selection for a shift transfer. `out_edge`/`in_edge`
/// of `None` means the transfer does not write/read respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ShiftFlags {
    pub out_edge: Option<ClockEdge>,
    pub in_edge: Option<ClockEdge>,
    pub order: BitOrder,
}

impl ShiftFlags {
    fn opcode(&self, bit_granular: bool) -> u8 {
        let mut op = 0;
        if let Some(edge) = self.out_edge {
            op |= SHIFT_WRITE;
            if edge == ClockEdge::Falling {
                op |= SHIFT_OUT_FALLING;
            }
        }
        if let Some(edge) = self.in_edge {
            op |= SHIFT_READ;
            if edge == ClockEdge::Falling {
                op |= SHIFT_IN_FALLING;
            }
        }
        if self.order == BitOrder::LsbFirst {
            op |= SHIFT_LSB_FIRST;
        }
        if bit_granular {
            op |= SHIFT_BIT_GRANULAR;
        }
        op
    }
}

/// One engine command. [`Command::encode`] appends the exact wire bytes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Command<'a> {
    /// Drive a bank's direction and value bytes (bit set = output / high).
    SetBank { bank: Bank, direction: u8, value: u8 },
    /// Request a bank's pin states; the engine answers with one byte.
    ReadBank { bank: Bank },
    /// Program the shift clock divisor. Callers pass the raw 16-bit wire
    /// field, which is the divisor minus one.
    ClockDivisor { divisor: u16 },
    /// Divide-by-5 prescaler off: 30 MHz shift clock ceiling.
    FastBaseClock,
    /// Divide-by-5 prescaler on: 6 MHz shift clock ceiling.
    SlowBaseClock,
    /// Three-phase clocking holds data across the whole clock-high phase,
    /// as I2C requires.
    ThreePhaseClocking { enabled: bool },
    AdaptiveClockingOff,
    Loopback { enabled: bool },
    /// Open-drain emulation: masked pins drive low for 0 and float for 1.
    Tristate { bank_a: u8, bank_b: u8 },
    /// Flush the engine's response buffer to the host immediately.
    Flush,
    /// Byte-granular shift of `len` bytes (1..=65536). `out` must carry
    /// exactly `len` bytes when the flags write.
    ShiftBytes {
        flags: ShiftFlags,
        len: usize,
        out: Option<&'a [u8]>,
    },
    /// Bit-granular shift of 1..=8 bits within a single byte.
    ShiftBits {
        flags: ShiftFlags,
        bits: u8,
        out: Option<u8>,
    },
}

impl Command<'_> {
    /// Appends this command's wire bytes to `buf`.
    pub(crate) fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        match *self {
            Command::SetBank {
                bank,
                direction,
                value,
            } => {
                let op = match bank {
                    Bank::A => SET_BITS_LOW,
                    Bank::B => SET_BITS_HIGH,
                };
                buf.extend_from_slice(&[op, value, direction]);
            }
            Command::ReadBank { bank } => {
                buf.push(match bank {
                    Bank::A => READ_BITS_LOW,
                    Bank::B => READ_BITS_HIGH,
                });
            }
            Command::ClockDivisor { divisor } => {
                buf.extend_from_slice(&[TCK_DIVISOR, divisor as u8, (divisor >> 8) as u8]);
            }
            Command::FastBaseClock => buf.push(DIVIDE_BY_5_OFF),
            Command::SlowBaseClock => buf.push(DIVIDE_BY_5_ON),
            Command::ThreePhaseClocking { enabled } => {
                buf.push(if enabled { THREE_PHASE_ON } else { THREE_PHASE_OFF });
            }
            Command::AdaptiveClockingOff => buf.push(ADAPTIVE_CLOCKING_OFF),
            Command::Loopback { enabled } => {
                buf.push(if enabled { LOOPBACK_ON } else { LOOPBACK_OFF });
            }
            Command::Tristate { bank_a, bank_b } => {
                buf.extend_from_slice(&[DATA_TRISTATE, bank_a, bank_b]);
            }
            Command::Flush => buf.push(SEND_IMMEDIATE),
            Command::ShiftBytes { flags, len, out } => {
                if len == 0 || len > MAX_SHIFT_LEN {
                    return Err(Error::OperationTooLarge {
                        max: MAX_SHIFT_LEN,
                        actual: len,
                    });
                }
                if let Some(data) = out {
                    if data.len() != len {
                        return Err(Error::BufferMismatch {
                            write_len: data.len(),
                            read_len: len,
                        });
                    }
                }
                // length field is count-minus-one, little endian
                let n = (len - 1) as u16;
                buf.extend_from_slice(&[flags.opcode(false), n as u8, (n >> 8) as u8]);
                if let Some(data) = out {
                    buf.extend_from_slice(data);
                }
            }
            Command::ShiftBits { flags, bits, out } => {
                if bits == 0 || bits > 8 {
                    return Err(Error::OperationTooLarge {
                        max: 8,
                        actual: bits as usize,
                    });
                }
                buf.extend_from_slice(&[flags.opcode(true), bits - 1]);
                if let Some(data) = out {
                    buf.push(data);
                }
            }
        }
        Ok(())
    }
}

/// A resolved shift clock: which base to select and the divisor to program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClockSetting {
    /// Raw 16-bit divisor field (divisor-minus-1).
    pub divisor: u16,
    /// True when the divide-by-5 prescaler must be enabled.
    pub slow_base: bool,
    /// The frequency the hardware will actually produce, always <= target.
    pub achieved_hz: u32,
}

/// Resolves a target frequency to the closest achievable setting that does
/// not exceed it. Callers rely on the ceiling contract: the achieved rate
/// is never silently higher than requested.
pub(crate) fn clock_setting(target_hz: u32) -> Result<ClockSetting> {
    let minimum = ((BASE_CLOCK_SLOW_HZ as u64 + MAX_DIVISOR - 1) / MAX_DIVISOR) as u32;
    if target_hz < minimum {
        return Err(Error::ClockTooLow {
            requested: target_hz,
            minimum,
        });
    }
    let mut base = BASE_CLOCK_FAST_HZ;
    let mut slow_base = false;
    let mut div = ceil_div(base as u64, target_hz as u64);
    if div > MAX_DIVISOR {
        base = BASE_CLOCK_SLOW_HZ;
        slow_base = true;
        div = ceil_div(base as u64, target_hz as u64);
        if div > MAX_DIVISOR {
            return Err(Error::ClockTooLow {
                requested: target_hz,
                minimum,
            });
        }
    }
    Ok(ClockSetting {
        divisor: (div - 1) as u16,
        slow_base,
        achieved_hz: (base as u64 / div) as u32,
    })
}

/// Divisor for an SCL rate under three-phase clocking, where a full clock
/// period spans three phases instead of two:
/// `SCL = 60 MHz / ((1 + divisor) * 3)`.
pub(crate) fn three_phase_divisor(target_hz: u32) -> Result<u16> {
    let minimum = ((60_000_000 + 3 * MAX_DIVISOR - 1) / (3 * MAX_DIVISOR)) as u32;
    if target_hz < minimum {
        return Err(Error::ClockTooLow {
            requested: target_hz,
            minimum,
        });
    }
    let div = ceil_div(60_000_000, 3 * target_hz as u64).min(MAX_DIVISOR);
    Ok((div - 1) as u16)
}

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}
