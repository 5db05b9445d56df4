use thiserror::Error;

use crate::device::BusClaim;
use crate::gpio::Bank;
use crate::transport::{ChipModel, TransportError};

/// Errors surfaced by the driver.
///
/// Transport failures, protocol rejections (a peer NAK, a misconfigured
/// transfer) and claim conflicts are distinct variants so callers can tell
/// "the peer refused this" apart from "the link is broken".
#[derive(Error, Debug)]
pub enum Error {
    /// Error from the underlying USB transport, propagated unchanged.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// An I2C peer did not acknowledge a byte. `byte_index` counts every
    /// byte clocked out in the transaction, address bytes included.
    #[error("peer did not acknowledge byte {byte_index}")]
    Nack {
        /// Position of the rejected byte within the transaction.
        byte_index: usize,
    },
    /// Transfer width is not a whole number of bytes.
    #[error("transfer width of {bits} bits is not a multiple of 8")]
    NotByteAligned {
        /// The requested width in bits.
        bits: u32,
    },
    /// Full-duplex write and read buffers differ in length.
    #[error("write and read buffer lengths differ ({write_len} vs {read_len})")]
    BufferMismatch {
        /// Length of the write buffer.
        write_len: usize,
        /// Length of the read buffer.
        read_len: usize,
    },
    /// Requested operation exceeds what a single transfer can carry.
    #[error("requested operation size is too large (max {max}, got {actual})")]
    OperationTooLarge {
        /// Maximum allowed size for this operation.
        max: usize,
        /// Actual size requested.
        actual: usize,
    },
    /// The requested behavior is recognized but not supported yet.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    /// Requested clock frequency is above the interface's ceiling.
    #[error("clock frequency {requested} Hz exceeds the maximum supported rate ({maximum} Hz)")]
    ClockTooHigh {
        /// The frequency that was requested.
        requested: u32,
        /// Fastest rate the interface supports.
        maximum: u32,
    },
    /// Requested clock frequency is below the slowest achievable divisor.
    #[error("clock frequency {requested} Hz is below the minimum achievable rate ({minimum} Hz)")]
    ClockTooLow {
        /// The frequency that was requested.
        requested: u32,
        /// Slowest frequency the divisor can reach.
        minimum: u32,
    },
    /// Another bus is already using the shared pins on this device.
    #[error("bus claim conflict: {held} is active, cannot claim {requested}")]
    ClaimConflict {
        /// The claim currently held.
        held: BusClaim,
        /// The claim that was refused.
        requested: BusClaim,
    },
    /// The shift engine never verified after reset and one full retry.
    #[error("engine bring-up failed after {attempts} attempts")]
    BringUpFailed {
        /// Number of full bring-up attempts made.
        attempts: u32,
    },
    /// The engine's bad-opcode echo did not match the expected reply.
    #[error("engine verification failed: sent {sent:#04X}, echoed {echoed:02X?}")]
    EchoMismatch {
        /// The deliberately invalid opcode that was sent.
        sent: u8,
        /// The two bytes the engine answered with.
        echoed: [u8; 2],
    },
    /// Feature is not available on this chip model.
    #[error("not supported by {model}: {feature}")]
    UnsupportedByModel {
        /// The model that lacks the feature.
        model: ChipModel,
        /// What was requested.
        feature: &'static str,
    },
    /// Pin index outside the bank's valid range.
    #[error("pin index {index} out of range for bank {bank} (0-{max})")]
    PinOutOfRange {
        /// The bank that was addressed.
        bank: Bank,
        /// The invalid index.
        index: u8,
        /// Highest valid index for this bank on this model.
        max: u8,
    },
    /// I2C address outside the 7-bit range.
    #[error("I2C address 0x{0:02X} out of 7-bit range")]
    InvalidAddress(u8),
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn i2c_unsupported(model: ChipModel) -> Error {
    Error::UnsupportedByModel {
        model,
        feature: "I2C requires the programmable shift engine",
    }
}
