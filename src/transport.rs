//! The USB transport boundary.
//!
//! The crate never talks to the OS itself. Callers bind whichever vendor or
//! libusb-based driver they use to the [`Transport`] trait and hand the
//! implementation to [`Ft232x::open`](crate::Ft232x::open). All calls are
//! synchronous and blocking, with one in-flight request per device handle.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Chip capability tier, fixed for the lifetime of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipModel {
    /// Programmable MPSSE engine with two 8-bit pin banks. Supports I2C,
    /// SPI and GPIO.
    Ft232h,
    /// Fixed-rate synchronous bit-bang port plus a 4-bit CBUS nibble.
    /// Supports emulated SPI and GPIO; no I2C.
    Ft232r,
}

impl ChipModel {
    /// True when the chip carries the programmable shift engine.
    #[inline]
    pub fn has_mpsse(&self) -> bool {
        matches!(self, ChipModel::Ft232h)
    }
}

impl fmt::Display for ChipModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChipModel::Ft232h => write!(f, "FT232H"),
            ChipModel::Ft232r => write!(f, "FT232R"),
        }
    }
}

/// Identity of the chip behind a transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: ChipModel,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Pin operating mode selected with [`Transport::set_bit_mode`].
///
/// The values match the mode byte of the vendor driver's `SetBitMode` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BitMode {
    /// Leave any bit-bang mode and return to the default serial function.
    Reset = 0x00,
    AsyncBitbang = 0x01,
    /// Programmable shift engine (FT232H only).
    Mpsse = 0x02,
    /// Sample-then-drive port: input is captured the instant before each
    /// written byte takes effect on the outputs.
    SyncBitbang = 0x04,
    McuHost = 0x08,
    FastSerial = 0x10,
    /// Drives the 4-bit CBUS nibble; the mask byte carries directions in
    /// the upper nibble and output values in the lower.
    CbusBitbang = 0x20,
    SyncFifo = 0x40,
}

/// Failures reported by the transport layer, mirroring the vendor driver's
/// status codes. Always fatal to the current operation; the crate never
/// retries them except inside the single bounded bring-up retry.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("device not found")]
    DeviceNotFound,
    #[error("device handle is no longer valid")]
    InvalidHandle,
    #[error("device was removed")]
    DeviceRemoved,
    #[error("operation timed out")]
    Timeout,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("insufficient driver resources")]
    InsufficientResources,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("{0}")]
    Other(String),
}

/// Result alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Minimum contract the driver needs from a USB bridge handle.
///
/// `write` and `read` move raw bytes to and from the chip's FIFO. `read`
/// returns however many bytes are currently available, which may be zero;
/// the driver paces its own polling.
pub trait Transport {
    /// Identity of the attached chip. Must not change for the lifetime of
    /// the handle.
    fn device_info(&self) -> DeviceInfo;

    /// Hardware reset. Bytes queued by the device before the reset may
    /// still be pending afterwards; the caller is expected to drain them.
    fn reset(&mut self) -> TransportResult<()>;

    /// Writes raw bytes, returning how many were accepted.
    fn write(&mut self, buf: &[u8]) -> TransportResult<usize>;

    /// Reads available bytes into `buf`, returning how many were filled.
    /// A return of 0 means nothing was pending.
    fn read(&mut self, buf: &mut [u8]) -> TransportResult<usize>;

    /// Returns the instantaneous pin states for the active bit mode.
    fn get_bit_mode(&mut self) -> TransportResult<u8>;

    /// Selects a pin operating mode. The meaning of `mask` depends on the
    /// mode: a direction byte for the bit-bang modes, direction and value
    /// nibbles for CBUS.
    fn set_bit_mode(&mut self, mask: u8, mode: BitMode) -> TransportResult<()>;

    /// Sets the bit-bang frame clock (ignored in MPSSE mode, where the
    /// shift clock is programmed through the command stream).
    fn set_baud_rate(&mut self, baud_hz: u32) -> TransportResult<()>;

    /// Sets the USB transfer chunk size in bytes.
    fn set_usb_parameters(&mut self, transfer_size: u32) -> TransportResult<()>;

    /// Configures event/error byte injection; `None` disables a character.
    fn set_chars(&mut self, event: Option<u8>, error: Option<u8>) -> TransportResult<()>;

    /// Sets the driver-side read and write timeouts.
    fn set_timeouts(&mut self, read: Duration, write: Duration) -> TransportResult<()>;

    /// Sets the latency timer that flushes partial USB packets to the host.
    fn set_latency_timer(&mut self, latency: Duration) -> TransportResult<()>;

    /// Enables RTS/CTS flow control so the chip's FIFO cannot overflow
    /// during long shifts.
    fn set_flow_control_rts_cts(&mut self) -> TransportResult<()>;
}
