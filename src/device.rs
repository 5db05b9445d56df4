//! Device handle, bring-up state machine and shared pin state.
//!
//! One [`Ft232x`] owns one transport connection plus the cached pin-bank
//! state and the bus claim. A single mutex serializes every operation that
//! touches either the cache or the transport, because the software model
//! and the hardware state must change together.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::gpio::{Bank, Level, Pin, PinBank, PinDirection};
use crate::i2c::I2cBus;
use crate::mpsse::{self, Command};
use crate::spi::SpiPort;
use crate::transport::{BitMode, ChipModel, DeviceInfo, Transport, TransportError};

/// Exclusive use of the shared lower-bank pins (A0-A3).
///
/// At most one claim is active per device. Buses take theirs at open and
/// release it at close; raw GPIO on a shared pin takes the `Gpio` claim
/// implicitly and holds it until [`Ft232x::release_gpio`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusClaim {
    I2c,
    Spi,
    Gpio,
}

impl fmt::Display for BusClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusClaim::I2c => write!(f, "I2C"),
            BusClaim::Spi => write!(f, "SPI"),
            BusClaim::Gpio => write!(f, "GPIO"),
        }
    }
}

/// Time source used for verification deadlines and read pacing.
///
/// Injectable so tests can simulate the bring-up timeout without waiting
/// out real wall-clock time.
pub trait Clock: Send {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock [`Clock`] used outside tests.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

// Fixed tuning recipe applied once per open. These are driver parameters,
// not protocol semantics.
const USB_TRANSFER_SIZE: u32 = 65536;
const IO_TIMEOUT: Duration = Duration::from_secs(5);
const LATENCY: Duration = Duration::from_millis(1);

// Engine verification: poll up to 200 ms for the bad-opcode echo, sleeping
// briefly between polls instead of busy-spinning.
const VERIFY_TIMEOUT: Duration = Duration::from_millis(200);
const POLL_SLEEP: Duration = Duration::from_micros(100);

// Nothing legitimate queues this much across a reset.
const DRAIN_LIMIT: usize = 4096;

// Conservative bit-bang frame clock; SPI configuration reprograms it.
const DEFAULT_FRAME_BAUD: u32 = 62_500;

// Lower nibble of bank A is shared between I2C, SPI and raw GPIO.
const SHARED_PIN_MASK: u8 = 0x0F;

/// Handle to one FT232H or FT232R behind a [`Transport`].
///
/// Obtained with [`Ft232x::open`], which runs the full bring-up sequence
/// and fails if the chip never becomes usable. The handle is `Sync`; all
/// operations serialize on an internal lock.
pub struct Ft232x<T: Transport> {
    inner: Mutex<Inner<T>>,
    info: DeviceInfo,
}

pub(crate) struct Inner<T: Transport> {
    pub(crate) transport: T,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) model: ChipModel,
    pub(crate) bank_a: PinBank,
    pub(crate) bank_b: PinBank,
    pub(crate) claim: Option<BusClaim>,
    /// SPI clock ceiling cached per claim; reprogrammed only downward.
    pub(crate) spi_ceiling_hz: Option<u32>,
}

impl<T: Transport> Ft232x<T> {
    /// Opens the device: reset, common tuning, engine verification (rich
    /// tier) or bit-bang initialization (simple tier). One full retry is
    /// attempted before the device is reported unusable.
    pub fn open(transport: T) -> Result<Self> {
        Self::open_with_clock(transport, Box::new(SystemClock))
    }

    /// Like [`Ft232x::open`] with an explicit time source.
    pub fn open_with_clock(transport: T, clock: Box<dyn Clock>) -> Result<Self> {
        let info = transport.device_info();
        let mut inner = Inner {
            transport,
            clock,
            model: info.model,
            bank_a: PinBank::default(),
            bank_b: PinBank::default(),
            claim: None,
            spi_ceiling_hz: None,
        };
        inner.bring_up()?;
        Ok(Self {
            inner: Mutex::new(inner),
            info,
        })
    }

    pub fn model(&self) -> ChipModel {
        self.info.model
    }

    pub fn vendor_id(&self) -> u16 {
        self.info.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.info.product_id
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, Inner<T>> {
        // a panic elsewhere must not wedge the device; the cache is
        // resynchronized by the next hardware read
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a handle to one logical pin. Bank B on the FT232R exposes
    /// only the 4-bit CBUS nibble.
    pub fn pin(&self, bank: Bank, index: u8) -> Result<Pin<'_, T>> {
        let max = match (self.info.model, bank) {
            (ChipModel::Ft232r, Bank::B) => 3,
            _ => 7,
        };
        if index > max {
            return Err(Error::PinOutOfRange { bank, index, max });
        }
        Ok(Pin {
            device: self,
            bank,
            index,
        })
    }

    /// Opens the I2C bus on pins A0-A2, claiming the shared pins.
    pub fn i2c(&self) -> Result<I2cBus<'_, T>> {
        I2cBus::open(self)
    }

    /// Opens the SPI port on pins A0-A3, claiming the shared pins.
    pub fn spi(&self) -> Result<SpiPort<'_, T>> {
        SpiPort::open(self)
    }

    /// Drives a whole bank's direction and value bytes in one command.
    pub fn bank_write(&self, bank: Bank, direction: u8, value: u8) -> Result<()> {
        let mut inner = self.lock_inner();
        if bank == Bank::A {
            inner.guard_shared_pins()?;
        }
        inner.apply_bank(bank, PinBank { direction, value })
    }

    /// Forces a hardware read of a bank, refreshing the cached value.
    /// This is the escape hatch for state that may have changed
    /// externally; plain pin reads of outputs never leave the cache.
    pub fn bank_read(&self, bank: Bank) -> Result<u8> {
        self.lock_inner().fetch_bank(bank)
    }

    /// Releases the implicit GPIO claim taken by touching a shared pin.
    pub fn release_gpio(&self) {
        let mut inner = self.lock_inner();
        if inner.claim == Some(BusClaim::Gpio) {
            inner.claim = None;
        }
    }

    pub(crate) fn pin_set_direction(
        &self,
        bank: Bank,
        mask: u8,
        direction: PinDirection,
    ) -> Result<()> {
        let mut inner = self.lock_inner();
        if bank == Bank::A && mask & SHARED_PIN_MASK != 0 {
            inner.guard_shared_pins()?;
        }
        let mut state = *inner.bank(bank);
        state.set_direction_bit(mask, direction == PinDirection::Output);
        inner.apply_bank(bank, state)
    }

    pub(crate) fn pin_write(&self, bank: Bank, mask: u8, level: Level) -> Result<()> {
        let mut inner = self.lock_inner();
        if bank == Bank::A && mask & SHARED_PIN_MASK != 0 {
            inner.guard_shared_pins()?;
        }
        let mut state = *inner.bank(bank);
        state.set_direction_bit(mask, true);
        state.set_value_bit(mask, level.is_high());
        inner.apply_bank(bank, state)
    }

    pub(crate) fn pin_read(&self, bank: Bank, mask: u8) -> Result<Level> {
        let mut inner = self.lock_inner();
        let cached = *inner.bank(bank);
        let byte = if cached.direction & mask != 0 {
            cached.value
        } else {
            inner.fetch_bank(bank)?
        };
        Ok(Level::from_bit(byte & mask != 0))
    }
}

impl<T: Transport> fmt::Debug for Ft232x<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ft232x({} {:04x}:{:04x})",
            self.info.model, self.info.vendor_id, self.info.product_id
        )
    }
}

impl<T: Transport> Inner<T> {
    pub(crate) fn bank(&self, bank: Bank) -> &PinBank {
        match bank {
            Bank::A => &self.bank_a,
            Bank::B => &self.bank_b,
        }
    }

    fn bank_mut(&mut self, bank: Bank) -> &mut PinBank {
        match bank {
            Bank::A => &mut self.bank_a,
            Bank::B => &mut self.bank_b,
        }
    }

    pub(crate) fn take_claim(&mut self, requested: BusClaim) -> Result<()> {
        match self.claim {
            None => {
                self.claim = Some(requested);
                Ok(())
            }
            Some(held) => Err(Error::ClaimConflict { held, requested }),
        }
    }

    pub(crate) fn release_claim(&mut self, claim: BusClaim) {
        if self.claim == Some(claim) {
            self.claim = None;
            if claim == BusClaim::Spi {
                self.spi_ceiling_hz = None;
            }
        }
    }

    /// Raw GPIO on a shared pin rides on the `Gpio` claim: taken
    /// implicitly when free, refused while a bus holds the pins.
    fn guard_shared_pins(&mut self) -> Result<()> {
        match self.claim {
            None => {
                self.claim = Some(BusClaim::Gpio);
                Ok(())
            }
            Some(BusClaim::Gpio) => Ok(()),
            Some(held) => Err(Error::ClaimConflict {
                held,
                requested: BusClaim::Gpio,
            }),
        }
    }

    /// Encodes and writes a command batch. Bank caches are updated as the
    /// commands are encoded so cache and wire bytes cannot diverge; on a
    /// transport failure the caller unwinds the logical operation, not
    /// the cache.
    pub(crate) fn send(&mut self, commands: &[Command<'_>]) -> Result<()> {
        let mut buf = Vec::new();
        for command in commands {
            if let Command::SetBank {
                bank,
                direction,
                value,
            } = *command
            {
                *self.bank_mut(bank) = PinBank { direction, value };
            }
            command.encode(&mut buf)?;
        }
        trace!("engine <- {buf:02X?}");
        self.write_all(&buf)
    }

    pub(crate) fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.transport.write(data)?;
            if n == 0 {
                return Err(Error::Transport(TransportError::Timeout));
            }
            data = &data[n..];
        }
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes, sleeping between empty polls and
    /// giving up at the transport timeout.
    pub(crate) fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let deadline = self.clock.now() + IO_TIMEOUT;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.transport.read(&mut buf[filled..])?;
            filled += n;
            if n == 0 {
                if self.clock.now() >= deadline {
                    return Err(Error::Transport(TransportError::Timeout));
                }
                self.clock.sleep(POLL_SLEEP);
            }
        }
        trace!("engine -> {:02X?}", &buf[..]);
        Ok(())
    }

    /// Applies a full bank state to the hardware, dispatching on tier.
    pub(crate) fn apply_bank(&mut self, bank: Bank, state: PinBank) -> Result<()> {
        match self.model {
            ChipModel::Ft232h => self.send(&[Command::SetBank {
                bank,
                direction: state.direction,
                value: state.value,
            }]),
            ChipModel::Ft232r => {
                *self.bank_mut(bank) = state;
                match bank {
                    Bank::A => {
                        self.transport
                            .set_bit_mode(state.direction, BitMode::SyncBitbang)?;
                        self.write_all(&[state.value])?;
                        // the port queues one sampled byte per frame;
                        // drain it to keep the stream aligned
                        let mut echo = [0u8; 1];
                        self.read_exact(&mut echo)?;
                        Ok(())
                    }
                    Bank::B => {
                        let cfg = (state.direction << 4) | (state.value & 0x0F);
                        self.transport.set_bit_mode(cfg, BitMode::CbusBitbang)?;
                        Ok(())
                    }
                }
            }
        }
    }

    /// Hardware read of a bank's pin states; refreshes the cached value.
    pub(crate) fn fetch_bank(&mut self, bank: Bank) -> Result<u8> {
        let byte = match self.model {
            ChipModel::Ft232h => {
                self.send(&[Command::ReadBank { bank }, Command::Flush])?;
                let mut reply = [0u8; 1];
                self.read_exact(&mut reply)?;
                reply[0]
            }
            ChipModel::Ft232r => match bank {
                Bank::A => {
                    self.transport
                        .set_bit_mode(self.bank_a.direction, BitMode::SyncBitbang)?;
                    self.transport.get_bit_mode()?
                }
                Bank::B => {
                    let cfg = (self.bank_b.direction << 4) | (self.bank_b.value & 0x0F);
                    self.transport.set_bit_mode(cfg, BitMode::CbusBitbang)?;
                    self.transport.get_bit_mode()? & 0x0F
                }
            },
        };
        self.bank_mut(bank).value = byte;
        Ok(byte)
    }

    fn bring_up(&mut self) -> Result<()> {
        match self.model {
            ChipModel::Ft232h => {
                debug!("bringing up FT232H shift engine");
                if let Err(first) = self.mpsse_bring_up() {
                    warn!("engine bring-up failed ({first}), resetting and retrying once");
                    if let Err(second) = self.mpsse_bring_up() {
                        debug!("engine bring-up retry failed: {second}");
                        return Err(Error::BringUpFailed { attempts: 2 });
                    }
                }
                debug!("engine verified and configured");
                Ok(())
            }
            ChipModel::Ft232r => self.bitbang_bring_up(),
        }
    }

    fn mpsse_bring_up(&mut self) -> Result<()> {
        self.transport.reset()?;
        self.drain_stale()?;
        self.common_setup()?;
        self.transport.set_bit_mode(0, BitMode::Reset)?;
        self.transport.set_bit_mode(0, BitMode::Mpsse)?;
        // the mode switch has no acknowledgement; the bad-opcode echo is
        // the only reliable signal the engine is listening
        self.verify_echo(mpsse::BAD_OPCODE_A)?;
        self.verify_echo(mpsse::BAD_OPCODE_B)?;
        self.send(&[
            Command::FastBaseClock,
            Command::AdaptiveClockingOff,
            Command::ThreePhaseClocking { enabled: false },
            Command::Loopback { enabled: false },
            Command::SetBank {
                bank: Bank::A,
                direction: 0,
                value: 0,
            },
            Command::SetBank {
                bank: Bank::B,
                direction: 0,
                value: 0,
            },
        ])?;
        // everything floats now; resynchronize the cache from hardware
        self.fetch_bank(Bank::A)?;
        self.fetch_bank(Bank::B)?;
        Ok(())
    }

    fn bitbang_bring_up(&mut self) -> Result<()> {
        debug!("bringing up FT232R bit-bang port");
        self.transport.reset()?;
        self.drain_stale()?;
        self.common_setup()?;
        self.transport.set_baud_rate(DEFAULT_FRAME_BAUD)?;
        // all pins start as inputs; no prior cache exists, so read the
        // actual state once per bank
        self.transport.set_bit_mode(0, BitMode::SyncBitbang)?;
        self.bank_a = PinBank {
            direction: 0,
            value: self.transport.get_bit_mode()?,
        };
        self.transport.set_bit_mode(0, BitMode::CbusBitbang)?;
        self.bank_b = PinBank {
            direction: 0,
            value: self.transport.get_bit_mode()? & 0x0F,
        };
        Ok(())
    }

    /// Discards bytes queued from before the reset. Skipping this makes
    /// the echo verification misread stale data.
    fn drain_stale(&mut self) -> Result<()> {
        let mut scratch = [0u8; 64];
        let mut total = 0;
        loop {
            let n = self.transport.read(&mut scratch)?;
            if n == 0 {
                break;
            }
            total += n;
            if total > DRAIN_LIMIT {
                warn!("device keeps producing data after reset, giving up the drain");
                break;
            }
        }
        if total > 0 {
            debug!("drained {total} stale bytes after reset");
        }
        Ok(())
    }

    fn common_setup(&mut self) -> Result<()> {
        self.transport.set_usb_parameters(USB_TRANSFER_SIZE)?;
        self.transport.set_chars(None, None)?;
        self.transport.set_timeouts(IO_TIMEOUT, IO_TIMEOUT)?;
        self.transport.set_latency_timer(LATENCY)?;
        self.transport.set_flow_control_rts_cts()?;
        Ok(())
    }

    fn verify_echo(&mut self, opcode: u8) -> Result<()> {
        self.write_all(&[opcode])?;
        let deadline = self.clock.now() + VERIFY_TIMEOUT;
        let mut reply = [0u8; 2];
        let mut filled = 0;
        while filled < reply.len() {
            let n = self.transport.read(&mut reply[filled..])?;
            filled += n;
            if n == 0 {
                if self.clock.now() >= deadline {
                    return Err(Error::Transport(TransportError::Timeout));
                }
                self.clock.sleep(POLL_SLEEP);
            }
        }
        if reply != [mpsse::BAD_OPCODE_ECHO, opcode] {
            return Err(Error::EchoMismatch {
                sent: opcode,
                echoed: reply,
            });
        }
        trace!("engine echoed bad opcode {opcode:#04X}");
        Ok(())
    }
}
