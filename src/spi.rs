//! SPI on both chip tiers.
//!
//! On the FT232H the shift engine does the work: the SPI mode maps to the
//! engine's edge flags through a pure 2x2 table, and chip select is framed
//! around each transfer with bank commands. Pins: A0 = SCLK, A1 = MOSI,
//! A2 = MISO, A3 = CS (active low).
//!
//! The FT232R has no shift engine, so SPI is synthesized from the
//! synchronous bit-bang port: every SPI clock period expands into two
//! frames (clock idle, then clock active) with the data bit held across
//! both, and the sampled byte stream is walked back at the same stride to
//! recover the input bits. Pins: A0 = MOSI, A1 = MISO, A2 = SCLK,
//! A3 = CS. Bandwidth is the frame rate divided by two.

use std::fmt;

use log::{debug, warn};

use crate::device::{BusClaim, Ft232x, Inner};
use crate::error::{Error, Result};
use crate::gpio::{Bank, PinBank};
use crate::mpsse::{self, ClockEdge, Command, ShiftFlags};
use crate::transport::{BitMode, ChipModel, Transport};

/// Clock polarity and phase, numbered the usual way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiMode {
    /// CPOL=0, CPHA=0.
    Mode0,
    /// CPOL=0, CPHA=1.
    Mode1,
    /// CPOL=1, CPHA=0.
    Mode2,
    /// CPOL=1, CPHA=1.
    Mode3,
}

impl SpiMode {
    /// Clock idles high.
    #[inline]
    pub fn cpol(&self) -> bool {
        matches!(self, SpiMode::Mode2 | SpiMode::Mode3)
    }

    /// Data is captured on the second clock edge.
    #[inline]
    pub fn cpha(&self) -> bool {
        matches!(self, SpiMode::Mode1 | SpiMode::Mode3)
    }
}

/// Wire bit order of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

/// One write/read pair within an exchange. Both buffers non-empty means
/// full duplex and their lengths must match; an empty buffer makes the
/// transfer write-only or read-only.
pub struct Transfer<'b> {
    pub write: &'b [u8],
    pub read: &'b mut [u8],
    pub bit_order: BitOrder,
    /// Keep chip select asserted into the next descriptor. Not supported
    /// yet; setting it fails the exchange before any I/O.
    pub keep_cs_asserted: bool,
}

// Rich-tier pin masks on bank A.
const SK: u8 = 0x01;
const MOSI: u8 = 0x02;
const CS: u8 = 0x08;
const MPSSE_DIR: u8 = SK | MOSI | CS;

// Simple-tier pin masks on the bit-bang byte.
const BB_MOSI: u8 = 0x01;
const BB_MISO: u8 = 0x02;
const BB_SCLK: u8 = 0x04;
const BB_CS: u8 = 0x08;
const BB_DIR: u8 = BB_MOSI | BB_SCLK | BB_CS;

// Fixed frames around each bit-bang transaction: settle CS going in,
// return the clock to idle and release CS going out.
const LEAD_FRAMES: usize = 2;
const TAIL_FRAMES: usize = 2;

/// Largest simple-tier transfer whose frame expansion still fits one
/// operation.
const MAX_SYNC_TRANSFER: usize = (65536 - LEAD_FRAMES - TAIL_FRAMES) / 16;

// The bit-bang port tops out at 3 MHz frames.
const MAX_FRAME_HZ: u32 = 3_000_000;

/// A claimed SPI port, obtained from [`Ft232x::spi`].
///
/// Configure it to get a [`SpiConn`] that runs exchanges. The claim is
/// held until [`SpiPort::close`] or drop.
pub struct SpiPort<'d, T: Transport> {
    device: &'d Ft232x<T>,
    closed: bool,
}

impl<'d, T: Transport> SpiPort<'d, T> {
    pub(crate) fn open(device: &'d Ft232x<T>) -> Result<Self> {
        device.lock_inner().take_claim(BusClaim::Spi)?;
        debug!("SPI port claimed");
        Ok(Self {
            device,
            closed: false,
        })
    }

    /// Applies clock, mode and word width, returning a connection.
    ///
    /// Requests above the hardware ceiling are clamped down (optimistic
    /// callers expect graceful degradation); requests below the slowest
    /// divisor are a hard error. Re-configuring with a higher frequency
    /// than a previous configuration keeps the existing, lower clock.
    pub fn configure(
        &mut self,
        clock_hz: u32,
        mode: SpiMode,
        bits_per_word: u8,
    ) -> Result<SpiConn<'_, T>> {
        if bits_per_word == 0 || bits_per_word % 8 != 0 {
            return Err(Error::NotByteAligned {
                bits: bits_per_word as u32,
            });
        }
        let mut inner = self.device.lock_inner();
        let engine = match inner.model {
            ChipModel::Ft232h => configure_mpsse(&mut inner, clock_hz, mode)?,
            ChipModel::Ft232r => configure_bitbang(&mut inner, clock_hz, mode)?,
        };
        drop(inner);
        Ok(SpiConn {
            device: self.device,
            engine,
        })
    }

    /// Returns the shared pins to inputs and releases the claim.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut inner = self.device.lock_inner();
        let result = match inner.model {
            ChipModel::Ft232h => {
                let bank = *inner.bank(Bank::A);
                inner.apply_bank(
                    Bank::A,
                    PinBank {
                        direction: bank.direction & 0xF0,
                        value: bank.value & 0xF0,
                    },
                )
            }
            ChipModel::Ft232r => {
                inner.bank_a.direction = 0;
                inner
                    .transport
                    .set_bit_mode(0, BitMode::SyncBitbang)
                    .map_err(Error::from)
            }
        };
        inner.release_claim(BusClaim::Spi);
        debug!("SPI port released");
        result
    }
}

impl<T: Transport> fmt::Debug for SpiPort<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpiPort({:?})", self.device)
    }
}

impl<T: Transport> Drop for SpiPort<'_, T> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

enum Engine {
    Mpsse {
        out_edge: ClockEdge,
        in_edge: ClockEdge,
        clock_idle_high: bool,
    },
    Bitbang {
        cpol: bool,
        cpha: bool,
    },
}

/// A configured SPI connection.
pub struct SpiConn<'p, T: Transport> {
    device: &'p Ft232x<T>,
    engine: Engine,
}

impl<T: Transport> SpiConn<'_, T> {
    /// Full-duplex convenience wrapper over a single-descriptor exchange,
    /// MSB first.
    pub fn transfer(&self, write: &[u8], read: &mut [u8]) -> Result<()> {
        self.exchange(&mut [Transfer {
            write,
            read,
            bit_order: BitOrder::MsbFirst,
            keep_cs_asserted: false,
        }])
    }

    /// Runs an ordered list of transfers, each framed by its own chip
    /// select. Every descriptor is validated before any I/O starts, so a
    /// rejected exchange leaves the device untouched.
    pub fn exchange(&self, transfers: &mut [Transfer<'_>]) -> Result<()> {
        for t in transfers.iter() {
            if t.keep_cs_asserted {
                return Err(Error::NotImplemented(
                    "holding chip select across descriptors",
                ));
            }
            if !t.write.is_empty() && !t.read.is_empty() && t.write.len() != t.read.len() {
                return Err(Error::BufferMismatch {
                    write_len: t.write.len(),
                    read_len: t.read.len(),
                });
            }
            if matches!(self.engine, Engine::Bitbang { .. }) {
                let len = t.write.len().max(t.read.len());
                if len > MAX_SYNC_TRANSFER {
                    return Err(Error::OperationTooLarge {
                        max: MAX_SYNC_TRANSFER,
                        actual: len,
                    });
                }
            }
        }
        let mut inner = self.device.lock_inner();
        for t in transfers.iter_mut() {
            match self.engine {
                Engine::Mpsse {
                    out_edge,
                    in_edge,
                    clock_idle_high,
                } => exchange_mpsse(&mut inner, t, out_edge, in_edge, clock_idle_high)?,
                Engine::Bitbang { cpol, cpha } => exchange_bitbang(&mut inner, t, cpol, cpha)?,
            }
        }
        Ok(())
    }
}

/// The 2x2 mode table: output edge, input edge, clock idle level.
fn mode_table(mode: SpiMode) -> (ClockEdge, ClockEdge, bool) {
    let (out_edge, in_edge) = if mode.cpha() {
        (ClockEdge::Rising, ClockEdge::Falling)
    } else {
        (ClockEdge::Falling, ClockEdge::Rising)
    };
    (out_edge, in_edge, mode.cpol())
}

fn configure_mpsse<T: Transport>(
    inner: &mut Inner<T>,
    clock_hz: u32,
    mode: SpiMode,
) -> Result<Engine> {
    let requested = clock_hz.min(mpsse::BASE_CLOCK_FAST_HZ);
    if requested < clock_hz {
        warn!("SPI clock clamped from {clock_hz} Hz to {requested} Hz");
    }
    let setting = mpsse::clock_setting(requested)?;
    let reprogram = match inner.spi_ceiling_hz {
        None => true,
        Some(ceiling) => requested < ceiling,
    };
    if reprogram {
        inner.send(&[
            if setting.slow_base {
                Command::SlowBaseClock
            } else {
                Command::FastBaseClock
            },
            Command::ClockDivisor {
                divisor: setting.divisor,
            },
        ])?;
        inner.spi_ceiling_hz = Some(requested);
        debug!("SPI clock set to {} Hz", setting.achieved_hz);
    }
    let (out_edge, in_edge, clock_idle_high) = mode_table(mode);
    let bank = *inner.bank(Bank::A);
    let idle = (bank.value & 0xF0) | CS | if clock_idle_high { SK } else { 0 };
    inner.apply_bank(
        Bank::A,
        PinBank {
            direction: (bank.direction & 0xF0) | MPSSE_DIR,
            value: idle,
        },
    )?;
    Ok(Engine::Mpsse {
        out_edge,
        in_edge,
        clock_idle_high,
    })
}

fn configure_bitbang<T: Transport>(
    inner: &mut Inner<T>,
    clock_hz: u32,
    mode: SpiMode,
) -> Result<Engine> {
    if clock_hz == 0 {
        return Err(Error::ClockTooLow {
            requested: clock_hz,
            minimum: 1,
        });
    }
    // two frames per clock period
    let frame_hz = clock_hz.saturating_mul(2).min(MAX_FRAME_HZ);
    inner.transport.set_baud_rate(frame_hz)?;
    debug!(
        "SPI bit-bang at {} Hz ({frame_hz} Hz frames)",
        frame_hz / 2
    );
    let bank = *inner.bank(Bank::A);
    let idle = (bank.value & 0xF0) | BB_CS | if mode.cpol() { BB_SCLK } else { 0 };
    inner.apply_bank(
        Bank::A,
        PinBank {
            direction: (bank.direction & 0xF0) | BB_DIR,
            value: idle,
        },
    )?;
    Ok(Engine::Bitbang {
        cpol: mode.cpol(),
        cpha: mode.cpha(),
    })
}

fn exchange_mpsse<T: Transport>(
    inner: &mut Inner<T>,
    t: &mut Transfer<'_>,
    out_edge: ClockEdge,
    in_edge: ClockEdge,
    clock_idle_high: bool,
) -> Result<()> {
    let len = t.write.len().max(t.read.len());
    if len == 0 {
        return Ok(());
    }
    let flags = ShiftFlags {
        out_edge: (!t.write.is_empty()).then_some(out_edge),
        in_edge: (!t.read.is_empty()).then_some(in_edge),
        order: t.bit_order,
    };
    let bank = *inner.bank(Bank::A);
    let idle = (bank.value & 0xF0) | CS | if clock_idle_high { SK } else { 0 };
    let asserted = idle & !CS;

    let mut commands = vec![Command::SetBank {
        bank: Bank::A,
        direction: bank.direction,
        value: asserted,
    }];
    if t.write.is_empty() {
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(mpsse::MAX_SHIFT_LEN);
            commands.push(Command::ShiftBytes {
                flags,
                len: chunk,
                out: None,
            });
            remaining -= chunk;
        }
    } else {
        for chunk in t.write.chunks(mpsse::MAX_SHIFT_LEN) {
            commands.push(Command::ShiftBytes {
                flags,
                len: chunk.len(),
                out: Some(chunk),
            });
        }
    }
    commands.push(Command::SetBank {
        bank: Bank::A,
        direction: bank.direction,
        value: idle,
    });
    commands.push(Command::Flush);
    inner.send(&commands)?;
    if !t.read.is_empty() {
        inner.read_exact(t.read)?;
    }
    Ok(())
}

fn exchange_bitbang<T: Transport>(
    inner: &mut Inner<T>,
    t: &mut Transfer<'_>,
    cpol: bool,
    cpha: bool,
) -> Result<()> {
    let len = t.write.len().max(t.read.len());
    if len == 0 {
        return Ok(());
    }
    let base = inner.bank(Bank::A).value & 0xF0;
    let frames = expand_frames(t.write, len * 8, t.bit_order, cpol, base);
    let mut sampled = vec![0u8; frames.len()];
    inner.write_all(&frames)?;
    inner.read_exact(&mut sampled)?;
    if !t.read.is_empty() {
        collect_frames(&sampled, len * 8, t.bit_order, cpha, t.read);
    }
    // the tail frames left the bus idle with CS released
    inner.bank_a.value = base | BB_CS | if cpol { BB_SCLK } else { 0 };
    Ok(())
}

/// Expands output bytes into sync bit-bang frames: a lead pair that
/// asserts CS with the clock idle, two frames per bit (idle then active
/// clock, data held across both), and a tail pair that re-idles the clock
/// and releases CS. The upper nibble of the bank rides along untouched.
fn expand_frames(write: &[u8], nbits: usize, order: BitOrder, cpol: bool, base: u8) -> Vec<u8> {
    // the capture phase only matters on the decode side
    let idle_clk = if cpol { BB_SCLK } else { 0 };
    let active_clk = if cpol { 0 } else { BB_SCLK };
    let bus_idle = base | BB_CS | idle_clk;
    let cs_held = base | idle_clk;
    let mut frames = Vec::with_capacity(LEAD_FRAMES + 2 * nbits + TAIL_FRAMES);
    frames.push(bus_idle);
    frames.push(cs_held);
    for k in 0..nbits {
        let byte = write.get(k / 8).copied().unwrap_or(0);
        let bit = match order {
            BitOrder::MsbFirst => (byte >> (7 - (k % 8))) & 1,
            BitOrder::LsbFirst => (byte >> (k % 8)) & 1,
        };
        let data = if bit != 0 { BB_MOSI } else { 0 };
        frames.push(base | data | idle_clk);
        frames.push(base | data | active_clk);
    }
    frames.push(cs_held);
    frames.push(bus_idle);
    frames
}

/// Reconstructs input bytes from the sampled frame stream. The port
/// samples the pins the instant before each frame drives the outputs, so
/// the byte at index `i` holds the bus state during frame `i - 1`; the
/// bit for clock period `k` therefore sits at `LEAD + 2k + 1 + cpha`.
fn collect_frames(sampled: &[u8], nbits: usize, order: BitOrder, cpha: bool, read: &mut [u8]) {
    for slot in read.iter_mut() {
        *slot = 0;
    }
    let phase = usize::from(cpha);
    for k in 0..nbits {
        if sampled[LEAD_FRAMES + 2 * k + 1 + phase] & BB_MISO == 0 {
            continue;
        }
        if let Some(slot) = read.get_mut(k / 8) {
            *slot |= match order {
                BitOrder::MsbFirst => 0x80 >> (k % 8),
                BitOrder::LsbFirst => 1 << (k % 8),
            };
        }
    }
}
