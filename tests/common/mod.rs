//! Shared test double: a scripted in-memory chip behind the transport
//! trait, with just enough of an engine model to answer the command
//! streams the driver emits.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ft232x::transport::TransportResult;
use ft232x::{BitMode, ChipModel, Clock, DeviceInfo, Transport};

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Simulated monotonic clock: `sleep` advances time instead of waiting.
pub struct TestClock(Mutex<Instant>);

impl TestClock {
    pub fn new() -> Self {
        Self(Mutex::new(Instant::now()))
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        *self.0.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        *self.0.lock().unwrap() += duration;
    }
}

/// Parsed engine command, recorded for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cmd {
    SetBankA { dir: u8, value: u8 },
    SetBankB { dir: u8, value: u8 },
    ReadBankA,
    ReadBankB,
    Divisor(u16),
    Base30MHz,
    Base6MHz,
    ThreePhase(bool),
    AdaptiveOff,
    Loopback(bool),
    Tristate(u8, u8),
    Flush,
    ShiftBytesOut(Vec<u8>),
    ShiftBytesIn(usize),
    ShiftBytesFull(Vec<u8>),
    ShiftBitsOut { bits: u8, data: u8 },
    ShiftBitsIn { bits: u8 },
    BadOpcode(u8),
}

pub struct FakeChip {
    pub info: DeviceInfo,
    pub mode: BitMode,
    pub mode_mask: u8,
    pub resets: usize,
    pub read_queue: VecDeque<u8>,
    /// Unparsed tail of the incoming command stream.
    pending: Vec<u8>,
    pub cmd_log: Vec<Cmd>,
    pub bank_a_dir: u8,
    pub bank_a_value: u8,
    pub bank_b_dir: u8,
    pub bank_b_value: u8,
    /// Externally driven input levels, returned for input pins on reads.
    pub external_a: u8,
    pub external_b: u8,
    /// Corrupt the next N bad-opcode echoes (bring-up failure injection).
    pub corrupt_echoes: usize,
    /// Swallow the next N bad-opcode echoes entirely (timeout injection).
    pub drop_echoes: usize,
    /// Replies for bit-granular reads (I2C ack bits and data bytes), in
    /// order. Empty means 0x00, i.e. ACK / all-zero data.
    pub bit_reads: VecDeque<u8>,
    /// Replies for byte-granular read-only shifts; missing entries read
    /// as zeros.
    pub byte_reads: VecDeque<Vec<u8>>,
    /// Frames written in synchronous bit-bang mode.
    pub frames: Vec<u8>,
    pub baud: u32,
    last_frame: u8,
}

impl FakeChip {
    fn new(model: ChipModel) -> Self {
        Self {
            info: DeviceInfo {
                model,
                vendor_id: 0x0403,
                product_id: match model {
                    ChipModel::Ft232h => 0x6014,
                    ChipModel::Ft232r => 0x6001,
                },
            },
            mode: BitMode::Reset,
            mode_mask: 0,
            resets: 0,
            read_queue: VecDeque::new(),
            pending: Vec::new(),
            cmd_log: Vec::new(),
            bank_a_dir: 0,
            bank_a_value: 0,
            bank_b_dir: 0,
            bank_b_value: 0,
            external_a: 0,
            external_b: 0,
            corrupt_echoes: 0,
            drop_echoes: 0,
            bit_reads: VecDeque::new(),
            byte_reads: VecDeque::new(),
            frames: Vec::new(),
            baud: 0,
            last_frame: 0,
        }
    }

    pub fn count<F: Fn(&Cmd) -> bool>(&self, pred: F) -> usize {
        self.cmd_log.iter().filter(|c| pred(c)).count()
    }

    fn bank_a_visible(&self) -> u8 {
        (self.bank_a_dir & self.bank_a_value) | (!self.bank_a_dir & self.external_a)
    }

    fn bank_b_visible(&self) -> u8 {
        ((self.bank_b_dir & self.bank_b_value) | (!self.bank_b_dir & self.external_b)) & 0x0F
    }

    fn accept(&mut self, data: &[u8]) {
        match self.mode {
            BitMode::Mpsse => {
                self.pending.extend_from_slice(data);
                self.process_commands();
            }
            BitMode::SyncBitbang => {
                for &frame in data {
                    // input is sampled the instant before the frame
                    // drives the outputs; MOSI is looped back to MISO
                    let miso = if self.last_frame & 0x01 != 0 { 0x02 } else { 0 };
                    self.read_queue.push_back((self.last_frame & !0x02) | miso);
                    self.last_frame = frame;
                    self.bank_a_value = frame;
                    self.frames.push(frame);
                }
            }
            _ => {}
        }
    }

    fn process_commands(&mut self) {
        loop {
            let Some(&op) = self.pending.first() else { return };
            let consumed = match op {
                0x80 | 0x82 => {
                    if self.pending.len() < 3 {
                        return;
                    }
                    let (value, dir) = (self.pending[1], self.pending[2]);
                    if op == 0x80 {
                        self.bank_a_value = value;
                        self.bank_a_dir = dir;
                        self.cmd_log.push(Cmd::SetBankA { dir, value });
                    } else {
                        self.bank_b_value = value;
                        self.bank_b_dir = dir;
                        self.cmd_log.push(Cmd::SetBankB { dir, value });
                    }
                    3
                }
                0x81 => {
                    let reply = self.bank_a_visible();
                    self.read_queue.push_back(reply);
                    self.cmd_log.push(Cmd::ReadBankA);
                    1
                }
                0x83 => {
                    let reply = self.bank_b_visible();
                    self.read_queue.push_back(reply);
                    self.cmd_log.push(Cmd::ReadBankB);
                    1
                }
                0x86 => {
                    if self.pending.len() < 3 {
                        return;
                    }
                    let divisor = u16::from_le_bytes([self.pending[1], self.pending[2]]);
                    self.cmd_log.push(Cmd::Divisor(divisor));
                    3
                }
                0x9E => {
                    if self.pending.len() < 3 {
                        return;
                    }
                    self.cmd_log
                        .push(Cmd::Tristate(self.pending[1], self.pending[2]));
                    3
                }
                0x84 => {
                    self.cmd_log.push(Cmd::Loopback(true));
                    1
                }
                0x85 => {
                    self.cmd_log.push(Cmd::Loopback(false));
                    1
                }
                0x87 => {
                    self.cmd_log.push(Cmd::Flush);
                    1
                }
                0x8A => {
                    self.cmd_log.push(Cmd::Base30MHz);
                    1
                }
                0x8B => {
                    self.cmd_log.push(Cmd::Base6MHz);
                    1
                }
                0x8C => {
                    self.cmd_log.push(Cmd::ThreePhase(true));
                    1
                }
                0x8D => {
                    self.cmd_log.push(Cmd::ThreePhase(false));
                    1
                }
                0x97 => {
                    self.cmd_log.push(Cmd::AdaptiveOff);
                    1
                }
                op if op & 0x80 == 0 && op & 0x30 != 0 => self.process_shift(op).unwrap_or(0),
                _ => {
                    // unknown opcode: echo 0xFA + offending byte, as the
                    // engine does
                    self.cmd_log.push(Cmd::BadOpcode(op));
                    if self.drop_echoes > 0 {
                        self.drop_echoes -= 1;
                    } else if self.corrupt_echoes > 0 {
                        self.corrupt_echoes -= 1;
                        self.read_queue.push_back(0xFA);
                        self.read_queue.push_back(!op);
                    } else {
                        self.read_queue.push_back(0xFA);
                        self.read_queue.push_back(op);
                    }
                    1
                }
            };
            if consumed == 0 {
                return;
            }
            self.pending.drain(..consumed);
        }
    }

    /// Returns bytes consumed, or None when the command is incomplete.
    fn process_shift(&mut self, op: u8) -> Option<usize> {
        let writes = op & 0x10 != 0;
        let reads = op & 0x20 != 0;
        if op & 0x02 != 0 {
            // bit granular
            if self.pending.len() < 2 {
                return None;
            }
            let bits = self.pending[1] + 1;
            if writes {
                if self.pending.len() < 3 {
                    return None;
                }
                let data = self.pending[2];
                self.cmd_log.push(Cmd::ShiftBitsOut { bits, data });
                Some(3)
            } else {
                self.cmd_log.push(Cmd::ShiftBitsIn { bits });
                if reads {
                    let reply = self.bit_reads.pop_front().unwrap_or(0);
                    self.read_queue.push_back(reply);
                }
                Some(2)
            }
        } else {
            if self.pending.len() < 3 {
                return None;
            }
            let len = u16::from_le_bytes([self.pending[1], self.pending[2]]) as usize + 1;
            if writes {
                if self.pending.len() < 3 + len {
                    return None;
                }
                let data = self.pending[3..3 + len].to_vec();
                if reads {
                    // loopback wiring: MOSI feeds MISO
                    self.read_queue.extend(data.iter().copied());
                    self.cmd_log.push(Cmd::ShiftBytesFull(data));
                } else {
                    self.cmd_log.push(Cmd::ShiftBytesOut(data));
                }
                Some(3 + len)
            } else {
                if reads {
                    let reply = self.byte_reads.pop_front().unwrap_or_default();
                    for i in 0..len {
                        self.read_queue.push_back(reply.get(i).copied().unwrap_or(0));
                    }
                }
                self.cmd_log.push(Cmd::ShiftBytesIn(len));
                Some(3)
            }
        }
    }
}

/// Cloneable transport handle; tests keep a clone to inspect the chip
/// after the device takes ownership of the other.
#[derive(Clone)]
pub struct FakeTransport(Arc<Mutex<FakeChip>>);

impl FakeTransport {
    pub fn ft232h() -> Self {
        Self(Arc::new(Mutex::new(FakeChip::new(ChipModel::Ft232h))))
    }

    pub fn ft232r() -> Self {
        Self(Arc::new(Mutex::new(FakeChip::new(ChipModel::Ft232r))))
    }

    pub fn chip(&self) -> MutexGuard<'_, FakeChip> {
        self.0.lock().unwrap()
    }
}

impl Transport for FakeTransport {
    fn device_info(&self) -> DeviceInfo {
        self.chip().info
    }

    fn reset(&mut self) -> TransportResult<()> {
        let mut chip = self.chip();
        chip.resets += 1;
        chip.mode = BitMode::Reset;
        chip.pending.clear();
        // stale queued bytes survive a reset; the driver must drain them
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> TransportResult<usize> {
        self.chip().accept(buf);
        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        let mut chip = self.chip();
        let mut n = 0;
        while n < buf.len() {
            match chip.read_queue.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn get_bit_mode(&mut self) -> TransportResult<u8> {
        let chip = self.chip();
        Ok(match chip.mode {
            BitMode::SyncBitbang | BitMode::AsyncBitbang => {
                (chip.mode_mask & chip.last_frame) | (!chip.mode_mask & chip.external_a)
            }
            BitMode::CbusBitbang => {
                let dirs = chip.mode_mask >> 4;
                let values = chip.mode_mask & 0x0F;
                ((dirs & values) | (!dirs & chip.external_b)) & 0x0F
            }
            _ => 0,
        })
    }

    fn set_bit_mode(&mut self, mask: u8, mode: BitMode) -> TransportResult<()> {
        let mut chip = self.chip();
        chip.mode = mode;
        chip.mode_mask = mask;
        if mode == BitMode::CbusBitbang {
            chip.bank_b_dir = mask >> 4;
            chip.bank_b_value = mask & 0x0F;
        }
        Ok(())
    }

    fn set_baud_rate(&mut self, baud_hz: u32) -> TransportResult<()> {
        self.chip().baud = baud_hz;
        Ok(())
    }

    fn set_usb_parameters(&mut self, _transfer_size: u32) -> TransportResult<()> {
        Ok(())
    }

    fn set_chars(&mut self, _event: Option<u8>, _error: Option<u8>) -> TransportResult<()> {
        Ok(())
    }

    fn set_timeouts(&mut self, _read: Duration, _write: Duration) -> TransportResult<()> {
        Ok(())
    }

    fn set_latency_timer(&mut self, _latency: Duration) -> TransportResult<()> {
        Ok(())
    }

    fn set_flow_control_rts_cts(&mut self) -> TransportResult<()> {
        Ok(())
    }
}
