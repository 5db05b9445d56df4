//! SPI behavior on both tiers against the scripted chip model.

mod common;

use common::{init_logs, Cmd, FakeTransport, TestClock};
use ft232x::{BitOrder, Error, Ft232x, SpiMode, Transfer};

fn open(transport: &FakeTransport) -> Ft232x<FakeTransport> {
    Ft232x::open_with_clock(transport.clone(), Box::new(TestClock::new())).unwrap()
}

#[test]
fn full_duplex_exchange_round_trips() {
    init_logs();
    let transport = FakeTransport::ft232h();
    let device = open(&transport);
    let mut port = device.spi().unwrap();
    let conn = port.configure(1_000_000, SpiMode::Mode0, 8).unwrap();

    let mut read = [0u8; 3];
    conn.transfer(&[0x12, 0x34, 0x56], &mut read).unwrap();
    // the model wires MOSI back to MISO
    assert_eq!(read, [0x12, 0x34, 0x56]);
}

#[test]
fn chip_select_frames_each_transfer() {
    init_logs();
    let transport = FakeTransport::ft232h();
    let device = open(&transport);
    let mut port = device.spi().unwrap();
    let conn = port.configure(1_000_000, SpiMode::Mode0, 8).unwrap();
    transport.chip().cmd_log.clear();

    let mut read = [0u8; 1];
    conn.transfer(&[0xFF], &mut read).unwrap();

    let chip = transport.chip();
    let banks: Vec<(u8, u8)> = chip
        .cmd_log
        .iter()
        .filter_map(|c| match c {
            Cmd::SetBankA { dir, value } => Some((*dir, *value)),
            _ => None,
        })
        .collect();
    // CS (bit 3) falls before the shift and rises after it
    assert_eq!(banks.len(), 2);
    assert_eq!(banks[0].1 & 0x08, 0);
    assert_eq!(banks[1].1 & 0x08, 0x08);
}

#[test]
fn requests_above_the_ceiling_are_clamped() {
    init_logs();
    let transport = FakeTransport::ft232h();
    let device = open(&transport);
    let mut port = device.spi().unwrap();
    port.configure(45_000_000, SpiMode::Mode0, 8).unwrap();
    // clamped to the 30 MHz ceiling: divisor field 0
    assert_eq!(
        transport.chip().count(|c| matches!(c, Cmd::Divisor(0))),
        1
    );
}

#[test]
fn requests_below_the_floor_are_rejected() {
    init_logs();
    let transport = FakeTransport::ft232h();
    let device = open(&transport);
    let mut port = device.spi().unwrap();
    assert!(matches!(
        port.configure(10, SpiMode::Mode0, 8),
        Err(Error::ClockTooLow { requested: 10, .. })
    ));
}

#[test]
fn clock_is_reprogrammed_only_downward() {
    init_logs();
    let transport = FakeTransport::ft232h();
    let device = open(&transport);
    let mut port = device.spi().unwrap();

    port.configure(1_000_000, SpiMode::Mode0, 8).unwrap();
    let after_first = transport.chip().count(|c| matches!(c, Cmd::Divisor(_)));
    // higher request: cached ceiling wins, no divisor traffic
    port.configure(2_000_000, SpiMode::Mode0, 8).unwrap();
    assert_eq!(
        transport.chip().count(|c| matches!(c, Cmd::Divisor(_))),
        after_first
    );
    // lower request reprograms
    port.configure(500_000, SpiMode::Mode0, 8).unwrap();
    assert_eq!(
        transport.chip().count(|c| matches!(c, Cmd::Divisor(_))),
        after_first + 1
    );
}

#[test]
fn non_byte_widths_are_rejected() {
    init_logs();
    let transport = FakeTransport::ft232h();
    let device = open(&transport);
    let mut port = device.spi().unwrap();
    assert!(matches!(
        port.configure(1_000_000, SpiMode::Mode0, 12),
        Err(Error::NotByteAligned { bits: 12 })
    ));
}

#[test]
fn keep_cs_is_reported_not_implemented() {
    init_logs();
    let transport = FakeTransport::ft232h();
    let device = open(&transport);
    let mut port = device.spi().unwrap();
    let conn = port.configure(1_000_000, SpiMode::Mode0, 8).unwrap();
    transport.chip().cmd_log.clear();

    let mut read = [0u8; 1];
    let result = conn.exchange(&mut [Transfer {
        write: &[0x00],
        read: &mut read,
        bit_order: BitOrder::MsbFirst,
        keep_cs_asserted: true,
    }]);
    assert!(matches!(result, Err(Error::NotImplemented(_))));
    // rejected before any I/O
    assert!(transport.chip().cmd_log.is_empty());
}

#[test]
fn mismatched_full_duplex_buffers_are_rejected() {
    init_logs();
    let transport = FakeTransport::ft232h();
    let device = open(&transport);
    let mut port = device.spi().unwrap();
    let conn = port.configure(1_000_000, SpiMode::Mode0, 8).unwrap();

    let mut read = [0u8; 2];
    assert!(matches!(
        conn.transfer(&[0x00, 0x11, 0x22], &mut read),
        Err(Error::BufferMismatch {
            write_len: 3,
            read_len: 2
        })
    ));
}

#[test]
fn mode2_idles_the_clock_high() {
    init_logs();
    let transport = FakeTransport::ft232h();
    let device = open(&transport);
    let mut port = device.spi().unwrap();
    port.configure(1_000_000, SpiMode::Mode2, 8).unwrap();
    // idle bank state: CS high and SCLK high
    let chip = transport.chip();
    assert_eq!(chip.bank_a_value & 0x09, 0x09);
}

#[test]
fn simple_tier_exchange_round_trips() {
    init_logs();
    let transport = FakeTransport::ft232r();
    let device = open(&transport);
    let mut port = device.spi().unwrap();
    let conn = port.configure(100_000, SpiMode::Mode0, 8).unwrap();

    let mut read = [0u8; 2];
    conn.transfer(&[0xC3, 0x5A], &mut read).unwrap();
    assert_eq!(read, [0xC3, 0x5A]);

    let chip = transport.chip();
    // frame clock is twice the bus clock
    assert_eq!(chip.baud, 200_000);
    // CS released on the outermost frames of the burst, held inside
    let n = chip.frames.len();
    assert!(n > 4);
    assert_ne!(chip.frames[n - 1] & 0x08, 0);
    assert_eq!(chip.frames[n - 3] & 0x08, 0);
}

#[test]
fn simple_tier_exchange_all_modes() {
    init_logs();
    for mode in [SpiMode::Mode0, SpiMode::Mode1, SpiMode::Mode2, SpiMode::Mode3] {
        let transport = FakeTransport::ft232r();
        let device = open(&transport);
        let mut port = device.spi().unwrap();
        let conn = port.configure(100_000, mode, 8).unwrap();
        let mut read = [0u8; 1];
        conn.transfer(&[0x96], &mut read).unwrap();
        assert_eq!(read, [0x96], "mode {mode:?}");
    }
}

#[test]
fn simple_tier_rejects_a_zero_clock() {
    init_logs();
    let transport = FakeTransport::ft232r();
    let device = open(&transport);
    let mut port = device.spi().unwrap();
    assert!(matches!(
        port.configure(0, SpiMode::Mode0, 8),
        Err(Error::ClockTooLow { requested: 0, .. })
    ));
    // the frame clock from bring-up was never touched
    assert_eq!(transport.chip().baud, 62_500);
}

#[test]
fn simple_tier_oversized_transfer_is_rejected() {
    init_logs();
    let transport = FakeTransport::ft232r();
    let device = open(&transport);
    let mut port = device.spi().unwrap();
    let conn = port.configure(100_000, SpiMode::Mode0, 8).unwrap();
    let write = vec![0u8; 5000];
    let result = conn.exchange(&mut [Transfer {
        write: &write,
        read: &mut [],
        bit_order: BitOrder::MsbFirst,
        keep_cs_asserted: false,
    }]);
    assert!(matches!(result, Err(Error::OperationTooLarge { .. })));
}
