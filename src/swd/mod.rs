//! Bit-banged Serial Wire Debug (SWD) line driver.
//!
//! This module implements exactly the framing described in ADIv5: an 8-bit
//! request, a turnaround, a 3-bit ACK and a 32+1-bit data phase. It performs
//! no retries and understands nothing about DP/AP register semantics — that
//! lives in [`crate::dp`] and [`crate::ap`]. Concurrent access is prevented
//! by giving [`transfer`] exclusive `&mut dyn PinDriver` for the duration of
//! one frame; callers that share a [`PinDriver`] across tasks are expected
//! to hold it behind their own critical section for that call.

pub mod pins;

pub use pins::PinDriver;

use crate::error::SwdError;

/// One SWD register address, keyed by the two wire bits A\[3:2\]. Only those
/// two bits are ever transmitted; the caller is responsible for first
/// selecting the correct {AP, bank} via DP.SELECT (see [`crate::dp`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegAddr(u8);

impl RegAddr {
    /// Constructs a [`RegAddr`] from a register offset; only bits \[3:2\] are
    /// retained.
    pub const fn new(offset: u8) -> Self {
        RegAddr(offset & 0b1100)
    }

    fn a2(self) -> bool {
        self.0 & 0b0100 != 0
    }

    fn a3(self) -> bool {
        self.0 & 0b1000 != 0
    }
}

/// Whether a transfer targets the Debug Port or an Access Port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    /// Debug Port (APnDP = 0).
    Dp,
    /// Access Port (APnDP = 1).
    Ap,
}

/// Transfer direction, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host reads from the target.
    Read,
    /// Host writes to the target.
    Write,
}

/// The 3-bit ACK response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// 0b001 — transfer completed normally.
    Ok,
    /// 0b010 — target asks the host to retry.
    Wait,
    /// 0b100 — a sticky error occurred; must be cleared via DP.ABORT.
    Fault,
}

impl Ack {
    fn decode(bits: u8) -> Result<Ack, SwdError> {
        match bits {
            0b001 => Ok(Ack::Ok),
            0b010 => Ok(Ack::Wait),
            0b100 => Ok(Ack::Fault),
            _ => Err(SwdError::Protocol),
        }
    }
}

/// `popcount(v) mod 2`, i.e. SWD parity: 1 for an odd number of set bits.
pub fn parity32(value: u32) -> bool {
    value.count_ones() % 2 == 1
}

/// Low-level clocked I/O shared by every sequence in this module. Not part
/// of the public API: callers only ever see [`transfer`] and the connect/
/// disconnect sequences.
struct Clock<'a> {
    pins: &'a mut dyn PinDriver,
    half_cycle_ns: u32,
}

impl<'a> Clock<'a> {
    fn new(pins: &'a mut dyn PinDriver, half_cycle_ns: u32) -> Self {
        Clock {
            pins,
            half_cycle_ns,
        }
    }

    /// One clock cycle with no data driven by the host; used for
    /// turnarounds and for sequences that are pure clocking (line reset).
    fn clock_only(&mut self) {
        self.pins.delay_ns(self.half_cycle_ns);
        self.pins.set_swclk(true);
        self.pins.delay_ns(self.half_cycle_ns);
        self.pins.set_swclk(false);
    }

    /// Drives one output bit: drive-edge, delay, clock-high, delay,
    /// clock-low (spec framing order).
    fn write_bit(&mut self, bit: bool) {
        self.pins.set_swdio(bit);
        self.clock_only();
    }

    /// Samples one input bit while SWDIO is in input mode.
    fn read_bit(&mut self) -> bool {
        self.pins.delay_ns(self.half_cycle_ns);
        let bit = self.pins.read_swdio();
        self.pins.set_swclk(true);
        self.pins.delay_ns(self.half_cycle_ns);
        self.pins.set_swclk(false);
        bit
    }

    fn write_bits_lsb_first(&mut self, mut value: u64, count: u32) {
        for _ in 0..count {
            self.write_bit(value & 1 != 0);
            value >>= 1;
        }
    }

    fn read_bits_lsb_first(&mut self, count: u32) -> u64 {
        let mut value = 0u64;
        for i in 0..count {
            if self.read_bit() {
                value |= 1 << i;
            }
        }
        value
    }

    /// Clocks `count` idle cycles with SWDIO released (used by line reset
    /// while the host still drives SWDIO high, and by dormant-wake gaps).
    fn clock_n(&mut self, count: u32) {
        for _ in 0..count {
            self.clock_only();
        }
    }
}

/// Performs exactly one SWD frame: the 8-bit request, turnaround, 3-bit ACK
/// and the 32+1-bit data phase, including the dummy write-back on a
/// non-`Ok` ACK. No retry happens here — see [`crate::dp::dp_read`] /
/// [`crate::dp::dp_write`] for WAIT/FAULT handling.
///
/// `half_cycle_ns` controls the clock rate: each clock phase (high or low)
/// is held for approximately that many nanoseconds via
/// [`PinDriver::delay_ns`].
pub fn transfer(
    pins: &mut dyn PinDriver,
    half_cycle_ns: u32,
    addr: RegAddr,
    port: Port,
    direction: Direction,
    write_value: u32,
) -> Result<(Ack, u32), SwdError> {
    let mut clk = Clock::new(pins, half_cycle_ns);
    clk.pins.set_swdio_output();

    let apndp = matches!(port, Port::Ap);
    let rnw = matches!(direction, Direction::Read);
    let request_parity = (apndp as u8) ^ (rnw as u8) ^ (addr.a2() as u8) ^ (addr.a3() as u8);
    let request: u8 = 1                        // start
        | ((apndp as u8) << 1)
        | ((rnw as u8) << 2)
        | ((addr.a2() as u8) << 3)
        | ((addr.a3() as u8) << 4)
        | (request_parity << 5)
        | (0 << 6)                             // stop
        | (1 << 7); // park
    clk.write_bits_lsb_first(request as u64, 8);

    // Turnaround: host releases SWDIO for the target to drive ACK.
    clk.pins.set_swdio_input();
    clk.clock_only();

    let ack_bits = clk.read_bits_lsb_first(3) as u8;
    let ack = Ack::decode(ack_bits)?;

    if ack == Ack::Ok && direction == Direction::Read {
        let raw = clk.read_bits_lsb_first(32) as u32;
        let parity_bit = clk.read_bit();
        // Turnaround back to host before driving the trailing park clock.
        clk.clock_only();
        clk.pins.set_swdio_output();
        clk.write_bit(false); // park
        if parity_bit != parity32(raw) {
            return Err(SwdError::Parity);
        }
        Ok((ack, raw))
    } else {
        // Either a write, or a non-OK ACK on a read: emit the data phase as
        // a (possibly dummy) write to keep line state consistent.
        clk.clock_only(); // turnaround
        clk.pins.set_swdio_output();
        let value = if ack == Ack::Ok { write_value } else { 0 };
        let parity = parity32(value);
        clk.write_bits_lsb_first(value as u64 | ((parity as u64) << 32), 33);
        clk.write_bit(false); // park
        Ok((ack, 0))
    }
}

/// Fixed 128-bit selection-alert pattern used by the dormant-to-SWD
/// sequence, each word transmitted MSB-first.
const SELECTION_ALERT_SEQUENCE: [u32; 4] =
    [0x49CF_9046, 0xA9B4_A161, 0x97F5_BBC7, 0x4570_3D98];

/// 8-bit SWD activation code, MSB-first on the wire.
const SWD_ACTIVATION_CODE: u8 = 0x58;

/// JTAG-to-SWD 16-bit pattern, LSB-first on the wire (`0xE79E`).
const JTAG_TO_SWD_SEQUENCE: u16 = 0xE79E;

/// SWD-to-dormant 16-bit pattern, LSB-first on the wire (`0xE3BC`).
const SWD_TO_DORMANT_SEQUENCE: u16 = 0xE3BC;

fn write_msb_first(clk: &mut Clock<'_>, value: u32, bits: u32) {
    for i in (0..bits).rev() {
        clk.write_bit((value >> i) & 1 != 0);
    }
}

/// Drives SWDIO high for at least 50 clocks, then one low clock, per
/// spec.md §4.1.
pub fn line_reset(pins: &mut dyn PinDriver, half_cycle_ns: u32) {
    let mut clk = Clock::new(pins, half_cycle_ns);
    clk.pins.set_swdio_output();
    clk.pins.set_swdio(true);
    clk.clock_n(50);
    clk.pins.set_swdio(false);
    clk.clock_only();
}

/// Dormant-to-SWD connect sequence: 8 high clocks, the 128-bit selection
/// alert (MSB-first per word), 4 low clocks, the activation code
/// (MSB-first), then a line reset.
pub fn dormant_to_swd(pins: &mut dyn PinDriver, half_cycle_ns: u32) {
    {
        let mut clk = Clock::new(pins, half_cycle_ns);
        clk.pins.set_swdio_output();
        clk.pins.set_swdio(true);
        clk.clock_n(8);
        for word in SELECTION_ALERT_SEQUENCE {
            write_msb_first(&mut clk, word, 32);
        }
        clk.pins.set_swdio(false);
        clk.clock_n(4);
        write_msb_first(&mut clk, SWD_ACTIVATION_CODE as u32, 8);
    }
    line_reset(pins, half_cycle_ns);
}

/// JTAG-to-SWD connect sequence: a line reset, the 16-bit pattern `0xE79E`
/// LSB-first, then another line reset.
pub fn jtag_to_swd(pins: &mut dyn PinDriver, half_cycle_ns: u32) {
    line_reset(pins, half_cycle_ns);
    {
        let mut clk = Clock::new(pins, half_cycle_ns);
        clk.pins.set_swdio_output();
        clk.write_bits_lsb_first(JTAG_TO_SWD_SEQUENCE as u64, 16);
    }
    line_reset(pins, half_cycle_ns);
}

/// SWD-to-dormant exit sequence used during shutdown: a line reset plus the
/// 16-bit pattern `0xE3BC` LSB-first.
pub fn swd_to_dormant(pins: &mut dyn PinDriver, half_cycle_ns: u32) {
    line_reset(pins, half_cycle_ns);
    let mut clk = Clock::new(pins, half_cycle_ns);
    clk.pins.set_swdio_output();
    clk.write_bits_lsb_first(SWD_TO_DORMANT_SEQUENCE as u64, 16);
}
