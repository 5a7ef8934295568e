//! Debug Port (DP) register layer.
//!
//! Owns the one piece of state ADIv5 requires above the line driver: the
//! cached `SELECT` register value, so a caller never has to remember
//! whether the right {AP, bank} is already selected. Retries WAIT, clears
//! sticky faults on FAULT, and implements the connect/disconnect
//! sequences from spec.md §4.2.

use crate::error::DpError;
use crate::swd::{self, Ack, Direction, Port, RegAddr, pins::PinDriver};

/// DP.IDCODE (read) / DP.ABORT (write).
const ADDR_IDCODE_ABORT: RegAddr = RegAddr::new(0x0);
/// DP.CTRL/STAT (read/write).
const ADDR_CTRL_STAT: RegAddr = RegAddr::new(0x4);
/// DP.SELECT (write-only).
const ADDR_SELECT: RegAddr = RegAddr::new(0x8);
/// DP.RDBUFF (read-only); holds the result of the most recent AP read.
const ADDR_RDBUFF: RegAddr = RegAddr::new(0xC);

/// Value written to ABORT to clear STKCMP, STKERR, WDERR and ORUNERR.
const ABORT_CLEAR_ALL_ERRORS: u32 = 0x1E;

const CTRL_STAT_CSYSPWRUPACK: u32 = 1 << 31;
const CTRL_STAT_CSYSPWRUPREQ: u32 = 1 << 30;
const CTRL_STAT_CDBGPWRUPACK: u32 = 1 << 29;
const CTRL_STAT_CDBGPWRUPREQ: u32 = 1 << 28;
const CTRL_STAT_POWERUP_REQ: u32 = CTRL_STAT_CSYSPWRUPREQ | CTRL_STAT_CDBGPWRUPREQ;
const CTRL_STAT_POWERUP_ACK: u32 = CTRL_STAT_CSYSPWRUPACK | CTRL_STAT_CDBGPWRUPACK;

/// Bounded retry budget for a single DP/AP register access while the
/// target responds WAIT.
const MAX_WAIT_ATTEMPTS: u32 = 10;

/// An IDCODE of all-zero or all-one bits is never valid and indicates no
/// responsive target (or a link not yet brought up).
fn idcode_is_valid(idcode: u32) -> bool {
    idcode != 0x0000_0000 && idcode != 0xFFFF_FFFF
}

/// The Debug Port layer: owns the pin driver for the session's lifetime,
/// the clock rate, and the cached `SELECT` value.
pub struct DebugInterface<'a> {
    pins: &'a mut dyn PinDriver,
    half_cycle_ns: u32,
    select: u32,
    idcode: Option<u32>,
}

impl<'a> DebugInterface<'a> {
    /// Wraps a [`PinDriver`] with no assumption about link state; call
    /// [`DebugInterface::connect`] before issuing any other DP/AP access.
    pub fn new(pins: &'a mut dyn PinDriver, half_cycle_ns: u32) -> Self {
        DebugInterface {
            pins,
            half_cycle_ns,
            // SELECT's reset value is unknown to the host; force the first
            // `select_ap_bank` call to actually write it.
            select: u32::MAX,
            idcode: None,
        }
    }

    /// The IDCODE observed at the last successful [`DebugInterface::connect`].
    pub fn idcode(&self) -> Option<u32> {
        self.idcode
    }

    fn transfer_with_retry(
        &mut self,
        addr: RegAddr,
        port: Port,
        direction: Direction,
        value: u32,
    ) -> Result<u32, DpError> {
        for _ in 0..MAX_WAIT_ATTEMPTS {
            match swd::transfer(self.pins, self.half_cycle_ns, addr, port, direction, value)? {
                (Ack::Ok, data) => return Ok(data),
                (Ack::Wait, _) => {
                    self.pins.delay_ms(1);
                    continue;
                }
                (Ack::Fault, _) => {
                    self.clear_sticky_errors()?;
                    continue;
                }
            }
        }
        Err(DpError::RetryExhausted {
            attempts: MAX_WAIT_ATTEMPTS,
        })
    }

    /// Clears STKCMP/STKERR/WDERR/ORUNERR by writing `0x1E` to DP.ABORT.
    fn clear_sticky_errors(&mut self) -> Result<(), DpError> {
        for _ in 0..MAX_WAIT_ATTEMPTS {
            match swd::transfer(
                self.pins,
                self.half_cycle_ns,
                ADDR_IDCODE_ABORT,
                Port::Dp,
                Direction::Write,
                ABORT_CLEAR_ALL_ERRORS,
            )? {
                (Ack::Ok, _) => return Ok(()),
                (Ack::Wait, _) => {
                    self.pins.delay_ms(1);
                    continue;
                }
                (Ack::Fault, _) => continue,
            }
        }
        Err(DpError::RetryExhausted {
            attempts: MAX_WAIT_ATTEMPTS,
        })
    }

    /// Reads a DP register, retrying WAIT and recovering FAULT inline.
    pub fn dp_read(&mut self, addr: RegAddr) -> Result<u32, DpError> {
        self.transfer_with_retry(addr, Port::Dp, Direction::Read, 0)
    }

    /// Writes a DP register, retrying WAIT and recovering FAULT inline.
    pub fn dp_write(&mut self, addr: RegAddr, value: u32) -> Result<(), DpError> {
        self.transfer_with_retry(addr, Port::Dp, Direction::Write, value)?;
        Ok(())
    }

    /// Rewrites DP.SELECT only if `(ap_number, bank)` differs from the
    /// cached value — the invariant from spec.md §3 ("any AP register
    /// access outside the currently selected {AP, bank} requires a DP
    /// write to SELECT first").
    pub fn select_ap_bank(&mut self, ap_number: u8, bank: u8) -> Result<(), DpError> {
        let select = (u32::from(ap_number) << 24) | (u32::from(bank) << 4);
        if select != self.select {
            self.dp_write(ADDR_SELECT, select)?;
            self.select = select;
        }
        Ok(())
    }

    /// Issues the raw AP read frame (whose data is stale per ADIv5), then
    /// reads DP.RDBUFF to obtain the value actually requested.
    pub fn ap_read(&mut self, ap_number: u8, bank: u8, offset: u8) -> Result<u32, DpError> {
        self.select_ap_bank(ap_number, bank)?;
        self.transfer_with_retry(RegAddr::new(offset), Port::Ap, Direction::Read, 0)?;
        self.dp_read(ADDR_RDBUFF)
    }

    /// Issues the raw AP write. The caller is responsible for a follow-up
    /// `dp_read(RDBUFF)` if it needs to know the write has committed.
    pub fn ap_write(&mut self, ap_number: u8, bank: u8, offset: u8, value: u32) -> Result<(), DpError> {
        self.select_ap_bank(ap_number, bank)?;
        self.transfer_with_retry(RegAddr::new(offset), Port::Ap, Direction::Write, value)?;
        Ok(())
    }

    /// Reads DP.RDBUFF, draining/committing the previous AP access.
    pub fn drain(&mut self) -> Result<u32, DpError> {
        self.dp_read(ADDR_RDBUFF)
    }

    /// Delays the calling poll loop by approximately `millis` milliseconds,
    /// forwarding to the underlying [`PinDriver`]. Shared by every layer
    /// above this one so no layer needs its own handle to the pins.
    pub fn delay_ms(&mut self, millis: u32) {
        self.pins.delay_ms(millis);
    }

    /// Whether the underlying pin driver has a hardware reset line wired.
    pub fn has_reset_pin(&self) -> bool {
        self.pins.has_reset_pin()
    }

    /// Asserts (`true`) or releases (`false`) the hardware reset line, if
    /// wired. No-op otherwise.
    pub fn set_reset(&mut self, asserted: bool) {
        self.pins.set_reset(asserted);
    }

    /// Parks every pin as a floating input, ending the session.
    pub fn shutdown_pins(&mut self) {
        self.pins.park();
    }

    /// Brings the link up: dormant wakeup first, then JTAG-to-SWD as a
    /// fallback; clears errors and requests debug/system power-up, polling
    /// for both acknowledgement bits. Returns the observed IDCODE.
    pub fn connect(&mut self) -> Result<u32, DpError> {
        swd::dormant_to_swd(self.pins, self.half_cycle_ns);
        let mut idcode = self.dp_read(ADDR_IDCODE_ABORT);

        if !matches!(idcode, Ok(v) if idcode_is_valid(v)) {
            tracing::debug!("dormant wakeup did not yield a valid IDCODE, trying JTAG-to-SWD");
            swd::jtag_to_swd(self.pins, self.half_cycle_ns);
            idcode = self.dp_read(ADDR_IDCODE_ABORT);
        }

        let idcode = match idcode {
            Ok(v) if idcode_is_valid(v) => v,
            _ => return Err(DpError::InvalidIdCode),
        };
        tracing::info!("SWD link up, IDCODE = 0x{idcode:08x}");

        self.clear_sticky_errors()?;
        self.dp_write(ADDR_CTRL_STAT, CTRL_STAT_POWERUP_REQ)?;

        let mut acked = false;
        for _ in 0..100 {
            let status = self.dp_read(ADDR_CTRL_STAT)?;
            if status & CTRL_STAT_POWERUP_ACK == CTRL_STAT_POWERUP_ACK {
                acked = true;
                break;
            }
            self.pins.delay_ms(10);
        }
        if !acked {
            return Err(DpError::PowerUpTimeout);
        }

        self.clear_sticky_errors()?;
        self.idcode = Some(idcode);
        Ok(idcode)
    }

    /// Clears the power-up request, waits for both ACK bits to clear, then
    /// emits the line-reset + SWD-to-dormant exit sequence.
    pub fn disconnect(&mut self) {
        if self.dp_write(ADDR_CTRL_STAT, 0).is_ok() {
            for _ in 0..100 {
                match self.dp_read(ADDR_CTRL_STAT) {
                    Ok(status) if status & CTRL_STAT_POWERUP_ACK == 0 => break,
                    Ok(_) => self.pins.delay_ms(10),
                    Err(_) => break,
                }
            }
        }
        swd::line_reset(self.pins, self.half_cycle_ns);
        swd::swd_to_dormant(self.pins, self.half_cycle_ns);
        self.idcode = None;
        tracing::info!("SWD link disconnected");
    }
}
