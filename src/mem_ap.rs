//! MEM-AP memory access and (optional) Cortex-M core register access.
//!
//! A [`MemAp`] is deliberately small: one AP number and a cached TAR value,
//! nothing else. Every method takes the [`DebugInterface`] it should talk
//! through as an explicit argument rather than storing one, so a `Session`
//! can own the link and hand out `MemAp`s (or a core-register view of one)
//! without fighting the borrow checker over who holds the pins.

use crate::ap::{AUTO_INCREMENT_WRAP_BYTES, AddressIncrement, CSW, DRW, DataSize, TAR, csw_value};
use crate::dp::DebugInterface;
use crate::error::ApError;

const DHCSR: u32 = 0xE000_EDF0;
const DCRSR: u32 = 0xE000_EDF4;
const DCRDR: u32 = 0xE000_EDF8;

const DHCSR_DBGKEY: u32 = 0xA05F << 16;
const DHCSR_C_DEBUGEN: u32 = 1 << 0;
const DHCSR_C_HALT: u32 = 1 << 1;
const DHCSR_S_REGRDY: u32 = 1 << 16;
const DHCSR_S_HALT: u32 = 1 << 17;

const DCRSR_REGWNR: u32 = 1 << 16;

/// Bound on S_HALT / S_REGRDY polling; each iteration sleeps 1ms, so this is
/// a ~100ms budget.
const MAX_POLL_ATTEMPTS: u32 = 100;

/// One Memory Access Port, addressed on the DP by `ap_number`.
pub struct MemAp {
    ap_number: u8,
    tar: Option<u32>,
}

impl MemAp {
    /// Wraps the AP at `ap_number`. Does not touch the wire until a method
    /// is called.
    pub fn new(ap_number: u8) -> Self {
        MemAp {
            ap_number,
            tar: None,
        }
    }

    /// The AP number this instance addresses.
    pub fn ap_number(&self) -> u8 {
        self.ap_number
    }

    /// Drops the cached TAR value, forcing the next access to rewrite it.
    /// Needed after another AP (e.g. the CTRL-AP) or a link reconnect may
    /// have changed TAR without this instance's knowledge.
    pub fn invalidate(&mut self) {
        self.tar = None;
    }

    fn set_csw(&mut self, dp: &mut DebugInterface, size: DataSize, increment: AddressIncrement) -> Result<(), ApError> {
        dp.ap_write(self.ap_number, 0, CSW, csw_value(size, increment))?;
        Ok(())
    }

    fn set_tar(&mut self, dp: &mut DebugInterface, addr: u32) -> Result<(), ApError> {
        if self.tar != Some(addr) {
            dp.ap_write(self.ap_number, 0, TAR, addr)?;
            self.tar = Some(addr);
        }
        Ok(())
    }

    /// Reads one 32-bit word at a word-aligned address.
    pub fn read32(&mut self, dp: &mut DebugInterface, addr: u32) -> Result<u32, ApError> {
        if addr % 4 != 0 {
            return Err(ApError::InvalidArg(format!(
                "read32 address 0x{addr:08x} is not word-aligned"
            )));
        }
        self.set_csw(dp, DataSize::U32, AddressIncrement::Off)?;
        self.set_tar(dp, addr)?;
        let value = dp.ap_read(self.ap_number, 0, DRW)?;
        Ok(value)
    }

    /// Writes one 32-bit word at a word-aligned address.
    pub fn write32(&mut self, dp: &mut DebugInterface, addr: u32, word: u32) -> Result<(), ApError> {
        if addr % 4 != 0 {
            return Err(ApError::InvalidArg(format!(
                "write32 address 0x{addr:08x} is not word-aligned"
            )));
        }
        self.set_csw(dp, DataSize::U32, AddressIncrement::Off)?;
        self.set_tar(dp, addr)?;
        dp.ap_write(self.ap_number, 0, DRW, word)?;
        Ok(())
    }

    /// Reads `words.len()` consecutive 32-bit words starting at the
    /// word-aligned `addr`, rewriting TAR whenever a run would otherwise
    /// cross the 1024-byte auto-increment wrap boundary.
    fn read_words(&mut self, dp: &mut DebugInterface, addr: u32, words: &mut [u32]) -> Result<(), ApError> {
        if words.is_empty() {
            return Ok(());
        }
        self.set_csw(dp, DataSize::U32, AddressIncrement::Single)?;
        let mut cur = addr;
        let mut idx = 0;
        while idx < words.len() {
            self.set_tar(dp, cur)?;
            let bytes_to_boundary = AUTO_INCREMENT_WRAP_BYTES - (cur % AUTO_INCREMENT_WRAP_BYTES);
            let run = ((bytes_to_boundary / 4) as usize).min(words.len() - idx);
            for word in &mut words[idx..idx + run] {
                *word = dp.ap_read(self.ap_number, 0, DRW)?;
            }
            dp.drain()?;
            // A run that consumes exactly the bytes left in the window ends
            // with real hardware wrapping TAR's low bits back to the window
            // start, not advancing to `cur`. The cache can't predict that
            // value, so drop it and force the next run to rewrite TAR.
            let crossed_boundary = (run as u32) * 4 == bytes_to_boundary;
            cur += (run as u32) * 4;
            self.tar = if crossed_boundary { None } else { Some(cur) };
            idx += run;
        }
        Ok(())
    }

    /// Writes `words` starting at the word-aligned `addr`, rewriting TAR
    /// whenever a run would otherwise cross the 1024-byte auto-increment
    /// wrap boundary, and draining DP.RDBUFF once per run to commit it.
    fn write_words(&mut self, dp: &mut DebugInterface, addr: u32, words: &[u32]) -> Result<(), ApError> {
        if words.is_empty() {
            return Ok(());
        }
        self.set_csw(dp, DataSize::U32, AddressIncrement::Single)?;
        let mut cur = addr;
        let mut idx = 0;
        while idx < words.len() {
            self.set_tar(dp, cur)?;
            let bytes_to_boundary = AUTO_INCREMENT_WRAP_BYTES - (cur % AUTO_INCREMENT_WRAP_BYTES);
            let run = ((bytes_to_boundary / 4) as usize).min(words.len() - idx);
            for &word in &words[idx..idx + run] {
                dp.ap_write(self.ap_number, 0, DRW, word)?;
            }
            dp.drain()?;
            // See the matching comment in `read_words`: a run landing exactly
            // on the window boundary leaves real hardware's TAR wrapped, not
            // advanced, so the cache must be dropped rather than trusted.
            let crossed_boundary = (run as u32) * 4 == bytes_to_boundary;
            cur += (run as u32) * 4;
            self.tar = if crossed_boundary { None } else { Some(cur) };
            idx += run;
        }
        Ok(())
    }

    /// Writes a block of aligned 32-bit words via TAR auto-increment.
    /// `addr` must be word-aligned; `words` may be any length, including
    /// zero.
    pub fn write_block32(&mut self, dp: &mut DebugInterface, addr: u32, words: &[u32]) -> Result<(), ApError> {
        if addr % 4 != 0 {
            return Err(ApError::InvalidArg(format!(
                "write_block32 address 0x{addr:08x} is not word-aligned"
            )));
        }
        self.write_words(dp, addr, words)
    }

    /// Reads `len` bytes starting at `addr`, which need not be aligned.
    /// Unaligned edges are covered by reading the whole/partial words that
    /// contain them; the middle runs through the same auto-increment path
    /// as [`MemAp::write_block32`].
    pub fn read_buffer(&mut self, dp: &mut DebugInterface, addr: u32, len: usize) -> Result<Vec<u8>, ApError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let head = (addr % 4) as usize;
        let word_addr = addr - head as u32;
        let word_count = (head + len).div_ceil(4);
        let mut words = vec![0u32; word_count];
        self.read_words(dp, word_addr, &mut words)?;
        let mut bytes = Vec::with_capacity(word_count * 4);
        for word in &words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes.truncate(head + len);
        Ok(bytes.split_off(head))
    }

    /// Writes `data` starting at `addr`, which need not be aligned. Partial
    /// edge words are covered with a read-modify-write against the current
    /// flash/RAM contents; the aligned middle goes through the same
    /// auto-increment path as [`MemAp::write_block32`].
    pub fn write_buffer(&mut self, dp: &mut DebugInterface, addr: u32, data: &[u8]) -> Result<(), ApError> {
        if data.is_empty() {
            return Ok(());
        }
        let head = (addr % 4) as usize;
        let word_addr = addr - head as u32;
        let word_count = (head + data.len()).div_ceil(4);
        let mut bytes = vec![0u8; word_count * 4];
        if head != 0 || data.len() % 4 != 0 {
            let mut existing = vec![0u32; word_count];
            self.read_words(dp, word_addr, &mut existing)?;
            for (i, word) in existing.iter().enumerate() {
                bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
            }
        }
        bytes[head..head + data.len()].copy_from_slice(data);
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.write_words(dp, word_addr, &words)
    }

    /// Halts the core, polling S_HALT for up to ~100ms.
    pub fn halt_core(&mut self, dp: &mut DebugInterface) -> Result<(), ApError> {
        self.write32(dp, DHCSR, DHCSR_DBGKEY | DHCSR_C_DEBUGEN | DHCSR_C_HALT)?;
        for _ in 0..MAX_POLL_ATTEMPTS {
            if self.read32(dp, DHCSR)? & DHCSR_S_HALT != 0 {
                return Ok(());
            }
            dp.delay_ms(1);
        }
        Err(ApError::CoreNotHalted)
    }

    /// Clears C_HALT, resuming core execution. Debug remains enabled.
    pub fn resume_core(&mut self, dp: &mut DebugInterface) -> Result<(), ApError> {
        self.write32(dp, DHCSR, DHCSR_DBGKEY | DHCSR_C_DEBUGEN)?;
        Ok(())
    }

    fn require_halted(&mut self, dp: &mut DebugInterface) -> Result<(), ApError> {
        if self.read32(dp, DHCSR)? & DHCSR_S_HALT == 0 {
            return Err(ApError::CoreNotHalted);
        }
        Ok(())
    }

    fn wait_regrdy(&mut self, dp: &mut DebugInterface) -> Result<(), ApError> {
        for _ in 0..MAX_POLL_ATTEMPTS {
            if self.read32(dp, DHCSR)? & DHCSR_S_REGRDY != 0 {
                return Ok(());
            }
            dp.delay_ms(1);
        }
        Err(ApError::RegisterNotReady)
    }

    /// Reads a Cortex-M core register (r0-r15, xPSR, ...) via DCRSR/DCRDR.
    /// The core must already be halted.
    pub fn read_core_register(&mut self, dp: &mut DebugInterface, regsel: u32) -> Result<u32, ApError> {
        self.require_halted(dp)?;
        self.write32(dp, DCRSR, regsel & 0x7F)?;
        self.wait_regrdy(dp)?;
        self.read32(dp, DCRDR)
    }

    /// Writes a Cortex-M core register via DCRSR/DCRDR. The core must
    /// already be halted.
    pub fn write_core_register(&mut self, dp: &mut DebugInterface, regsel: u32, value: u32) -> Result<(), ApError> {
        self.require_halted(dp)?;
        self.write32(dp, DCRDR, value)?;
        self.write32(dp, DCRSR, (regsel & 0x7F) | DCRSR_REGWNR)?;
        self.wait_regrdy(dp)
    }
}
