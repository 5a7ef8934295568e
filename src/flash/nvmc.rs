//! Non-Volatile Memory Controller sequencing: page erase, word/buffer
//! program, full-chip erase, and the scoped CONFIG-mode acquisition that
//! guarantees read-only on every exit path.

use super::PAGE_SIZE;
use crate::dp::DebugInterface;
use crate::error::FlashError;
use crate::mem_ap::MemAp;
use crate::progress::ProgressSink;

const NVMC_BASE: u32 = 0x4001_E000;
const READY: u32 = NVMC_BASE + 0x400;
const CONFIG: u32 = NVMC_BASE + 0x504;
const ERASEPAGE: u32 = NVMC_BASE + 0x508;
const ERASEALL: u32 = NVMC_BASE + 0x50C;

const CONFIG_READ_ONLY: u32 = 0;
const CONFIG_WRITE: u32 = 1;
const CONFIG_ERASE: u32 = 2;

const ERASED_WORD: u32 = 0xFFFF_FFFF;

/// Typical full-page erase duration; the driver waits this long before it
/// starts polling READY, rather than spinning through it.
const ERASE_PULSE_MS: u32 = 90;
/// Total READY poll budget before a page erase, in milliseconds.
const PRE_ERASE_READY_TIMEOUT_MS: u32 = 500;
/// Total READY poll budget after triggering a page erase, in milliseconds,
/// not counting [`ERASE_PULSE_MS`].
const POST_ERASE_READY_TIMEOUT_MS: u32 = 400;
/// READY poll budget around a word/buffer program.
const PROGRAM_READY_TIMEOUT_MS: u32 = 500;

/// Offsets within a page sampled to confirm an erase actually took.
const VERIFY_OFFSETS: [u32; 4] = [0, 4, 8, PAGE_SIZE - 4];

/// Sequences the target NVMC. Stateless: every method takes the
/// [`MemAp`]/[`DebugInterface`] pair it should act through.
#[derive(Debug, Default)]
pub struct Nvmc;

impl Nvmc {
    /// Constructs the driver. There is no per-instance state to initialize;
    /// CONFIG mode lives on the target.
    pub fn new() -> Self {
        Nvmc
    }

    /// Erases the 4 KiB page containing `page_addr`, which must be page
    /// aligned. Accepts UICR addresses as well as application flash.
    pub fn erase_page(&self, mem: &mut MemAp, dp: &mut DebugInterface, page_addr: u32) -> Result<(), FlashError> {
        if page_addr % PAGE_SIZE != 0 {
            return Err(FlashError::InvalidArg(format!(
                "erase_page address 0x{page_addr:08x} is not page-aligned"
            )));
        }

        poll_ready(mem, dp, PRE_ERASE_READY_TIMEOUT_MS, "NVMC READY before erase")?;

        with_config(mem, dp, CONFIG_ERASE, |mem, dp| {
            mem.write32(dp, ERASEPAGE, page_addr)?;
            dp.delay_ms(ERASE_PULSE_MS);
            poll_ready(mem, dp, POST_ERASE_READY_TIMEOUT_MS, "NVMC READY after erase")
        })?;

        verify_erased(mem, dp, page_addr)
    }

    /// Programs one word-aligned 32-bit word.
    pub fn program_word(&self, mem: &mut MemAp, dp: &mut DebugInterface, addr: u32, word: u32) -> Result<(), FlashError> {
        if addr % 4 != 0 {
            return Err(FlashError::InvalidArg(format!(
                "program_word address 0x{addr:08x} is not word-aligned"
            )));
        }
        with_config(mem, dp, CONFIG_WRITE, |mem, dp| {
            mem.write32(dp, addr, word)?;
            poll_ready(mem, dp, PROGRAM_READY_TIMEOUT_MS, "NVMC READY after word program")
        })
    }

    /// Programs an arbitrarily-aligned buffer. Unaligned head/tail bytes go
    /// through read-modify-write; the aligned middle goes through the
    /// MEM-AP block-write path. Yields to `progress` every page's worth of
    /// bytes written.
    pub fn program_buffer(
        &self,
        mem: &mut MemAp,
        dp: &mut DebugInterface,
        progress: &mut dyn ProgressSink,
        addr: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        if data.is_empty() {
            return Ok(());
        }
        let total = data.len() as u64;
        with_config(mem, dp, CONFIG_WRITE, |mem, dp| {
            let chunk_size = PAGE_SIZE as usize;
            let mut written = 0usize;
            while written < data.len() {
                let len = chunk_size.min(data.len() - written);
                let chunk_addr = addr
                    .checked_add(written as u32)
                    .ok_or_else(|| FlashError::InvalidArg("program_buffer address overflow".into()))?;
                mem.write_buffer(dp, chunk_addr, &data[written..written + len])?;
                written += len;
                progress.on_progress(written as u64, total, "program");
                // Cooperative yield point; the block programmer must not
                // starve other tasks for more than one page's worth of work.
                dp.delay_ms(0);
            }
            poll_ready(mem, dp, PROGRAM_READY_TIMEOUT_MS, "NVMC READY after buffer program")
        })
    }

    /// Erases the whole application flash region via NVMC.ERASEALL. Does
    /// not clear read-out protection; see
    /// [`crate::flash::ctrl_ap::mass_erase`] for that.
    pub fn mass_erase(&self, mem: &mut MemAp, dp: &mut DebugInterface) -> Result<(), FlashError> {
        poll_ready(mem, dp, PRE_ERASE_READY_TIMEOUT_MS, "NVMC READY before mass erase")?;
        with_config(mem, dp, CONFIG_ERASE, |mem, dp| {
            mem.write32(dp, ERASEALL, 1)?;
            poll_ready(mem, dp, POST_ERASE_READY_TIMEOUT_MS, "NVMC READY after mass erase")
        })
    }
}

/// Writes `mode` to CONFIG and confirms it by read-back.
fn set_config(mem: &mut MemAp, dp: &mut DebugInterface, mode: u32) -> Result<(), FlashError> {
    mem.write32(dp, CONFIG, mode)?;
    let observed = mem.read32(dp, CONFIG)?;
    if observed != mode {
        return Err(FlashError::Verify {
            address: CONFIG,
            expected: mode,
            actual: observed,
        });
    }
    Ok(())
}

/// Runs `f` with CONFIG set to `mode`, then unconditionally restores
/// read-only, regardless of whether `f` or the restore itself failed. This
/// is the scoped-acquisition replacement for a `goto cleanup` pattern: the
/// read-only invariant holds on every exit path.
fn with_config<F, T>(mem: &mut MemAp, dp: &mut DebugInterface, mode: u32, f: F) -> Result<T, FlashError>
where
    F: FnOnce(&mut MemAp, &mut DebugInterface) -> Result<T, FlashError>,
{
    set_config(mem, dp, mode)?;
    let result = f(mem, dp);
    let restore = set_config(mem, dp, CONFIG_READ_ONLY);
    match (result, restore) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(restore_err)) => Err(restore_err),
        (Err(err), _) => Err(err),
    }
}

/// Polls READY until it is observed high on two consecutive reads, or
/// `timeout_ms` one-millisecond iterations elapse.
fn poll_ready(mem: &mut MemAp, dp: &mut DebugInterface, timeout_ms: u32, context: &'static str) -> Result<(), FlashError> {
    let mut consecutive = 0u32;
    for _ in 0..timeout_ms.max(1) {
        let ready = mem.read32(dp, READY)? & 1 != 0;
        if ready {
            consecutive += 1;
            if consecutive >= 2 {
                return Ok(());
            }
        } else {
            consecutive = 0;
        }
        dp.delay_ms(1);
    }
    Err(FlashError::Timeout(context))
}

/// Confirms a page actually erased by sampling four offsets within it. A
/// single mismatched read is retried once before the erase is declared
/// failed.
fn verify_erased(mem: &mut MemAp, dp: &mut DebugInterface, page_addr: u32) -> Result<(), FlashError> {
    for offset in VERIFY_OFFSETS {
        let addr = page_addr + offset;
        let mut value = mem.read32(dp, addr)?;
        if value != ERASED_WORD {
            value = mem.read32(dp, addr)?;
        }
        if value != ERASED_WORD {
            return Err(FlashError::Verify {
                address: addr,
                expected: ERASED_WORD,
                actual: value,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_offsets_cover_page_head_and_tail() {
        assert_eq!(VERIFY_OFFSETS, [0, 4, 8, PAGE_SIZE - 4]);
    }
}
