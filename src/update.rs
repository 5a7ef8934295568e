//! Firmware-update coordinator: turns a stream of Intel-HEX records into
//! page-aligned erase+program operations through a page buffer, finishing
//! with reset-and-release on `EOF`.

use crate::dp::DebugInterface;
use crate::error::FlashError;
use crate::flash::{self, Nvmc, reset};
use crate::hex::Record;
use crate::mem_ap::MemAp;
use crate::progress::ProgressSink;

/// A page-aligned-on-flush buffer of pending writes, initialized to the
/// erased-flash value so partial records never corrupt surrounding bytes.
struct PageBuffer {
    start: u32,
    data: Vec<u8>,
    valid_len: usize,
}

impl PageBuffer {
    fn new() -> Self {
        PageBuffer {
            start: 0,
            data: vec![0xFF; flash::PAGE_SIZE as usize],
            valid_len: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.valid_len == 0
    }

    fn begin(&mut self, addr: u32) {
        self.start = addr;
        self.valid_len = 0;
        self.data.iter_mut().for_each(|b| *b = 0xFF);
    }

    fn fits(&self, addr: u32, len: usize) -> bool {
        let end = match addr.checked_add(len as u32) {
            Some(end) => end,
            None => return false,
        };
        let capacity_end = match self.start.checked_add(self.data.len() as u32) {
            Some(end) => end,
            None => return false,
        };
        addr >= self.start && end <= capacity_end
    }

    fn place(&mut self, addr: u32, bytes: &[u8]) {
        let offset = (addr - self.start) as usize;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.valid_len = self.valid_len.max(offset + bytes.len());
    }
}

/// Drives one firmware-update session: holds the exclusive borrow of the
/// link for its lifetime, per spec.md §5 ("one update at a time per
/// device").
pub struct UpdateCoordinator<'dp, 'pins> {
    mem: &'dp mut MemAp,
    dp: &'dp mut DebugInterface<'pins>,
    nvmc: Nvmc,
    buffer: PageBuffer,
    /// Set when the session began with a CTRL-AP mass erase, letting
    /// flushes skip the per-page erase since flash is already 0xFF.
    /// Cleared on `EOF`.
    mass_erased: bool,
}

impl<'dp, 'pins> UpdateCoordinator<'dp, 'pins> {
    /// Builds a coordinator over an already-connected link. The caller
    /// owns connect/disconnect of the DP itself; [`UpdateCoordinator`]
    /// only calls [`reset::reset_and_release`] at `EOF` or [`Self::abort`].
    pub fn new(mem: &'dp mut MemAp, dp: &'dp mut DebugInterface<'pins>) -> Self {
        UpdateCoordinator {
            mem,
            dp,
            nvmc: Nvmc::new(),
            buffer: PageBuffer::new(),
            mass_erased: false,
        }
    }

    /// Marks the session as having started from a CTRL-AP mass erase, so
    /// the next flushes skip per-page erase. The flag is cleared at `EOF`.
    pub fn set_mass_erased(&mut self, mass_erased: bool) {
        self.mass_erased = mass_erased;
    }

    /// Feeds one decoded hex record (as produced by [`crate::hex::Parser`])
    /// into the coordinator.
    pub fn handle_record(&mut self, record: Record, absolute_address: u32, progress: &mut dyn ProgressSink) -> Result<(), FlashError> {
        match record {
            Record::Data { value, .. } => self.on_data(absolute_address, &value, progress),
            Record::ExtendedLinearAddress(_) | Record::ExtendedSegmentAddress(_) => {
                // Any base change makes subsequent addresses discontinuous
                // with whatever the buffer currently holds.
                self.flush(progress)
            }
            Record::EndOfFile => {
                self.flush(progress)?;
                self.mass_erased = false;
                reset::reset_and_release(self.mem, self.dp)?;
                self.dp.shutdown_pins();
                Ok(())
            }
            Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => Ok(()),
        }
    }

    fn on_data(&mut self, addr: u32, bytes: &[u8], progress: &mut dyn ProgressSink) -> Result<(), FlashError> {
        if bytes.is_empty() {
            return Ok(());
        }
        if bytes.len() > self.buffer.data.len() {
            return Err(FlashError::InvalidArg(format!(
                "DATA record of {} bytes exceeds the page buffer",
                bytes.len()
            )));
        }
        if self.buffer.is_empty() {
            self.buffer.begin(addr);
        } else if !self.buffer.fits(addr, bytes.len()) {
            self.flush(progress)?;
            self.buffer.begin(addr);
        }
        self.buffer.place(addr, bytes);
        Ok(())
    }

    /// Erases (unless mass-erased) and programs the buffer's held bytes,
    /// then marks it empty. A no-op if the buffer holds nothing.
    fn flush(&mut self, progress: &mut dyn ProgressSink) -> Result<(), FlashError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let span_start = flash::page_floor(self.buffer.start);
        let span_end = flash::page_ceil(self.buffer.start + self.buffer.valid_len as u32);

        if !self.mass_erased {
            let mut page = span_start;
            while page < span_end {
                self.nvmc.erase_page(self.mem, self.dp, page)?;
                page += flash::PAGE_SIZE;
            }
        }

        self.nvmc
            .program_buffer(self.mem, self.dp, progress, self.buffer.start, &self.buffer.data[..self.buffer.valid_len])?;

        self.buffer.valid_len = 0;
        Ok(())
    }

    /// Attempts a clean shutdown mid-session: no further flush is
    /// attempted (whatever was already flushed stays in flash), but the
    /// target is still reset-and-released and the link disconnected.
    pub fn abort(&mut self) -> Result<(), FlashError> {
        reset::reset_and_release(self.mem, self.dp)?;
        self.dp.shutdown_pins();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn page_buffer_fits_rejects_discontinuity() {
        let mut buf = PageBuffer::new();
        buf.begin(0x1000);
        assert!(buf.fits(0x1004, 16));
        assert!(!buf.fits(0x1000 + flash::PAGE_SIZE, 4));
    }

    #[test]
    fn page_buffer_place_tracks_high_watermark() {
        let mut buf = PageBuffer::new();
        buf.begin(0x2000);
        buf.place(0x2000, &[1, 2, 3, 4]);
        buf.place(0x2010, &[5, 6]);
        assert_eq!(buf.valid_len, 0x12);
        assert_eq!(buf.data[0..4], [1, 2, 3, 4]);
        assert_eq!(buf.data[0x10..0x12], [5, 6]);
    }
}
