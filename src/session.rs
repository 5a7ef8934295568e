//! The top-level session object: owns the pin driver for its entire
//! lifetime, exposes the connect/flash/shutdown lifecycle, and publishes
//! the relaxed-consistency status counters from spec.md §5/§6.
//!
//! Replaces the source's global mutable singletons (one static SWD
//! config, one parser-progress struct) with values a caller creates,
//! passes explicitly, and drops at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::dp::DebugInterface;
use crate::error::Error;
use crate::flash::{Nvmc, ctrl_ap};
use crate::hex::{self, Record};
use crate::mem_ap::MemAp;
use crate::progress::ProgressSink;
use crate::swd::PinDriver;
use crate::update::UpdateCoordinator;

/// One debug session over one target. Not `Sync`: every operation is
/// totally ordered, so sharing a `Session` across tasks is a compile-time
/// error rather than a runtime race (spec.md §5, "single-owner per
/// session").
pub struct Session<P: PinDriver> {
    pins: P,
    half_cycle_ns: u32,
    mem_ap: MemAp,
    lines_parsed: AtomicU64,
    data_bytes_seen: AtomicU64,
    bytes_flashed: AtomicU64,
}

/// The MEM-AP used for application flash and core access on this target
/// family.
const MEM_AP_NUMBER: u8 = 0;

impl<P: PinDriver> Session<P> {
    /// Wraps a pin driver. The link is not brought up until the first
    /// operation that needs it.
    pub fn new(pins: P, half_cycle_ns: u32) -> Self {
        Session {
            pins,
            half_cycle_ns,
            mem_ap: MemAp::new(MEM_AP_NUMBER),
            lines_parsed: AtomicU64::new(0),
            data_bytes_seen: AtomicU64::new(0),
            bytes_flashed: AtomicU64::new(0),
        }
    }

    /// Lines observed by the hex parser across every update run on this
    /// session so far.
    pub fn lines_parsed(&self) -> u64 {
        self.lines_parsed.load(Ordering::Relaxed)
    }

    /// Bytes carried by `Data` records observed so far.
    pub fn data_bytes_seen(&self) -> u64 {
        self.data_bytes_seen.load(Ordering::Relaxed)
    }

    /// Bytes actually committed to flash so far (post-program, not
    /// counting bytes still sitting in the page buffer).
    pub fn bytes_flashed(&self) -> u64 {
        self.bytes_flashed.load(Ordering::Relaxed)
    }

    /// Breaks read-out protection and erases the whole chip via the
    /// vendor CTRL-AP. Idempotent: calling this twice in a row leaves the
    /// same post-state as calling it once (spec.md §8, property 9).
    pub fn mass_erase_unprotect(&mut self) -> Result<(), Error> {
        let mut dp = connect_link(&mut self.pins, self.half_cycle_ns)?;
        self.mem_ap.invalidate();
        ctrl_ap::mass_erase(&mut self.mem_ap, &mut dp)?;
        Ok(())
    }

    /// Erases application flash via NVMC.ERASEALL. Leaves read-out
    /// protection, if enabled, untouched.
    pub fn mass_erase(&mut self) -> Result<(), Error> {
        let mut dp = connect_link(&mut self.pins, self.half_cycle_ns)?;
        self.mem_ap.invalidate();
        Nvmc::new().mass_erase(&mut self.mem_ap, &mut dp)?;
        Ok(())
    }

    /// Starts one firmware-update run. The returned [`UpdateSession`]
    /// borrows this session exclusively until it is consumed by
    /// reaching `EOF` inside [`UpdateSession::ingest`], or by
    /// [`UpdateSession::abort`].
    pub fn begin_update(&mut self) -> Result<UpdateSession<'_, P>, Error> {
        let dp = connect_link(&mut self.pins, self.half_cycle_ns)?;
        self.mem_ap.invalidate();
        Ok(UpdateSession {
            dp,
            mem_ap: &mut self.mem_ap,
            parser: hex::Parser::new(),
            mass_erased: false,
            lines_parsed: &self.lines_parsed,
            data_bytes_seen: &self.data_bytes_seen,
            bytes_flashed: &self.bytes_flashed,
            finished: false,
            _pins: std::marker::PhantomData,
        })
    }
}

/// Brings the link up over `pins` alone, so the borrow this returns never
/// covers more of a [`Session`] than the pin driver itself — the other
/// fields (`mem_ap`, the counters) stay free for the caller to borrow in
/// the same statement.
fn connect_link(pins: &mut dyn PinDriver, half_cycle_ns: u32) -> Result<DebugInterface<'_>, Error> {
    let mut dp = DebugInterface::new(pins, half_cycle_ns);
    dp.connect()?;
    Ok(dp)
}

/// A throughput-tracking [`ProgressSink`] wrapper: forwards every update
/// to an inner sink while also accumulating into a session's
/// `bytes_flashed` counter.
struct CountingProgress<'a> {
    inner: &'a mut dyn ProgressSink,
    counter: &'a AtomicU64,
    last: u64,
}

impl ProgressSink for CountingProgress<'_> {
    fn on_progress(&mut self, current: u64, total: u64, operation: &str) {
        if operation == "program" && current >= self.last {
            self.counter.fetch_add(current - self.last, Ordering::Relaxed);
            self.last = current;
        }
        self.inner.on_progress(current, total, operation);
    }
}

/// One firmware-update run, borrowed from a [`Session`]. Chunks of an
/// Intel-HEX image are fed in via [`UpdateSession::ingest`] as they
/// arrive; reaching `EOF` runs reset-and-release automatically.
pub struct UpdateSession<'s, P: PinDriver> {
    dp: DebugInterface<'s>,
    mem_ap: &'s mut MemAp,
    parser: hex::Parser,
    mass_erased: bool,
    lines_parsed: &'s AtomicU64,
    data_bytes_seen: &'s AtomicU64,
    bytes_flashed: &'s AtomicU64,
    finished: bool,
    _pins: std::marker::PhantomData<&'s mut P>,
}

impl<'s, P: PinDriver> UpdateSession<'s, P> {
    /// Marks this run as having started from a CTRL-AP mass erase, so
    /// flushes skip the per-page erase. Must be called before the first
    /// [`UpdateSession::ingest`] to take effect for the whole run.
    pub fn set_mass_erased(&mut self, mass_erased: bool) {
        self.mass_erased = mass_erased;
    }

    /// Whether `EOF` has already been observed; `ingest` is a no-op past
    /// that point.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds one chunk of Intel-HEX text. Safe to call with arbitrarily
    /// sized chunks, including single bytes. Runs reset-and-release
    /// automatically the moment `EOF` is observed.
    pub fn ingest(&mut self, bytes: &[u8], progress: &mut dyn ProgressSink) -> Result<(), Error> {
        if self.finished {
            return Ok(());
        }

        let mut counting = CountingProgress {
            inner: progress,
            counter: self.bytes_flashed,
            last: 0,
        };
        let mut coordinator = UpdateCoordinator::new(self.mem_ap, &mut self.dp);
        coordinator.set_mass_erased(self.mass_erased);

        let mut result = Ok(());
        let mut reached_eof = false;
        {
            let mut on_record = |record: Record, addr: u32| {
                if result.is_err() {
                    return;
                }
                if matches!(record, Record::EndOfFile) {
                    reached_eof = true;
                }
                if let Err(e) = coordinator.handle_record(record, addr, &mut counting) {
                    result = Err(e);
                }
            };
            self.parser.feed(bytes, &mut on_record);
        }

        self.lines_parsed.store(self.parser.lines(), Ordering::Relaxed);
        self.data_bytes_seen.store(self.parser.data_bytes(), Ordering::Relaxed);
        if reached_eof {
            self.finished = true;
        }

        result.map_err(Error::from)
    }

    /// Aborts a partially-ingested update: does not attempt a final
    /// flush, but still runs reset-and-release and disconnects cleanly,
    /// per spec.md §5's cancellation semantics. Whatever was already
    /// flushed to flash is left in place.
    pub fn abort(mut self) -> Result<(), Error> {
        if self.finished {
            return Ok(());
        }
        let mut coordinator = UpdateCoordinator::new(self.mem_ap, &mut self.dp);
        coordinator.abort()?;
        self.finished = true;
        Ok(())
    }
}

impl<P: PinDriver> std::fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("half_cycle_ns", &self.half_cycle_ns)
            .field("lines_parsed", &self.lines_parsed())
            .field("data_bytes_seen", &self.data_bytes_seen())
            .field("bytes_flashed", &self.bytes_flashed())
            .finish()
    }
}
