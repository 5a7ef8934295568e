//! Progress reporting capability.
//!
//! Long-running operations (buffer programming, mass erase polling) accept
//! a `&mut dyn ProgressSink` instead of a concrete callback type, the same
//! trait-object-for-a-callback shape `probe-rs` uses for its flash
//! progress reporting.

/// Receives periodic progress updates from a long-running operation.
pub trait ProgressSink {
    /// `current` and `total` share a unit appropriate to `operation`
    /// (usually bytes). `operation` is a short, stable label such as
    /// `"program"` or `"erase"`.
    fn on_progress(&mut self, current: u64, total: u64, operation: &str);
}

/// A [`ProgressSink`] that discards every update; the default when a
/// caller has no interest in progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_progress(&mut self, _current: u64, _total: u64, _operation: &str) {}
}
