//! Crate-wide error types.
//!
//! Every layer (SWD line driver, DP, AP/MEM-AP, flash, parser, coordinator)
//! raises its own error type and converts it into [`Error`] via `#[from]`,
//! the same composition pattern `probe-rs` uses for `ArmError`.

use std::fmt;

/// The coarse failure category a caller can match on, independent of which
/// layer raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Null/zero-length buffers, misaligned addresses where alignment is
    /// required, or an out-of-range target address.
    InvalidArg,
    /// IDCODE invalid, ACK repeatedly NACK/protocol-error, or a sticky FAULT
    /// that could not be cleared.
    LinkLost,
    /// A DP WAIT response persisted past the retry budget.
    Busy,
    /// A poll loop (flash READY, CTRL-AP ERASEALLSTATUS, power-up ACK) did
    /// not settle within its documented bound.
    Timeout,
    /// A post-erase or post-write read-back mismatched.
    Verify,
    /// The CTRL-AP identity register did not match the expected vendor
    /// value.
    Protected,
    /// An Intel-HEX line's checksum did not sum to zero modulo 256.
    BadChecksum,
    /// An Intel-HEX line was malformed (missing `:`, too short, or an
    /// unrecognized record type where one is required).
    BadFormat,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArg => "invalid argument",
            ErrorKind::LinkLost => "link lost",
            ErrorKind::Busy => "target busy",
            ErrorKind::Timeout => "operation timed out",
            ErrorKind::Verify => "verification failed",
            ErrorKind::Protected => "access port identity protected/unexpected",
            ErrorKind::BadChecksum => "bad hex checksum",
            ErrorKind::BadFormat => "malformed hex record",
        };
        f.write_str(s)
    }
}

/// Top-level error type returned by every public operation in this crate.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct Error {
    kind: ErrorKind,
    detail: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Builds an [`Error`] with no further detail beyond its [`ErrorKind`].
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Error {
            kind,
            detail: detail.into(),
            source: None,
        }
    }

    /// Builds an [`Error`] that wraps a lower-layer error as its `source`.
    pub fn wrap(
        kind: ErrorKind,
        detail: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error {
            kind,
            detail: detail.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The coarse category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A layer-local error that knows which [`ErrorKind`] it maps to, so the
/// `From<LayerError> for Error` impls can stay mechanical.
trait LayerError: std::error::Error + Send + Sync + Sized + 'static {
    fn kind(&self) -> ErrorKind;
    fn context(&self) -> &'static str;
}

/// Errors raised by the SWD line driver (`swd` module). No retry happens at
/// this layer; every variant is surfaced to the DP layer as-is.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum SwdError {
    /// The target responded with a bit pattern that is not one of
    /// OK/WAIT/FAULT, or did not drive the ACK phase at all. `WAIT` and
    /// `FAULT` are not error conditions at this layer — `swd::transfer`
    /// returns them as successfully decoded ACK values for the DP layer
    /// to retry or recover, so this is the only ACK-related variant here.
    #[error("protocol error: invalid or missing ACK")]
    Protocol,
    /// The parity bit accompanying a data phase did not match the
    /// transmitted data.
    #[error("parity error on data phase")]
    Parity,
}

impl LayerError for SwdError {
    fn kind(&self) -> ErrorKind {
        match self {
            SwdError::Protocol | SwdError::Parity => ErrorKind::LinkLost,
        }
    }

    fn context(&self) -> &'static str {
        "SWD transfer failed"
    }
}

/// Errors raised by the Debug Port layer (`dp` module).
#[derive(Debug, thiserror::Error)]
pub enum DpError {
    /// The underlying SWD transfer failed.
    #[error("SWD transfer error")]
    Swd(#[from] SwdError),
    /// `WAIT` persisted past the retry budget.
    #[error("DP WAIT retry budget exhausted after {attempts} attempts")]
    RetryExhausted {
        /// Number of attempts made before giving up.
        attempts: u32,
    },
    /// IDCODE read as zero or all-ones, or no connect sequence succeeded.
    #[error("invalid IDCODE or no responsive target")]
    InvalidIdCode,
    /// The debug/system power-up request did not complete within the
    /// documented bound.
    #[error("timed out waiting for debug/system power-up acknowledgement")]
    PowerUpTimeout,
}

impl LayerError for DpError {
    fn kind(&self) -> ErrorKind {
        match self {
            DpError::Swd(inner) => inner.kind(),
            DpError::RetryExhausted { .. } => ErrorKind::Busy,
            DpError::InvalidIdCode => ErrorKind::LinkLost,
            DpError::PowerUpTimeout => ErrorKind::Timeout,
        }
    }

    fn context(&self) -> &'static str {
        "DP operation failed"
    }
}

/// Errors raised by the AP/MEM-AP layer (`ap`, `mem_ap` modules).
#[derive(Debug, thiserror::Error)]
pub enum ApError {
    /// The underlying DP operation failed.
    #[error("DP operation error")]
    Dp(#[from] DpError),
    /// An address passed to a block transfer was not aligned to the access
    /// size, or a length/bounds argument was invalid.
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    /// A halted-core precondition (S_HALT) was required but not observed.
    #[error("core register access requires the core to be halted")]
    CoreNotHalted,
    /// S_REGRDY did not assert after issuing a DCRSR transfer.
    #[error("timed out waiting for core register access to complete")]
    RegisterNotReady,
}

impl LayerError for ApError {
    fn kind(&self) -> ErrorKind {
        match self {
            ApError::Dp(inner) => inner.kind(),
            ApError::InvalidArg(_) | ApError::CoreNotHalted => ErrorKind::InvalidArg,
            ApError::RegisterNotReady => ErrorKind::Timeout,
        }
    }

    fn context(&self) -> &'static str {
        "AP operation failed"
    }
}

/// Errors raised by the flash controller / CTRL-AP layer (`flash` module).
#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    /// The underlying AP operation failed.
    #[error("AP operation error")]
    Ap(#[from] ApError),
    /// READY (or ERASEALLSTATUS) did not settle within its documented bound.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// A post-erase or post-write read-back mismatched.
    #[error(
        "verification failed at 0x{address:08x}: expected 0x{expected:08x}, got 0x{actual:08x}"
    )]
    Verify {
        /// The address that was read back.
        address: u32,
        /// The expected value.
        expected: u32,
        /// The value actually observed.
        actual: u32,
    },
    /// The CTRL-AP identity register did not match the expected vendor
    /// value.
    #[error("CTRL-AP identity mismatch: got 0x{0:08x}")]
    Protected(u32),
    /// An address or length argument was invalid for the operation (e.g.
    /// out of the flash/UICR address range).
    #[error("invalid argument: {0}")]
    InvalidArg(String),
}

impl LayerError for FlashError {
    fn kind(&self) -> ErrorKind {
        match self {
            FlashError::Ap(inner) => inner.kind(),
            FlashError::Timeout(_) => ErrorKind::Timeout,
            FlashError::Verify { .. } => ErrorKind::Verify,
            FlashError::Protected(_) => ErrorKind::Protected,
            FlashError::InvalidArg(_) => ErrorKind::InvalidArg,
        }
    }

    fn context(&self) -> &'static str {
        "flash operation failed"
    }
}

/// Errors raised by the Intel-HEX parser (`hex` module). These never abort
/// the stream: they are surfaced via the error counter, not by a `Result`
/// return from `parse`.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum HexError {
    /// The line's checksum did not sum to zero modulo 256.
    #[error("checksum mismatch")]
    BadChecksum,
    /// The line was missing `:`, too short for its declared byte count, or
    /// contained non-hex characters.
    #[error("malformed record")]
    BadFormat,
    /// A run of bytes exceeded the line-accumulator capacity without a
    /// terminator; the run was dropped and parsing resumed at the next
    /// terminator.
    #[error("line accumulator overflowed, data dropped")]
    Overflow,
}

impl LayerError for HexError {
    fn kind(&self) -> ErrorKind {
        match self {
            HexError::BadChecksum => ErrorKind::BadChecksum,
            HexError::BadFormat | HexError::Overflow => ErrorKind::BadFormat,
        }
    }

    fn context(&self) -> &'static str {
        "hex parse error"
    }
}

macro_rules! impl_from_layer_error {
    ($($t:ty),+ $(,)?) => {
        $(
            impl From<$t> for Error {
                fn from(e: $t) -> Self {
                    let kind = LayerError::kind(&e);
                    let context = LayerError::context(&e);
                    Error::wrap(kind, context, e)
                }
            }
        )+
    };
}

impl_from_layer_error!(SwdError, DpError, ApError, FlashError, HexError);
