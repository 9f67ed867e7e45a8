//! Error types and error handling strategy for wirecall.
//!
//! This module defines the crate-wide error type. Error handling follows
//! these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Each kind has a portable class name so it can cross the wire inside a
//!   response envelope and be resurrected on the other side
//! - Operating-system failures are converted at the channel boundary and
//!   carried as sources

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === I/O ===
    /// An operating-system I/O operation failed.
    Io,
    /// The operation would block (non-blocking paths only).
    TryAgain,
    /// The peer closed the stream orderly mid-frame.
    Eof,

    // === Deadlines / cancellation ===
    /// A deadline elapsed before the operation completed.
    DeadlineExceeded,
    /// The governing context was cancelled.
    Cancelled,

    // === Protocol ===
    /// Framing checksum, message type, or method signature did not match.
    DataMismatch,
    /// Object or method name unknown at the peer.
    NotFound,
    /// Argument decoding failed.
    InvalidArgument,
    /// A size or length exceeded its allowed range.
    OutOfRange,

    // === Lifecycle ===
    /// API misuse: empty future, broken promise, closed channel handle.
    InvalidState,
    /// The component is tearing down and refuses new work.
    ShuttingDown,
    /// No candidate address accepted a connection.
    Unavailable,
    /// The requested operation is not implemented.
    NotImplemented,

    // === Catch-alls ===
    /// Invariant violation inside the runtime.
    Internal,
    /// A remote error whose class is not registered locally.
    Unknown,
}

impl ErrorKind {
    /// Returns the portable class name used on the wire.
    #[must_use]
    pub const fn portable_name(self) -> &'static str {
        match self {
            Self::Io => "io_error",
            Self::TryAgain => "try_again",
            Self::Eof => "eof",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::DataMismatch => "data_mismatch",
            Self::NotFound => "not_found",
            Self::InvalidArgument => "invalid_argument",
            Self::OutOfRange => "out_of_range",
            Self::InvalidState => "invalid_state",
            Self::ShuttingDown => "shutting_down",
            Self::Unavailable => "unavailable",
            Self::NotImplemented => "not_implemented",
            Self::Internal => "internal_error",
            Self::Unknown => "unknown_error",
        }
    }

    /// Looks a kind up by its portable class name.
    ///
    /// Returns `None` for names this build does not know, in which case the
    /// caller should fall back to [`ErrorKind::Unknown`].
    #[must_use]
    pub fn for_portable_name(name: &str) -> Option<Self> {
        const ALL: [ErrorKind; 15] = [
            ErrorKind::Io,
            ErrorKind::TryAgain,
            ErrorKind::Eof,
            ErrorKind::DeadlineExceeded,
            ErrorKind::Cancelled,
            ErrorKind::DataMismatch,
            ErrorKind::NotFound,
            ErrorKind::InvalidArgument,
            ErrorKind::OutOfRange,
            ErrorKind::InvalidState,
            ErrorKind::ShuttingDown,
            ErrorKind::Unavailable,
            ErrorKind::NotImplemented,
            ErrorKind::Internal,
            ErrorKind::Unknown,
        ];
        ALL.into_iter().find(|k| k.portable_name() == name)
    }
}

/// The main error type for wirecall operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.context == other.context
    }
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if this error is a would-block marker.
    #[must_use]
    pub const fn is_try_again(&self) -> bool {
        matches!(self.kind, ErrorKind::TryAgain)
    }

    /// Returns true if this error is a deadline condition.
    #[must_use]
    pub const fn is_deadline(&self) -> bool {
        matches!(self.kind, ErrorKind::DeadlineExceeded)
    }

    /// Returns the context message, if any.
    #[must_use]
    pub fn message(&self) -> &str {
        self.context.as_deref().unwrap_or("")
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Shorthand for an [`ErrorKind::Io`] error with context.
    #[must_use]
    pub fn io(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io).with_context(ctx)
    }

    /// Shorthand for an [`ErrorKind::TryAgain`] error with context.
    #[must_use]
    pub fn try_again(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::TryAgain).with_context(ctx)
    }

    /// Shorthand for an [`ErrorKind::Eof`] error with context.
    #[must_use]
    pub fn eof(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::Eof).with_context(ctx)
    }

    /// Shorthand for an [`ErrorKind::DeadlineExceeded`] error with context.
    #[must_use]
    pub fn deadline_exceeded(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded).with_context(ctx)
    }

    /// Shorthand for an [`ErrorKind::Cancelled`] error with context.
    #[must_use]
    pub fn cancelled(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled).with_context(ctx)
    }

    /// Shorthand for an [`ErrorKind::DataMismatch`] error with context.
    #[must_use]
    pub fn data_mismatch(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::DataMismatch).with_context(ctx)
    }

    /// Shorthand for an [`ErrorKind::NotFound`] error with context.
    #[must_use]
    pub fn not_found(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound).with_context(ctx)
    }

    /// Shorthand for an [`ErrorKind::InvalidArgument`] error with context.
    #[must_use]
    pub fn invalid_argument(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument).with_context(ctx)
    }

    /// Shorthand for an [`ErrorKind::OutOfRange`] error with context.
    #[must_use]
    pub fn out_of_range(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutOfRange).with_context(ctx)
    }

    /// Shorthand for an [`ErrorKind::InvalidState`] error with context.
    #[must_use]
    pub fn invalid_state(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState).with_context(ctx)
    }

    /// Shorthand for an [`ErrorKind::ShuttingDown`] error with context.
    #[must_use]
    pub fn shutting_down(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::ShuttingDown).with_context(ctx)
    }

    /// Shorthand for an [`ErrorKind::Unavailable`] error with context.
    #[must_use]
    pub fn unavailable(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable).with_context(ctx)
    }

    /// Shorthand for an [`ErrorKind::Internal`] error with context.
    #[must_use]
    pub fn internal(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_context(ctx)
    }

    /// Converts an OS-level error into the matching kind.
    ///
    /// `WouldBlock` maps to [`ErrorKind::TryAgain`], `UnexpectedEof` to
    /// [`ErrorKind::Eof`], everything else to [`ErrorKind::Io`] with the
    /// original error attached as source.
    #[must_use]
    pub fn from_io(err: std::io::Error, ctx: impl Into<String>) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::WouldBlock => ErrorKind::TryAgain,
            std::io::ErrorKind::UnexpectedEof => ErrorKind::Eof,
            _ => ErrorKind::Io,
        };
        Self::new(kind).with_context(ctx).with_source(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "i/o failure")
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for wirecall operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal");
    }

    #[test]
    fn display_with_context() {
        let err = Error::data_mismatch("bad checksum");
        assert_eq!(err.to_string(), "DataMismatch: bad checksum");
    }

    #[test]
    fn portable_names_round_trip() {
        for kind in [
            ErrorKind::Io,
            ErrorKind::TryAgain,
            ErrorKind::Eof,
            ErrorKind::DeadlineExceeded,
            ErrorKind::Cancelled,
            ErrorKind::DataMismatch,
            ErrorKind::NotFound,
            ErrorKind::InvalidArgument,
            ErrorKind::OutOfRange,
            ErrorKind::InvalidState,
            ErrorKind::ShuttingDown,
            ErrorKind::Unavailable,
            ErrorKind::NotImplemented,
            ErrorKind::Internal,
            ErrorKind::Unknown,
        ] {
            assert_eq!(ErrorKind::for_portable_name(kind.portable_name()), Some(kind));
        }
    }

    #[test]
    fn unknown_portable_name() {
        assert_eq!(ErrorKind::for_portable_name("no_such_error"), None);
    }

    #[test]
    fn io_error_conversion_maps_would_block() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::WouldBlock).into();
        assert!(err.is_try_again());
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::from_io(
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer"),
            "read failed",
        );
        assert_eq!(err.kind(), ErrorKind::Io);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "reset by peer");
    }
}
