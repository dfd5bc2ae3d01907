//! Framework-specific error kinds, mapped onto `conveyor_shared::ErrorEnvelope`.

use conveyor_shared::{ErrorClass, ErrorCode, ErrorEnvelope};
use std::fmt;

/// A put was attempted against a closed queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedForPutError;

impl fmt::Display for ClosedForPutError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("put on a closed queue")
    }
}

impl std::error::Error for ClosedForPutError {}

impl From<ClosedForPutError> for ErrorEnvelope {
    fn from(_: ClosedForPutError) -> Self {
        Self::expected(ErrorCode::new("pipeline", "closed_for_put"), "put on a closed queue")
    }
}

/// `close()` was called a second time with `once = true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseTwiceError;

impl fmt::Display for CloseTwiceError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("queue was already closed")
    }
}

impl std::error::Error for CloseTwiceError {}

impl From<CloseTwiceError> for ErrorEnvelope {
    fn from(_: CloseTwiceError) -> Self {
        Self::expected(ErrorCode::new("pipeline", "close_twice"), "queue was already closed")
    }
}

/// A non-blocking operation could not complete immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WouldBlockError;

impl fmt::Display for WouldBlockError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("operation would block")
    }
}

impl std::error::Error for WouldBlockError {}

impl From<WouldBlockError> for ErrorEnvelope {
    fn from(_: WouldBlockError) -> Self {
        Self::expected(ErrorCode::new("pipeline", "would_block"), "operation would block")
    }
}

/// Builder misuse that the type system could not prevent statically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MisuseError {
    reason: String,
}

impl MisuseError {
    /// Construct a misuse error with a human-readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl fmt::Display for MisuseError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "pipeline misuse: {}", self.reason)
    }
}

impl std::error::Error for MisuseError {}

impl From<MisuseError> for ErrorEnvelope {
    fn from(error: MisuseError) -> Self {
        Self::invariant(ErrorCode::new("pipeline", "misuse"), error.reason)
    }
}

/// A framework invariant was violated (a bug in `conveyor-pipeline` itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolationError {
    reason: String,
}

impl InvariantViolationError {
    /// Construct an invariant-violation error with a human-readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl fmt::Display for InvariantViolationError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "pipeline invariant violated: {}", self.reason)
    }
}

impl std::error::Error for InvariantViolationError {}

impl From<InvariantViolationError> for ErrorEnvelope {
    fn from(error: InvariantViolationError) -> Self {
        Self::invariant(ErrorCode::new("pipeline", "invariant_violation"), error.reason)
    }
}

/// Wrap a user-supplied function's error as an `UserFunctionError`-flavored envelope.
///
/// Preserves the original message and records the originating stage in metadata.
pub fn user_function_error(stage: &'static str, error: impl fmt::Display) -> ErrorEnvelope {
    ErrorEnvelope::unexpected(
        ErrorCode::new("pipeline", "user_function_error"),
        error.to_string(),
        ErrorClass::NonRetriable,
    )
    .with_metadata("stage", stage)
}
