//! The error taxonomy shared by the build path and the query engine.
//!
//! Mirrors the kinds described for the query engine: client-facing parse/request
//! errors are reported verbatim, build-time errors are surfaced to the loader,
//! and invariant violations are programming errors rather than user input
//! problems.

use thiserror::Error;

/// Errors produced while building or querying a [`crate::domain::table::Table`].
#[derive(Debug, Error)]
pub enum SiloError {
    /// Malformed JSON, unknown `type` discriminant, missing required field,
    /// out-of-range enum, non-positive position, or a proportion outside `[0, 1]`.
    #[error("query parse error: {0}")]
    QueryParse(String),

    /// Syntactically valid but refers to something that does not exist, or is
    /// out of bounds: unknown column, unknown sequence name, invalid regex,
    /// position past the end of the reference sequence.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Bad insertion syntax encountered while building a sequence column.
    #[error("invalid insertion format: {0}")]
    InsertionFormat(String),

    /// Build-time failure: empty reference sequence, illegal character in an
    /// aligned sequence, schema violation (e.g. two default columns).
    #[error("preprocessing error: {0}")]
    Preprocessing(String),

    /// The request's deadline elapsed before the query could complete.
    #[error("query timed out")]
    Timeout,

    /// The request was cancelled cooperatively before it could complete.
    #[error("query was cancelled")]
    Cancelled,

    /// An invariant was violated. In debug builds the call site should prefer
    /// `debug_assert!`/`unreachable!`; this variant is what that same call
    /// site degrades to in release builds instead of panicking.
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl SiloError {
    pub fn query_parse(msg: impl Into<String>) -> Self {
        Self::QueryParse(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn insertion_format(msg: impl Into<String>) -> Self {
        Self::InsertionFormat(msg.into())
    }

    pub fn preprocessing(msg: impl Into<String>) -> Self {
        Self::Preprocessing(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Asserts an internal invariant. Panics in debug builds (fast failure during
/// development); returns `Err(SiloError::Internal)` in release builds so a
/// single misbehaving query cannot take a long-running server down.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($msg:tt)*) => {
        if cfg!(debug_assertions) {
            assert!($cond, $($msg)*);
        } else if !$cond {
            return Err($crate::error::SiloError::internal(format!($($msg)*)));
        }
    };
}
