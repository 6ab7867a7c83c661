//! Error types for archive operations.
//!
//! All fallible operations in this crate return [`Result<T>`], an alias for
//! `std::result::Result<T, Error>`. Errors fall into a few categories:
//!
//! | Category | Variants | Typical cause |
//! |----------|----------|---------------|
//! | Configuration | [`Config`][Error::Config] | bad command line or method string |
//! | I/O | [`Io`][Error::Io] | file system operations |
//! | Format | [`Format`][Error::Format], [`BadBlock`][Error::BadBlock] | malformed archive data |
//! | Integrity | [`ChecksumMismatch`][Error::ChecksumMismatch], [`SizeMismatch`][Error::SizeMismatch] | corruption detected by verification |
//! | Resources | [`TooBig`][Error::TooBig] | a buffer would exceed its configured limit |
//!
//! During an archive scan, format errors are recoverable per block: the scan
//! loop counts them and moves to the next block (or switches to the recovery
//! pass). The `test` command treats any of them as an overall failure.

use std::io;

/// The main error type for archive operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid command line, option value, or method string.
    ///
    /// Raised before any archive I/O happens.
    #[error("{0}")]
    Config(String),

    /// Malformed archive data that is not attributable to one block.
    #[error("invalid archive format: {0}")]
    Format(String),

    /// A block that could not be parsed or decompressed.
    ///
    /// Carries the archive offset where the block starts so that scan
    /// diagnostics can point at the damage.
    #[error("bad block at offset {offset}: {reason}")]
    BadBlock {
        /// Archive byte offset of the block.
        offset: u64,
        /// What went wrong.
        reason: String,
    },

    /// A fragment or segment hash did not match its stored value.
    #[error("checksum mismatch for {what}")]
    ChecksumMismatch {
        /// Description of the mismatching unit (fragment id, segment name).
        what: String,
    },

    /// Decompressed data had the wrong length.
    #[error("{what}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Description of the unit being checked.
        what: String,
        /// Length the index or comment declared.
        expected: u64,
        /// Length actually produced.
        actual: u64,
    },

    /// A buffer would exceed its configured limit.
    #[error("{0} exceeds size limit")]
    TooBig(String),

    /// A ZPAQL configuration failed to compile.
    #[error("config line {line}: {reason}")]
    Syntax {
        /// 1-based line in the config source.
        line: u32,
        /// Parser message.
        reason: String,
    },
}

impl Error {
    /// Shorthand for a [`Error::Format`] with a formatted message.
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    /// Shorthand for a [`Error::BadBlock`] at a known offset.
    pub fn bad_block(offset: u64, reason: impl Into<String>) -> Self {
        Error::BadBlock {
            offset,
            reason: reason.into(),
        }
    }

    /// True if this error should abort the whole run rather than be
    /// recorded against one block and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Config(_) | Error::TooBig(_))
    }
}

/// Alias for `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_offset() {
        let e = Error::bad_block(4096, "truncated header");
        assert_eq!(e.to_string(), "bad block at offset 4096: truncated header");
    }

    #[test]
    fn io_errors_are_fatal() {
        let e = Error::from(io::Error::other("disk failure"));
        assert!(e.is_fatal());
        assert!(!Error::format("x").is_fatal());
    }
}
