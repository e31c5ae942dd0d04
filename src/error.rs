//! Error types and Result alias for rustkv

use std::fmt;

/// Status kinds returned by database, tree, and cursor operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Lookup miss, move past the last/first key, erase of an absent key
    KeyNotFound,
    /// Insert of an existing key without OVERWRITE
    DuplicateKey,
    /// Read or advance of a NIL cursor without a seed direction
    CursorIsNil,
    /// Allocation limit exhausted
    OutOfMemory,
    /// The comparator callback refused the comparison
    CompareFailed,
    /// Null or out-of-range required argument
    InvParameter,
    /// Cursor or tree operation without a bound backend
    NotInitialized,
    /// Key longer than the configured in-node key width
    InvKeysize,
    /// A transaction is already active on this database
    TxnInProgress,
    /// Underlying file I/O failure
    IoError,
    /// Database file does not exist
    FileNotFound,
    /// File magic or format version mismatch
    InvFileVersion,
    /// Page size is out of range or not a power of two
    InvPagesize,
    /// Broken internal invariant (also: poisoned lock)
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::KeyNotFound => "key not found",
            ErrorCode::DuplicateKey => "duplicate key",
            ErrorCode::CursorIsNil => "cursor is nil",
            ErrorCode::OutOfMemory => "out of memory",
            ErrorCode::CompareFailed => "key comparison failed",
            ErrorCode::InvParameter => "invalid parameter",
            ErrorCode::NotInitialized => "not initialized",
            ErrorCode::InvKeysize => "invalid key size",
            ErrorCode::TxnInProgress => "transaction already in progress",
            ErrorCode::IoError => "i/o error",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::InvFileVersion => "invalid file version",
            ErrorCode::InvPagesize => "invalid page size",
            ErrorCode::Internal => "internal error",
        }
    }
}

/// Error carrying a status kind and an optional context message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    code: ErrorCode,
    message: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Error {
            code,
            message: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            message: Some(message.into()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.code.as_str(), msg),
            None => f.write_str(self.code.as_str()),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            _ => ErrorCode::IoError,
        };
        Error::with_message(code, err.to_string())
    }
}

/// Result type alias for rustkv operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_message() {
        let err = Error::with_message(ErrorCode::InvPagesize, "got 100");
        assert_eq!(err.to_string(), "invalid page size: got 100");
        assert_eq!(
            Error::new(ErrorCode::KeyNotFound).to_string(),
            "key not found"
        );
    }

    #[test]
    fn io_error_maps_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert_eq!(err.code(), ErrorCode::FileNotFound);
    }
}
