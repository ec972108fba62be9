use std::io;
use std::os::raw::c_int;
use std::result;

use thiserror::Error;

/// Custom result type for engine operations
pub type Result<T> = result::Result<T, Error>;

const EINVAL: c_int = 22;
const EACCES: c_int = 13;

/// Engine error codes
#[derive(Debug, Error)]
pub enum Error {
    /// Key/data pair already exists
    #[error("Key/data pair already exists")]
    KeyExist,
    /// No matching key/data pair found
    #[error("No matching key/data pair found")]
    NotFound,
    /// Requested page not found
    #[error("Requested page not found")]
    PageNotFound,
    /// Database file is corrupted
    #[error("Database file is corrupted")]
    Corrupted,
    /// Update of meta page failed or environment had fatal error
    #[error("Update of meta page failed or environment had fatal error")]
    Panic,
    /// Database version mismatch
    #[error("Database environment version mismatch")]
    VersionMismatch,
    /// File is not a valid data file
    #[error("File is not a valid data file")]
    Invalid,
    /// Environment mapsize limit reached
    #[error("Environment mapsize limit reached")]
    MapFull,
    /// Environment maxdbs limit reached
    #[error("Environment maxdbs limit reached")]
    DbsFull,
    /// Environment maxreaders limit reached
    #[error("Environment maxreaders limit reached")]
    ReadersFull,
    /// Thread-local storage keys full
    #[error("Thread-local storage keys full - too many environments open")]
    TlsFull,
    /// Transaction has too many dirty pages
    #[error("Transaction has too many dirty pages - transaction too big")]
    TxnFull,
    /// Too many open cursors
    #[error("Internal error - cursor stack limit reached")]
    CursorFull,
    /// Page has not enough space
    #[error("Internal error - page has no more space")]
    PageFull,
    /// Database contents grew beyond environment mapsize
    #[error("Database contents grew beyond environment mapsize")]
    MapResized,
    /// Operation and DB incompatible
    #[error("Operation and DB incompatible, or DB flags changed")]
    Incompatible,
    /// Invalid reuse of reader locktable slot
    #[error("Invalid reuse of reader locktable slot")]
    BadRslot,
    /// Transaction must abort, has a child, or is invalid
    #[error("Transaction must abort, has a child, or is invalid")]
    BadTxn,
    /// Unsupported size of key/DB name/data, or wrong DUPFIXED size
    #[error("Unsupported size of key/DB name/data, or wrong DUPFIXED size")]
    BadValSize,
    /// The specified DBI was changed unexpectedly
    #[error("The specified DBI handle was closed/changed unexpectedly")]
    BadDbi,
    /// Invalid argument or option combination
    #[error("Invalid argument")]
    InvalidArgument,
    /// Write attempted through a read-only environment or transaction
    #[error("Permission denied")]
    ReadOnly,
    /// Underlying file operation failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Classic numeric code of this error.
    pub fn code(&self) -> c_int {
        match self {
            Error::KeyExist => -30799,
            Error::NotFound => -30798,
            Error::PageNotFound => -30797,
            Error::Corrupted => -30796,
            Error::Panic => -30795,
            Error::VersionMismatch => -30794,
            Error::Invalid => -30793,
            Error::MapFull => -30792,
            Error::DbsFull => -30791,
            Error::ReadersFull => -30790,
            Error::TlsFull => -30789,
            Error::TxnFull => -30788,
            Error::CursorFull => -30787,
            Error::PageFull => -30786,
            Error::MapResized => -30785,
            Error::Incompatible => -30784,
            Error::BadRslot => -30783,
            Error::BadTxn => -30782,
            Error::BadValSize => -30781,
            Error::BadDbi => -30780,
            Error::InvalidArgument => EINVAL,
            Error::ReadOnly => EACCES,
            Error::Io(err) => err.raw_os_error().unwrap_or(-1),
        }
    }

    /// Rebuild an error from its numeric code.
    pub fn from_code(code: c_int) -> Error {
        match code {
            -30799 => Error::KeyExist,
            -30798 => Error::NotFound,
            -30797 => Error::PageNotFound,
            -30796 => Error::Corrupted,
            -30795 => Error::Panic,
            -30794 => Error::VersionMismatch,
            -30793 => Error::Invalid,
            -30792 => Error::MapFull,
            -30791 => Error::DbsFull,
            -30790 => Error::ReadersFull,
            -30789 => Error::TlsFull,
            -30788 => Error::TxnFull,
            -30787 => Error::CursorFull,
            -30786 => Error::PageFull,
            -30785 => Error::MapResized,
            -30784 => Error::Incompatible,
            -30783 => Error::BadRslot,
            -30782 => Error::BadTxn,
            -30781 => Error::BadValSize,
            -30780 => Error::BadDbi,
            EINVAL => Error::InvalidArgument,
            EACCES => Error::ReadOnly,
            err => Error::Io(io::Error::from_raw_os_error(err)),
        }
    }

    /// True for a missing key or database, and for a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound => true,
            Error::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<c_int> for Error {
    fn from(code: c_int) -> Error {
        Error::from_code(code)
    }
}

/// Describe a numeric error code.
pub fn strerror(code: c_int) -> String {
    if code == 0 {
        return "Successful return: 0".to_string();
    }
    Error::from_code(code).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_codes_survive_conversion() {
        for code in -30799..=-30780 {
            let err = Error::from_code(code);
            assert!(!matches!(err, Error::Io(_)), "code {code}");
            assert_eq!(err.code(), code);
            assert!(!strerror(code).is_empty());
        }
    }

    #[test]
    fn os_codes_map_to_io() {
        let err = Error::from_code(2);
        assert!(err.is_not_found());
        assert_eq!(err.code(), 2);
        assert!(matches!(Error::from(EACCES), Error::ReadOnly));
        assert!(strerror(0).starts_with("Successful"));
    }
}
