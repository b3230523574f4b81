//! Error types for ipoddb-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Binary format error: {0}")]
    BinRw(String),

    /// Malformed or unrecognized iTunesDB structure
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Database is not open")]
    NotOpen,

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Does not exist: {0}")]
    DoesNotExist(String),

    #[error("Not empty: {0}")]
    NotEmpty(String),

    /// A low-level mutation reported success but its post-condition failed
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Log error: {0}")]
    Log(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Query cancelled")]
    Cancelled,
}

impl Error {
    /// Stable result code used on the wire
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::BinRw(_) => "binary_format",
            Error::Parse(_) => "parse_error",
            Error::NotOpen => "not_open",
            Error::AlreadyExists(_) => "already_exists",
            Error::DoesNotExist(_) => "does_not_exist",
            Error::NotEmpty(_) => "not_empty",
            Error::Internal(_) => "internal",
            Error::Write(_) => "write_error",
            Error::Log(_) => "log_error",
            Error::Serialization(_) => "serialization",
            Error::Cancelled => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<binrw::Error> for Error {
    fn from(e: binrw::Error) -> Self {
        Error::BinRw(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
