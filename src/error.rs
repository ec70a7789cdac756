use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    InvalidHeader(&'static str),
    Decode(&'static str, io::Error),
    Encode(&'static str, io::Error),
    InvalidData(String),
    ChecksumMismatch { expected: u64, actual: u64 },
    IndexCorruption(String),
    InvalidState(String),
    InvalidOperation(String),
    InvalidConfiguration(String),
    RunUnavailable(String),
    TableNotFound(String),
    ReadOnly(String),
    LockError(io::Error),
    Serialization(String),
    FilterFailed(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::InvalidHeader(file) => write!(f, "Invalid header in {} file", file),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::Encode(field, err) => write!(f, "Failed to encode {}: {}", field, err),
            Error::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            Error::ChecksumMismatch { expected, actual } => write!(
                f,
                "Checksum mismatch: expected {:016x}, got {:016x}",
                expected, actual
            ),
            Error::IndexCorruption(msg) => write!(f, "Index corruption: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::RunUnavailable(msg) => write!(f, "Sorted run unavailable: {}", msg),
            Error::TableNotFound(name) => write!(f, "Table not found: {}", name),
            Error::ReadOnly(name) => write!(f, "Table {} is read only", name),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::Serialization(msg) => write!(f, "Serialization failed: {}", msg),
            Error::FilterFailed(msg) => write!(f, "User defined filter failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
