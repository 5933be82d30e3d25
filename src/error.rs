use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy of the driver.
///
/// The first four variants mirror response codes produced by the device
/// itself; the remaining ones are host-side failures.
#[derive(Debug, Error)]
pub enum Error {
    /// Device refused the operation (e.g. authentication not yet done).
    #[error("Forbidden")]
    Forbidden,
    /// Target absent, or a command was issued while disconnected.
    #[error("Not found")]
    NotFound,
    /// Device reported an unrecoverable error; the handle refuses
    /// further commands until the next successful connect.
    #[error("Internal server error")]
    Internal,
    /// Frame advertised a length beyond what the framer will buffer.
    #[error("Insufficient memory")]
    NoMem,
    /// Character-set conversion failed.
    #[error("Encoding failure")]
    Encoding,
    /// Response code outside the recognized set.
    #[error("Unexpected response code 0x{0:02x}")]
    Unexpected(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn invalid_data(msg: &'static str) -> Error {
        Error::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
    }
}
