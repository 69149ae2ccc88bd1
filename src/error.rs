use thiserror::Error;

/// The error value threaded through the engine. Success is an ordinary
/// `Ok`; each variant corresponds to one failure code.
#[derive(Debug, Error)]
pub enum Error {
    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Not implemented: {0}")]
    NotSupported(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    IO(std::io::Error),
}

impl Error {
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    #[inline]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    #[inline]
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Error::NotSupported(_))
    }

    #[inline]
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }

    #[inline]
    pub fn is_io_error(&self) -> bool {
        matches!(self, Error::IO(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(e.to_string())
        } else {
            Error::IO(e)
        }
    }
}

pub type IResult<T> = std::result::Result<T, Error>;
