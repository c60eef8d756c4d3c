//! Error handling for the PMR socket layer.

/// PMR socket layer result type
///
/// This is a type alias for the standard library's [`Result`](core::result::Result) type with the
/// error type defaulting to [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that can occur in socket and TLS operations.
///
/// Byte-oriented calls (`read`, `write`, `flush`, `send_file`) use the
/// negative-result convention instead: a negative return whose magnitude is
/// the error's [`code`](Error::code), with EOF distinguished by the socket's
/// EOF flag rather than the return value.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid arguments
    #[error("Bad arguments: {0}")]
    BadArgs(String),
    /// Operation attempted in an invalid state
    #[error("Bad state: {0}")]
    BadState(String),
    /// A socket could not be created
    #[error("Cannot create socket: {0}")]
    CantCreate(String),
    /// A provider or TLS configuration could not be initialized
    #[error("Cannot initialize: {0}")]
    CantInitialize(String),
    /// A socket could not be bound or opened
    #[error("Cannot open: {0}")]
    CantOpen(String),
    /// A read failed
    #[error("Cannot read: {0}")]
    CantRead(String),
    /// A write failed
    #[error("Cannot write: {0}")]
    CantWrite(String),
    /// A connection could not be established
    #[error("Cannot connect: {0}")]
    CantConnect(String),
    /// An operation could not run to completion
    #[error("Cannot complete: {0}")]
    CantComplete(String),
    /// A name lookup failed
    #[error("Cannot find: {0}")]
    CantFind(String),
    /// The operation timed out
    #[error("Timed out")]
    Timeout,
    /// The resource is busy
    #[error("Busy: {0}")]
    Busy(String),
}

impl Error {
    /// Stable magnitude for the negative-result convention.
    #[must_use]
    pub fn code(&self) -> isize {
        match self {
            Error::BadArgs(_) => 1,
            Error::BadState(_) => 2,
            Error::CantCreate(_) => 3,
            Error::CantInitialize(_) => 4,
            Error::CantOpen(_) => 5,
            Error::CantRead(_) => 6,
            Error::CantWrite(_) => 7,
            Error::CantConnect(_) => 8,
            Error::CantComplete(_) => 9,
            Error::CantFind(_) => 10,
            Error::Timeout => 11,
            Error::Busy(_) => 12,
        }
    }

    /// The negative return value for byte-oriented calls.
    #[must_use]
    pub fn as_return(&self) -> isize {
        -self.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_returns() {
        let error = Error::CantRead("eof".to_string());
        assert!(error.as_return() < 0);
        assert_eq!(error.as_return(), -error.code());
    }
}
