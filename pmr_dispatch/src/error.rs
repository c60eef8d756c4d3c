//! Error handling for the PMR dispatcher service.

/// PMR dispatcher service result type
///
/// This is a type alias for the standard library's [`Result`](core::result::Result) type with the
/// error type defaulting to [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that can occur while scheduling and servicing events.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The wait expired before an event or signal arrived
    #[error("Timed out waiting for an event")]
    Timeout,
    /// No worker is available, or the resource is claimed by another thread
    #[error("Busy: {0}")]
    Busy(String),
    /// Operation attempted in an invalid state
    #[error("Bad state: {0}")]
    BadState(String),
    /// A thread or event could not be created
    #[error("Cannot create {0}")]
    CantCreate(String),
}
