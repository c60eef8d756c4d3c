//! Error handling for the PMR memory service.

/// PMR memory service result type
///
/// This is a type alias for the standard library's [`Result`](core::result::Result) type with the
/// error type defaulting to [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that can occur during allocation and garbage collection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operating system refused to supply memory
    #[error("Memory allocation of {0} bytes failed")]
    Memory(usize),
    /// The request exceeds the allocator's internal maximum
    #[error("Allocation of {0} bytes exceeds the maximum block size")]
    TooBig(usize),
    /// The request would exceed the configured heap limit
    #[error("Allocation of {0} bytes exceeds the configured memory limit")]
    Limit(usize),
    /// Invalid arguments
    #[error("Bad arguments: {0}")]
    BadArgs(String),
    /// Operation attempted in an invalid state
    #[error("Bad state: {0}")]
    BadState(String),
    /// The service has not been initialized
    #[error("Not initialized: {0}")]
    NotInitialized(String),
}
