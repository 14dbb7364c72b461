use thiserror::Error;

use crate::repl::{CacheError, DescriptorError, IstError, MarkerError, RequestError};

/// Crate-level convenience error.
///
/// A thin wrapper over the module errors; the coordinator's own boundary
/// codes live in [`crate::repl::TransferError`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Marker(#[from] MarkerError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Ist(#[from] IstError),
}
