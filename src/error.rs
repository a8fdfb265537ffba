use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("asset catalog unavailable: {0}")]
    CatalogUnavailable(String),
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("{failed} of {total} tasks failed")]
    PartialBatchFailure { total: usize, failed: usize },
    #[error("none of the {total} tasks succeeded")]
    NothingSucceeded { total: usize },
    #[error("operation cancelled")]
    Cancelled,
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;
