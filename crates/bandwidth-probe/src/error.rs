use thiserror::Error;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection failure: {0}")]
    ConnectionFailure(Box<reqwest::Error>),
    #[error("probe cancelled before completion")]
    Cancelled,
    #[error("server-timing header missing or malformed: {0:?}")]
    TimingHeaderMissing(Option<String>),
    #[error("failed to read response body: {0}")]
    BodyReadFailure(Box<reqwest::Error>),
    #[error("response body exceeds {limit} bytes (received {received})")]
    BodyTooLarge { limit: u64, received: u64 },
    #[error("completion token not found in response body ({segments} segment(s))")]
    TokenExtraction { segments: usize },
    #[error("completion token longer than {limit} bytes")]
    TokenTooLong { limit: usize },
    #[error("metadata fetch failed: {0}")]
    MetadataFetch(Box<reqwest::Error>),
    #[error("invalid test plan: {0}")]
    InvalidPlan(String),
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("http client construction failed: {0}")]
    HttpClient(Box<reqwest::Error>),
    #[error("pipeline task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Cancellation of an in-flight probe is reported alongside transport
    /// failures; both end the session through the same path.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Error::ConnectionFailure(_) | Error::Cancelled)
    }

    /// Failures raised by a single probe, as opposed to setup or pipeline errors.
    pub fn is_probe_failure(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailure(_)
                | Error::Cancelled
                | Error::TimingHeaderMissing(_)
                | Error::BodyReadFailure(_)
                | Error::BodyTooLarge { .. }
                | Error::TokenExtraction { .. }
                | Error::TokenTooLong { .. }
        )
    }
}
