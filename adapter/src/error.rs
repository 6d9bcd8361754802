use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProductError {
    #[error("products request failed: {0}")]
    Fetch(String),
    #[error("failed to decode product catalog: {0}")]
    Decode(String),
    #[error("invalid resource pattern '{0}'")]
    InvalidResource(String),
}

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota request failed: {0}")]
    Transport(String),
    #[error("quota service returned HTTP {0}")]
    Status(u16),
    #[error("failed to decode quota result: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("record serialization failed: {0}")]
    Serialize(String),
    #[error("signed url request failed: {0}")]
    SignedUrl(String),
    #[error("upload not authorized (HTTP {0})")]
    NotAuthorized(u16),
    #[error("upload failed with HTTP {0}")]
    UploadStatus(u16),
    #[error("upload transport failure: {0}")]
    Transport(String),
}

impl AnalyticsError {
    /// Authentication-related failures stop an upload pass early; everything
    /// else is retried under backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AnalyticsError::NotAuthorized(_))
    }
}
