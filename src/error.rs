use thiserror::Error;

/// Failure of a single call to the inference service. Never fatal to the chat loop.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("could not connect to the model server at {url}, make sure it is running")]
    Connect { url: String },
    #[error("request to the model server timed out")]
    Timeout,
    #[error("http: {0}")]
    Http(#[source] reqwest::Error),
    #[error("model server returned {status}: {body}")]
    Status { status: reqwest::StatusCode, body: String },
    #[error("model server error: {0}")]
    Remote(String),
    #[error("malformed stream chunk: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("reply stream ended before completion")]
    Truncated,
}

impl ServiceError {
    pub fn from_reqwest(err: reqwest::Error, url: &str) -> Self {
        if err.is_timeout() {
            ServiceError::Timeout
        } else if err.is_connect() {
            ServiceError::Connect { url: url.to_string() }
        } else {
            ServiceError::Http(err)
        }
    }
}
