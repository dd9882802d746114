use thiserror::Error;

pub type Result<T> = std::result::Result<T, SurfaceError>;

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("Browser launch failed: {0}")]
    Launch(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("CDP error: {0}")]
    Cdp(String),

    #[error("Unknown element handle: {0}")]
    UnknownHandle(u64),

    #[error("Script error: {0}")]
    Script(String),
}

impl From<reqwest::Error> for SurfaceError {
    fn from(err: reqwest::Error) -> Self {
        SurfaceError::Network(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for SurfaceError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        SurfaceError::Cdp(err.to_string())
    }
}

impl From<serde_json::Error> for SurfaceError {
    fn from(err: serde_json::Error) -> Self {
        SurfaceError::Script(err.to_string())
    }
}
