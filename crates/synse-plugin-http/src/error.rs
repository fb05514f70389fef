//! Error types for the HTTP plugin link

use synse_core::GatewayError;
use thiserror::Error;

/// Errors raised while talking to a plugin over HTTP
#[derive(Error, Debug)]
pub enum HttpLinkError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Plugin address is not a usable base URL
    #[error("Invalid plugin address: {0}")]
    InvalidAddress(String),

    /// Plugin answered with an error status
    #[error("Plugin error {status}: {message}")]
    Status { status: u16, message: String },

    /// Plugin answered with something we could not decode
    #[error("Failed to decode plugin response: {0}")]
    Decode(String),
}

impl HttpLinkError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }
}

impl From<url::ParseError> for HttpLinkError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidAddress(e.to_string())
    }
}

impl From<HttpLinkError> for GatewayError {
    fn from(e: HttpLinkError) -> Self {
        match e {
            HttpLinkError::Http(e) if e.is_timeout() => GatewayError::UpstreamTimeout(e.to_string()),
            HttpLinkError::Http(e) if e.is_decode() => GatewayError::UpstreamProtocol(e.to_string()),
            HttpLinkError::Http(e) => GatewayError::UpstreamUnavailable(e.to_string()),
            HttpLinkError::InvalidAddress(m) => {
                GatewayError::UpstreamUnavailable(format!("Invalid plugin address: {}", m))
            }
            HttpLinkError::Status { status, message } => match status {
                404 => GatewayError::NotFound(message),
                400 | 422 => GatewayError::InvalidRequest(message),
                502 | 503 => GatewayError::UpstreamUnavailable(message),
                504 => GatewayError::UpstreamTimeout(message),
                _ => GatewayError::UpstreamProtocol(format!("HTTP {}: {}", status, message)),
            },
            HttpLinkError::Decode(m) => GatewayError::UpstreamProtocol(m),
        }
    }
}
