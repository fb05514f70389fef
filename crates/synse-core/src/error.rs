//! Common error types for the gateway core

use thiserror::Error;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors surfaced by the gateway core
///
/// The transport layer maps these onto its own external representation;
/// the core never formats a transport response itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Unknown device, tag, plugin or transaction identifier
    #[error("Not found: {0}")]
    NotFound(String),

    /// Target plugin is offline or its link failed
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// No response or status from a plugin within the deadline
    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    /// Malformed or capability-mismatched plugin response
    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// Malformed filter, namespace or payload from the caller
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Returns the conventional HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::NotFound(_) => 404,
            GatewayError::UpstreamUnavailable(_) => 503,
            GatewayError::UpstreamTimeout(_) => 504,
            GatewayError::UpstreamProtocol(_) => 502,
            GatewayError::InvalidRequest(_) => 400,
        }
    }

    /// Whether this error counts against the health of the plugin that produced it.
    ///
    /// A plugin answering `NotFound` or `InvalidRequest` is reachable and
    /// behaving, so only upstream failures feed the consecutive-failure counter.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamUnavailable(_)
                | GatewayError::UpstreamTimeout(_)
                | GatewayError::UpstreamProtocol(_)
        )
    }
}
