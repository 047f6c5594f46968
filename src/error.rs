//! Centralized error types for the gateway

use thiserror::Error;

/// Gateway error taxonomy. Every variant carries enough context for the
/// admin plane or the proxy error handler to produce a response.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request body unparseable or missing required fields
    #[error("Request malformed: {0}")]
    RequestMalformed(String),

    /// A semantic rule was violated (duplicate IDs, missing referenced entity)
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Key/API/client/policy absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// ID mismatch between path and body, or OAS/Classic form mismatch
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Hard timeout or header-read deadline reached while talking upstream
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// DNS failure or no reachable upstream host
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Client disconnected before the response was written
    #[error("Client closed request")]
    ClientClosed,

    /// Circuit breaker refused the request
    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    /// File write or store write failed; prior state is left intact
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// Configuration file parsing or validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Outbound HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// HTTP status the admin plane or proxy error handler should surface.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RequestMalformed(_) => 400,
            Self::ValidationFailed(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 400,
            Self::UpstreamTimeout(_) => 504,
            Self::UpstreamUnreachable(_) => 500,
            Self::ClientClosed => 499,
            Self::CircuitOpen(_) => 503,
            Self::PersistenceFailure(_) => 500,
            Self::Config(_) => 500,
            Self::Io(_) => 500,
            Self::Serialization(_) => 500,
            Self::Http(_) => 500,
            Self::Other(_) => 500,
        }
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::NotFound("api xyz".into());
        assert_eq!(err.to_string(), "Not found: api xyz");

        let err = GatewayError::UpstreamTimeout("2s deadline".into());
        assert_eq!(err.to_string(), "Upstream timeout: 2s deadline");

        let err = GatewayError::ClientClosed;
        assert_eq!(err.to_string(), "Client closed request");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::RequestMalformed("x".into()).status_code(), 400);
        assert_eq!(GatewayError::NotFound("x".into()).status_code(), 404);
        assert_eq!(GatewayError::Conflict("x".into()).status_code(), 400);
        assert_eq!(GatewayError::UpstreamTimeout("x".into()).status_code(), 504);
        assert_eq!(GatewayError::ClientClosed.status_code(), 499);
        assert_eq!(GatewayError::CircuitOpen("x".into()).status_code(), 503);
        assert_eq!(GatewayError::PersistenceFailure("x".into()).status_code(), 500);
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: GatewayError = io_err.into();
        assert!(err.to_string().contains("missing"));
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("nope").unwrap_err();
        let err: GatewayError = json_err.into();
        assert!(matches!(err, GatewayError::Serialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GatewayError>();
    }
}
