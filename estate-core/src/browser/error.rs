use thiserror::Error;

pub type AutomationResult<T> = Result<T, AutomationError>;

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("anti-bot challenge: {0}")]
    Challenge(String),
    #[error("anti-bot challenge '{signature}' still present after {waited_secs}s")]
    ChallengeTimeout { signature: String, waited_secs: u64 },
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("video encoder error: {0}")]
    Encoder(String),
    #[error("telemetry error: {0}")]
    Telemetry(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AutomationError {
    /// Maps an HTTP status reported by a remote provider onto an error variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => AutomationError::RateLimited(message),
            401 | 403 => AutomationError::Authentication(message),
            408 | 504 => AutomationError::Timeout(message),
            400..=499 => AutomationError::InvalidInput(message),
            _ => AutomationError::Transport(format!("status {status}: {message}")),
        }
    }
}

impl From<tokio::task::JoinError> for AutomationError {
    fn from(err: tokio::task::JoinError) -> Self {
        AutomationError::Unexpected(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_variants() {
        assert!(matches!(
            AutomationError::from_status(429, "slow down"),
            AutomationError::RateLimited(_)
        ));
        assert!(matches!(
            AutomationError::from_status(401, "bad key"),
            AutomationError::Authentication(_)
        ));
        assert!(matches!(
            AutomationError::from_status(502, "gateway"),
            AutomationError::Transport(_)
        ));
    }
}
