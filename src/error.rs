//! Failure taxonomy for result delivery.
//!
//! Every variant is terminal for the request that produced it; nothing here is retried.

use crate::model::{GENERIC_ANALYSIS_FAILURE, GENERIC_SUBMISSION_FAILURE};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Bad input, caught locally before any network call.
    #[error("{0}")]
    Validation(String),

    /// No signed-in session, or its token has expired.
    #[error("{0}")]
    Auth(String),

    /// The submission or watch call itself failed.
    #[error("{0}")]
    Transport(String),

    /// The backend explicitly reported a failure.
    #[error("{0}")]
    Remote(String),
}

impl DeliveryError {
    pub fn empty_ticker() -> Self {
        DeliveryError::Validation("Please enter a ticker symbol".to_string())
    }

    pub fn not_signed_in() -> Self {
        DeliveryError::Auth("You must be signed in to analyze stocks.".to_string())
    }

    pub fn transport() -> Self {
        DeliveryError::Transport(GENERIC_SUBMISSION_FAILURE.to_string())
    }

    pub fn remote(reason: Option<String>) -> Self {
        DeliveryError::Remote(reason.unwrap_or_else(|| GENERIC_ANALYSIS_FAILURE.to_string()))
    }

    /// User-visible message handed to the renderer.
    pub fn user_message(&self) -> &str {
        match self {
            DeliveryError::Validation(m)
            | DeliveryError::Auth(m)
            | DeliveryError::Transport(m)
            | DeliveryError::Remote(m) => m,
        }
    }
}

/// Normalize a ticker: trimmed and uppercased, rejected if empty.
pub fn normalize_ticker(raw: &str) -> Result<String, DeliveryError> {
    let ticker = raw.trim().to_uppercase();
    if ticker.is_empty() {
        return Err(DeliveryError::empty_ticker());
    }
    Ok(ticker)
}
