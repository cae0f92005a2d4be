//! Typed errors at the transport and delivery boundaries.

use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures talking to the exchange, streaming or REST.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tungstenite::Error>,
    },

    #[error("stream transport error: {0}")]
    Transport(#[from] Box<tungstenite::Error>),

    #[error("no message received within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("stream closed by server")]
    Closed,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("exchange returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limited, gave up after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("exchange rejected request: {0}")]
    Api(String),
}

impl FeedError {
    /// Network-level failures retried by the REST client.
    pub fn is_retryable(&self) -> bool {
        match self {
            FeedError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            _ => false,
        }
    }
}

impl From<tungstenite::Error> for FeedError {
    fn from(err: tungstenite::Error) -> Self {
        FeedError::Transport(Box::new(err))
    }
}

/// Failures handing a signal to an alert sink.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sink rejected alert (HTTP {status}): {description}")]
    Rejected { status: u16, description: String },

    #[error("failed to encode alert: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = FeedError::Status {
            status: 500,
            body: "oops".to_string(),
        };
        assert_eq!(err.to_string(), "exchange returned HTTP 500: oops");
        assert!(!err.is_retryable());

        let err = FeedError::RateLimited { attempts: 4 };
        assert!(!err.is_retryable());

        let err = FeedError::HeartbeatTimeout(Duration::from_secs(60));
        assert_eq!(err.to_string(), "no message received within 60s");

        let err = DeliveryError::Rejected {
            status: 400,
            description: "chat not found".to_string(),
        };
        assert!(err.to_string().contains("chat not found"));
    }
}
