//! Device-control capability used by the command worker

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Why a device request did not succeed
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device did not answer within {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("device rejected request with {0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DeviceError {
    /// Short label for structured logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceError::Timeout(_) => "timeout",
            DeviceError::Transport(_) => "transport",
            DeviceError::Rejected(_) => "rejected",
            DeviceError::Protocol(_) => "protocol",
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        DeviceError::Transport(e.to_string())
    }
}

/// Request/response channel to the embedded controller
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Write `payload` to resource `path`, waiting at most `timeout` for the reply
    async fn put(&self, path: &str, payload: &[u8], timeout: Duration)
        -> Result<Bytes, DeviceError>;
}
