//! Capture-side transport to a remote relay
//!
//! Used when the capture endpoint runs in a separate process and reaches the
//! relay over its `/internal` HTTP routes.

pub mod client;

pub use client::{SignalingClient, SignalingLink};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
}

impl ClientError {
    /// The relay no longer knows the stream (it restarted or never saw it)
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::UnexpectedStatus { status, .. } if *status == reqwest::StatusCode::NOT_FOUND)
    }
}
