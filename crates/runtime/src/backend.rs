//! Thin client for the backend's NFC endpoints.

use std::time::Duration;

use anyhow::Result;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;

use tagrelay_protocol::{PendingCommand, PendingCommandsResponse};

/// Header carrying the shared secret on every request.
pub const SECRET_HEADER: &str = "X-Agent-Secret";

/// Why a single request did not succeed.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// 4xx: the backend understood and refused. Retrying cannot help.
    #[error("backend rejected request with {0}")]
    Rejected(StatusCode),
    /// 5xx or any other non-success status.
    #[error("backend answered {0}")]
    Status(StatusCode),
    /// No response at all: connect failure, reset, or timeout.
    #[error("backend unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("unreadable backend response: {0}")]
    Decode(#[source] reqwest::Error),
}

impl AttemptError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    fn from_status(status: StatusCode) -> Self {
        if status.is_client_error() {
            Self::Rejected(status)
        } else {
            Self::Status(status)
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    base_url: String,
    secret: String,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
        })
    }

    pub fn events_url(&self) -> String {
        format!("{}/api/nfc/events", self.base_url)
    }

    pub fn pending_commands_url(&self) -> String {
        format!("{}/api/nfc/commands/pending", self.base_url)
    }

    pub fn command_result_url(&self, command_id: &str) -> String {
        format!("{}/api/nfc/commands/{command_id}/result", self.base_url)
    }

    /// One POST, no retries.
    pub async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<(), AttemptError> {
        let response = self
            .http
            .post(url)
            .header(SECRET_HEADER, &self.secret)
            .json(body)
            .send()
            .await
            .map_err(AttemptError::Unreachable)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AttemptError::from_status(status))
        }
    }

    pub async fn pending_commands(&self) -> Result<Vec<PendingCommand>, AttemptError> {
        let response = self
            .http
            .get(self.pending_commands_url())
            .header(SECRET_HEADER, &self.secret)
            .send()
            .await
            .map_err(AttemptError::Unreachable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::from_status(status));
        }
        let body: PendingCommandsResponse = response.json().await.map_err(AttemptError::Decode)?;
        Ok(body.data)
    }
}
