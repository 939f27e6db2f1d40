//! HTTP client for the call registry.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::signaling::{
    is_valid_call_code, CallSession, CreateCallResponse, JoinCallRequest, JoinCallResponse,
    LeaveCallRequest, LeaveCallResponse,
};

/// Result of leaving a call.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaveResult {
    /// Others remain; the updated call
    Left(CallSession),
    /// We were the last participant and the call is gone
    CallEnded,
}

/// Client for `/api/calls`.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    /// Create a client for a registry base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create a client from configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.registry_url.clone())
    }

    /// Create a call and return its code.
    pub async fn create_call(&self) -> Result<String> {
        let response = self.http.post(self.url("/api/calls")).send().await?;
        let created: CreateCallResponse = decode(response, "").await?;
        tracing::info!(call_id = created.call_id.as_str(), "Call created");
        Ok(created.call_id)
    }

    /// Join a call by code.
    pub async fn join_call(&self, call_id: &str, user_id: &str, username: &str) -> Result<CallSession> {
        let call_id = checked_code(call_id)?;
        let response = self
            .http
            .post(self.url(&format!("/api/calls/{}/join", call_id)))
            .json(&JoinCallRequest {
                user_id: user_id.to_string(),
                username: username.to_string(),
            })
            .send()
            .await?;
        let joined: JoinCallResponse = decode(response, &call_id).await?;
        Ok(joined.call)
    }

    /// Leave a call.
    pub async fn leave_call(&self, call_id: &str, user_id: &str) -> Result<LeaveResult> {
        let call_id = checked_code(call_id)?;
        let response = self
            .http
            .post(self.url(&format!("/api/calls/{}/leave", call_id)))
            .json(&LeaveCallRequest {
                user_id: user_id.to_string(),
            })
            .send()
            .await?;
        let left: LeaveCallResponse = decode(response, &call_id).await?;

        match left.call {
            Some(call) if left.status == "left" => Ok(LeaveResult::Left(call)),
            _ => Ok(LeaveResult::CallEnded),
        }
    }

    /// Fetch a call's current state.
    pub async fn get_call(&self, call_id: &str) -> Result<CallSession> {
        let call_id = checked_code(call_id)?;
        let response = self
            .http
            .get(self.url(&format!("/api/calls/{}", call_id)))
            .send()
            .await?;
        decode(response, &call_id).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn checked_code(call_id: &str) -> Result<String> {
    let code = call_id.trim().to_ascii_uppercase();
    if !is_valid_call_code(&code) {
        return Err(Error::InvalidCallCode(call_id.to_string()));
    }
    Ok(code)
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response, call_id: &str) -> Result<T> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(Error::CallNotFound(call_id.to_string()));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Http(format!("registry returned {}: {}", status, body)));
    }
    Ok(response.json::<T>().await?)
}
