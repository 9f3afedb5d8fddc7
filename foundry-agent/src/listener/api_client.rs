//! HTTP client for the hub's self-hosted agent API.
//!
//! All endpoints are bearer-token authenticated JSON POSTs; anything but
//! a 200 is an error carrying the status code.

use foundry_agent_lib::api::JobRequest;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const BASE_PATH: &str = "api/v1/self_hosted_agents";

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub version: String,
    pub name: String,
    pub pid: u32,
    pub os: String,
    pub arch: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub name: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentState {
    WaitingForJobs,
    StartingJob,
    RunningJob,
    StoppingJob,
    FinishedJob,
    FailedToFetchJob,
    FailedToConstructJob,
    FailedToSendCallback,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentState::WaitingForJobs => "waiting-for-jobs",
            AgentState::StartingJob => "starting-job",
            AgentState::RunningJob => "running-job",
            AgentState::StoppingJob => "stopping-job",
            AgentState::FinishedJob => "finished-job",
            AgentState::FailedToFetchJob => "failed-to-fetch-job",
            AgentState::FailedToConstructJob => "failed-to-construct-job",
            AgentState::FailedToSendCallback => "failed-to-send-callback",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentAction {
    Continue,
    WaitForJobs,
    RunJob,
    StopJob,
    Shutdown,

    /// Forward compatibility: an action this agent does not know is a
    /// no-op, not a protocol failure.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRequest {
    pub state: AgentState,
    pub job_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncResponse {
    pub action: AgentAction,

    #[serde(default)]
    pub job_id: String,
}

/// Reusable hub client; safe to share across tasks.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl ApiClient {
    pub fn new(client: reqwest::Client, scheme: &str, endpoint: &str, token: &str) -> ApiClient {
        ApiClient {
            client,
            base_url: format!("{scheme}://{endpoint}/{BASE_PATH}"),
            access_token: token.to_string(),
        }
    }

    /// The same client, authenticated with a different token. Used after
    /// registration exchanges the registration token for an access token.
    pub fn with_access_token(&self, token: &str) -> ApiClient {
        ApiClient {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            access_token: token.to_string(),
        }
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse> {
        self.post_json("register", request).await
    }

    pub async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse> {
        self.post_json("sync", request).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<JobRequest> {
        self.post_json(&format!("jobs/{job_id}"), &serde_json::json!({})).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        let path = "disconnect";
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({}))
            .send()
            .await?;

        if response.status().as_u16() != 200 {
            return Err(Error::Hub { path: path.to_string(), status: response.status().as_u16() });
        }

        Ok(())
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize,
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;

        if response.status().as_u16() != 200 {
            return Err(Error::Hub { path: path.to_string(), status: response.status().as_u16() });
        }

        Ok(response.json::<T>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_serialize_kebab_case() {
        assert_eq!(
            serde_json::to_string(&AgentState::WaitingForJobs).unwrap(),
            "\"waiting-for-jobs\""
        );
        assert_eq!(
            serde_json::to_string(&AgentState::FailedToFetchJob).unwrap(),
            "\"failed-to-fetch-job\""
        );
    }

    #[test]
    fn unknown_actions_are_tolerated() {
        let response: SyncResponse =
            serde_json::from_str(r#"{"action":"some-future-action"}"#).unwrap();
        assert_eq!(response.action, AgentAction::Unknown);
        assert!(response.job_id.is_empty());

        let response: SyncResponse =
            serde_json::from_str(r#"{"action":"run-job","job_id":"j1"}"#).unwrap();
        assert_eq!(response.action, AgentAction::RunJob);
        assert_eq!(response.job_id, "j1");
    }
}
