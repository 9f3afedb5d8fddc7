//! Hub listener: registration plus the job processor.

pub mod api_client;
pub mod job_processor;

use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use api_client::{ApiClient, RegisterRequest};
use job_processor::{JobProcessor, JobProcessorConfig};

const REGISTER_RETRY_WAIT: Duration = Duration::from_secs(1);

/// Everything `Listener::start` needs, flattened out of the config file
/// so tests can construct it directly.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub endpoint: String,
    pub scheme: String,
    pub token: String,
    pub name: Option<String>,
    pub register_retry_limit: usize,
    pub version: String,
    pub processor: JobProcessorConfig,
}

impl ListenerConfig {
    pub fn from_config(config: &Config, version: &str) -> ListenerConfig {
        ListenerConfig {
            endpoint: config.hub.endpoint.clone(),
            scheme: config.hub.scheme.clone(),
            token: config.hub.token.clone(),
            name: config.hub.name.clone(),
            register_retry_limit: config.hub.register_retry_limit,
            version: version.to_string(),
            processor: JobProcessorConfig {
                shutdown_hook_path: config.agent.shutdown_hook.clone(),
                disconnect_after_job: config.agent.disconnect_after_job,
                disconnect_after_idle_timeout: Duration::from_secs(
                    config.agent.disconnect_after_idle_seconds,
                ),
                env_vars: config.agent.env_vars.clone(),
                file_injections: config.agent.file_injections.clone(),
                fail_on_missing_files: config.agent.fail_on_missing_files,
                expose_kvm_device: config.agent.expose_kvm_device,
                ..JobProcessorConfig::default()
            },
        }
    }
}

pub struct Listener {
    pub processor: std::sync::Arc<JobProcessor>,
}

impl Listener {
    /// Register with the hub, then start syncing.
    pub async fn start(client: reqwest::Client, config: ListenerConfig) -> Result<Listener> {
        let name = match &config.name {
            Some(name) => name.clone(),
            None => generated_name(),
        };

        let registration_client =
            ApiClient::new(client.clone(), &config.scheme, &config.endpoint, &config.token);

        let request = RegisterRequest {
            version: config.version.clone(),
            name,
            pid: std::process::id(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
        };

        let response =
            register(&registration_client, &request, config.register_retry_limit).await?;
        info!("Registered as {}", response.name);

        let api = registration_client.with_access_token(&response.token);
        let processor = JobProcessor::start(api, client, config.processor);

        Ok(Listener { processor })
    }

    /// Shut the agent down as if the hub asked for it.
    pub async fn stop(&self) {
        self.processor.shutdown(job_processor::ShutdownReason::Requested, 0).await;
    }
}

/// One-shot registration with bounded retry. 401/422 mean a bad token or
/// request, which no amount of retrying fixes.
async fn register(
    api: &ApiClient,
    request: &RegisterRequest,
    retry_limit: usize,
) -> Result<api_client::RegisterResponse> {
    let mut attempt = 1;
    loop {
        match api.register(request).await {
            Ok(response) => return Ok(response),
            Err(err) if err.is_non_retryable_registration() => {
                return Err(Error::Registration(err.to_string()));
            }
            Err(err) if attempt < retry_limit => {
                warn!(
                    "[Register] Attempt {}/{} failed: {}. Retrying in {:?}...",
                    attempt, retry_limit, err, REGISTER_RETRY_WAIT
                );
                attempt += 1;
                tokio::time::sleep(REGISTER_RETRY_WAIT).await;
            }
            Err(err) => {
                return Err(Error::Registration(format!(
                    "gave up after {retry_limit} attempts: {err}"
                )));
            }
        }
    }
}

/// `<hostname>__<random>` keeps agents distinguishable when nothing is
/// configured.
fn generated_name() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let suffix: String =
        rand::thread_rng().sample_iter(&Alphanumeric).take(8).map(char::from).collect();
    format!("{hostname}__{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_carry_the_hostname() {
        let name = generated_name();
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        assert!(name.starts_with(&format!("{hostname}__")));
        assert_eq!(name.len(), hostname.len() + 2 + 8);
    }
}
