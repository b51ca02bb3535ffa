//! HTTP provider: JSON REST client for a hosted sandbox service.
//!
//! All requests carry a bearer token. A `404` on a sandbox path is reported as
//! [`ProviderError::Gone`]; termination treats it as success.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use super::{ExecRequest, ProvisionRequest, Provisioned, RawOutput, SandboxProvider};
use crate::config::ProviderSettings;
use crate::error::{ConfigError, ProviderError};

/// Extra time granted on top of a command timeout before the HTTP request
/// itself is abandoned, so the provider gets to report its own timeout first.
const EXEC_GRACE: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct CreateBody<'a> {
    profile: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cpu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_mb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gpu: Option<&'a str>,
    timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct CreateResponse {
    sandbox_id: String,
    #[serde(default)]
    tunnels: BTreeMap<u16, String>,
}

#[derive(Serialize)]
struct ExecBody<'a> {
    argv: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    env: &'a HashMap<String, String>,
    timeout_seconds: u64,
}

#[derive(Serialize)]
struct SpawnBody<'a> {
    argv: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    env: &'a HashMap<String, String>,
}

#[derive(Serialize)]
struct WaitBody {
    timeout_seconds: u64,
}

#[derive(Deserialize)]
struct ExecResponse {
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

impl From<ExecResponse> for RawOutput {
    fn from(r: ExecResponse) -> Self {
        Self {
            exit_code: r.exit_code,
            stdout: r.stdout.into_bytes(),
            stderr: r.stderr.into_bytes(),
        }
    }
}

#[derive(Deserialize)]
struct SpawnResponse {
    process_id: String,
}

#[derive(Deserialize)]
struct SnapshotResponse {
    image_id: String,
}

/// REST client implementing [`SandboxProvider`].
#[derive(Debug, Clone)]
pub struct HttpProvider {
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
    http: reqwest::Client,
}

impl HttpProvider {
    /// Builds a provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEndpoint` if no endpoint is set, or
    /// `ConfigError::Invalid` if the HTTP client cannot be constructed.
    pub fn new(settings: &ProviderSettings) -> Result<Self, ConfigError> {
        let endpoint = settings
            .endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or(ConfigError::MissingEndpoint)?;

        let request_timeout = Duration::from_secs(settings.request_timeout_seconds);
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: endpoint.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            request_timeout,
            http,
        })
    }

    fn sandbox_url(&self, remote_id: &str, suffix: &str) -> String {
        format!("{}/v1/sandboxes/{remote_id}{suffix}", self.base_url)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Sends a request and decodes a JSON body, mapping failures to
    /// [`ProviderError`].
    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<T, ProviderError> {
        let resp = self
            .authorized(builder.timeout(timeout))
            .send()
            .await
            .map_err(|e| map_send_error(&e, timeout))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ProviderError::Transport(format!("failed to read response body: {e}")))?;
        trace!(%status, len = body.len(), "Provider response");

        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::Gone(body));
        }
        if !status.is_success() {
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| ProviderError::Protocol(format!("{e}; body: {body}")))
    }
}

fn map_send_error(e: &reqwest::Error, timeout: Duration) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout {
            seconds: timeout.as_secs(),
        }
    } else if e.is_connect() {
        ProviderError::Unavailable(e.to_string())
    } else {
        ProviderError::Transport(e.to_string())
    }
}

#[async_trait]
impl SandboxProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, request), fields(profile = %request.profile.name))]
    async fn provision(&self, request: &ProvisionRequest<'_>) -> Result<Provisioned, ProviderError> {
        let body = CreateBody {
            profile: &request.profile.name,
            cpu: request.profile.cpu,
            memory_mb: request.profile.memory_mb,
            gpu: request.profile.gpu.as_deref(),
            timeout_seconds: request.timeout.as_secs(),
            image_id: request.image_id,
        };
        let url = format!("{}/v1/sandboxes", self.base_url);

        let created: CreateResponse = self
            .send_json(self.http.post(&url).json(&body), self.request_timeout)
            .await?;

        if created.sandbox_id.is_empty() {
            return Err(ProviderError::Protocol(
                "provider returned an empty sandbox_id".into(),
            ));
        }

        debug!(remote_id = %created.sandbox_id, "Remote sandbox provisioned");
        Ok(Provisioned {
            remote_id: created.sandbox_id,
            tunnels: created.tunnels,
        })
    }

    #[instrument(skip(self))]
    async fn terminate(&self, remote_id: &str) -> Result<(), ProviderError> {
        let url = self.sandbox_url(remote_id, "");
        let resp = self
            .authorized(self.http.delete(&url))
            .send()
            .await
            .map_err(|e| map_send_error(&e, self.request_timeout))?;

        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(%status, "Remote sandbox terminated");
            return Ok(());
        }

        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable>".to_string());
        Err(ProviderError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    #[instrument(skip(self, request), fields(command = %request.command))]
    async fn exec(
        &self,
        remote_id: &str,
        request: &ExecRequest<'_>,
    ) -> Result<RawOutput, ProviderError> {
        let body = ExecBody {
            argv: request.command.to_argv(),
            cwd: request.cwd,
            env: request.env,
            timeout_seconds: request.timeout.as_secs(),
        };
        let url = self.sandbox_url(remote_id, "/exec");

        let output: ExecResponse = self
            .send_json(self.http.post(&url).json(&body), request.timeout + EXEC_GRACE)
            .await?;
        Ok(output.into())
    }

    #[instrument(skip(self, request), fields(command = %request.command))]
    async fn spawn(
        &self,
        remote_id: &str,
        request: &ExecRequest<'_>,
    ) -> Result<String, ProviderError> {
        let body = SpawnBody {
            argv: request.command.to_argv(),
            cwd: request.cwd,
            env: request.env,
        };
        let url = self.sandbox_url(remote_id, "/processes");

        let spawned: SpawnResponse = self
            .send_json(self.http.post(&url).json(&body), self.request_timeout)
            .await?;
        Ok(spawned.process_id)
    }

    #[instrument(skip(self))]
    async fn wait(
        &self,
        remote_id: &str,
        process_id: &str,
        timeout: Duration,
    ) -> Result<RawOutput, ProviderError> {
        let url = self.sandbox_url(remote_id, &format!("/processes/{process_id}/wait"));
        let body = WaitBody {
            timeout_seconds: timeout.as_secs(),
        };

        let output: ExecResponse = self
            .send_json(self.http.post(&url).json(&body), timeout + EXEC_GRACE)
            .await?;
        Ok(output.into())
    }

    #[instrument(skip(self))]
    async fn snapshot(&self, remote_id: &str) -> Result<String, ProviderError> {
        let url = self.sandbox_url(remote_id, "/snapshot");
        let snap: SnapshotResponse = self
            .send_json(self.http.post(&url), self.request_timeout)
            .await?;
        Ok(snap.image_id)
    }
}
