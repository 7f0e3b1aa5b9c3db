//! Customer-side edge runtime: the worker process that registers with the control
//! plane, long-polls for edge tasks, executes them through registered handlers, and
//! reports acks/failures/results.
//!
//! The client keeps a single access token, rotating it via heartbeat once it is
//! within a minute of expiry. Result posts use a deterministic per-task request id so
//! redeliveries dedupe at the gateway's receipt boundary.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use conduit_core::contracts::{
    EdgeTaskAckRequest, EdgeTaskFailRequest, EdgeTaskLease, EdgeTaskPullRequest,
    EdgeTaskPullResponse, EdgeTaskResultRequest, EdgeTaskResultResponse,
    RuntimeCapabilitiesUpdateRequest, RuntimeHeartbeatRequest, RuntimeHeartbeatResponse,
    RuntimeRegistrationRequest, RuntimeRegistrationResponse,
};
use conduit_core::MessageEnvelope;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub mod config;

// UUIDv5 namespace for deterministic result request ids (one per task).
const RESULT_REQUEST_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3e, 0x91, 0x4a, 0x6b, 0x0d, 0x52, 0x47, 0x1c, 0x9a, 0x35, 0x6f, 0x8e, 0x21, 0xd4, 0x7b,
    0x09,
]);

/// Stable idempotency key for a task's result post; retries reuse the same id.
pub fn result_request_id(task_id: Uuid) -> String {
    Uuid::new_v5(&RESULT_REQUEST_NAMESPACE, task_id.as_bytes()).to_string()
}

#[derive(Clone)]
pub struct EdgeClientConfig {
    pub api_base_url: String,
    pub registration_token: Option<String>,
    pub access_token: Option<String>,
    pub display_name: Option<String>,
    pub tags: Vec<String>,
    pub capabilities: Map<String, Value>,
    pub max_tasks: i32,
    pub long_poll_seconds: i64,
    pub visibility_timeout_seconds: i64,
    pub retry_delay_seconds: i64,
}

impl std::fmt::Debug for EdgeClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registration_token = self.registration_token.as_deref().map(|_| "<redacted>");
        let access_token = self.access_token.as_deref().map(|_| "<redacted>");
        f.debug_struct("EdgeClientConfig")
            .field("api_base_url", &self.api_base_url)
            .field("registration_token", &registration_token)
            .field("access_token", &access_token)
            .field("display_name", &self.display_name)
            .field("tags", &self.tags)
            .field("capabilities", &self.capabilities)
            .field("max_tasks", &self.max_tasks)
            .field("long_poll_seconds", &self.long_poll_seconds)
            .field("visibility_timeout_seconds", &self.visibility_timeout_seconds)
            .field("retry_delay_seconds", &self.retry_delay_seconds)
            .finish()
    }
}

#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    runtime_id: Option<Uuid>,
}

pub struct EdgeClient {
    http: reqwest::Client,
    base_url: String,
    cfg: EdgeClientConfig,
    state: Mutex<TokenState>,
}

impl EdgeClient {
    pub fn new(cfg: EdgeClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(65))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .context("build http client")?;
        let base_url = cfg.api_base_url.trim_end_matches('/').to_string();
        let state = TokenState {
            access_token: cfg.access_token.clone(),
            expires_at: None,
            runtime_id: None,
        };
        Ok(Self {
            http,
            base_url,
            cfg,
            state: Mutex::new(state),
        })
    }

    pub async fn runtime_id(&self) -> Option<Uuid> {
        self.state.lock().await.runtime_id
    }

    pub async fn pull(&self) -> anyhow::Result<Vec<EdgeTaskLease>> {
        let token = self.ensure_access_token().await?;
        let request = EdgeTaskPullRequest {
            max_tasks: self.cfg.max_tasks.clamp(1, 10),
            long_poll_seconds: self.cfg.long_poll_seconds.clamp(1, 60),
            visibility_timeout_seconds: self.cfg.visibility_timeout_seconds.clamp(10, 600),
        };
        let response: EdgeTaskPullResponse = self
            .post_json("/edge/tasks/pull", &request, Some(&token))
            .await?;
        Ok(response.tasks)
    }

    pub async fn ack(&self, task_id: Uuid, lease_id: &str) -> anyhow::Result<()> {
        let token = self.ensure_access_token().await?;
        let request = EdgeTaskAckRequest {
            task_id,
            lease_id: lease_id.to_string(),
        };
        let _: Value = self
            .post_json("/edge/tasks/ack", &request, Some(&token))
            .await?;
        Ok(())
    }

    pub async fn fail(&self, task_id: Uuid, lease_id: &str, error: &str) -> anyhow::Result<()> {
        let token = self.ensure_access_token().await?;
        let request = EdgeTaskFailRequest {
            task_id,
            lease_id: lease_id.to_string(),
            error: error.to_string(),
            retry_delay_seconds: self.cfg.retry_delay_seconds.clamp(0, 600),
        };
        let _: Value = self
            .post_json("/edge/tasks/fail", &request, Some(&token))
            .await?;
        Ok(())
    }

    pub async fn post_result(
        &self,
        request_id: &str,
        task_id: Option<Uuid>,
        envelopes: Vec<MessageEnvelope>,
    ) -> anyhow::Result<EdgeTaskResultResponse> {
        let token = self.ensure_access_token().await?;
        let request = EdgeTaskResultRequest {
            request_id: request_id.to_string(),
            task_id,
            lease_id: None,
            envelopes,
        };
        self.post_json("/edge/tasks/result", &request, Some(&token))
            .await
    }

    pub async fn update_capabilities(&self) -> anyhow::Result<()> {
        let token = Box::pin(self.ensure_access_token()).await?;
        let request = RuntimeCapabilitiesUpdateRequest {
            tags: self.cfg.tags.clone(),
            capabilities: self.cfg.capabilities.clone(),
        };
        let _: Value = self
            .post_json("/runtimes/capabilities", &request, Some(&token))
            .await?;
        Ok(())
    }

    /// Return a usable access token: the current one while it is comfortably inside
    /// its lifetime, a heartbeat-rotated one when close to expiry, or a fresh one via
    /// registration when the client has only a registration token.
    async fn ensure_access_token(&self) -> anyhow::Result<String> {
        {
            let state = self.state.lock().await;
            if let (Some(token), Some(expires_at)) = (&state.access_token, state.expires_at) {
                if expires_at > Utc::now() + Duration::seconds(60) {
                    return Ok(token.clone());
                }
            }
        }

        let has_token = self.state.lock().await.access_token.is_some();
        if has_token {
            self.heartbeat().await?;
        } else {
            self.register().await?;
            self.update_capabilities().await?;
        }

        let state = self.state.lock().await;
        state
            .access_token
            .clone()
            .ok_or_else(|| anyhow!("no access token after refresh"))
    }

    async fn register(&self) -> anyhow::Result<()> {
        let registration_token = self.cfg.registration_token.clone().ok_or_else(|| {
            anyhow!("edge runtime requires a registration token or an access token")
        })?;
        let request = RuntimeRegistrationRequest {
            registration_token,
            display_name: self.cfg.display_name.clone(),
            tags: self.cfg.tags.clone(),
            capabilities: self.cfg.capabilities.clone(),
            metadata: json_object(json!({
                "worker_version": env!("CARGO_PKG_VERSION"),
            })),
        };

        let response: RuntimeRegistrationResponse = self
            .post_json("/runtimes/register", &request, None)
            .await?;

        let mut state = self.state.lock().await;
        state.access_token = Some(response.access_token);
        state.expires_at = Some(response.expires_at);
        state.runtime_id = Some(response.ep_id);

        tracing::info!(
            event = "conduit.runtime.registered",
            tenant_id = %response.tenant_id,
            ep_id = %response.ep_id,
            "registered with control plane"
        );
        Ok(())
    }

    async fn heartbeat(&self) -> anyhow::Result<()> {
        let token = {
            let state = self.state.lock().await;
            match &state.access_token {
                Some(token) => token.clone(),
                None => return Ok(()),
            }
        };

        let runtime_id = self.runtime_id().await;
        let request = RuntimeHeartbeatRequest {
            status: None,
            metadata: json_object(json!({
                "runtime_id": runtime_id.map(|id| id.to_string()),
            })),
        };
        let response: RuntimeHeartbeatResponse = self
            .post_json("/runtimes/heartbeat", &request, Some(&token))
            .await?;

        let mut state = self.state.lock().await;
        state.access_token = Some(response.access_token);
        state.expires_at = Some(response.expires_at);
        Ok(())
    }

    async fn post_json<Req, Res>(
        &self,
        path: &str,
        request: &Req,
        bearer: Option<&str>,
    ) -> anyhow::Result<Res>
    where
        Req: serde::Serialize,
        Res: serde::de::DeserializeOwned,
    {
        let mut builder = self.http.post(format!("{}{path}", self.base_url)).json(request);
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("POST {path}"))?
            .error_for_status()
            .with_context(|| format!("POST {path}"))?;
        response
            .json::<Res>()
            .await
            .with_context(|| format!("decode {path} response"))
    }
}

fn json_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Executes one message type. Returned envelopes are posted as the task's result.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, envelope: &MessageEnvelope) -> anyhow::Result<Vec<MessageEnvelope>>;
}

/// Echoes the payload of a `test` envelope back as a result. Handy for wiring
/// checks against a live gateway.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, envelope: &MessageEnvelope) -> anyhow::Result<Vec<MessageEnvelope>> {
        Ok(vec![MessageEnvelope::new(
            "test",
            envelope.payload.clone(),
        )])
    }
}

pub struct EdgeWorker {
    client: Arc<EdgeClient>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl EdgeWorker {
    pub fn new(client: Arc<EdgeClient>) -> Self {
        Self {
            client,
            handlers: HashMap::new(),
        }
    }

    pub fn with_handler(
        mut self,
        message_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        self.handlers.insert(message_type.into(), handler);
        self
    }

    /// Long-poll forever, executing whatever arrives. Per-task failures are reported
    /// to the gateway and do not stop the loop.
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!(event = "conduit.runtime.worker_started", "edge worker started");
        loop {
            match self.poll_once().await {
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        event = "conduit.runtime.poll_error",
                        error = %err,
                        "pull failed; backing off"
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                }
            }
        }
    }

    /// Pull once and process every returned lease. Returns the number of leases
    /// pulled.
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        let leases = self.client.pull().await?;
        for lease in &leases {
            if let Err(err) = self.process(lease).await {
                tracing::warn!(
                    event = "conduit.runtime.task_error",
                    task_id = %lease.task_id,
                    error = %err,
                    "task processing failed"
                );
            }
        }
        Ok(leases.len())
    }

    async fn process(&self, lease: &EdgeTaskLease) -> anyhow::Result<()> {
        let Some(handler) = self.handlers.get(&lease.envelope.message_type) else {
            let error = format!(
                "no handler registered for message type `{}`",
                lease.envelope.message_type
            );
            self.client
                .fail(lease.task_id, &lease.lease_id, &error)
                .await?;
            return Ok(());
        };

        match handler.handle(&lease.envelope).await {
            Ok(results) => {
                if !results.is_empty() {
                    let request_id = result_request_id(lease.task_id);
                    self.client
                        .post_result(&request_id, Some(lease.task_id), results)
                        .await?;
                }
                self.client.ack(lease.task_id, &lease.lease_id).await?;
                tracing::debug!(
                    event = "conduit.runtime.task_done",
                    task_id = %lease.task_id,
                    attempt = lease.delivery_attempt,
                    "task completed"
                );
                Ok(())
            }
            Err(err) => {
                self.client
                    .fail(lease.task_id, &lease.lease_id, &err.to_string())
                    .await?;
                Ok(())
            }
        }
    }
}
