use crate::EdgeClientConfig;
use anyhow::Context;
use clap::Parser;
use serde_json::{Map, Value};

/// Edge worker configuration.
#[derive(Parser, Clone)]
pub struct WorkerConfig {
    /// Base URL of the control-plane API.
    #[arg(long, env = "EDGE_API_BASE_URL", default_value = "http://localhost:8080")]
    pub api_base_url: String,

    /// One-shot registration token (first run).
    #[arg(long, env = "EDGE_REGISTRATION_TOKEN")]
    pub registration_token: Option<String>,

    /// Existing access token (resumed runtime).
    #[arg(long, env = "EDGE_RUNTIME_ACCESS_TOKEN")]
    pub access_token: Option<String>,

    /// Display name advertised at registration.
    #[arg(long, env = "WORKER_RUNTIME_NAME")]
    pub runtime_name: Option<String>,

    /// Comma-separated tags advertised at registration.
    #[arg(long, env = "WORKER_RUNTIME_TAGS", default_value = "")]
    pub runtime_tags: String,

    /// Capabilities JSON object; empty means the built-in default set.
    #[arg(long, env = "WORKER_RUNTIME_CAPABILITIES", default_value = "")]
    pub runtime_capabilities: String,

    #[arg(long, env = "EDGE_PULL_MAX_TASKS", default_value_t = 1)]
    pub max_tasks: i32,

    #[arg(long, env = "EDGE_LONG_POLL_SECONDS", default_value_t = 20)]
    pub long_poll_seconds: i64,

    #[arg(long, env = "EDGE_VISIBILITY_TIMEOUT_SECONDS", default_value_t = 90)]
    pub visibility_timeout_seconds: i64,

    #[arg(long, env = "EDGE_RETRY_DELAY_SECONDS", default_value_t = 5)]
    pub retry_delay_seconds: i64,
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registration_token = self.registration_token.as_deref().map(|_| "<redacted>");
        let access_token = self.access_token.as_deref().map(|_| "<redacted>");
        f.debug_struct("WorkerConfig")
            .field("api_base_url", &self.api_base_url)
            .field("registration_token", &registration_token)
            .field("access_token", &access_token)
            .field("runtime_name", &self.runtime_name)
            .field("runtime_tags", &self.runtime_tags)
            .field("runtime_capabilities", &self.runtime_capabilities)
            .field("max_tasks", &self.max_tasks)
            .field("long_poll_seconds", &self.long_poll_seconds)
            .field("visibility_timeout_seconds", &self.visibility_timeout_seconds)
            .field("retry_delay_seconds", &self.retry_delay_seconds)
            .finish()
    }
}

impl WorkerConfig {
    pub fn tags(&self) -> Vec<String> {
        self.runtime_tags
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn capabilities(&self) -> anyhow::Result<Map<String, Value>> {
        let raw = self.runtime_capabilities.trim();
        if raw.is_empty() {
            let default = serde_json::json!({
                "message_types": [
                    "agent_job_request",
                    "semantic_query_request",
                    "copilot_dashboard_request"
                ]
            });
            return Ok(match default {
                Value::Object(map) => map,
                _ => Map::new(),
            });
        }

        let parsed: Value =
            serde_json::from_str(raw).context("WORKER_RUNTIME_CAPABILITIES must be valid JSON")?;
        match parsed {
            Value::Object(map) => Ok(map),
            _ => anyhow::bail!("WORKER_RUNTIME_CAPABILITIES must deserialize to an object"),
        }
    }

    pub fn client_config(&self) -> anyhow::Result<EdgeClientConfig> {
        Ok(EdgeClientConfig {
            api_base_url: self.api_base_url.clone(),
            registration_token: self.registration_token.clone(),
            access_token: self.access_token.clone(),
            display_name: self.runtime_name.clone(),
            tags: self.tags(),
            capabilities: self.capabilities()?,
            max_tasks: self.max_tasks,
            long_poll_seconds: self.long_poll_seconds,
            visibility_timeout_seconds: self.visibility_timeout_seconds,
            retry_delay_seconds: self.retry_delay_seconds,
        })
    }
}
