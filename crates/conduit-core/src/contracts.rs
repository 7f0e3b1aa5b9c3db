//! Wire DTOs for the runtime registry and edge-task HTTP surface.

use crate::envelope::MessageEnvelope;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Per-tenant execution selector: in-cluster worker pool or customer-owned edge runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Hosted,
    CustomerRuntime,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hosted => "hosted",
            Self::CustomerRuntime => "customer_runtime",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "hosted" => Some(Self::Hosted),
            "customer_runtime" => Some(Self::CustomerRuntime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeRegistrationRequest {
    pub registration_token: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeRegistrationResponse {
    pub ep_id: Uuid,
    pub tenant_id: Uuid,
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeHeartbeatRequest {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeHeartbeatResponse {
    pub accepted: bool,
    pub server_time: DateTime<Utc>,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeCapabilitiesUpdateRequest {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeCapabilitiesUpdateResponse {
    pub accepted: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInstanceView {
    pub ep_id: Uuid,
    pub tenant_id: Uuid,
    pub display_name: Option<String>,
    pub status: String,
    pub tags: Vec<String>,
    pub capabilities: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationTokenResponse {
    pub registration_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeTaskPullRequest {
    #[serde(default = "default_max_tasks")]
    pub max_tasks: i32,
    #[serde(default = "default_long_poll_seconds")]
    pub long_poll_seconds: i64,
    #[serde(default = "default_visibility_timeout_seconds")]
    pub visibility_timeout_seconds: i64,
}

fn default_max_tasks() -> i32 {
    1
}

fn default_long_poll_seconds() -> i64 {
    20
}

fn default_visibility_timeout_seconds() -> i64 {
    90
}

impl Default for EdgeTaskPullRequest {
    fn default() -> Self {
        Self {
            max_tasks: default_max_tasks(),
            long_poll_seconds: default_long_poll_seconds(),
            visibility_timeout_seconds: default_visibility_timeout_seconds(),
        }
    }
}

impl EdgeTaskPullRequest {
    /// Request-boundary range checks. Internal callers are trusted with raw values.
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.max_tasks) {
            return Err(Error::validation("max_tasks must be between 1 and 10."));
        }
        if !(1..=60).contains(&self.long_poll_seconds) {
            return Err(Error::validation(
                "long_poll_seconds must be between 1 and 60.",
            ));
        }
        if !(10..=600).contains(&self.visibility_timeout_seconds) {
            return Err(Error::validation(
                "visibility_timeout_seconds must be between 10 and 600.",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeTaskLease {
    pub task_id: Uuid,
    pub lease_id: String,
    pub delivery_attempt: i32,
    pub envelope: MessageEnvelope,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeTaskPullResponse {
    #[serde(default)]
    pub tasks: Vec<EdgeTaskLease>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeTaskAckRequest {
    pub task_id: Uuid,
    pub lease_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeTaskAckResponse {
    pub accepted: bool,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeTaskFailRequest {
    pub task_id: Uuid,
    pub lease_id: String,
    pub error: String,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: i64,
}

fn default_retry_delay_seconds() -> i64 {
    5
}

impl EdgeTaskFailRequest {
    pub fn validate(&self) -> Result<()> {
        if !(0..=600).contains(&self.retry_delay_seconds) {
            return Err(Error::validation(
                "retry_delay_seconds must be between 0 and 600.",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeTaskFailResponse {
    pub accepted: bool,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeTaskResultRequest {
    /// Worker-chosen idempotency key; repeated ingestions fan out at most once.
    pub request_id: String,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub lease_id: Option<String>,
    #[serde(default)]
    pub envelopes: Vec<MessageEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeTaskResultResponse {
    pub accepted: bool,
    pub duplicate: bool,
}
