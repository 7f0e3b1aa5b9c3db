//! Shared core abstractions for the Conduit edge dispatch plane.
//!
//! This crate defines the cross-crate contracts used by the gateway, the admission
//! dispatcher, and the customer-side worker: the message envelope, the wire DTOs for the
//! runtime/edge-task HTTP surface, the store and stream trait seams, and the runtime
//! token service.
//!
//! # API notes
//! `conduit-core` is an internal crate (`publish = false`). Its public API uses a few
//! third-party types (`uuid::Uuid`, `chrono::DateTime<Utc>`, `serde_json::Value`) as part
//! of the Conduit contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

pub mod contracts;
pub mod envelope;
pub mod lite;
pub mod streams;
pub mod token;

pub use envelope::{MessageEnvelope, MessageHeaders};

pub type Result<T> = std::result::Result<T, Error>;

/// Error for core operations, split by how the HTTP layer must surface it.
#[derive(Debug)]
pub enum Error {
    /// Business-rule violation. Surfaced to the caller as HTTP 400.
    Validation(String),
    /// Credential failure. Surfaced as HTTP 401.
    Unauthorized(String),
    /// Unexpected failure; aborts the current request.
    Internal(anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(message) | Self::Unauthorized(message) => f.write_str(message),
            Self::Internal(inner) => inner.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Internal(inner) => inner.source(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value)
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self::Internal(anyhow::Error::from(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(anyhow::Error::from(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeTaskStatus {
    Queued,
    Leased,
    Acked,
    DeadLetter,
}

impl EdgeTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::Acked => "acked",
            Self::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "leased" => Some(Self::Leased),
            "acked" => Some(Self::Acked),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Active,
    Draining,
    Offline,
}

impl RuntimeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Offline => "offline",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "draining" => Some(Self::Draining),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Durable record of one unit of edge work. The task store is the system of record;
/// the lease index holds the claimable soft state.
#[derive(Debug, Clone)]
pub struct EdgeTask {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub target_runtime_id: Uuid,
    pub message_type: String,
    pub envelope: MessageEnvelope,
    pub status: EdgeTaskStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub lease_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub leased_to_runtime_id: Option<Uuid>,
    pub last_error: Option<Value>,
    pub enqueued_at: DateTime<Utc>,
    pub acked_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// One registered customer worker process, scoped to a tenant.
#[derive(Debug, Clone)]
pub struct RuntimeInstance {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub display_name: Option<String>,
    pub tags: Vec<String>,
    pub capabilities: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub status: RuntimeStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RuntimeInstance {
    /// Message types this runtime advertises. Empty means "accepts everything".
    pub fn capability_message_types(&self) -> Vec<String> {
        self.capabilities
            .get("message_types")
            .and_then(Value::as_array)
            .map(|types| {
                types
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One-shot registration token row. Only the SHA-256 hash of the raw token is stored.
#[derive(Debug, Clone)]
pub struct RegistrationToken {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub runtime_id: Option<Uuid>,
    pub created_by_user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Deduplication ledger row for result ingestion, unique per
/// `(tenant_id, runtime_id, request_id)`.
#[derive(Debug, Clone)]
pub struct ResultReceipt {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub runtime_id: Uuid,
    pub request_id: String,
    pub task_id: Option<Uuid>,
    pub payload_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptInsert {
    Inserted,
    Duplicate,
}

/// One entry appended to an internal stream during result fanout. On the wire the
/// type field is named `type`, matching what stream consumers read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEntry {
    pub data: Value,
    #[serde(rename = "type")]
    pub message_type: String,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &EdgeTask) -> Result<()>;

    async fn get(&self, task_id: Uuid) -> Result<Option<EdgeTask>>;

    async fn mark_leased(
        &self,
        task_id: Uuid,
        lease_id: &str,
        lease_expires_at: DateTime<Utc>,
        leased_to_runtime_id: Uuid,
        attempt_count: i32,
    ) -> Result<()>;

    async fn mark_acked(&self, task_id: Uuid, acked_at: DateTime<Utc>) -> Result<()>;

    /// Back to `queued` with the lease triple cleared. `last_error` is kept as-is when
    /// `None` (lease expiry does not overwrite a worker-reported error).
    async fn mark_requeued(&self, task_id: Uuid, last_error: Option<Value>) -> Result<()>;

    async fn mark_dead_letter(
        &self,
        task_id: Uuid,
        last_error: Option<Value>,
        failed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// All `queued` and `leased` rows, oldest first. Used to rebuild the lease index
    /// after a restart.
    async fn list_open(&self) -> Result<Vec<EdgeTask>>;
}

#[async_trait]
pub trait RuntimeStore: Send + Sync {
    async fn insert(&self, runtime: &RuntimeInstance) -> Result<()>;

    async fn get(&self, runtime_id: Uuid) -> Result<Option<RuntimeInstance>>;

    async fn update(&self, runtime: &RuntimeInstance) -> Result<()>;

    /// Active runtimes for a tenant, freshest heartbeat first (nulls last).
    async fn list_active_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<RuntimeInstance>>;

    async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<RuntimeInstance>>;
}

#[async_trait]
pub trait RegistrationTokenStore: Send + Sync {
    async fn create(&self, token: &RegistrationToken) -> Result<()>;

    async fn get_by_hash(&self, token_hash: &str) -> Result<Option<RegistrationToken>>;

    /// Atomically transition the token from unused to used. Returns `false` when a
    /// concurrent registration won the transition first.
    async fn consume(&self, token_id: Uuid, runtime_id: Uuid, used_at: DateTime<Utc>)
        -> Result<bool>;
}

#[async_trait]
pub trait ReceiptStore: Send + Sync {
    async fn get(
        &self,
        tenant_id: Uuid,
        runtime_id: Uuid,
        request_id: &str,
    ) -> Result<Option<ResultReceipt>>;

    /// Insert under the `(tenant_id, runtime_id, request_id)` unique constraint.
    /// A lost race reports `Duplicate` instead of an error.
    async fn insert(&self, receipt: &ResultReceipt) -> Result<ReceiptInsert>;
}

#[async_trait]
pub trait ResultStream: Send + Sync {
    /// Append an entry to the named internal stream; returns the entry id.
    async fn append(&self, stream: &str, entry: StreamEntry) -> Result<String>;
}

#[async_trait]
pub trait TenantSettings: Send + Sync {
    async fn get_setting(&self, tenant_id: Uuid, key: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait OutboxWriter: Send + Sync {
    /// Record an envelope on the hosted-path outbox; returns the outbox message id.
    async fn enqueue(&self, envelope: &MessageEnvelope) -> Result<Uuid>;
}
