//! Message envelope carried uniformly across the hosted and edge paths.
//!
//! The gateway never interprets `payload`; only `message_type` is read for routing.
//! Typed decoders live at the application edge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Standardized message headers for tracing and delivery metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeaders {
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub organisation_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub causation_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Per-producer attempt counter. Independent of the task row's delivery
    /// `attempt_count`, which the gateway owns.
    #[serde(default)]
    pub attempt: i32,
    #[serde(default)]
    pub max_attempts: Option<i32>,
}

impl Default for MessageHeaders {
    fn default() -> Self {
        Self {
            content_type: default_content_type(),
            schema_version: None,
            organisation_id: None,
            correlation_id: None,
            causation_id: None,
            trace_id: None,
            span_id: None,
            reply_to: None,
            attempt: 0,
            max_attempts: None,
        }
    }
}

fn default_content_type() -> String {
    "application/json".to_string()
}

/// Envelope for queued messages. `payload` is carried verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub message_type: String,
    pub payload: Value,
    #[serde(default)]
    pub headers: MessageHeaders,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            payload,
            headers: MessageHeaders::default(),
            created_at: Utc::now(),
        }
    }

    pub fn increment_attempt(&mut self) {
        self.headers.attempt += 1;
    }

    pub fn to_value(&self) -> crate::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
