//! Admission-side dispatch: per tenant, route an analytic job either to the hosted
//! worker pool (outbox) or to a selected customer runtime (edge queue).

use conduit_core::contracts::ExecutionMode;
use conduit_core::{MessageEnvelope, OutboxWriter, Result, TenantSettings};
use conduit_gateway::{RuntimeRegistry, TaskGateway};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

pub const EXECUTION_MODE_KEY: &str = "execution_mode";

/// Message types eligible for the edge path until configured otherwise.
const DEFAULT_EDGE_MESSAGE_TYPES: &[&str] = &["semantic_query_request"];

/// Resolves the configured execution mode for a tenant. Pure read; any lookup
/// failure falls back to the process-wide default, unknown values collapse to hosted.
pub struct ExecutionRouter {
    settings: Arc<dyn TenantSettings>,
    default_mode: ExecutionMode,
}

impl ExecutionRouter {
    pub fn new(settings: Arc<dyn TenantSettings>, default_mode: ExecutionMode) -> Self {
        Self {
            settings,
            default_mode,
        }
    }

    pub async fn mode_for_tenant(&self, tenant_id: Uuid) -> ExecutionMode {
        let raw = match self.settings.get_setting(tenant_id, EXECUTION_MODE_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return self.default_mode,
            Err(err) => {
                tracing::warn!(
                    event = "conduit.dispatch.mode_lookup_failed",
                    tenant_id = %tenant_id,
                    error = %err,
                    "execution mode lookup failed, using default"
                );
                return self.default_mode;
            }
        };
        ExecutionMode::parse(raw.trim().to_ascii_lowercase().as_str())
            .unwrap_or(ExecutionMode::Hosted)
    }
}

/// A producer-submitted job payload, not yet wrapped in an envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub message_type: String,
    pub payload: Value,
}

/// Ambient request context carried into dispatch.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    pub correlation_id: Option<String>,
}

pub struct TaskDispatcher {
    router: ExecutionRouter,
    registry: Arc<RuntimeRegistry>,
    gateway: Arc<TaskGateway>,
    outbox: Arc<dyn OutboxWriter>,
    edge_message_types: HashSet<String>,
}

impl TaskDispatcher {
    pub fn new(
        router: ExecutionRouter,
        registry: Arc<RuntimeRegistry>,
        gateway: Arc<TaskGateway>,
        outbox: Arc<dyn OutboxWriter>,
    ) -> Self {
        Self {
            router,
            registry,
            gateway,
            outbox,
            edge_message_types: DEFAULT_EDGE_MESSAGE_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }

    pub fn with_edge_message_types(
        mut self,
        message_types: impl IntoIterator<Item = String>,
    ) -> Self {
        self.edge_message_types = message_types.into_iter().collect();
        self
    }

    /// Route one job. Hosted tenants (and message types outside the edge-eligible
    /// set) get an outbox record; edge tenants get an `EdgeTask` targeting the
    /// selected runtime. Returns the mode the job was actually routed under.
    pub async fn dispatch_job_message(
        &self,
        tenant_id: Uuid,
        message: JobMessage,
        required_tags: Option<&[String]>,
        context: &DispatchContext,
    ) -> Result<ExecutionMode> {
        let mode = self.router.mode_for_tenant(tenant_id).await;

        let mut envelope = MessageEnvelope::new(message.message_type, message.payload);
        envelope.headers.organisation_id = Some(tenant_id.to_string());
        envelope.headers.correlation_id = context.correlation_id.clone();

        if mode == ExecutionMode::Hosted
            || !self.edge_message_types.contains(&envelope.message_type)
        {
            self.outbox.enqueue(&envelope).await?;
            return Ok(ExecutionMode::Hosted);
        }

        let runtime = self
            .registry
            .select_runtime_for_dispatch(tenant_id, &envelope.message_type, required_tags)
            .await?;
        let task_id = self
            .gateway
            .enqueue_for_runtime(tenant_id, runtime.id, envelope)
            .await?;

        tracing::info!(
            event = "conduit.dispatch.edge",
            tenant_id = %tenant_id,
            runtime_id = %runtime.id,
            task_id = %task_id,
            "job dispatched to customer runtime"
        );
        Ok(ExecutionMode::CustomerRuntime)
    }
}
