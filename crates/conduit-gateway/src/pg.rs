//! Postgres implementations of the core store interfaces.
//!
//! Schema lives in `migrations/`. Statuses are text-checked columns; envelopes and
//! capability documents are JSONB.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::{
    EdgeTask, EdgeTaskStatus, Error, MessageEnvelope, OutboxWriter, ReceiptInsert, ReceiptStore,
    RegistrationToken, RegistrationTokenStore, Result, ResultReceipt, ResultStream,
    RuntimeInstance, RuntimeStatus, RuntimeStore, StreamEntry, TaskStore, TenantSettings,
};
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn task_from_row(row: &PgRow) -> Result<EdgeTask> {
    let status_raw: String = row.try_get("status")?;
    let status = EdgeTaskStatus::parse(&status_raw)
        .ok_or_else(|| Error::Internal(anyhow::anyhow!("unknown task status `{status_raw}`")))?;
    let payload: Value = row.try_get("message_payload")?;
    let envelope: MessageEnvelope =
        serde_json::from_value(payload).context("decode task envelope")?;

    Ok(EdgeTask {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        target_runtime_id: row.try_get("target_runtime_id")?,
        message_type: row.try_get("message_type")?,
        envelope,
        status,
        attempt_count: row.try_get("attempt_count")?,
        max_attempts: row.try_get("max_attempts")?,
        lease_id: row.try_get("lease_id")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        leased_to_runtime_id: row.try_get("leased_to_runtime_id")?,
        last_error: row.try_get("last_error")?,
        enqueued_at: row.try_get("enqueued_at")?,
        acked_at: row.try_get("acked_at")?,
        failed_at: row.try_get("failed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const TASK_COLUMNS: &str = "id, tenant_id, message_type, message_payload, status, \
     target_runtime_id, lease_id, lease_expires_at, leased_to_runtime_id, attempt_count, \
     max_attempts, last_error, enqueued_at, acked_at, failed_at, updated_at";

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert(&self, task: &EdgeTask) -> Result<()> {
        let envelope = serde_json::to_value(&task.envelope)?;
        sqlx::query(
            r#"
            INSERT INTO edge_task_records (
              id, tenant_id, message_type, message_payload, status, target_runtime_id,
              attempt_count, max_attempts, enqueued_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(task.id)
        .bind(task.tenant_id)
        .bind(&task.message_type)
        .bind(envelope)
        .bind(task.status.as_str())
        .bind(task.target_runtime_id)
        .bind(task.attempt_count)
        .bind(task.max_attempts)
        .bind(task.enqueued_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .context("insert edge task")?;
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<EdgeTask>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM edge_task_records WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch edge task")?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn mark_leased(
        &self,
        task_id: Uuid,
        lease_id: &str,
        lease_expires_at: DateTime<Utc>,
        leased_to_runtime_id: Uuid,
        attempt_count: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE edge_task_records
            SET status = 'leased',
                lease_id = $2,
                lease_expires_at = $3,
                leased_to_runtime_id = $4,
                attempt_count = $5,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(lease_id)
        .bind(lease_expires_at)
        .bind(leased_to_runtime_id)
        .bind(attempt_count)
        .execute(&self.pool)
        .await
        .with_context(|| format!("mark task {task_id} leased"))?;
        Ok(())
    }

    async fn mark_acked(&self, task_id: Uuid, acked_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE edge_task_records
            SET status = 'acked',
                lease_id = NULL,
                lease_expires_at = NULL,
                leased_to_runtime_id = NULL,
                acked_at = $2,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(acked_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("mark task {task_id} acked"))?;
        Ok(())
    }

    async fn mark_requeued(&self, task_id: Uuid, last_error: Option<Value>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE edge_task_records
            SET status = 'queued',
                lease_id = NULL,
                lease_expires_at = NULL,
                leased_to_runtime_id = NULL,
                last_error = COALESCE($2, last_error),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(last_error)
        .execute(&self.pool)
        .await
        .with_context(|| format!("mark task {task_id} requeued"))?;
        Ok(())
    }

    async fn mark_dead_letter(
        &self,
        task_id: Uuid,
        last_error: Option<Value>,
        failed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE edge_task_records
            SET status = 'dead_letter',
                lease_id = NULL,
                lease_expires_at = NULL,
                leased_to_runtime_id = NULL,
                last_error = COALESCE($2, last_error),
                failed_at = $3,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(last_error)
        .bind(failed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("mark task {task_id} dead-lettered"))?;
        Ok(())
    }

    async fn list_open(&self) -> Result<Vec<EdgeTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM edge_task_records \
             WHERE status IN ('queued', 'leased') ORDER BY enqueued_at"
        ))
        .fetch_all(&self.pool)
        .await
        .context("list open edge tasks")?;
        rows.iter().map(task_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgRuntimeStore {
    pool: PgPool,
}

impl PgRuntimeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn runtime_from_row(row: &PgRow) -> Result<RuntimeInstance> {
    let status_raw: String = row.try_get("status")?;
    let status = RuntimeStatus::parse(&status_raw)
        .ok_or_else(|| Error::Internal(anyhow::anyhow!("unknown runtime status `{status_raw}`")))?;
    let tags: Value = row.try_get("tags")?;
    let capabilities: Value = row.try_get("capabilities")?;
    let metadata: Value = row.try_get("metadata")?;

    Ok(RuntimeInstance {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        display_name: row.try_get("display_name")?,
        tags: serde_json::from_value(tags).context("decode runtime tags")?,
        capabilities: serde_json::from_value::<Map<String, Value>>(capabilities)
            .context("decode runtime capabilities")?,
        metadata: serde_json::from_value::<Map<String, Value>>(metadata)
            .context("decode runtime metadata")?,
        status,
        last_seen_at: row.try_get("last_seen_at")?,
        registered_at: row.try_get("registered_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const RUNTIME_COLUMNS: &str = "id, tenant_id, display_name, tags, capabilities, metadata, \
     status, last_seen_at, registered_at, created_at, updated_at";

#[async_trait]
impl RuntimeStore for PgRuntimeStore {
    async fn insert(&self, runtime: &RuntimeInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ep_runtime_instances (
              id, tenant_id, display_name, tags, capabilities, metadata, status,
              last_seen_at, registered_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(runtime.id)
        .bind(runtime.tenant_id)
        .bind(&runtime.display_name)
        .bind(Value::from(runtime.tags.clone()))
        .bind(Value::Object(runtime.capabilities.clone()))
        .bind(Value::Object(runtime.metadata.clone()))
        .bind(runtime.status.as_str())
        .bind(runtime.last_seen_at)
        .bind(runtime.registered_at)
        .bind(runtime.created_at)
        .bind(runtime.updated_at)
        .execute(&self.pool)
        .await
        .context("insert runtime instance")?;
        Ok(())
    }

    async fn get(&self, runtime_id: Uuid) -> Result<Option<RuntimeInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {RUNTIME_COLUMNS} FROM ep_runtime_instances WHERE id = $1"
        ))
        .bind(runtime_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch runtime instance")?;
        row.as_ref().map(runtime_from_row).transpose()
    }

    async fn update(&self, runtime: &RuntimeInstance) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ep_runtime_instances
            SET display_name = $2,
                tags = $3,
                capabilities = $4,
                metadata = $5,
                status = $6,
                last_seen_at = $7,
                updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(runtime.id)
        .bind(&runtime.display_name)
        .bind(Value::from(runtime.tags.clone()))
        .bind(Value::Object(runtime.capabilities.clone()))
        .bind(Value::Object(runtime.metadata.clone()))
        .bind(runtime.status.as_str())
        .bind(runtime.last_seen_at)
        .bind(runtime.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("update runtime {}", runtime.id))?;
        Ok(())
    }

    async fn list_active_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<RuntimeInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUNTIME_COLUMNS} FROM ep_runtime_instances \
             WHERE tenant_id = $1 AND status = 'active' \
             ORDER BY last_seen_at DESC NULLS LAST"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .context("list active runtimes")?;
        rows.iter().map(runtime_from_row).collect()
    }

    async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<RuntimeInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUNTIME_COLUMNS} FROM ep_runtime_instances \
             WHERE tenant_id = $1 ORDER BY last_seen_at DESC NULLS LAST"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .context("list runtimes for tenant")?;
        rows.iter().map(runtime_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgRegistrationTokenStore {
    pool: PgPool,
}

impl PgRegistrationTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RegistrationTokenStore for PgRegistrationTokenStore {
    async fn create(&self, token: &RegistrationToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ep_runtime_registration_tokens (
              id, tenant_id, token_hash, expires_at, created_by_user_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(token.id)
        .bind(token.tenant_id)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .bind(token.created_by_user_id)
        .bind(token.created_at)
        .execute(&self.pool)
        .await
        .context("insert registration token")?;
        Ok(())
    }

    async fn get_by_hash(&self, token_hash: &str) -> Result<Option<RegistrationToken>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, token_hash, expires_at, used_at, runtime_id,
                   created_by_user_id, created_at
            FROM ep_runtime_registration_tokens
            WHERE token_hash = $1
            LIMIT 1
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .context("fetch registration token")?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(RegistrationToken {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            token_hash: row.try_get("token_hash")?,
            expires_at: row.try_get("expires_at")?,
            used_at: row.try_get("used_at")?,
            runtime_id: row.try_get("runtime_id")?,
            created_by_user_id: row.try_get("created_by_user_id")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn consume(
        &self,
        token_id: Uuid,
        runtime_id: Uuid,
        used_at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE ep_runtime_registration_tokens
            SET used_at = $3,
                runtime_id = $2
            WHERE id = $1
              AND used_at IS NULL
            "#,
        )
        .bind(token_id)
        .bind(runtime_id)
        .bind(used_at)
        .execute(&self.pool)
        .await
        .context("consume registration token")?;
        Ok(updated.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
pub struct PgReceiptStore {
    pool: PgPool,
}

impl PgReceiptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReceiptStore for PgReceiptStore {
    async fn get(
        &self,
        tenant_id: Uuid,
        runtime_id: Uuid,
        request_id: &str,
    ) -> Result<Option<ResultReceipt>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, runtime_id, request_id, task_id, payload_hash, created_at
            FROM edge_result_receipts
            WHERE tenant_id = $1
              AND runtime_id = $2
              AND request_id = $3
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(runtime_id)
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch result receipt")?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ResultReceipt {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            runtime_id: row.try_get("runtime_id")?,
            request_id: row.try_get("request_id")?,
            task_id: row.try_get("task_id")?,
            payload_hash: row.try_get("payload_hash")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn insert(&self, receipt: &ResultReceipt) -> Result<ReceiptInsert> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO edge_result_receipts (
              id, tenant_id, runtime_id, request_id, task_id, payload_hash, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT ON CONSTRAINT uq_edge_result_receipt_request DO NOTHING
            "#,
        )
        .bind(receipt.id)
        .bind(receipt.tenant_id)
        .bind(receipt.runtime_id)
        .bind(&receipt.request_id)
        .bind(receipt.task_id)
        .bind(&receipt.payload_hash)
        .bind(receipt.created_at)
        .execute(&self.pool)
        .await
        .context("insert result receipt")?;

        if inserted.rows_affected() == 1 {
            Ok(ReceiptInsert::Inserted)
        } else {
            Ok(ReceiptInsert::Duplicate)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStreams {
    pool: PgPool,
}

impl PgStreams {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStream for PgStreams {
    async fn append(&self, stream: &str, entry: StreamEntry) -> Result<String> {
        let entry_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO stream_entries (entry_id, stream, message_type, data)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(entry_id)
        .bind(stream)
        .bind(&entry.message_type)
        .bind(&entry.data)
        .execute(&self.pool)
        .await
        .with_context(|| format!("append to stream {stream}"))?;
        Ok(entry_id.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct PgTenantSettings {
    pool: PgPool,
}

impl PgTenantSettings {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantSettings for PgTenantSettings {
    async fn get_setting(&self, tenant_id: Uuid, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            r#"
            SELECT setting_value
            FROM tenant_settings
            WHERE tenant_id = $1
              AND setting_key = $2
            "#,
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("fetch tenant setting {key}"))?;
        Ok(value)
    }
}

#[derive(Debug, Clone)]
pub struct PgOutboxWriter {
    pool: PgPool,
}

impl PgOutboxWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxWriter for PgOutboxWriter {
    async fn enqueue(&self, envelope: &MessageEnvelope) -> Result<Uuid> {
        let payload = serde_json::to_value(envelope)?;
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (outbox_id, message_type, payload, available_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (outbox_id) DO NOTHING
            "#,
        )
        .bind(envelope.id)
        .bind(&envelope.message_type)
        .bind(payload)
        .execute(&self.pool)
        .await
        .context("insert outbox message")?;
        Ok(envelope.id)
    }
}
