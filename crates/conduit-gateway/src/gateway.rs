//! Task gateway: pull/ack/fail/result operations for authenticated runtimes.
//!
//! The lease index decides which task is claimable right now; the task store is
//! authoritative for durable state after each transition. Every operation persists its
//! transition before returning, so the index can always be rebuilt from store rows.

use crate::lease_index::{ClaimedLease, ExpiryAction, FailOutcome, LeaseIndex};
use chrono::{Duration, Utc};
use conduit_core::contracts::{
    EdgeTaskAckRequest, EdgeTaskAckResponse, EdgeTaskFailRequest, EdgeTaskFailResponse,
    EdgeTaskLease, EdgeTaskPullRequest, EdgeTaskResultRequest, EdgeTaskResultResponse,
};
use conduit_core::streams::stream_for_message_type;
use conduit_core::token::sha256_hex;
use conduit_core::{
    EdgeTask, EdgeTaskStatus, MessageEnvelope, ReceiptInsert, ReceiptStore, Result,
    ResultReceipt, ResultStream, StreamEntry, TaskStore,
};
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_MAX_ATTEMPTS: i32 = 5;
const EXPIRED_LEASE_BATCH: usize = 25;
const CLAIM_RETRY_SLEEP: std::time::Duration = std::time::Duration::from_millis(500);

pub struct TaskGateway {
    store: Arc<dyn TaskStore>,
    receipts: Arc<dyn ReceiptStore>,
    streams: Arc<dyn ResultStream>,
    index: LeaseIndex,
}

impl TaskGateway {
    pub fn new(
        store: Arc<dyn TaskStore>,
        receipts: Arc<dyn ReceiptStore>,
        streams: Arc<dyn ResultStream>,
    ) -> Self {
        Self {
            store,
            receipts,
            streams,
            index: LeaseIndex::new(),
        }
    }

    /// Reload the lease index from durable task rows. Called once at startup.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let open = self.store.list_open().await?;
        Ok(self.index.load_open_tasks(open))
    }

    /// Producer-facing enqueue; never blocks on lease availability.
    pub async fn enqueue_for_runtime(
        &self,
        tenant_id: Uuid,
        runtime_id: Uuid,
        envelope: MessageEnvelope,
    ) -> Result<Uuid> {
        let now = Utc::now();
        let max_attempts = envelope
            .headers
            .max_attempts
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let task = EdgeTask {
            id: Uuid::new_v4(),
            tenant_id,
            target_runtime_id: runtime_id,
            message_type: envelope.message_type.clone(),
            envelope,
            status: EdgeTaskStatus::Queued,
            attempt_count: 0,
            max_attempts,
            lease_id: None,
            lease_expires_at: None,
            leased_to_runtime_id: None,
            last_error: None,
            enqueued_at: now,
            acked_at: None,
            failed_at: None,
            updated_at: now,
        };

        self.store.insert(&task).await?;
        self.index.add_pending(&task, now);

        tracing::debug!(
            event = "conduit.gateway.enqueued",
            tenant_id = %tenant_id,
            runtime_id = %runtime_id,
            task_id = %task.id,
            message_type = %task.message_type,
            "edge task enqueued"
        );
        Ok(task.id)
    }

    /// Long-poll claim loop. Bounded by `long_poll_seconds`; a disconnected caller
    /// cancels the loop at the next await point without acquiring new leases.
    pub async fn pull_tasks(
        &self,
        tenant_id: Uuid,
        runtime_id: Uuid,
        request: &EdgeTaskPullRequest,
    ) -> Result<Vec<EdgeTaskLease>> {
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_secs(request.long_poll_seconds.max(0) as u64);
        let visibility = Duration::seconds(request.visibility_timeout_seconds);

        let mut leases = Vec::new();
        while tokio::time::Instant::now() < deadline && leases.len() < request.max_tasks as usize
        {
            self.requeue_expired_leases(tenant_id, runtime_id).await?;

            if let Some(claim) = self.claim_one_task(tenant_id, runtime_id, visibility).await? {
                leases.push(claim);
                continue;
            }
            tokio::time::sleep(CLAIM_RETRY_SLEEP).await;
        }
        Ok(leases)
    }

    pub async fn ack_task(
        &self,
        tenant_id: Uuid,
        runtime_id: Uuid,
        request: &EdgeTaskAckRequest,
    ) -> Result<EdgeTaskAckResponse> {
        self.index
            .ack(tenant_id, runtime_id, request.task_id, &request.lease_id)?;
        self.store.mark_acked(request.task_id, Utc::now()).await?;

        tracing::debug!(
            event = "conduit.gateway.acked",
            tenant_id = %tenant_id,
            runtime_id = %runtime_id,
            task_id = %request.task_id,
            "edge task acked"
        );
        Ok(EdgeTaskAckResponse {
            accepted: true,
            status: EdgeTaskStatus::Acked.as_str().to_string(),
        })
    }

    pub async fn fail_task(
        &self,
        tenant_id: Uuid,
        runtime_id: Uuid,
        request: &EdgeTaskFailRequest,
    ) -> Result<EdgeTaskFailResponse> {
        let outcome = self.index.fail(
            tenant_id,
            runtime_id,
            request.task_id,
            &request.lease_id,
            Duration::seconds(request.retry_delay_seconds),
        )?;

        let last_error = Some(serde_json::json!({ "message": request.error }));
        match outcome {
            FailOutcome::Requeued => {
                self.store.mark_requeued(request.task_id, last_error).await?;
            }
            FailOutcome::DeadLettered => {
                self.store
                    .mark_dead_letter(request.task_id, last_error, Utc::now())
                    .await?;
                tracing::warn!(
                    event = "conduit.gateway.dead_letter",
                    tenant_id = %tenant_id,
                    runtime_id = %runtime_id,
                    task_id = %request.task_id,
                    error = %request.error,
                    "edge task dead-lettered"
                );
            }
        }

        Ok(EdgeTaskFailResponse {
            accepted: true,
            status: outcome.status().as_str().to_string(),
        })
    }

    /// Idempotent result acceptance. The receipt is written before any fanout, so a
    /// repeated `request_id` fans out at most once.
    pub async fn ingest_result(
        &self,
        tenant_id: Uuid,
        runtime_id: Uuid,
        request: &EdgeTaskResultRequest,
    ) -> Result<EdgeTaskResultResponse> {
        if self
            .receipts
            .get(tenant_id, runtime_id, &request.request_id)
            .await?
            .is_some()
        {
            return Ok(duplicate_response());
        }

        let payload_hash = sha256_hex(&serde_json::to_vec(request)?);
        let receipt = ResultReceipt {
            id: Uuid::new_v4(),
            tenant_id,
            runtime_id,
            request_id: request.request_id.clone(),
            task_id: request.task_id,
            payload_hash: Some(payload_hash),
            created_at: Utc::now(),
        };
        if let ReceiptInsert::Duplicate = self.receipts.insert(&receipt).await? {
            return Ok(duplicate_response());
        }

        for envelope in &request.envelopes {
            let Some(stream) = stream_for_message_type(&envelope.message_type) else {
                tracing::debug!(
                    event = "conduit.gateway.result.unmapped",
                    tenant_id = %tenant_id,
                    message_type = %envelope.message_type,
                    "result envelope skipped: no stream mapping"
                );
                continue;
            };
            let entry = StreamEntry {
                data: envelope.to_value()?,
                message_type: envelope.message_type.clone(),
            };
            self.streams.append(stream, entry).await?;
        }

        Ok(EdgeTaskResultResponse {
            accepted: true,
            duplicate: false,
        })
    }

    async fn claim_one_task(
        &self,
        tenant_id: Uuid,
        runtime_id: Uuid,
        visibility: Duration,
    ) -> Result<Option<EdgeTaskLease>> {
        let Some(claim) = self.index.claim_one(tenant_id, runtime_id, visibility)? else {
            return Ok(None);
        };
        let ClaimedLease {
            task_id,
            lease_id,
            lease_expires_at,
            delivery_attempt,
            envelope,
        } = claim;

        self.store
            .mark_leased(task_id, &lease_id, lease_expires_at, runtime_id, delivery_attempt)
            .await?;

        Ok(Some(EdgeTaskLease {
            task_id,
            lease_id,
            delivery_attempt,
            envelope,
        }))
    }

    async fn requeue_expired_leases(&self, tenant_id: Uuid, runtime_id: Uuid) -> Result<()> {
        for action in self
            .index
            .requeue_expired(tenant_id, runtime_id, EXPIRED_LEASE_BATCH)
        {
            match action {
                ExpiryAction::Requeued { task_id } => {
                    self.store.mark_requeued(task_id, None).await?;
                    tracing::debug!(
                        event = "conduit.gateway.lease_expired.requeued",
                        tenant_id = %tenant_id,
                        runtime_id = %runtime_id,
                        task_id = %task_id,
                        "expired lease requeued"
                    );
                }
                ExpiryAction::DeadLettered { task_id } => {
                    self.store.mark_dead_letter(task_id, None, Utc::now()).await?;
                    tracing::warn!(
                        event = "conduit.gateway.lease_expired.dead_letter",
                        tenant_id = %tenant_id,
                        runtime_id = %runtime_id,
                        task_id = %task_id,
                        "expired lease dead-lettered"
                    );
                }
            }
        }
        Ok(())
    }
}

fn duplicate_response() -> EdgeTaskResultResponse {
    EdgeTaskResultResponse {
        accepted: true,
        duplicate: true,
    }
}
