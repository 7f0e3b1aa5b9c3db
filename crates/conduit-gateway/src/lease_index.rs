//! Per-runtime pending queue and lease-expiry index.
//!
//! Soft state kept alongside the task store: two ordered sets per
//! `(tenant, runtime)` — Pending scored by `visible_at`, Leases scored by
//! `lease_expires_at`, both in unix milliseconds — plus a per-task record for O(1)
//! lookup during ack/fail/expire. Each `(tenant, runtime)` shard sits behind its own
//! mutex; removing a member under the shard lock is the single serialization point
//! for claims, so exactly one puller wins each pending task.
//!
//! The index is rebuildable from task store rows after a restart (`load_open_tasks`);
//! rebuilt leases that have already expired are promoted back to Pending by the lazy
//! expiry pass on the next pull.

use chrono::{DateTime, Duration, Utc};
use conduit_core::{EdgeTask, EdgeTaskStatus, Error, MessageEnvelope, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct QueueKey {
    tenant_id: Uuid,
    runtime_id: Uuid,
}

#[derive(Debug, Clone)]
struct TaskRecord {
    status: EdgeTaskStatus,
    envelope: MessageEnvelope,
    attempt_count: i32,
    max_attempts: i32,
    lease_id: Option<String>,
    lease_expires_at_ms: Option<i64>,
    leased_to_runtime_id: Option<Uuid>,
}

#[derive(Debug, Default)]
struct Shard {
    /// Members `(visible_at_ms, task_id)`; eligible iff `visible_at_ms <= now`.
    pending: BTreeSet<(i64, Uuid)>,
    /// Members `(lease_expires_at_ms, task_id)`; expired iff the score `<= now`.
    leases: BTreeSet<(i64, Uuid)>,
    tasks: HashMap<Uuid, TaskRecord>,
}

/// A freshly claimed lease plus everything the gateway needs to persist the
/// transition and answer the puller.
#[derive(Debug, Clone)]
pub struct ClaimedLease {
    pub task_id: Uuid,
    pub lease_id: String,
    pub lease_expires_at: DateTime<Utc>,
    pub delivery_attempt: i32,
    pub envelope: MessageEnvelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryAction {
    Requeued { task_id: Uuid },
    DeadLettered { task_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued,
    DeadLettered,
}

impl FailOutcome {
    pub fn status(&self) -> EdgeTaskStatus {
        match self {
            Self::Requeued => EdgeTaskStatus::Queued,
            Self::DeadLettered => EdgeTaskStatus::DeadLetter,
        }
    }
}

#[derive(Debug, Default)]
pub struct LeaseIndex {
    shards: Mutex<HashMap<QueueKey, Arc<Mutex<Shard>>>>,
}

impl LeaseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, tenant_id: Uuid, runtime_id: Uuid) -> Arc<Mutex<Shard>> {
        let key = QueueKey {
            tenant_id,
            runtime_id,
        };
        lock(&self.shards).entry(key).or_default().clone()
    }

    /// Register a queued task and make it claimable at `visible_at`.
    pub fn add_pending(&self, task: &EdgeTask, visible_at: DateTime<Utc>) {
        let shard = self.shard(task.tenant_id, task.target_runtime_id);
        let mut guard = lock(&shard);
        let shard = &mut *guard;
        shard.tasks.insert(
            task.id,
            TaskRecord {
                status: EdgeTaskStatus::Queued,
                envelope: task.envelope.clone(),
                attempt_count: task.attempt_count,
                max_attempts: task.max_attempts,
                lease_id: None,
                lease_expires_at_ms: None,
                leased_to_runtime_id: None,
            },
        );
        shard
            .pending
            .insert((visible_at.timestamp_millis(), task.id));
    }

    /// Claim the oldest eligible pending task, if any. Atomic with respect to
    /// sibling claimers on the same `(tenant, runtime)`.
    pub fn claim_one(
        &self,
        tenant_id: Uuid,
        runtime_id: Uuid,
        visibility_timeout: Duration,
    ) -> Result<Option<ClaimedLease>> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let shard = self.shard(tenant_id, runtime_id);
        let mut guard = lock(&shard);
        let shard = &mut *guard;

        let Some(&(visible_at_ms, task_id)) = shard.pending.first() else {
            return Ok(None);
        };
        if visible_at_ms > now_ms {
            return Ok(None);
        }
        shard.pending.remove(&(visible_at_ms, task_id));

        let lease_id = Uuid::new_v4().to_string();
        let lease_expires_at = now + visibility_timeout;
        let expires_ms = lease_expires_at.timestamp_millis();

        let record = shard
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::validation("Task payload is missing."))?;
        record.attempt_count += 1;
        record.status = EdgeTaskStatus::Leased;
        record.lease_id = Some(lease_id.clone());
        record.lease_expires_at_ms = Some(expires_ms);
        record.leased_to_runtime_id = Some(runtime_id);
        let delivery_attempt = record.attempt_count;
        let envelope = record.envelope.clone();

        shard.leases.insert((expires_ms, task_id));

        Ok(Some(ClaimedLease {
            task_id,
            lease_id,
            lease_expires_at,
            delivery_attempt,
            envelope,
        }))
    }

    /// Acknowledge a delivery. The lease id must match the current claim and the
    /// caller must be the leaseholder; a stale ack leaves the task untouched.
    pub fn ack(
        &self,
        tenant_id: Uuid,
        runtime_id: Uuid,
        task_id: Uuid,
        lease_id: &str,
    ) -> Result<()> {
        let shard = self.shard(tenant_id, runtime_id);
        let mut guard = lock(&shard);
        let shard = &mut *guard;

        let record = shard
            .tasks
            .get(&task_id)
            .ok_or_else(|| Error::validation("Task lease does not exist."))?;
        check_lease(record, runtime_id, lease_id)?;

        if let Some(expires_ms) = record.lease_expires_at_ms {
            shard.leases.remove(&(expires_ms, task_id));
        }
        // Terminal in the index; the task store keeps the durable acked row.
        shard.tasks.remove(&task_id);
        Ok(())
    }

    /// Worker-reported failure: requeue with a retry delay, or dead-letter once
    /// `attempt_count` has reached `max_attempts`. Same fencing rules as `ack`.
    pub fn fail(
        &self,
        tenant_id: Uuid,
        runtime_id: Uuid,
        task_id: Uuid,
        lease_id: &str,
        retry_delay: Duration,
    ) -> Result<FailOutcome> {
        let shard = self.shard(tenant_id, runtime_id);
        let mut guard = lock(&shard);
        let shard = &mut *guard;

        let record = shard
            .tasks
            .get(&task_id)
            .ok_or_else(|| Error::validation("Task lease does not exist."))?;
        check_lease(record, runtime_id, lease_id)?;

        let expires_ms = record.lease_expires_at_ms;
        let exhausted = record.attempt_count >= record.max_attempts;

        if let Some(expires_ms) = expires_ms {
            shard.leases.remove(&(expires_ms, task_id));
        }

        if exhausted {
            shard.tasks.remove(&task_id);
            return Ok(FailOutcome::DeadLettered);
        }

        let visible_at = Utc::now() + retry_delay;
        if let Some(record) = shard.tasks.get_mut(&task_id) {
            record.status = EdgeTaskStatus::Queued;
            record.lease_id = None;
            record.lease_expires_at_ms = None;
            record.leased_to_runtime_id = None;
        }
        shard
            .pending
            .insert((visible_at.timestamp_millis(), task_id));
        Ok(FailOutcome::Requeued)
    }

    /// Move expired leases back to Pending (or to dead-letter when attempts are
    /// exhausted), up to `limit` per pass. Runs lazily at the start of each pull
    /// iteration, so leases from a crashed worker become visible automatically.
    pub fn requeue_expired(
        &self,
        tenant_id: Uuid,
        runtime_id: Uuid,
        limit: usize,
    ) -> Vec<ExpiryAction> {
        let now_ms = Utc::now().timestamp_millis();
        let shard = self.shard(tenant_id, runtime_id);
        let mut guard = lock(&shard);
        let shard = &mut *guard;

        let expired: Vec<(i64, Uuid)> = shard
            .leases
            .iter()
            .take_while(|(expires_ms, _)| *expires_ms <= now_ms)
            .take(limit)
            .copied()
            .collect();

        let mut actions = Vec::with_capacity(expired.len());
        for (expires_ms, task_id) in expired {
            shard.leases.remove(&(expires_ms, task_id));

            let Some(record) = shard.tasks.get(&task_id) else {
                continue;
            };
            if record.status != EdgeTaskStatus::Leased {
                continue;
            }

            if record.attempt_count >= record.max_attempts {
                shard.tasks.remove(&task_id);
                actions.push(ExpiryAction::DeadLettered { task_id });
                continue;
            }

            if let Some(record) = shard.tasks.get_mut(&task_id) {
                record.status = EdgeTaskStatus::Queued;
                record.lease_id = None;
                record.lease_expires_at_ms = None;
                record.leased_to_runtime_id = None;
            }
            shard.pending.insert((now_ms, task_id));
            actions.push(ExpiryAction::Requeued { task_id });
        }
        actions
    }

    /// Rebuild the index from durable rows: queued rows become immediately
    /// claimable; leased rows keep their lease so in-flight acks still fence, and
    /// expired ones are promoted by the next expiry pass.
    pub fn load_open_tasks(&self, tasks: Vec<EdgeTask>) -> usize {
        let now = Utc::now();
        let mut restored = 0;
        for task in tasks {
            match task.status {
                EdgeTaskStatus::Queued => {
                    self.add_pending(&task, now);
                    restored += 1;
                }
                EdgeTaskStatus::Leased => {
                    let (Some(lease_id), Some(lease_expires_at), Some(leased_to)) = (
                        task.lease_id.clone(),
                        task.lease_expires_at,
                        task.leased_to_runtime_id,
                    ) else {
                        continue;
                    };
                    let expires_ms = lease_expires_at.timestamp_millis();
                    let shard = self.shard(task.tenant_id, task.target_runtime_id);
                    let mut guard = lock(&shard);
                    let shard = &mut *guard;
                    shard.tasks.insert(
                        task.id,
                        TaskRecord {
                            status: EdgeTaskStatus::Leased,
                            envelope: task.envelope.clone(),
                            attempt_count: task.attempt_count,
                            max_attempts: task.max_attempts,
                            lease_id: Some(lease_id),
                            lease_expires_at_ms: Some(expires_ms),
                            leased_to_runtime_id: Some(leased_to),
                        },
                    );
                    shard.leases.insert((expires_ms, task.id));
                    restored += 1;
                }
                _ => {}
            }
        }
        restored
    }

    /// Test helper: `(pending, leased)` member counts for one queue.
    pub fn depth(&self, tenant_id: Uuid, runtime_id: Uuid) -> (usize, usize) {
        let shard = self.shard(tenant_id, runtime_id);
        let shard = lock(&shard);
        (shard.pending.len(), shard.leases.len())
    }
}

fn check_lease(record: &TaskRecord, runtime_id: Uuid, lease_id: &str) -> Result<()> {
    if record.lease_id.as_deref() != Some(lease_id) {
        return Err(Error::validation("Task lease does not match."));
    }
    if record.leased_to_runtime_id != Some(runtime_id) {
        return Err(Error::validation(
            "Task lease belongs to a different runtime.",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queued_task(tenant_id: Uuid, runtime_id: Uuid, max_attempts: i32) -> EdgeTask {
        let now = Utc::now();
        let envelope = MessageEnvelope::new("test", json!({"message": "hello"}));
        EdgeTask {
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
        }
    }

    #[test]
    fn claim_serves_oldest_visible_first() {
        let index = LeaseIndex::new();
        let tenant_id = Uuid::new_v4();
        let runtime_id = Uuid::new_v4();
        let now = Utc::now();

        let older = queued_task(tenant_id, runtime_id, 5);
        let newer = queued_task(tenant_id, runtime_id, 5);
        index.add_pending(&older, now - Duration::seconds(5));
        index.add_pending(&newer, now);

        let first = index
            .claim_one(tenant_id, runtime_id, Duration::seconds(60))
            .expect("claim")
            .expect("lease");
        assert_eq!(first.task_id, older.id);
        assert_eq!(first.delivery_attempt, 1);
    }

    #[test]
    fn future_visible_at_is_not_claimable() {
        let index = LeaseIndex::new();
        let tenant_id = Uuid::new_v4();
        let runtime_id = Uuid::new_v4();

        let task = queued_task(tenant_id, runtime_id, 5);
        index.add_pending(&task, Utc::now() + Duration::seconds(30));

        let claimed = index
            .claim_one(tenant_id, runtime_id, Duration::seconds(60))
            .expect("claim");
        assert!(claimed.is_none());
    }

    #[test]
    fn each_pending_task_is_claimed_exactly_once() {
        let index = Arc::new(LeaseIndex::new());
        let tenant_id = Uuid::new_v4();
        let runtime_id = Uuid::new_v4();
        let now = Utc::now();

        for _ in 0..20 {
            index.add_pending(&queued_task(tenant_id, runtime_id, 5), now);
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let index = index.clone();
            handles.push(std::thread::spawn(move || {
                let mut claimed = Vec::new();
                while let Ok(Some(lease)) =
                    index.claim_one(tenant_id, runtime_id, Duration::seconds(60))
                {
                    claimed.push(lease.task_id);
                }
                claimed
            }));
        }

        let mut all: Vec<Uuid> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("join claimer"))
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 20);
        assert_eq!(all.len(), 20, "a task was claimed twice");
    }

    #[test]
    fn stale_lease_id_cannot_ack_or_fail() {
        let index = LeaseIndex::new();
        let tenant_id = Uuid::new_v4();
        let runtime_id = Uuid::new_v4();

        let task = queued_task(tenant_id, runtime_id, 5);
        index.add_pending(&task, Utc::now());
        let lease = index
            .claim_one(tenant_id, runtime_id, Duration::seconds(60))
            .expect("claim")
            .expect("lease");

        assert!(index.ack(tenant_id, runtime_id, task.id, "stale").is_err());
        assert!(index
            .fail(tenant_id, runtime_id, task.id, "stale", Duration::zero())
            .is_err());

        // The real lease still works after the stale attempts.
        index
            .ack(tenant_id, runtime_id, task.id, &lease.lease_id)
            .expect("ack with live lease");
    }

    #[test]
    fn ack_from_another_runtime_is_rejected() {
        let index = LeaseIndex::new();
        let tenant_id = Uuid::new_v4();
        let runtime_id = Uuid::new_v4();

        let task = queued_task(tenant_id, runtime_id, 5);
        index.add_pending(&task, Utc::now());
        let lease = index
            .claim_one(tenant_id, runtime_id, Duration::seconds(60))
            .expect("claim")
            .expect("lease");

        // Same lease id presented by a different runtime's shard is a miss; the
        // task record lives in the owning shard only.
        let other_runtime = Uuid::new_v4();
        let err = index
            .ack(tenant_id, other_runtime, task.id, &lease.lease_id)
            .expect_err("foreign ack must fail");
        assert!(err.to_string().contains("lease"));
    }

    #[test]
    fn fail_exhausts_into_dead_letter() {
        let index = LeaseIndex::new();
        let tenant_id = Uuid::new_v4();
        let runtime_id = Uuid::new_v4();

        let task = queued_task(tenant_id, runtime_id, 2);
        index.add_pending(&task, Utc::now());

        let first = index
            .claim_one(tenant_id, runtime_id, Duration::seconds(60))
            .expect("claim")
            .expect("lease");
        let outcome = index
            .fail(
                tenant_id,
                runtime_id,
                task.id,
                &first.lease_id,
                Duration::zero(),
            )
            .expect("fail");
        assert_eq!(outcome, FailOutcome::Requeued);

        let second = index
            .claim_one(tenant_id, runtime_id, Duration::seconds(60))
            .expect("claim")
            .expect("lease");
        assert_eq!(second.delivery_attempt, 2);
        let outcome = index
            .fail(
                tenant_id,
                runtime_id,
                task.id,
                &second.lease_id,
                Duration::zero(),
            )
            .expect("fail");
        assert_eq!(outcome, FailOutcome::DeadLettered);

        let (pending, leased) = index.depth(tenant_id, runtime_id);
        assert_eq!((pending, leased), (0, 0));
    }

    #[test]
    fn expired_lease_requeues_until_attempts_exhaust() {
        let index = LeaseIndex::new();
        let tenant_id = Uuid::new_v4();
        let runtime_id = Uuid::new_v4();

        let task = queued_task(tenant_id, runtime_id, 1);
        index.add_pending(&task, Utc::now());

        // Zero visibility: the lease is expired as soon as it is granted.
        index
            .claim_one(tenant_id, runtime_id, Duration::zero())
            .expect("claim")
            .expect("lease");

        let actions = index.requeue_expired(tenant_id, runtime_id, 25);
        assert_eq!(actions, vec![ExpiryAction::DeadLettered { task_id: task.id }]);
    }
}
