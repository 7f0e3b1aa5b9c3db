use crate::{
    EdgeTask, EdgeTaskStatus, MessageEnvelope, OutboxWriter, ReceiptInsert, ReceiptStore,
    RegistrationToken, RegistrationTokenStore, Result, ResultReceipt, RuntimeInstance,
    RuntimeStore, TaskStore, TenantSettings,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct MemTaskStore {
    tasks: Mutex<HashMap<Uuid, EdgeTask>>,
}

impl MemTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: the current durable snapshot of one task.
    pub fn snapshot(&self, task_id: Uuid) -> Option<EdgeTask> {
        lock(&self.tasks).get(&task_id).cloned()
    }
}

#[async_trait]
impl TaskStore for MemTaskStore {
    async fn insert(&self, task: &EdgeTask) -> Result<()> {
        lock(&self.tasks).insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<EdgeTask>> {
        Ok(lock(&self.tasks).get(&task_id).cloned())
    }

    async fn mark_leased(
        &self,
        task_id: Uuid,
        lease_id: &str,
        lease_expires_at: DateTime<Utc>,
        leased_to_runtime_id: Uuid,
        attempt_count: i32,
    ) -> Result<()> {
        if let Some(task) = lock(&self.tasks).get_mut(&task_id) {
            task.status = EdgeTaskStatus::Leased;
            task.lease_id = Some(lease_id.to_string());
            task.lease_expires_at = Some(lease_expires_at);
            task.leased_to_runtime_id = Some(leased_to_runtime_id);
            task.attempt_count = attempt_count;
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_acked(&self, task_id: Uuid, acked_at: DateTime<Utc>) -> Result<()> {
        if let Some(task) = lock(&self.tasks).get_mut(&task_id) {
            task.status = EdgeTaskStatus::Acked;
            task.lease_id = None;
            task.lease_expires_at = None;
            task.leased_to_runtime_id = None;
            task.acked_at = Some(acked_at);
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_requeued(&self, task_id: Uuid, last_error: Option<Value>) -> Result<()> {
        if let Some(task) = lock(&self.tasks).get_mut(&task_id) {
            task.status = EdgeTaskStatus::Queued;
            task.lease_id = None;
            task.lease_expires_at = None;
            task.leased_to_runtime_id = None;
            if last_error.is_some() {
                task.last_error = last_error;
            }
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_dead_letter(
        &self,
        task_id: Uuid,
        last_error: Option<Value>,
        failed_at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(task) = lock(&self.tasks).get_mut(&task_id) {
            task.status = EdgeTaskStatus::DeadLetter;
            task.lease_id = None;
            task.lease_expires_at = None;
            task.leased_to_runtime_id = None;
            if last_error.is_some() {
                task.last_error = last_error;
            }
            task.failed_at = Some(failed_at);
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_open(&self) -> Result<Vec<EdgeTask>> {
        let mut open: Vec<EdgeTask> = lock(&self.tasks)
            .values()
            .filter(|task| {
                matches!(task.status, EdgeTaskStatus::Queued | EdgeTaskStatus::Leased)
            })
            .cloned()
            .collect();
        open.sort_by_key(|task| task.enqueued_at);
        Ok(open)
    }
}

#[derive(Debug, Default)]
pub struct MemRuntimeStore {
    runtimes: Mutex<HashMap<Uuid, RuntimeInstance>>,
}

impl MemRuntimeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuntimeStore for MemRuntimeStore {
    async fn insert(&self, runtime: &RuntimeInstance) -> Result<()> {
        lock(&self.runtimes).insert(runtime.id, runtime.clone());
        Ok(())
    }

    async fn get(&self, runtime_id: Uuid) -> Result<Option<RuntimeInstance>> {
        Ok(lock(&self.runtimes).get(&runtime_id).cloned())
    }

    async fn update(&self, runtime: &RuntimeInstance) -> Result<()> {
        lock(&self.runtimes).insert(runtime.id, runtime.clone());
        Ok(())
    }

    async fn list_active_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<RuntimeInstance>> {
        let mut active: Vec<RuntimeInstance> = lock(&self.runtimes)
            .values()
            .filter(|runtime| {
                runtime.tenant_id == tenant_id
                    && runtime.status == crate::RuntimeStatus::Active
            })
            .cloned()
            .collect();
        // Freshest heartbeat first; never-seen runtimes sort last.
        active.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(active)
    }

    async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<RuntimeInstance>> {
        let mut all: Vec<RuntimeInstance> = lock(&self.runtimes)
            .values()
            .filter(|runtime| runtime.tenant_id == tenant_id)
            .cloned()
            .collect();
        all.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(all)
    }
}

#[derive(Debug, Default)]
pub struct MemRegistrationTokenStore {
    tokens: Mutex<HashMap<Uuid, RegistrationToken>>,
}

impl MemRegistrationTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistrationTokenStore for MemRegistrationTokenStore {
    async fn create(&self, token: &RegistrationToken) -> Result<()> {
        lock(&self.tokens).insert(token.id, token.clone());
        Ok(())
    }

    async fn get_by_hash(&self, token_hash: &str) -> Result<Option<RegistrationToken>> {
        Ok(lock(&self.tokens)
            .values()
            .find(|token| token.token_hash == token_hash)
            .cloned())
    }

    async fn consume(
        &self,
        token_id: Uuid,
        runtime_id: Uuid,
        used_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tokens = lock(&self.tokens);
        match tokens.get_mut(&token_id) {
            Some(token) if token.used_at.is_none() => {
                token.used_at = Some(used_at);
                token.runtime_id = Some(runtime_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemReceiptStore {
    receipts: Mutex<HashMap<(Uuid, Uuid, String), ResultReceipt>>,
}

impl MemReceiptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.receipts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReceiptStore for MemReceiptStore {
    async fn get(
        &self,
        tenant_id: Uuid,
        runtime_id: Uuid,
        request_id: &str,
    ) -> Result<Option<ResultReceipt>> {
        Ok(lock(&self.receipts)
            .get(&(tenant_id, runtime_id, request_id.to_string()))
            .cloned())
    }

    async fn insert(&self, receipt: &ResultReceipt) -> Result<ReceiptInsert> {
        let key = (
            receipt.tenant_id,
            receipt.runtime_id,
            receipt.request_id.clone(),
        );
        let mut receipts = lock(&self.receipts);
        if receipts.contains_key(&key) {
            return Ok(ReceiptInsert::Duplicate);
        }
        receipts.insert(key, receipt.clone());
        Ok(ReceiptInsert::Inserted)
    }
}

#[derive(Debug, Default)]
pub struct MemTenantSettings {
    settings: Mutex<HashMap<(Uuid, String), String>>,
}

impl MemTenantSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_setting(&self, tenant_id: Uuid, key: &str, value: &str) {
        lock(&self.settings).insert((tenant_id, key.to_string()), value.to_string());
    }
}

#[async_trait]
impl TenantSettings for MemTenantSettings {
    async fn get_setting(&self, tenant_id: Uuid, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.settings)
            .get(&(tenant_id, key.to_string()))
            .cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemOutbox {
    messages: Mutex<Vec<MessageEnvelope>>,
}

impl MemOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<MessageEnvelope> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl OutboxWriter for MemOutbox {
    async fn enqueue(&self, envelope: &MessageEnvelope) -> Result<Uuid> {
        lock(&self.messages).push(envelope.clone());
        Ok(envelope.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn runtime(tenant_id: Uuid, last_seen_at: Option<DateTime<Utc>>) -> RuntimeInstance {
        let now = Utc::now();
        RuntimeInstance {
            id: Uuid::new_v4(),
            tenant_id,
            display_name: None,
            tags: Vec::new(),
            capabilities: serde_json::Map::new(),
            metadata: serde_json::Map::new(),
            status: crate::RuntimeStatus::Active,
            last_seen_at,
            registered_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn active_listing_orders_freshest_first_nulls_last() -> anyhow::Result<()> {
        let store = MemRuntimeStore::new();
        let tenant_id = Uuid::new_v4();
        let now = Utc::now();

        let stale = runtime(tenant_id, Some(now - Duration::minutes(10)));
        let fresh = runtime(tenant_id, Some(now));
        let never_seen = runtime(tenant_id, None);
        store.insert(&stale).await?;
        store.insert(&fresh).await?;
        store.insert(&never_seen).await?;

        let listed = store.list_active_for_tenant(tenant_id).await?;
        let ids: Vec<Uuid> = listed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![fresh.id, stale.id, never_seen.id]);
        Ok(())
    }

    #[tokio::test]
    async fn registration_token_consume_is_single_use() -> anyhow::Result<()> {
        let store = MemRegistrationTokenStore::new();
        let token = RegistrationToken {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            token_hash: "hash".to_string(),
            expires_at: Utc::now() + Duration::minutes(30),
            used_at: None,
            runtime_id: None,
            created_by_user_id: None,
            created_at: Utc::now(),
        };
        store.create(&token).await?;

        let first = store.consume(token.id, Uuid::new_v4(), Utc::now()).await?;
        let second = store.consume(token.id, Uuid::new_v4(), Utc::now()).await?;
        assert!(first);
        assert!(!second);
        Ok(())
    }

    #[tokio::test]
    async fn receipt_insert_reports_duplicates() -> anyhow::Result<()> {
        let store = MemReceiptStore::new();
        let receipt = ResultReceipt {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            runtime_id: Uuid::new_v4(),
            request_id: "r-1".to_string(),
            task_id: None,
            payload_hash: None,
            created_at: Utc::now(),
        };

        assert_eq!(store.insert(&receipt).await?, ReceiptInsert::Inserted);
        assert_eq!(store.insert(&receipt).await?, ReceiptInsert::Duplicate);
        assert_eq!(store.len(), 1);
        Ok(())
    }
}
