use conduit_core::contracts::{
    EdgeTaskAckRequest, EdgeTaskFailRequest, EdgeTaskPullRequest, EdgeTaskResultRequest,
};
use conduit_core::lite::{MemReceiptStore, MemStreams, MemTaskStore};
use conduit_core::streams::WORKER_STREAM;
use conduit_core::{EdgeTaskStatus, MessageEnvelope};
use conduit_gateway::TaskGateway;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Harness {
    gateway: Arc<TaskGateway>,
    store: Arc<MemTaskStore>,
    receipts: Arc<MemReceiptStore>,
    streams: Arc<MemStreams>,
}

fn harness() -> Harness {
    let store = Arc::new(MemTaskStore::new());
    let receipts = Arc::new(MemReceiptStore::new());
    let streams = Arc::new(MemStreams::new());
    let gateway = Arc::new(TaskGateway::new(
        store.clone(),
        receipts.clone(),
        streams.clone(),
    ));
    Harness {
        gateway,
        store,
        receipts,
        streams,
    }
}

fn test_envelope(message: &str) -> MessageEnvelope {
    MessageEnvelope::new("test", json!({ "message": message }))
}

fn pull(max_tasks: i32, long_poll_seconds: i64, visibility_timeout_seconds: i64) -> EdgeTaskPullRequest {
    EdgeTaskPullRequest {
        max_tasks,
        long_poll_seconds,
        visibility_timeout_seconds,
    }
}

#[tokio::test]
async fn enqueue_pull_ack_round_trip() -> anyhow::Result<()> {
    let h = harness();
    let tenant_id = Uuid::new_v4();
    let runtime_id = Uuid::new_v4();

    let task_id = h
        .gateway
        .enqueue_for_runtime(tenant_id, runtime_id, test_envelope("hello"))
        .await?;

    let leases = h
        .gateway
        .pull_tasks(tenant_id, runtime_id, &pull(1, 1, 60))
        .await?;
    anyhow::ensure!(leases.len() == 1, "expected one lease");
    let lease = &leases[0];
    assert_eq!(lease.task_id, task_id);
    assert_eq!(lease.delivery_attempt, 1);
    assert_eq!(lease.envelope.payload, json!({ "message": "hello" }));

    // Leased rows carry the full lease triple.
    let row = h.store.snapshot(task_id).expect("task row");
    assert_eq!(row.status, EdgeTaskStatus::Leased);
    assert_eq!(row.lease_id.as_deref(), Some(lease.lease_id.as_str()));
    assert_eq!(row.leased_to_runtime_id, Some(runtime_id));
    assert!(row.lease_expires_at.is_some());
    assert_eq!(row.attempt_count, 1);

    let ack = h
        .gateway
        .ack_task(
            tenant_id,
            runtime_id,
            &EdgeTaskAckRequest {
                task_id,
                lease_id: lease.lease_id.clone(),
            },
        )
        .await?;
    assert!(ack.accepted);
    assert_eq!(ack.status, "acked");

    // Non-leased rows carry no lease triple at all.
    let row = h.store.snapshot(task_id).expect("task row");
    assert_eq!(row.status, EdgeTaskStatus::Acked);
    assert!(row.lease_id.is_none());
    assert!(row.lease_expires_at.is_none());
    assert!(row.leased_to_runtime_id.is_none());
    assert!(row.acked_at.is_some());
    assert_eq!(row.attempt_count, 1);
    Ok(())
}

#[tokio::test]
async fn pull_serves_tasks_in_enqueue_order() -> anyhow::Result<()> {
    let h = harness();
    let tenant_id = Uuid::new_v4();
    let runtime_id = Uuid::new_v4();

    let mut enqueued = Vec::new();
    for i in 0..3 {
        enqueued.push(
            h.gateway
                .enqueue_for_runtime(tenant_id, runtime_id, test_envelope(&format!("m{i}")))
                .await?,
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let leases = h
        .gateway
        .pull_tasks(tenant_id, runtime_id, &pull(10, 1, 60))
        .await?;
    let pulled: Vec<Uuid> = leases.iter().map(|l| l.task_id).collect();
    assert_eq!(pulled, enqueued);
    Ok(())
}

#[tokio::test]
async fn stale_ack_leaves_task_unchanged() -> anyhow::Result<()> {
    let h = harness();
    let tenant_id = Uuid::new_v4();
    let runtime_id = Uuid::new_v4();

    let task_id = h
        .gateway
        .enqueue_for_runtime(tenant_id, runtime_id, test_envelope("hello"))
        .await?;
    let leases = h
        .gateway
        .pull_tasks(tenant_id, runtime_id, &pull(1, 1, 60))
        .await?;
    let lease = &leases[0];

    let stale = h
        .gateway
        .ack_task(
            tenant_id,
            runtime_id,
            &EdgeTaskAckRequest {
                task_id,
                lease_id: "not-the-lease".to_string(),
            },
        )
        .await;
    anyhow::ensure!(stale.is_err(), "stale ack must fail");

    let row = h.store.snapshot(task_id).expect("task row");
    assert_eq!(row.status, EdgeTaskStatus::Leased);
    assert_eq!(row.lease_id.as_deref(), Some(lease.lease_id.as_str()));

    // The live lease is unaffected by the stale attempt.
    h.gateway
        .ack_task(
            tenant_id,
            runtime_id,
            &EdgeTaskAckRequest {
                task_id,
                lease_id: lease.lease_id.clone(),
            },
        )
        .await?;
    Ok(())
}

#[tokio::test]
async fn expired_lease_is_redelivered_with_higher_attempt() -> anyhow::Result<()> {
    let h = harness();
    let tenant_id = Uuid::new_v4();
    let runtime_id = Uuid::new_v4();

    let task_id = h
        .gateway
        .enqueue_for_runtime(tenant_id, runtime_id, test_envelope("hello"))
        .await?;

    let first = h
        .gateway
        .pull_tasks(tenant_id, runtime_id, &pull(1, 1, 1))
        .await?;
    assert_eq!(first[0].delivery_attempt, 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let second = h
        .gateway
        .pull_tasks(tenant_id, runtime_id, &pull(1, 2, 60))
        .await?;
    anyhow::ensure!(second.len() == 1, "expected redelivery after expiry");
    assert_eq!(second[0].task_id, task_id);
    assert_eq!(second[0].delivery_attempt, 2);

    h.gateway
        .ack_task(
            tenant_id,
            runtime_id,
            &EdgeTaskAckRequest {
                task_id,
                lease_id: second[0].lease_id.clone(),
            },
        )
        .await?;
    let row = h.store.snapshot(task_id).expect("task row");
    assert_eq!(row.status, EdgeTaskStatus::Acked);
    assert_eq!(row.attempt_count, 2);
    Ok(())
}

#[tokio::test]
async fn repeated_failures_dead_letter_the_task() -> anyhow::Result<()> {
    let h = harness();
    let tenant_id = Uuid::new_v4();
    let runtime_id = Uuid::new_v4();

    let mut envelope = test_envelope("doomed");
    envelope.headers.max_attempts = Some(2);
    let task_id = h
        .gateway
        .enqueue_for_runtime(tenant_id, runtime_id, envelope)
        .await?;

    let first = h
        .gateway
        .pull_tasks(tenant_id, runtime_id, &pull(1, 1, 60))
        .await?;
    let failed = h
        .gateway
        .fail_task(
            tenant_id,
            runtime_id,
            &EdgeTaskFailRequest {
                task_id,
                lease_id: first[0].lease_id.clone(),
                error: "first failure".to_string(),
                retry_delay_seconds: 0,
            },
        )
        .await?;
    assert_eq!(failed.status, "queued");

    let second = h
        .gateway
        .pull_tasks(tenant_id, runtime_id, &pull(1, 1, 60))
        .await?;
    assert_eq!(second[0].delivery_attempt, 2);
    let failed = h
        .gateway
        .fail_task(
            tenant_id,
            runtime_id,
            &EdgeTaskFailRequest {
                task_id,
                lease_id: second[0].lease_id.clone(),
                error: "second failure".to_string(),
                retry_delay_seconds: 0,
            },
        )
        .await?;
    assert_eq!(failed.status, "dead_letter");

    let row = h.store.snapshot(task_id).expect("task row");
    assert_eq!(row.status, EdgeTaskStatus::DeadLetter);
    assert!(row.failed_at.is_some());
    assert_eq!(
        row.last_error,
        Some(json!({ "message": "second failure" }))
    );

    // Dead-lettered tasks are excluded from further delivery.
    let after = h
        .gateway
        .pull_tasks(tenant_id, runtime_id, &pull(1, 1, 60))
        .await?;
    anyhow::ensure!(after.is_empty(), "dead-lettered task must not be served");
    Ok(())
}

#[tokio::test]
async fn retry_delay_defers_visibility() -> anyhow::Result<()> {
    let h = harness();
    let tenant_id = Uuid::new_v4();
    let runtime_id = Uuid::new_v4();

    let task_id = h
        .gateway
        .enqueue_for_runtime(tenant_id, runtime_id, test_envelope("later"))
        .await?;
    let leases = h
        .gateway
        .pull_tasks(tenant_id, runtime_id, &pull(1, 1, 60))
        .await?;
    h.gateway
        .fail_task(
            tenant_id,
            runtime_id,
            &EdgeTaskFailRequest {
                task_id,
                lease_id: leases[0].lease_id.clone(),
                error: "try later".to_string(),
                retry_delay_seconds: 30,
            },
        )
        .await?;

    let immediate = h
        .gateway
        .pull_tasks(tenant_id, runtime_id, &pull(1, 1, 60))
        .await?;
    anyhow::ensure!(
        immediate.is_empty(),
        "delayed retry must not be immediately visible"
    );
    Ok(())
}

#[tokio::test]
async fn result_ingestion_is_idempotent_per_request_id() -> anyhow::Result<()> {
    let h = harness();
    let tenant_id = Uuid::new_v4();
    let runtime_id = Uuid::new_v4();

    let request = EdgeTaskResultRequest {
        request_id: "r-1".to_string(),
        task_id: None,
        lease_id: None,
        envelopes: vec![test_envelope("result")],
    };

    let first = h.gateway.ingest_result(tenant_id, runtime_id, &request).await?;
    assert!(first.accepted);
    assert!(!first.duplicate);
    assert_eq!(h.streams.entries(WORKER_STREAM).len(), 1);

    let second = h.gateway.ingest_result(tenant_id, runtime_id, &request).await?;
    assert!(second.accepted);
    assert!(second.duplicate);
    assert_eq!(h.streams.entries(WORKER_STREAM).len(), 1);
    assert_eq!(h.receipts.len(), 1);

    // Same request id from a different runtime is a distinct receipt.
    let other_runtime = Uuid::new_v4();
    let third = h
        .gateway
        .ingest_result(tenant_id, other_runtime, &request)
        .await?;
    assert!(!third.duplicate);
    assert_eq!(h.streams.entries(WORKER_STREAM).len(), 2);
    Ok(())
}

#[tokio::test]
async fn unmapped_result_types_are_skipped_but_accepted() -> anyhow::Result<()> {
    let h = harness();
    let tenant_id = Uuid::new_v4();
    let runtime_id = Uuid::new_v4();

    let request = EdgeTaskResultRequest {
        request_id: "r-unmapped".to_string(),
        task_id: None,
        lease_id: None,
        envelopes: vec![MessageEnvelope::new(
            "semantic_query_result",
            json!({ "rows": [] }),
        )],
    };

    let response = h.gateway.ingest_result(tenant_id, runtime_id, &request).await?;
    assert!(response.accepted);
    assert!(!response.duplicate);
    assert_eq!(h.streams.total_entries(), 0);
    assert_eq!(h.receipts.len(), 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_pullers_claim_each_task_exactly_once() -> anyhow::Result<()> {
    let h = harness();
    let tenant_id = Uuid::new_v4();
    let runtime_id = Uuid::new_v4();

    h.gateway
        .enqueue_for_runtime(tenant_id, runtime_id, test_envelope("contested"))
        .await?;

    let a = {
        let gateway = h.gateway.clone();
        tokio::spawn(async move {
            gateway
                .pull_tasks(tenant_id, runtime_id, &pull(1, 1, 60))
                .await
        })
    };
    let b = {
        let gateway = h.gateway.clone();
        tokio::spawn(async move {
            gateway
                .pull_tasks(tenant_id, runtime_id, &pull(1, 1, 60))
                .await
        })
    };

    let leases_a = a.await??;
    let leases_b = b.await??;
    assert_eq!(
        leases_a.len() + leases_b.len(),
        1,
        "exactly one puller may win the claim"
    );
    Ok(())
}

#[tokio::test]
async fn rebuilt_index_restores_queued_and_expired_leases() -> anyhow::Result<()> {
    let h = harness();
    let tenant_id = Uuid::new_v4();
    let runtime_id = Uuid::new_v4();

    let leased_task = h
        .gateway
        .enqueue_for_runtime(tenant_id, runtime_id, test_envelope("in-flight"))
        .await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let queued_task = h
        .gateway
        .enqueue_for_runtime(tenant_id, runtime_id, test_envelope("waiting"))
        .await?;

    // Lease the first task with a short visibility window, then "restart".
    let leases = h
        .gateway
        .pull_tasks(tenant_id, runtime_id, &pull(1, 1, 1))
        .await?;
    assert_eq!(leases[0].task_id, leased_task);

    let restarted = TaskGateway::new(h.store.clone(), h.receipts.clone(), h.streams.clone());
    let restored = restarted.rebuild_index().await?;
    assert_eq!(restored, 2);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let leases = restarted
        .pull_tasks(tenant_id, runtime_id, &pull(10, 2, 60))
        .await?;
    let mut seen: Vec<(Uuid, i32)> = leases
        .iter()
        .map(|l| (l.task_id, l.delivery_attempt))
        .collect();
    seen.sort();
    let mut expected = vec![(leased_task, 2), (queued_task, 1)];
    expected.sort();
    assert_eq!(seen, expected);
    Ok(())
}
