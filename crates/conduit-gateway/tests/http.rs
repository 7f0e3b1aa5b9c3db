use axum::body::Body;
use axum::http::{Request, StatusCode};
use conduit_core::lite::{
    MemReceiptStore, MemRegistrationTokenStore, MemRuntimeStore, MemStreams, MemTaskStore,
};
use conduit_core::token::{RuntimeTokenConfig, RuntimeTokenService};
use conduit_core::MessageEnvelope;
use conduit_gateway::{build_router, AppState, RuntimeRegistry, TaskGateway};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;
use uuid::Uuid;

const CONTROL_TOKEN: &str = "test-control-token";

fn test_state() -> AppState {
    let auth = Arc::new(
        RuntimeTokenService::new(RuntimeTokenConfig {
            secret: "test-secret".to_string(),
            algorithm: "HS256".to_string(),
            access_token_ttl_seconds: 3600,
        })
        .expect("build token service"),
    );
    let registry = Arc::new(RuntimeRegistry::new(
        Arc::new(MemRuntimeStore::new()),
        Arc::new(MemRegistrationTokenStore::new()),
        auth.clone(),
        30,
    ));
    let gateway = Arc::new(TaskGateway::new(
        Arc::new(MemTaskStore::new()),
        Arc::new(MemReceiptStore::new()),
        Arc::new(MemStreams::new()),
    ));
    AppState {
        registry,
        gateway,
        auth,
        control_plane_token: CONTROL_TOKEN.to_string(),
    }
}

async fn send(
    app: axum::Router,
    method: &str,
    path: &str,
    bearer: Option<&str>,
    body: Option<Value>,
) -> anyhow::Result<(StatusCode, Value)> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }

    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?,
        None => builder.body(Body::empty())?,
    };

    let response = app.oneshot(request).await?;
    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    let body: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, body))
}

/// Mint a registration token and register a runtime; returns `(ep_id, access_token)`.
async fn register_runtime(
    app: &axum::Router,
    tenant_id: Uuid,
    capabilities: Value,
) -> anyhow::Result<(Uuid, String)> {
    let (status, body) = send(
        app.clone(),
        "POST",
        &format!("/runtimes/{tenant_id}/tokens"),
        Some(CONTROL_TOKEN),
        None,
    )
    .await?;
    anyhow::ensure!(status == StatusCode::CREATED, "token mint failed: {body}");
    let registration_token = body["registration_token"]
        .as_str()
        .expect("registration_token")
        .to_string();

    let (status, body) = send(
        app.clone(),
        "POST",
        "/runtimes/register",
        None,
        Some(json!({
            "registration_token": registration_token,
            "display_name": "test-runtime",
            "tags": ["blue"],
            "capabilities": capabilities,
            "metadata": {"region": "eu-west"}
        })),
    )
    .await?;
    anyhow::ensure!(status == StatusCode::OK, "register failed: {body}");

    let ep_id: Uuid = body["ep_id"].as_str().expect("ep_id").parse()?;
    let access_token = body["access_token"].as_str().expect("access_token").to_string();
    assert_eq!(body["token_type"].as_str(), Some("bearer"));
    Ok((ep_id, access_token))
}

#[tokio::test]
async fn edge_routes_require_a_valid_bearer() -> anyhow::Result<()> {
    let app = build_router(test_state());

    let pull_body = json!({"max_tasks": 1, "long_poll_seconds": 1, "visibility_timeout_seconds": 60});
    let (status, _) = send(app.clone(), "POST", "/edge/tasks/pull", None, Some(pull_body.clone())).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        app.clone(),
        "POST",
        "/edge/tasks/pull",
        Some("not-a-jwt"),
        Some(pull_body),
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn control_plane_routes_require_the_control_token() -> anyhow::Result<()> {
    let app = build_router(test_state());
    let tenant_id = Uuid::new_v4();

    let (status, _) = send(
        app.clone(),
        "POST",
        &format!("/runtimes/{tenant_id}/tokens"),
        Some("wrong-token"),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        app,
        "GET",
        &format!("/runtimes/{tenant_id}/instances"),
        None,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn register_heartbeat_capabilities_flow() -> anyhow::Result<()> {
    let state = test_state();
    let app = build_router(state);
    let tenant_id = Uuid::new_v4();

    let (status, body) = send(
        app.clone(),
        "POST",
        &format!("/runtimes/{tenant_id}/tokens"),
        Some(CONTROL_TOKEN),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    let registration_token = body["registration_token"].as_str().expect("token").to_string();

    let register_body = json!({
        "registration_token": registration_token,
        "tags": ["blue"],
        "capabilities": {"message_types": ["test"]},
        "metadata": {}
    });
    let (status, body) = send(app.clone(), "POST", "/runtimes/register", None, Some(register_body.clone())).await?;
    assert_eq!(status, StatusCode::OK, "register failed: {body}");
    let access_token = body["access_token"].as_str().expect("access_token").to_string();

    // The registration token is single-use.
    let (status, body) = send(app.clone(), "POST", "/runtimes/register", None, Some(register_body)).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    anyhow::ensure!(
        body["error"].as_str().unwrap_or_default().contains("already been used"),
        "unexpected error: {body}"
    );

    let (status, body) = send(
        app.clone(),
        "POST",
        "/runtimes/heartbeat",
        Some(&access_token),
        Some(json!({"metadata": {"worker_version": "v2"}})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK, "heartbeat failed: {body}");
    assert_eq!(body["accepted"].as_bool(), Some(true));
    let rotated = body["access_token"].as_str().expect("rotated token").to_string();

    let (status, body) = send(
        app.clone(),
        "POST",
        "/runtimes/capabilities",
        Some(&rotated),
        Some(json!({"tags": ["blue", "green"], "capabilities": {"message_types": ["test", "agent_job_request"]}})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK, "capabilities failed: {body}");
    assert_eq!(body["accepted"].as_bool(), Some(true));

    let (status, body) = send(
        app,
        "GET",
        &format!("/runtimes/{tenant_id}/instances"),
        Some(CONTROL_TOKEN),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let instances = body.as_array().expect("instance list");
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0]["tags"], json!(["blue", "green"]));
    assert_eq!(instances[0]["metadata"]["worker_version"], json!("v2"));
    Ok(())
}

#[tokio::test]
async fn pull_and_ack_over_http() -> anyhow::Result<()> {
    let state = test_state();
    let app = build_router(state.clone());
    let tenant_id = Uuid::new_v4();

    let (ep_id, access_token) =
        register_runtime(&app, tenant_id, json!({"message_types": ["test"]})).await?;

    state
        .gateway
        .enqueue_for_runtime(
            tenant_id,
            ep_id,
            MessageEnvelope::new("test", json!({"message": "hello"})),
        )
        .await?;

    let (status, body) = send(
        app.clone(),
        "POST",
        "/edge/tasks/pull",
        Some(&access_token),
        Some(json!({"max_tasks": 1, "long_poll_seconds": 1, "visibility_timeout_seconds": 60})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK, "pull failed: {body}");
    let tasks = body["tasks"].as_array().expect("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["delivery_attempt"], json!(1));
    assert_eq!(tasks[0]["envelope"]["payload"]["message"], json!("hello"));

    let (status, body) = send(
        app,
        "POST",
        "/edge/tasks/ack",
        Some(&access_token),
        Some(json!({
            "task_id": tasks[0]["task_id"],
            "lease_id": tasks[0]["lease_id"],
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK, "ack failed: {body}");
    assert_eq!(body["status"].as_str(), Some("acked"));
    Ok(())
}

#[tokio::test]
async fn out_of_range_parameters_are_rejected() -> anyhow::Result<()> {
    let state = test_state();
    let app = build_router(state);
    let tenant_id = Uuid::new_v4();
    let (_ep_id, access_token) = register_runtime(&app, tenant_id, json!({})).await?;

    for body in [
        json!({"max_tasks": 0, "long_poll_seconds": 1, "visibility_timeout_seconds": 60}),
        json!({"max_tasks": 11, "long_poll_seconds": 1, "visibility_timeout_seconds": 60}),
        json!({"max_tasks": 1, "long_poll_seconds": 61, "visibility_timeout_seconds": 60}),
        json!({"max_tasks": 1, "long_poll_seconds": 1, "visibility_timeout_seconds": 5}),
    ] {
        let (status, response) = send(
            app.clone(),
            "POST",
            "/edge/tasks/pull",
            Some(&access_token),
            Some(body.clone()),
        )
        .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST, "accepted: {body}");
        anyhow::ensure!(response["error"].is_string(), "missing error body");
    }

    let (status, response) = send(
        app,
        "POST",
        "/edge/tasks/fail",
        Some(&access_token),
        Some(json!({
            "task_id": Uuid::new_v4(),
            "lease_id": "lease",
            "error": "boom",
            "retry_delay_seconds": 601
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    anyhow::ensure!(
        response["error"]
            .as_str()
            .unwrap_or_default()
            .contains("retry_delay_seconds"),
        "unexpected error: {response}"
    );
    Ok(())
}
