//! Router construction for the `/api/v1` surface.

pub mod checkpoints;
pub mod scheduler;
pub mod subtasks;
pub mod tasks;
pub mod workers;

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;

use crate::state::AppState;
use crate::ws;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        // Workers
        .route("/api/v1/workers/register", post(workers::register))
        .route("/api/v1/workers", get(workers::list))
        .route("/api/v1/workers/api-keys/{key_id}", delete(workers::revoke_key))
        .route("/api/v1/workers/{id}", get(workers::detail))
        .route("/api/v1/workers/{id}/heartbeat", post(workers::heartbeat))
        .route("/api/v1/workers/{id}/unregister", post(workers::unregister))
        .route(
            "/api/v1/workers/{id}/api-keys",
            post(workers::issue_key).get(workers::list_keys),
        )
        .route("/api/v1/workers/{id}/ws", get(ws::worker_channel))
        // Tasks
        .route("/api/v1/tasks", post(tasks::create).get(tasks::list))
        .route("/api/v1/tasks/{id}", get(tasks::detail))
        .route("/api/v1/tasks/{id}/cancel", post(tasks::cancel))
        .route("/api/v1/tasks/{id}/decompose", post(tasks::decompose))
        .route("/api/v1/tasks/{id}/schedule", post(tasks::schedule))
        .route("/api/v1/tasks/{id}/allocate", post(tasks::allocate_ready))
        .route("/api/v1/tasks/{id}/checkpoint", post(tasks::manual_checkpoint))
        .route("/api/v1/tasks/{id}/checkpoints", get(tasks::checkpoints))
        // Subtasks
        .route(
            "/api/v1/subtasks/reallocate-queued",
            post(subtasks::reallocate_queued),
        )
        .route("/api/v1/subtasks/{id}", get(subtasks::detail))
        .route("/api/v1/subtasks/{id}/start", post(subtasks::start))
        .route("/api/v1/subtasks/{id}/result", post(subtasks::upload_result))
        .route("/api/v1/subtasks/{id}/allocate", post(subtasks::allocate))
        .route("/api/v1/subtasks/{id}/complete", post(subtasks::complete))
        .route(
            "/api/v1/subtasks/{id}/review-chain",
            get(subtasks::review_chain),
        )
        .route(
            "/api/v1/subtasks/{id}/evaluations",
            post(subtasks::record_evaluation).get(subtasks::list_evaluations),
        )
        // Scheduler
        .route("/api/v1/scheduler/run", post(scheduler::run))
        .route("/api/v1/scheduler/stats", get(scheduler::stats))
        // Checkpoints
        .route("/api/v1/checkpoints/{id}", get(checkpoints::detail))
        .route("/api/v1/checkpoints/{id}/decision", post(checkpoints::decision))
        .route("/api/v1/checkpoints/{id}/rollback", post(checkpoints::rollback))
        .route(
            "/api/v1/checkpoints/{id}/rollback-preview",
            get(checkpoints::rollback_preview),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    use drover_core::config::ControlConfig;
    use drover_core::coordination::Coordination;
    use drover_core::registry::apikey::KeyConfig;
    use drover_test_utils::{create_test_db, drop_test_db};

    use crate::state::{AppState, WORKER_KEY_HEADER};

    async fn test_state() -> (AppState, String) {
        let (pool, db_name) = create_test_db().await;
        let state = AppState::new(
            pool,
            Coordination::in_memory(),
            ControlConfig::default(),
            KeyConfig::new(b"router-test-secret".to_vec()),
        );
        (state, db_name)
    }

    async fn send(
        state: AppState,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
        worker_key: Option<&str>,
    ) -> axum::response::Response {
        let app = super::build_router(state);

        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        if let Some(key) = worker_key {
            builder = builder.header(WORKER_KEY_HEADER, key);
        }

        let request = builder
            .body(match body {
                Some(json) => Body::from(json.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        app.oneshot(request).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (state, db_name) = test_state().await;
        let pool = state.pool.clone();

        let resp = send(state, Method::GET, "/api/v1/health", None, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_task_create_decompose_detail() {
        let (state, db_name) = test_state().await;
        let pool = state.pool.clone();

        let resp = send(
            state.clone(),
            Method::POST,
            "/api/v1/tasks",
            Some(serde_json::json!({
                "description": "ship the exporter",
                "task_type": "develop_feature",
            })),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let task = body_json(resp).await;
        let task_id = task["id"].as_str().unwrap().to_owned();
        assert_eq!(task["status"], "pending");

        let resp = send(
            state.clone(),
            Method::POST,
            &format!("/api/v1/tasks/{task_id}/decompose"),
            None,
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let subtasks = body_json(resp).await;
        assert_eq!(subtasks.as_array().unwrap().len(), 4);

        let resp = send(
            state,
            Method::GET,
            &format!("/api/v1/tasks/{task_id}"),
            None,
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let detail = body_json(resp).await;
        assert_eq!(detail["task"]["status"], "initializing");
        assert_eq!(detail["subtasks"].as_array().unwrap().len(), 4);
        assert_eq!(detail["counts"]["total"], 4);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_task_not_found_carries_detail() {
        let (state, db_name) = test_state().await;
        let pool = state.pool.clone();

        let missing = uuid::Uuid::new_v4();
        let resp = send(
            state,
            Method::GET,
            &format!("/api/v1/tasks/{missing}"),
            None,
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert!(json["detail"].as_str().unwrap().contains("not found"));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_empty_description_rejected() {
        let (state, db_name) = test_state().await;
        let pool = state.pool.clone();

        let resp = send(
            state,
            Method::POST,
            "/api/v1/tasks",
            Some(serde_json::json!({"description": "   "})),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_worker_auth_round_trip() {
        let (state, db_name) = test_state().await;
        let pool = state.pool.clone();

        // Register (open endpoint).
        let resp = send(
            state.clone(),
            Method::POST,
            "/api/v1/workers/register",
            Some(serde_json::json!({
                "machine_id": "router-test-1",
                "machine_name": "router test",
                "tools": ["claude_code"],
            })),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let registered = body_json(resp).await;
        let worker_id = registered["worker_id"].as_str().unwrap().to_owned();

        // Heartbeat without a key: 401.
        let heartbeat = serde_json::json!({
            "status": "online",
            "resources": {"cpu_percent": 10.0, "memory_percent": 20.0, "disk_percent": 5.0},
        });
        let resp = send(
            state.clone(),
            Method::POST,
            &format!("/api/v1/workers/{worker_id}/heartbeat"),
            Some(heartbeat.clone()),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // Issue a key; the plaintext comes back exactly once.
        let resp = send(
            state.clone(),
            Method::POST,
            &format!("/api/v1/workers/{worker_id}/api-keys"),
            Some(serde_json::json!({})),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let issued = body_json(resp).await;
        let api_key = issued["api_key"].as_str().unwrap().to_owned();
        assert!(api_key.starts_with("drover_wk_"));

        // Listing keys never exposes the secret material.
        let resp = send(
            state.clone(),
            Method::GET,
            &format!("/api/v1/workers/{worker_id}/api-keys"),
            None,
            None,
        )
        .await;
        let listed = body_json(resp).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert!(listed[0].get("key_hash").is_none());

        // Heartbeat with the key: accepted.
        let resp = send(
            state.clone(),
            Method::POST,
            &format!("/api/v1/workers/{worker_id}/heartbeat"),
            Some(heartbeat.clone()),
            Some(&api_key),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        // A key for a different worker: 403.
        let resp = send(
            state.clone(),
            Method::POST,
            "/api/v1/workers/register",
            Some(serde_json::json!({
                "machine_id": "router-test-2",
                "machine_name": "second",
                "tools": [],
            })),
            None,
        )
        .await;
        let other_id = body_json(resp).await["worker_id"].as_str().unwrap().to_owned();
        let resp = send(
            state.clone(),
            Method::POST,
            &format!("/api/v1/workers/{other_id}/heartbeat"),
            Some(heartbeat),
            Some(&api_key),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        // Revoke, then the key stops working.
        let key_id = issued["key_id"].as_str().unwrap().to_owned();
        let resp = send(
            state.clone(),
            Method::DELETE,
            &format!("/api/v1/workers/api-keys/{key_id}"),
            None,
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(
            state,
            Method::POST,
            &format!("/api/v1/workers/{worker_id}/unregister"),
            None,
            Some(&api_key),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_result_upload_requires_key_and_live_state() {
        let (state, db_name) = test_state().await;
        let pool = state.pool.clone();

        // A worker with a key.
        let resp = send(
            state.clone(),
            Method::POST,
            "/api/v1/workers/register",
            Some(serde_json::json!({
                "machine_id": "uploader-1",
                "machine_name": "uploader",
                "tools": ["claude_code"],
            })),
            None,
        )
        .await;
        let worker_id = body_json(resp).await["worker_id"].as_str().unwrap().to_owned();
        let resp = send(
            state.clone(),
            Method::POST,
            &format!("/api/v1/workers/{worker_id}/api-keys"),
            Some(serde_json::json!({})),
            None,
        )
        .await;
        let api_key = body_json(resp).await["api_key"].as_str().unwrap().to_owned();

        // A decomposed task whose first subtask is still pending.
        let resp = send(
            state.clone(),
            Method::POST,
            "/api/v1/tasks",
            Some(serde_json::json!({"description": "upload test", "task_type": "bug_fix"})),
            None,
        )
        .await;
        let task_id = body_json(resp).await["id"].as_str().unwrap().to_owned();
        let resp = send(
            state.clone(),
            Method::POST,
            &format!("/api/v1/tasks/{task_id}/decompose"),
            None,
            None,
        )
        .await;
        let subtasks = body_json(resp).await;
        let subtask_id = subtasks[0]["id"].as_str().unwrap().to_owned();

        let upload = serde_json::json!({
            "status": "completed",
            "result": {"files": ["fix.rs"]},
            "execution_time": 3.5,
        });

        // No key: 401.
        let resp = send(
            state.clone(),
            Method::POST,
            &format!("/api/v1/subtasks/{subtask_id}/result"),
            Some(upload.clone()),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // With a key but the subtask is not executing: 400 bad state.
        let resp = send(
            state.clone(),
            Method::POST,
            &format!("/api/v1/subtasks/{subtask_id}/result"),
            Some(upload),
            Some(&api_key),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert!(json["detail"].as_str().unwrap().contains("not executing"));

        // Starting an unqueued subtask is also a bad-state error.
        let resp = send(
            state,
            Method::POST,
            &format!("/api/v1/subtasks/{subtask_id}/start"),
            None,
            Some(&api_key),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_scheduler_run_returns_cycle_result() {
        let (state, db_name) = test_state().await;
        let pool = state.pool.clone();

        let resp = send(state, Method::POST, "/api/v1/scheduler/run", None, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert!(json.get("tasks_processed").is_some());
        assert!(json.get("subtasks_allocated").is_some());
        assert!(json["errors"].as_array().unwrap().is_empty());

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_checkpoint_decision_unknown_id_is_404() {
        let (state, db_name) = test_state().await;
        let pool = state.pool.clone();

        let missing = uuid::Uuid::new_v4();
        let resp = send(
            state,
            Method::POST,
            &format!("/api/v1/checkpoints/{missing}/decision"),
            Some(serde_json::json!({"decision": "accept"})),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_reallocate_queued_endpoint() {
        let (state, db_name) = test_state().await;
        let pool = state.pool.clone();

        let resp = send(
            state,
            Method::POST,
            "/api/v1/subtasks/reallocate-queued",
            None,
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["reallocated"], 0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_scheduler_stats_reflect_config() {
        let (state, db_name) = test_state().await;
        let pool = state.pool.clone();

        let resp = send(state, Method::GET, "/api/v1/scheduler/stats", None, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["max_concurrent_subtasks"], 20);
        assert_eq!(json["max_subtasks_per_worker"], 1);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
