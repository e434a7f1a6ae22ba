//! Authenticated admin endpoints.

use crate::error::AppError;
use crate::services::runner::{self, RunStatus, TaskKind};
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_engine::generation::GenerationInfo;
use backup_engine::Engine;
use serde_json::{json, Value};
use std::sync::Arc;
use subtle::ConstantTimeEq;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/backup", post(start_backup))
        .route("/archive", post(start_archive))
        .route("/sweep", post(start_sweep))
        .route("/db-backup", post(start_db_backup))
        .route("/status", get(status))
        .route("/generations", get(generations))
        .route_layer(middleware::from_fn_with_state(state, require_token))
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let expected = state
        .config
        .admin_token
        .as_deref()
        .ok_or_else(|| AppError::Unauthorized("admin token is not configured".into()))?;

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if !token_matches(provided, expected) {
        return Err(AppError::Unauthorized("invalid or missing bearer token".into()));
    }
    Ok(next.run(request).await)
}

fn token_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn accepted(state: Arc<AppState>, task: TaskKind) -> Result<(StatusCode, Json<Value>), AppError> {
    let run_id = runner::start(state, task)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "runId": run_id, "task": task }))))
}

async fn start_backup(State(state): State<Arc<AppState>>) -> Result<(StatusCode, Json<Value>), AppError> {
    accepted(state, TaskKind::Backup)
}

async fn start_archive(State(state): State<Arc<AppState>>) -> Result<(StatusCode, Json<Value>), AppError> {
    accepted(state, TaskKind::Archive)
}

async fn start_sweep(State(state): State<Arc<AppState>>) -> Result<(StatusCode, Json<Value>), AppError> {
    accepted(state, TaskKind::Sweep)
}

async fn start_db_backup(State(state): State<Arc<AppState>>) -> Result<(StatusCode, Json<Value>), AppError> {
    accepted(state, TaskKind::DbBackup)
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Vec<RunStatus>> {
    Json(state.runs.snapshot())
}

async fn generations(State(state): State<Arc<AppState>>) -> Result<Json<Vec<GenerationInfo>>, AppError> {
    let engine_config = state.engine_config.clone();
    let generations = tokio::task::spawn_blocking(move || {
        let engine = Engine::from_config(engine_config)?;
        engine.list_generations()
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(generations))
}

#[cfg(test)]
mod tests {
    use crate::config::AppConfig;
    use crate::routes::create_router;
    use crate::services::runner::{RunState, TaskKind};
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";

    fn test_state(dir: &TempDir) -> Arc<AppState> {
        let storage_root = dir.path().join("storage");
        std::fs::create_dir_all(storage_root.join("sessions")).unwrap();
        std::fs::write(storage_root.join("sessions/file"), b"payload").unwrap();

        let engine_config: backup_engine::Config = serde_json::from_value(serde_json::json!({
            "storage_root": storage_root,
            "work_dir": dir.path().join("work"),
            "archive_root": dir.path().join("archive"),
            "store": { "kind": "local", "path": dir.path().join("bucket") },
        }))
        .unwrap();

        let config = AppConfig {
            port: 0,
            engine_config: dir.path().join("engine.toml"),
            admin_token: Some(TOKEN.into()),
            backup_cron: None,
            archive_cron: None,
            sweep_cron: None,
            db_backup_cron: None,
        };
        Arc::new(AppState::new(config, engine_config))
    }

    fn request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));
        let (status, body) = send(&app, request("GET", "/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_admin_rejects_missing_or_wrong_token() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));
        let (status, _) = send(&app, request("GET", "/admin/status", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&app, request("POST", "/admin/backup", Some("wrong"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&app, request("GET", "/admin/status", Some(&TOKEN[..4]))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_token_comparison() {
        assert!(super::token_matches(TOKEN, TOKEN));
        assert!(!super::token_matches("", TOKEN));
        assert!(!super::token_matches("test-tokenX", TOKEN));
        assert!(!super::token_matches("TEST-TOKEN", TOKEN));
    }

    #[tokio::test]
    async fn test_backup_trigger_runs_to_completion() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let app = create_router(state.clone());

        let (status, body) = send(&app, request("POST", "/admin/backup", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["task"], "backup");
        assert!(body["runId"].is_string());

        let mut finished = None;
        for _ in 0..100 {
            let run = state.runs.get(TaskKind::Backup).unwrap();
            if run.state != RunState::Running {
                finished = Some(run);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let run = finished.expect("backup did not finish");
        assert_eq!(run.state, RunState::Succeeded, "error: {:?}", run.error);
        assert_eq!(run.result.as_ref().unwrap()["uploaded_files"], 1);

        let (status, body) = send(&app, request("GET", "/admin/status", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["task"], "backup");
        assert_eq!(body[0]["state"], "succeeded");

        let (status, body) = send(&app, request("GET", "/admin/generations", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["state"], "raw");
    }

    #[tokio::test]
    async fn test_running_task_conflicts() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        state.runs.try_begin(TaskKind::Sweep).unwrap();
        let app = create_router(state);

        let (status, body) = send(&app, request("POST", "/admin/sweep", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "sweep is already running");
    }

    #[tokio::test]
    async fn test_disabled_db_backup_is_a_bad_request() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));
        let (status, _) = send(&app, request("POST", "/admin/db-backup", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
