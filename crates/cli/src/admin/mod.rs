//! Admin HTTP surface for the UI.
//!
//! Endpoints:
//! - GET  /health                       - Liveness and stage (exempt from auth)
//! - GET  /environments                 - Configured environments
//! - GET  /checks, /actions             - Registered checks and actions
//! - POST /checks/{name}/run            - Queue a check (body = kwargs)
//! - POST /actions/{name}/run           - Queue an action (body = kwargs with check_name)
//! - GET  /results/{name}/latest        - Latest stored result
//! - GET  /results/{name}/primary       - Primary stored result
//! - GET  /results/{name}/history       - Results between `from` and `to`
//! - GET  /results/{name}/closest       - Result nearest `at`
//! - GET  /queues                       - Stats for both queues
//!
//! Every endpoint but /health takes an optional `env` query parameter.

mod handlers;
mod middleware;
mod state;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use self::handlers::{
    handle_closest, handle_environments, handle_health, handle_history, handle_latest,
    handle_list_actions, handle_list_checks, handle_not_found, handle_primary, handle_queues,
    handle_run_action, handle_run_check,
};
use self::middleware::auth_middleware;

pub(crate) use self::handlers::describe_environment;
pub(crate) use self::state::AdminState;

/// Kwargs bodies are small; 1 MB is generous.
const MAX_BODY_SIZE: usize = 1024 * 1024;

fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({ "error": message })))
}

pub(crate) fn router(state: Arc<AdminState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/environments", get(handle_environments))
        .route("/checks", get(handle_list_checks))
        .route("/actions", get(handle_list_actions))
        .route("/checks/{name}/run", post(handle_run_check))
        .route("/actions/{name}/run", post(handle_run_action))
        .route("/results/{name}/latest", get(handle_latest))
        .route("/results/{name}/primary", get(handle_primary))
        .route("/results/{name}/history", get(handle_history))
        .route("/results/{name}/closest", get(handle_closest))
        .route("/queues", get(handle_queues))
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Serve the admin router on `bind` until `shutdown` flips.
pub(crate) async fn serve(
    bind: &str,
    state: Arc<AdminState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    if state.api_key.is_some() {
        tracing::info!("admin API key authentication enabled");
    }
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "admin surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    tracing::info!("admin surface stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use foursight_engine::testing::Fixture;
    use foursight_interchange::{CheckResult, CheckStatus, QueueItem, RunId};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn fixture() -> Fixture {
        let registry = foursight_checks::registry().unwrap();
        Fixture::new(registry, "prod")
    }

    fn app(fx: &Fixture, api_key: Option<&str>) -> Router {
        router(Arc::new(AdminState::new(
            fx.ctx.clone(),
            api_key.map(str::to_string),
        )))
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_req(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_open_even_with_a_key() {
        let fx = fixture();
        let (status, body) = call(app(&fx, Some("sekrit")), get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stage"], "prod");
    }

    #[tokio::test]
    async fn key_is_enforced_elsewhere() {
        let fx = fixture();
        let (status, _) = call(app(&fx, Some("sekrit")), get_req("/checks")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let wrong = Request::get("/checks")
            .header("x-api-key", "nope")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(app(&fx, Some("sekrit")), wrong).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let right = Request::get("/checks")
            .header("authorization", "Bearer sekrit")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(app(&fx, Some("sekrit")), right).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn lists_checks_and_actions() {
        let fx = fixture();
        let (status, body) = call(app(&fx, None), get_req("/checks")).await;
        assert_eq!(status, StatusCode::OK);
        let start = body["checks"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["name"] == "runs_to_start")
            .unwrap();
        assert_eq!(start["action"], "start_runs");
        assert_eq!(start["title"], "Runs To Start");

        let (_, body) = call(app(&fx, None), get_req("/actions")).await;
        assert!(body["actions"]
            .as_array()
            .unwrap()
            .iter()
            .any(|a| a["name"] == "start_runs"));
    }

    #[tokio::test]
    async fn lists_environments() {
        let fx = fixture();
        let (status, body) = call(app(&fx, None), get_req("/environments")).await;
        assert_eq!(status, StatusCode::OK);
        let envs = body["environments"].as_array().unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0]["default"], true);
    }

    #[tokio::test]
    async fn run_check_enqueues_on_primary() {
        let fx = fixture();
        let (status, body) = call(
            app(&fx, None),
            post_req("/checks/runs_to_start/run", json!({"primary": true})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["uuid"].is_string());

        let items = fx.primary_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].target, "runs_to_start");
        assert!(items[0].kwargs.primary());
        assert_eq!(items[0].kwargs.uuid_str(), body["uuid"].as_str());
    }

    #[tokio::test]
    async fn run_rejects_unknown_names_and_bad_kwargs() {
        let fx = fixture();
        let (status, _) = call(app(&fx, None), post_req("/checks/nope/run", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            app(&fx, None),
            post_req("/checks/runs_to_start/run", json!({"colour": "blue"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) =
            call(app(&fx, None), post_req("/actions/start_runs/run", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "check_name is required");
        assert!(fx.primary_items().is_empty());
    }

    #[tokio::test]
    async fn run_action_carries_the_upstream_check() {
        let fx = fixture();
        let (status, body) = call(
            app(&fx, None),
            post_req(
                "/actions/start_runs/run",
                json!({"check_name": "runs_to_start"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["uuid"].is_string());
        let items: Vec<QueueItem> = fx.primary_items();
        assert_eq!(items[0].kwargs.check_name(), Some("runs_to_start"));
        assert_eq!(items[0].kwargs.uuid_str(), body["uuid"].as_str());
    }

    #[tokio::test]
    async fn run_action_keeps_a_named_run() {
        let fx = fixture();
        let run = "2026-01-01T00:00:00.000000";
        let (status, body) = call(
            app(&fx, None),
            post_req(
                "/actions/start_runs/run",
                json!({"check_name": "runs_to_start", "uuid": run}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["uuid"], run);
        assert_eq!(fx.primary_items()[0].kwargs.uuid_str(), Some(run));
    }

    #[tokio::test]
    async fn reads_results() {
        let fx = fixture();
        let older = RunId::parse("2026-01-01T00:00:00.000000").unwrap();
        let newer = RunId::parse("2026-01-01T00:10:00.000000").unwrap();
        for id in [&older, &newer] {
            let mut result = CheckResult::new("runs_to_start", id.clone());
            result.status = CheckStatus::Pass;
            fx.results.put(&result, id == &older).await.unwrap();
        }

        let (status, body) = call(app(&fx, None), get_req("/results/runs_to_start/latest")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uuid"], newer.as_str());

        let (_, body) = call(app(&fx, None), get_req("/results/runs_to_start/primary")).await;
        assert_eq!(body["uuid"], older.as_str());

        let (_, body) = call(
            app(&fx, None),
            get_req("/results/runs_to_start/history?from=2026-01-01T00:05:00.000000"),
        )
        .await;
        assert_eq!(body["results"].as_array().unwrap().len(), 1);

        let (_, body) = call(
            app(&fx, None),
            get_req("/results/runs_to_start/closest?at=2026-01-01T00:02:00.000000&tolerance_secs=300"),
        )
        .await;
        assert_eq!(body["uuid"], older.as_str());

        let (status, _) = call(
            app(&fx, None),
            get_req("/results/runs_to_start/closest?at=2026-01-02T00:00:00.000000&tolerance_secs=60"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(app(&fx, None), get_req("/results/missing/latest")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            app(&fx, None),
            get_req("/results/runs_to_start/history?from=yesterday"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn queue_stats_cover_both_queues() {
        let fx = fixture();
        fx.enqueue(&QueueItem::new("runs_to_start", Default::default()))
            .await
            .unwrap();
        let (status, body) = call(app(&fx, None), get_req("/queues")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["primary"]["stats"]["visible"], 1);
        assert_eq!(body["secondary"]["stats"]["visible"], 0);
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let fx = fixture();
        let (status, body) = call(app(&fx, None), get_req("/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not found");
    }
}
