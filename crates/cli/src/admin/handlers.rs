//! Request handlers for the admin router.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;

use foursight_engine::{CheckError, Environment, ErrorKind, ParamSpec};
use foursight_interchange::{Kwargs, QueueItem, RunId};
use foursight_queue::SendOptions;
use foursight_storage::ResultStore;

use super::json_error;
use super::state::AdminState;

/// Tolerance for `/closest` when the caller gives none: one ten-minute tick.
const DEFAULT_TOLERANCE_SECS: u64 = 600;

type HandlerResult = Result<Response, Response>;

#[derive(Debug, Deserialize)]
pub(crate) struct EnvQuery {
    env: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    env: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ClosestQuery {
    env: Option<String>,
    at: String,
    tolerance_secs: Option<u64>,
}

/// GET /health
pub(crate) async fn handle_health(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "stage": state.ctx.stage,
    }))
}

/// GET /environments
pub(crate) async fn handle_environments(
    State(state): State<Arc<AdminState>>,
) -> impl IntoResponse {
    let default = state.ctx.environments.default_name();
    let environments: Vec<Value> = state
        .ctx
        .environments
        .iter()
        .map(|env| describe_environment(env, default == Some(env.name.as_str())))
        .collect();
    Json(json!({ "environments": environments }))
}

pub(crate) fn describe_environment(env: &Environment, is_default: bool) -> Value {
    json!({
        "name": env.name,
        "default": is_default,
        "api_url": env.api_url,
        "search_url": env.search_url,
        "workflow_url": env.workflow_url,
        "buckets": {
            "raw": env.buckets.raw,
            "processed": env.buckets.processed,
            "logs": env.buckets.logs,
        },
    })
}

/// GET /checks
pub(crate) async fn handle_list_checks(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let checks: Vec<Value> = state
        .ctx
        .registry
        .list_checks()
        .iter()
        .map(|check| {
            json!({
                "name": check.name,
                "title": check.title,
                "description": check.description,
                "params": params(&check.params),
                "action": check.linked_action,
                "schedule_groups": check.schedule_groups,
                "auto_action": check.auto_action,
            })
        })
        .collect();
    Json(json!({ "checks": checks }))
}

/// GET /actions
pub(crate) async fn handle_list_actions(
    State(state): State<Arc<AdminState>>,
) -> impl IntoResponse {
    let actions: Vec<Value> = state
        .ctx
        .registry
        .list_actions()
        .iter()
        .map(|action| {
            json!({
                "name": action.name,
                "title": action.title,
                "description": action.description,
                "params": params(&action.params),
            })
        })
        .collect();
    Json(json!({ "actions": actions }))
}

fn params(specs: &[ParamSpec]) -> Value {
    serde_json::to_value(specs).unwrap_or(Value::Null)
}

/// POST /checks/{name}/run
///
/// The body, when present, is the kwargs object. A missing `uuid` is
/// filled with the current time.
pub(crate) async fn handle_run_check(
    State(state): State<Arc<AdminState>>,
    Path(name): Path<String>,
    Query(query): Query<EnvQuery>,
    body: Bytes,
) -> Response {
    respond(run_check(&state, &name, query.env, &body).await)
}

async fn run_check(
    state: &AdminState,
    name: &str,
    env: Option<String>,
    body: &[u8],
) -> HandlerResult {
    let check = state
        .ctx
        .registry
        .get_check(name)
        .ok_or_else(|| not_found(&format!("unknown check '{}'", name)))?;
    let mut kwargs = kwargs_from_body(body)?;
    check.validate(&kwargs).map_err(check_error)?;
    if kwargs.uuid_str().is_none() {
        kwargs.set_uuid(&RunId::now());
    }
    enqueue(state, name, kwargs, env).await
}

/// POST /actions/{name}/run
///
/// The body must name the upstream check with `check_name`. A missing
/// `uuid` is filled with the current time, so the upstream lookup falls
/// back to the check's latest result unless the caller names a run.
pub(crate) async fn handle_run_action(
    State(state): State<Arc<AdminState>>,
    Path(name): Path<String>,
    Query(query): Query<EnvQuery>,
    body: Bytes,
) -> Response {
    respond(run_action(&state, &name, query.env, &body).await)
}

async fn run_action(
    state: &AdminState,
    name: &str,
    env: Option<String>,
    body: &[u8],
) -> HandlerResult {
    let action = state
        .ctx
        .registry
        .get_action(name)
        .ok_or_else(|| not_found(&format!("unknown action '{}'", name)))?;
    let mut kwargs = kwargs_from_body(body)?;
    if kwargs.check_name().is_none() {
        return Err(
            json_error(StatusCode::BAD_REQUEST, "check_name is required").into_response(),
        );
    }
    action.validate(&kwargs).map_err(check_error)?;
    if kwargs.uuid_str().is_none() {
        kwargs.set_uuid(&RunId::now());
    }
    enqueue(state, name, kwargs, env).await
}

fn kwargs_from_body(body: &[u8]) -> Result<Kwargs, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Kwargs::new());
    }
    let value: Value = serde_json::from_slice(body).map_err(|e| {
        json_error(StatusCode::BAD_REQUEST, &format!("invalid JSON body: {}", e)).into_response()
    })?;
    Kwargs::from_value(value)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, &e.to_string()).into_response())
}

async fn enqueue(
    state: &AdminState,
    target: &str,
    kwargs: Kwargs,
    env: Option<String>,
) -> HandlerResult {
    let mut item = QueueItem::new(target, kwargs);
    if let Some(env) = env {
        if state.ctx.environments.get(&env).is_none() {
            return Err(not_found(&format!("unknown environment '{}'", env)));
        }
        item = item.with_environment(env);
    }
    let queue = &state.ctx.queues.primary;
    let message_id = queue
        .send(item.to_json(), SendOptions::new())
        .await
        .map_err(|e| json_error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()).into_response())?;
    tracing::info!(invocation = %item.target, message_id = %message_id, "queued from admin surface");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message_id": message_id,
            "queue": queue.name(),
            "target": item.target,
            "uuid": item.kwargs.uuid_str(),
        })),
    )
        .into_response())
}

/// GET /results/{name}/latest
pub(crate) async fn handle_latest(
    State(state): State<Arc<AdminState>>,
    Path(name): Path<String>,
    Query(query): Query<EnvQuery>,
) -> Response {
    respond(latest(&state, &name, query.env.as_deref(), false).await)
}

/// GET /results/{name}/primary
pub(crate) async fn handle_primary(
    State(state): State<Arc<AdminState>>,
    Path(name): Path<String>,
    Query(query): Query<EnvQuery>,
) -> Response {
    respond(latest(&state, &name, query.env.as_deref(), true).await)
}

async fn latest(state: &AdminState, name: &str, env: Option<&str>, primary: bool) -> HandlerResult {
    let store = result_store(state, env)?;
    let record = if primary {
        store.get_primary::<Value>(name).await
    } else {
        store.get_latest::<Value>(name).await
    };
    match record.map_err(storage_error)? {
        Some(record) => Ok(Json(record).into_response()),
        None => Err(not_found(&format!("no result for '{}'", name))),
    }
}

/// GET /results/{name}/history?from=&to=
///
/// Bounds are run ids and inclusive. `from` defaults to the epoch and `to`
/// to now.
pub(crate) async fn handle_history(
    State(state): State<Arc<AdminState>>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    respond(history(&state, &name, query).await)
}

async fn history(state: &AdminState, name: &str, query: HistoryQuery) -> HandlerResult {
    let store = result_store(state, query.env.as_deref())?;
    let from = match query.from.as_deref() {
        Some(text) => parse_run_id(text)?,
        None => RunId::from_datetime(OffsetDateTime::UNIX_EPOCH),
    };
    let to = match query.to.as_deref() {
        Some(text) => parse_run_id(text)?,
        None => RunId::now(),
    };
    let results = store
        .list_between::<Value>(name, &from, &to)
        .await
        .map_err(storage_error)?
        .collect()
        .await
        .map_err(storage_error)?;
    Ok(Json(json!({
        "name": name,
        "from": from,
        "to": to,
        "results": results,
    }))
    .into_response())
}

/// GET /results/{name}/closest?at=&tolerance_secs=
pub(crate) async fn handle_closest(
    State(state): State<Arc<AdminState>>,
    Path(name): Path<String>,
    Query(query): Query<ClosestQuery>,
) -> Response {
    respond(closest(&state, &name, query).await)
}

async fn closest(state: &AdminState, name: &str, query: ClosestQuery) -> HandlerResult {
    let store = result_store(state, query.env.as_deref())?;
    let at = parse_run_id(&query.at)?.to_datetime();
    let tolerance = Duration::from_secs(query.tolerance_secs.unwrap_or(DEFAULT_TOLERANCE_SECS));
    match store
        .get_closest::<Value>(name, at, tolerance)
        .await
        .map_err(storage_error)?
    {
        Some(record) => Ok(Json(record).into_response()),
        None => Err(not_found(&format!(
            "no result for '{}' within {}s of {}",
            name,
            tolerance.as_secs(),
            query.at
        ))),
    }
}

/// GET /queues
pub(crate) async fn handle_queues(State(state): State<Arc<AdminState>>) -> Response {
    let queues = &state.ctx.queues;
    let mut body = serde_json::Map::new();
    for (role, queue) in [("primary", &queues.primary), ("secondary", &queues.secondary)] {
        match queue.stats().await {
            Ok(stats) => {
                body.insert(role.into(), json!({ "name": queue.name(), "stats": stats }));
            }
            Err(e) => {
                return json_error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()).into_response()
            }
        }
    }
    Json(Value::Object(body)).into_response()
}

/// Fallback for unknown routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

// ──────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────

fn respond(result: HandlerResult) -> Response {
    result.unwrap_or_else(|e| e)
}

fn result_store(state: &AdminState, env: Option<&str>) -> Result<ResultStore, Response> {
    let environment = state.ctx.environment(env).map_err(check_error)?;
    state
        .ctx
        .results(&environment.name)
        .cloned()
        .map_err(check_error)
}

fn parse_run_id(text: &str) -> Result<RunId, Response> {
    RunId::parse(text).map_err(|e| json_error(StatusCode::BAD_REQUEST, &e.to_string()).into_response())
}

fn not_found(message: &str) -> Response {
    json_error(StatusCode::NOT_FOUND, message).into_response()
}

fn check_error(e: CheckError) -> Response {
    let status = match e.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::TransientIo => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::DomainFailure | ErrorKind::Timeout => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, &e.to_string()).into_response()
}

fn storage_error(e: foursight_storage::StorageError) -> Response {
    check_error(CheckError::Storage(e))
}
