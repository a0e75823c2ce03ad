use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::http::{join_url, JsonRequest, Method};
use super::ApiError;

/// One condition of a search. Field names may be dotted paths into
/// embedded objects.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
    /// The field is absent or null.
    Missing(String),
}

/// A search over items of one type. Every filter must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub item_type: String,
    pub filters: Vec<Filter>,
    pub limit: Option<usize>,
}

impl SearchQuery {
    pub fn new(item_type: impl Into<String>) -> Self {
        Self {
            item_type: item_type.into(),
            ..Self::default()
        }
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.into(), value.into()));
        self
    }

    pub fn is_in<V: Into<Value>>(
        mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.filters.push(Filter::In(
            field.into(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn missing(mut self, field: impl Into<String>) -> Self {
        self.filters.push(Filter::Missing(field.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `item` satisfies the query.
    pub fn matches(&self, item: &Value) -> bool {
        if item.get("@type").and_then(Value::as_str) != Some(self.item_type.as_str()) {
            return false;
        }
        self.filters.iter().all(|filter| match filter {
            Filter::Eq(field, value) => lookup(item, field) == Some(value),
            Filter::In(field, values) => lookup(item, field).is_some_and(|v| values.contains(v)),
            Filter::Missing(field) => matches!(lookup(item, field), None | Some(Value::Null)),
        })
    }

    /// Query string for the portal search endpoint.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("type".to_string(), self.item_type.clone())];
        for filter in &self.filters {
            match filter {
                Filter::Eq(field, value) => pairs.push((field.clone(), scalar(value))),
                Filter::In(field, values) => {
                    pairs.extend(values.iter().map(|v| (field.clone(), scalar(v))))
                }
                Filter::Missing(field) => pairs.push((field.clone(), "No value".to_string())),
            }
        }
        let limit = self
            .limit
            .map(|n| n.to_string())
            .unwrap_or_else(|| "all".to_string());
        pairs.push(("limit".to_string(), limit));
        pairs.push(("format".to_string(), "json".to_string()));
        pairs
    }
}

fn lookup<'a>(item: &'a Value, field: &str) -> Option<&'a Value> {
    field.split('.').try_fold(item, |v, part| v.get(part))
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The metadata portal the checks observe and repair.
///
/// Items are JSON objects carrying `uuid` and `@type`.
#[async_trait]
pub trait DomainApi: Send + Sync + 'static {
    async fn get(&self, id: &str) -> Result<Value, ApiError>;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Value>, ApiError>;

    /// Merge `body` into the item's top-level fields.
    async fn patch(&self, id: &str, body: Value) -> Result<Value, ApiError>;

    /// Create an item of `item_type`. Returns the stored item.
    async fn post(&self, item_type: &str, body: Value) -> Result<Value, ApiError>;

    /// Highest sequence id issued by the portal's indexer.
    async fn max_sid(&self) -> Result<i64, ApiError>;
}

// ──────────────────────────────────────────────
// HTTP
// ──────────────────────────────────────────────

/// Portal client over its REST interface.
#[derive(Debug, Clone)]
pub struct HttpDomainApi {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpDomainApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn request(&self, method: Method, path: &str) -> JsonRequest {
        JsonRequest::new(method, join_url(&self.base_url, path), self.timeout)
            .bearer(self.token.as_deref())
    }
}

fn not_found_as(what: &str) -> impl Fn(ApiError) -> ApiError + '_ {
    move |e| match e {
        ApiError::Status { status: 404, .. } => ApiError::NotFound {
            what: what.to_string(),
        },
        other => other,
    }
}

#[async_trait]
impl DomainApi for HttpDomainApi {
    async fn get(&self, id: &str) -> Result<Value, ApiError> {
        self.request(Method::Get, id)
            .query(vec![
                ("frame".into(), "object".into()),
                ("format".into(), "json".into()),
            ])
            .send()
            .await
            .map_err(not_found_as(id))
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Value>, ApiError> {
        let result = self
            .request(Method::Get, "search/")
            .query(query.query_pairs())
            .send()
            .await;
        let body = match result {
            Ok(body) => body,
            // The portal answers an empty search with 404.
            Err(ApiError::Status { status: 404, .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        match body.get("@graph") {
            Some(Value::Array(items)) => Ok(items.clone()),
            _ => Err(ApiError::Decode {
                url: join_url(&self.base_url, "search/"),
                message: "response has no @graph array".into(),
            }),
        }
    }

    async fn patch(&self, id: &str, body: Value) -> Result<Value, ApiError> {
        self.request(Method::Patch, id)
            .body(body)
            .send()
            .await
            .map_err(not_found_as(id))
    }

    async fn post(&self, item_type: &str, body: Value) -> Result<Value, ApiError> {
        self.request(Method::Post, item_type)
            .body(body)
            .send()
            .await
            .map_err(|e| match e {
                ApiError::Status {
                    status: 409 | 422,
                    message,
                    ..
                } => ApiError::Rejected {
                    what: item_type.to_string(),
                    message,
                },
                other => other,
            })
    }

    async fn max_sid(&self) -> Result<i64, ApiError> {
        let body = self.request(Method::Get, "max_sid").send().await?;
        body.get("max_sid")
            .and_then(Value::as_i64)
            .ok_or_else(|| ApiError::Decode {
                url: join_url(&self.base_url, "max_sid"),
                message: "response has no integer max_sid".into(),
            })
    }
}

// ──────────────────────────────────────────────
// In memory
// ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryState {
    items: BTreeMap<String, Value>,
    sid: i64,
    writes: u64,
    failing: usize,
}

/// A portal held in a map. Every write bumps the sequence id and stamps
/// it onto the item as `sid`.
#[derive(Debug, Default)]
pub struct MemoryDomainApi {
    state: Mutex<MemoryState>,
}

impl MemoryDomainApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an item without counting it as a write. A missing `uuid` is
    /// generated. Returns the uuid.
    pub fn insert(&self, mut item: Value) -> String {
        let mut state = self.state();
        state.sid += 1;
        let sid = state.sid;
        let id = ensure_uuid(&mut item);
        if let Some(obj) = item.as_object_mut() {
            obj.insert("sid".into(), Value::from(sid));
        }
        state.items.insert(id.clone(), item);
        id
    }

    pub fn item(&self, id: &str) -> Option<Value> {
        self.state().items.get(id).cloned()
    }

    /// Patches and posts performed through the trait.
    pub fn write_count(&self) -> u64 {
        self.state().writes
    }

    /// Make the next `n` calls fail as if the portal were unreachable.
    pub fn fail_next(&self, n: usize) {
        self.state().failing = n;
    }

    fn injected(&self, state: &mut MemoryState, what: &str) -> Result<(), ApiError> {
        if state.failing > 0 {
            state.failing -= 1;
            return Err(ApiError::Transport {
                url: format!("memory://{}", what),
                message: "injected failure".into(),
            });
        }
        Ok(())
    }
}

fn ensure_uuid(item: &mut Value) -> String {
    if let Some(id) = item.get("uuid").and_then(Value::as_str) {
        return id.to_string();
    }
    let id = Uuid::new_v4().to_string();
    if let Some(obj) = item.as_object_mut() {
        obj.insert("uuid".into(), Value::String(id.clone()));
    }
    id
}

#[async_trait]
impl DomainApi for MemoryDomainApi {
    async fn get(&self, id: &str) -> Result<Value, ApiError> {
        let mut state = self.state();
        self.injected(&mut state, id)?;
        state.items.get(id).cloned().ok_or_else(|| ApiError::NotFound {
            what: id.to_string(),
        })
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Value>, ApiError> {
        let mut state = self.state();
        self.injected(&mut state, "search")?;
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(state
            .items
            .values()
            .filter(|item| query.matches(item))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn patch(&self, id: &str, body: Value) -> Result<Value, ApiError> {
        let mut state = self.state();
        self.injected(&mut state, id)?;
        let Value::Object(fields) = body else {
            return Err(ApiError::Rejected {
                what: id.to_string(),
                message: "patch body must be an object".into(),
            });
        };
        state.sid += 1;
        state.writes += 1;
        let sid = state.sid;
        let item = state.items.get_mut(id).ok_or_else(|| ApiError::NotFound {
            what: id.to_string(),
        })?;
        if let Some(obj) = item.as_object_mut() {
            obj.extend(fields);
            obj.insert("sid".into(), Value::from(sid));
        }
        Ok(item.clone())
    }

    async fn post(&self, item_type: &str, body: Value) -> Result<Value, ApiError> {
        let mut state = self.state();
        self.injected(&mut state, item_type)?;
        let Value::Object(fields) = body else {
            return Err(ApiError::Rejected {
                what: item_type.to_string(),
                message: "post body must be an object".into(),
            });
        };
        let mut item = Value::Object(fields);
        let id = ensure_uuid(&mut item);
        if state.items.contains_key(&id) {
            return Err(ApiError::Rejected {
                what: item_type.to_string(),
                message: format!("uuid {} already exists", id),
            });
        }
        state.sid += 1;
        state.writes += 1;
        let sid = state.sid;
        if let Some(obj) = item.as_object_mut() {
            obj.insert("@type".into(), Value::String(item_type.to_string()));
            obj.insert("sid".into(), Value::from(sid));
        }
        state.items.insert(id, item.clone());
        Ok(item)
    }

    async fn max_sid(&self) -> Result<i64, ApiError> {
        let mut state = self.state();
        self.injected(&mut state, "max_sid")?;
        Ok(state.sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_matches_type_and_filters() {
        let item = json!({"@type": "WorkflowRun", "status": "started", "meta": {"lab": "x"}});
        assert!(SearchQuery::new("WorkflowRun").eq("status", "started").matches(&item));
        assert!(SearchQuery::new("WorkflowRun").eq("meta.lab", "x").matches(&item));
        assert!(SearchQuery::new("WorkflowRun")
            .is_in("status", ["started", "running"])
            .matches(&item));
        assert!(SearchQuery::new("WorkflowRun").missing("output").matches(&item));
        assert!(!SearchQuery::new("FileProcessed").matches(&item));
        assert!(!SearchQuery::new("WorkflowRun").missing("status").matches(&item));
    }

    #[test]
    fn query_pairs_follow_portal_syntax() {
        let pairs = SearchQuery::new("WorkflowRun")
            .is_in("status", ["a", "b"])
            .missing("output")
            .limit(5)
            .query_pairs();
        let expect: Vec<(String, String)> = [
            ("type", "WorkflowRun"),
            ("status", "a"),
            ("status", "b"),
            ("output", "No value"),
            ("limit", "5"),
            ("format", "json"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(pairs, expect);
    }

    #[tokio::test]
    async fn memory_writes_bump_sid() {
        let api = MemoryDomainApi::new();
        let id = api.insert(json!({"@type": "WorkflowRun", "status": "started"}));
        let before = api.max_sid().await.unwrap();
        let patched = api.patch(&id, json!({"status": "complete"})).await.unwrap();
        assert_eq!(patched["status"], "complete");
        assert_eq!(patched["sid"], json!(before + 1));
        assert_eq!(api.write_count(), 1);

        let created = api.post("WorkflowRun", json!({"status": "started"})).await.unwrap();
        assert_eq!(created["@type"], "WorkflowRun");
        assert_eq!(api.max_sid().await.unwrap(), before + 2);
    }

    #[tokio::test]
    async fn memory_missing_item_is_not_found() {
        let api = MemoryDomainApi::new();
        let err = api.get("nope").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
        let err = api.patch("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound { .. }));
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let api = MemoryDomainApi::new();
        api.fail_next(1);
        assert!(api.max_sid().await.unwrap_err().kind() == crate::ErrorKind::TransientIo);
        assert!(api.max_sid().await.is_ok());
    }
}
