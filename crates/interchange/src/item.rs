//! Queue item bodies and the kwargs bag they carry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::InterchangeError;
use crate::run_id::RunId;

/// Logical run identifier. Required on every item.
pub const UUID: &str = "uuid";
/// Also write the result to the canonical `primary.json` pointer.
pub const PRIMARY: &str = "primary";
/// Auto-enqueue the linked action when this equals the deployment stage.
pub const QUEUE_ACTION: &str = "queue_action";
/// Domain sequence id carried through deduplication.
pub const SID: &str = "sid";
/// Audit tag written by deduplication runs.
pub const FS_DETAIL: &str = "fs_detail";
/// On action items: the name of the upstream check.
pub const CHECK_NAME: &str = "check_name";

/// Keys the dispatcher interprets itself. They are accepted on every target
/// regardless of its declared parameters.
pub const RESERVED_KEYS: [&str; 6] = [UUID, PRIMARY, QUEUE_ACTION, SID, FS_DETAIL, CHECK_NAME];

/// The parameter bag passed to a check or action.
///
/// Reserved keys have typed accessors; everything else is handed to the
/// target as a named argument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kwargs(Map<String, Value>);

impl Kwargs {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build from an arbitrary JSON value, which must be an object (or null).
    pub fn from_value(value: Value) -> Result<Self, InterchangeError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(InterchangeError::MalformedItem(format!(
                "kwargs must be an object, got {}",
                json_type(&other)
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries other than the reserved dispatcher keys.
    pub fn user_args(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    // ── Reserved keys ────────────────────────────────────────────────────────

    /// Raw `uuid` string. Deduplication keys on this without requiring it to
    /// be a well-formed run id.
    pub fn uuid_str(&self) -> Option<&str> {
        self.0.get(UUID).and_then(Value::as_str)
    }

    /// The `uuid` as a validated run id.
    pub fn run_id(&self) -> Result<RunId, InterchangeError> {
        let raw = self.uuid_str().ok_or_else(|| InterchangeError::MissingKwarg {
            key: UUID.to_string(),
        })?;
        RunId::parse(raw)
    }

    pub fn set_uuid(&mut self, id: &RunId) {
        self.0.insert(UUID.to_string(), Value::String(id.to_string()));
    }

    /// `primary` flag. Accepts JSON booleans and the strings `"true"`/`"True"`.
    pub fn primary(&self) -> bool {
        self.get_bool(PRIMARY).unwrap_or(false)
    }

    pub fn set_primary(&mut self, primary: bool) {
        self.0.insert(PRIMARY.to_string(), Value::Bool(primary));
    }

    pub fn queue_action(&self) -> Option<&str> {
        self.get_str(QUEUE_ACTION)
    }

    pub fn set_queue_action(&mut self, stage: &str) {
        self.0
            .insert(QUEUE_ACTION.to_string(), Value::String(stage.to_string()));
    }

    pub fn sid(&self) -> Option<i64> {
        self.get_i64(SID)
    }

    pub fn set_sid(&mut self, sid: i64) {
        self.0.insert(SID.to_string(), Value::from(sid));
    }

    pub fn fs_detail(&self) -> Option<&str> {
        self.get_str(FS_DETAIL)
    }

    pub fn set_fs_detail(&mut self, tag: &str) {
        self.0
            .insert(FS_DETAIL.to_string(), Value::String(tag.to_string()));
    }

    pub fn check_name(&self) -> Option<&str> {
        self.get_str(CHECK_NAME)
    }

    pub fn set_check_name(&mut self, name: &str) {
        self.0
            .insert(CHECK_NAME.to_string(), Value::String(name.to_string()));
    }

    // ── Typed argument access ────────────────────────────────────────────────

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.as_str() {
                "true" | "True" => Some(true),
                "false" | "False" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Integer argument. Numeric strings are accepted, since items created
    /// by hand through the admin surface often quote numbers.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// String-list argument. A single string is treated as a comma-separated
    /// list.
    pub fn get_str_list(&self, key: &str) -> Option<Vec<String>> {
        match self.0.get(key)? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            ),
            Value::String(s) => Some(
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl From<Map<String, Value>> for Kwargs {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A pending check or action invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Check or action name.
    pub target: String,
    #[serde(default)]
    pub kwargs: Kwargs,
    /// Environment the invocation runs against. Absent means the
    /// deployment's default environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl QueueItem {
    pub fn new(target: impl Into<String>, kwargs: Kwargs) -> Self {
        Self {
            target: target.into(),
            kwargs,
            environment: None,
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Decode a queue message body.
    pub fn from_json(body: &str) -> Result<Self, InterchangeError> {
        let item: QueueItem = serde_json::from_str(body)
            .map_err(|e| InterchangeError::MalformedItem(e.to_string()))?;
        if item.target.is_empty() {
            return Err(InterchangeError::MalformedItem(
                "empty target".to_string(),
            ));
        }
        Ok(item)
    }

    pub fn to_json(&self) -> String {
        // A struct of strings and a JSON map always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// `(target, uuid)` duplicate key, if the item carries a uuid.
    pub fn dedup_key(&self) -> Option<(String, String)> {
        self.kwargs
            .uuid_str()
            .map(|u| (self.target.clone(), u.to_string()))
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_wire_body() {
        let item = QueueItem::from_json(
            r#"{"target":"x","kwargs":{"uuid":"2024-01-01T00:00:00.000000","primary":true,"queue_action":"prod","sid":42}}"#,
        )
        .unwrap();
        assert_eq!(item.target, "x");
        assert!(item.kwargs.primary());
        assert_eq!(item.kwargs.queue_action(), Some("prod"));
        assert_eq!(item.kwargs.sid(), Some(42));
        assert_eq!(
            item.kwargs.run_id().unwrap().as_str(),
            "2024-01-01T00:00:00.000000"
        );
        assert!(item.environment.is_none());
    }

    #[test]
    fn rejects_bodies_without_target() {
        assert!(QueueItem::from_json("{}").is_err());
        assert!(QueueItem::from_json(r#"{"target":""}"#).is_err());
        assert!(QueueItem::from_json("not json").is_err());
    }

    #[test]
    fn environment_is_omitted_when_unset() {
        let item = QueueItem::new("x", Kwargs::new());
        assert_eq!(item.to_json(), r#"{"target":"x","kwargs":{}}"#);
        let item = item.with_environment("data");
        assert!(item.to_json().contains("\"environment\":\"data\""));
    }

    #[test]
    fn dedup_key_uses_raw_uuid() {
        let mut kwargs = Kwargs::new();
        kwargs.insert(UUID, "u1");
        let item = QueueItem::new("t", kwargs);
        assert_eq!(item.dedup_key(), Some(("t".into(), "u1".into())));
        assert!(item.kwargs.run_id().is_err());
    }

    #[test]
    fn user_args_skip_reserved_keys() {
        let kwargs = Kwargs::from_value(json!({
            "uuid": "2024-01-01T00:00:00.000000",
            "primary": true,
            "limit": 5,
            "runs": "a, b,,c"
        }))
        .unwrap();
        let names: Vec<&String> = kwargs.user_args().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["limit", "runs"]);
        assert_eq!(kwargs.get_i64("limit"), Some(5));
        assert_eq!(
            kwargs.get_str_list("runs").unwrap(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn primary_accepts_string_forms() {
        let kwargs = Kwargs::from_value(json!({"primary": "True"})).unwrap();
        assert!(kwargs.primary());
        let kwargs = Kwargs::from_value(json!({"primary": "nope"})).unwrap();
        assert!(!kwargs.primary());
        assert!(Kwargs::from_value(json!([1])).is_err());
    }
}
