//! Stored check and action results.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::item::Kwargs;
use crate::run_id::RunId;
use crate::status::{ActionStatus, CheckStatus};

/// A record the result store can key by `(name, uuid)`.
pub trait ResultRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn name(&self) -> &str;
    fn uuid(&self) -> &RunId;
}

/// The outcome of one check invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub uuid: RunId,
    pub status: CheckStatus,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    /// Human-oriented detail.
    #[serde(default)]
    pub brief_output: Value,
    /// Machine-oriented detail consumed by the linked action.
    #[serde(default)]
    pub full_output: Value,
    #[serde(default)]
    pub allow_action: bool,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub action_message: String,
    #[serde(default)]
    pub kwargs: Kwargs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ff_link: Option<String>,
}

impl CheckResult {
    /// A blank result. Status starts at `IGNORE` until the check sets it.
    pub fn new(name: impl Into<String>, uuid: RunId) -> Self {
        Self {
            name: name.into(),
            uuid,
            status: CheckStatus::Ignore,
            summary: String::new(),
            description: String::new(),
            brief_output: Value::Null,
            full_output: Value::Null,
            allow_action: false,
            action: None,
            action_message: String::new(),
            kwargs: Kwargs::new(),
            ff_link: None,
        }
    }

    /// An `ERROR` result carrying `message` as its description.
    pub fn error(name: impl Into<String>, uuid: RunId, message: impl Into<String>) -> Self {
        let mut result = Self::new(name, uuid);
        result.status = CheckStatus::Error;
        result.summary = "Check failed to run".to_string();
        result.description = message.into();
        result
    }

    /// Append a diagnostic line to the description.
    pub fn add_note(&mut self, note: &str) {
        if !self.description.is_empty() {
            self.description.push('\n');
        }
        self.description.push_str(note);
    }

    /// Whether this result asks for its linked action to run.
    pub fn wants_action(&self) -> bool {
        self.allow_action && self.action.is_some() && self.status.permits_action()
    }
}

impl ResultRecord for CheckResult {
    fn name(&self) -> &str {
        &self.name
    }

    fn uuid(&self) -> &RunId {
        &self.uuid
    }
}

/// The outcome of one action invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub name: String,
    pub uuid: RunId,
    pub status: ActionStatus,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub output: Value,
    /// Must carry `check_name`.
    #[serde(default)]
    pub kwargs: Kwargs,
}

impl ActionResult {
    /// A blank result. Status starts at `PEND`.
    pub fn new(name: impl Into<String>, uuid: RunId) -> Self {
        Self {
            name: name.into(),
            uuid,
            status: ActionStatus::Pend,
            description: String::new(),
            output: Value::Null,
            kwargs: Kwargs::new(),
        }
    }

    /// A `FAIL` result carrying `message` as its description.
    pub fn failure(name: impl Into<String>, uuid: RunId, message: impl Into<String>) -> Self {
        let mut result = Self::new(name, uuid);
        result.status = ActionStatus::Fail;
        result.description = message.into();
        result
    }

    pub fn add_note(&mut self, note: &str) {
        if !self.description.is_empty() {
            self.description.push('\n');
        }
        self.description.push_str(note);
    }
}

impl ResultRecord for ActionResult {
    fn name(&self) -> &str {
        &self.name
    }

    fn uuid(&self) -> &RunId {
        &self.uuid
    }
}
