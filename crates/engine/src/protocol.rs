//! The contract between the worker and the checks and actions it runs.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use foursight_interchange::{ActionResult, ActionStatus, CheckResult, Kwargs};

use crate::connection::Connection;
use crate::error::CheckError;

/// Note recorded when an invocation ran out of wall-clock budget.
pub const TIME_LIMIT_NOTE: &str = "did not complete due to time limitations";

/// An observation. Implementations fill in `result` and must not change
/// external state.
///
/// The worker pre-fills `name`, `uuid`, `kwargs` and `action` before the
/// call. An `Err` becomes an `ERROR` result.
#[async_trait]
pub trait CheckFn: Send + Sync + 'static {
    async fn run(
        &self,
        conn: &Connection,
        kwargs: &Kwargs,
        result: &mut CheckResult,
    ) -> Result<(), CheckError>;
}

/// A remediation. Implementations must be idempotent: re-read each
/// target before writing to it.
///
/// An `Err` becomes a `FAIL` result.
#[async_trait]
pub trait ActionFn: Send + Sync + 'static {
    async fn run(
        &self,
        conn: &Connection,
        kwargs: &Kwargs,
        result: &mut ActionResult,
    ) -> Result<(), CheckError>;
}

/// Wall-clock budget of one invocation, on tokio's clock.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    start: Instant,
    limit: Duration,
}

impl TimeBudget {
    pub fn start(limit: Duration) -> Self {
        Self {
            start: Instant::now(),
            limit,
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }

    pub fn is_past_time_limit(&self) -> bool {
        self.elapsed() >= self.limit
    }

    /// A budget ending `margin` earlier, for loops that must leave time
    /// to write their result.
    pub fn with_margin(&self, margin: Duration) -> Self {
        Self {
            start: self.start,
            limit: self.limit.saturating_sub(margin),
        }
    }
}

/// Per-candidate bookkeeping for an action's `output`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutput {
    pub success: Vec<String>,
    pub error: BTreeMap<String, String>,
    pub skipped: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ActionOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeeded(&mut self, id: impl Into<String>) {
        self.success.push(id.into());
    }

    pub fn failed(&mut self, id: impl Into<String>, message: impl ToString) {
        self.error.insert(id.into(), message.to_string());
    }

    pub fn skipped(&mut self, id: impl Into<String>) {
        self.skipped.push(id.into());
    }

    /// `FAIL` on any error, `PEND` when cut short, else `DONE`.
    pub fn status(&self, cut_short: bool) -> ActionStatus {
        if !self.error.is_empty() {
            ActionStatus::Fail
        } else if cut_short {
            ActionStatus::Pend
        } else {
            ActionStatus::Done
        }
    }

    /// Store into `result` with the matching status.
    pub fn finish(mut self, result: &mut ActionResult, cut_short: bool) {
        if cut_short {
            self.note = Some(TIME_LIMIT_NOTE.to_string());
            result.add_note(TIME_LIMIT_NOTE);
        }
        result.status = self.status(cut_short);
        result.output = serde_json::to_value(&self).unwrap_or(Value::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foursight_interchange::RunId;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn budget_tracks_paused_clock() {
        let budget = TimeBudget::start(Duration::from_secs(10));
        assert!(!budget.is_past_time_limit());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(budget.remaining(), Duration::from_secs(6));
        assert!(budget.with_margin(Duration::from_secs(6)).is_past_time_limit());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(budget.is_past_time_limit());
        assert_eq!(budget.remaining(), Duration::ZERO);
    }

    #[test]
    fn output_status_grid() {
        let mut out = ActionOutput::new();
        out.succeeded("a");
        assert_eq!(out.status(false), ActionStatus::Done);
        assert_eq!(out.status(true), ActionStatus::Pend);
        out.failed("b", "patch rejected");
        assert_eq!(out.status(true), ActionStatus::Fail);
    }

    #[test]
    fn finish_writes_output_and_note() {
        let mut result = ActionResult::new("start_runs", RunId::now());
        let mut out = ActionOutput::new();
        out.succeeded("r1");
        out.finish(&mut result, true);
        assert_eq!(result.status, ActionStatus::Pend);
        assert_eq!(
            result.output,
            json!({"success": ["r1"], "error": {}, "skipped": [], "note": TIME_LIMIT_NOTE})
        );
        assert!(result.description.contains(TIME_LIMIT_NOTE));
    }
}
