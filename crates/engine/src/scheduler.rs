//! Cron-driven fan-out of schedule groups onto the primary queue.
//!
//! Expressions are AWS style, six fields with a year and `?` for "no
//! specific value", optionally wrapped in `cron(...)`. The `cron` crate
//! wants seconds first, so `0` is prefixed and `?` becomes `*`.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;

use foursight_interchange::{QueueItem, RunId};
use foursight_queue::SendOptions;

use crate::config::Config;
use crate::context::Context;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {message}")]
    Invalid { expression: String, message: String },
}

/// AWS form to `cron` crate form.
pub fn to_cron_expression(aws: &str) -> Result<String, ScheduleError> {
    let trimmed = aws.trim();
    let inner = trimmed
        .strip_prefix("cron(")
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(trimmed);
    let fields: Vec<&str> = inner.split_whitespace().collect();
    if fields.len() != 6 {
        return Err(ScheduleError::Invalid {
            expression: aws.to_string(),
            message: format!("expected 6 fields, found {}", fields.len()),
        });
    }
    let mapped: Vec<&str> = fields
        .into_iter()
        .map(|f| if f == "?" { "*" } else { f })
        .collect();
    Ok(format!("0 {}", mapped.join(" ")))
}

pub fn parse_schedule(aws: &str) -> Result<cron::Schedule, ScheduleError> {
    let expression = to_cron_expression(aws)?;
    cron::Schedule::from_str(&expression).map_err(|e| ScheduleError::Invalid {
        expression: aws.to_string(),
        message: e.to_string(),
    })
}

fn to_chrono(at: OffsetDateTime) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(at.unix_timestamp(), at.nanosecond()).single()
}

fn from_chrono(at: DateTime<Utc>) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(at.timestamp()).ok()
}

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub group: String,
    pub expression: String,
    schedule: cron::Schedule,
}

impl ScheduleEntry {
    /// First firing strictly after `after`.
    pub fn next_after(&self, after: OffsetDateTime) -> Option<OffsetDateTime> {
        let start = to_chrono(after)?;
        self.schedule.after(&start).next().and_then(from_chrono)
    }
}

/// stage → group → schedule, plus the groups disabled per stage.
#[derive(Debug, Clone, Default)]
pub struct ScheduleTable {
    stages: BTreeMap<String, Vec<ScheduleEntry>>,
    disabled: BTreeMap<String, BTreeSet<String>>,
}

impl ScheduleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Result<Self, ScheduleError> {
        let mut table = Self::new();
        for (stage, groups) in &config.schedules {
            for (group, expression) in groups {
                table.insert(stage, group, expression)?;
            }
        }
        for (stage, groups) in &config.disabled_groups {
            for group in groups {
                table.disable(stage, group);
            }
        }
        Ok(table)
    }

    pub fn insert(&mut self, stage: &str, group: &str, expression: &str) -> Result<(), ScheduleError> {
        let schedule = parse_schedule(expression)?;
        let entries = self.stages.entry(stage.to_string()).or_default();
        entries.retain(|e| e.group != group);
        entries.push(ScheduleEntry {
            group: group.to_string(),
            expression: expression.to_string(),
            schedule,
        });
        Ok(())
    }

    pub fn disable(&mut self, stage: &str, group: &str) {
        self.disabled
            .entry(stage.to_string())
            .or_default()
            .insert(group.to_string());
    }

    pub fn is_disabled(&self, stage: &str, group: &str) -> bool {
        self.disabled
            .get(stage)
            .is_some_and(|groups| groups.contains(group))
    }

    pub fn entries(&self, stage: &str) -> &[ScheduleEntry] {
        self.stages.get(stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn next_firing(&self, stage: &str, group: &str, after: OffsetDateTime) -> Option<OffsetDateTime> {
        self.entries(stage)
            .iter()
            .find(|e| e.group == group)
            .and_then(|e| e.next_after(after))
    }

    /// Firings with `after < t <= until` of every enabled group, in time
    /// order.
    pub fn due_groups(
        &self,
        stage: &str,
        after: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Vec<(OffsetDateTime, String)> {
        let (Some(start), Some(end)) = (to_chrono(after), to_chrono(until)) else {
            return Vec::new();
        };
        let mut due: Vec<(OffsetDateTime, String)> = self
            .entries(stage)
            .iter()
            .filter(|e| !self.is_disabled(stage, &e.group))
            .flat_map(|e| {
                e.schedule
                    .after(&start)
                    .take_while(move |t| *t <= end)
                    .filter_map(from_chrono)
                    .map(move |t| (t, e.group.clone()))
            })
            .collect();
        due.sort();
        due
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enqueued {
    pub check: String,
    pub uuid: RunId,
    pub message_id: String,
}

/// What one firing put on the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FireReport {
    pub stage: String,
    pub group: String,
    pub disabled: bool,
    pub enqueued: Vec<Enqueued>,
    /// check → send error.
    pub failures: BTreeMap<String, String>,
}

pub struct Scheduler {
    ctx: Arc<Context>,
    table: ScheduleTable,
}

impl Scheduler {
    pub fn new(ctx: Arc<Context>, table: ScheduleTable) -> Self {
        Self { ctx, table }
    }

    pub fn table(&self) -> &ScheduleTable {
        &self.table
    }

    /// Fire `group` on the context's stage.
    pub async fn fire(&self, group: &str) -> FireReport {
        let stage = self.ctx.stage.clone();
        self.fire_stage(&stage, group).await
    }

    /// One item per check in `group`, each with a fresh run id and
    /// `primary = true`. Disabled groups enqueue nothing.
    pub async fn fire_stage(&self, stage: &str, group: &str) -> FireReport {
        let mut report = FireReport {
            stage: stage.to_string(),
            group: group.to_string(),
            ..FireReport::default()
        };
        if self.table.is_disabled(stage, group) {
            tracing::info!(stage, group, "schedule group disabled, nothing queued");
            report.disabled = true;
            return report;
        }

        for check in self.ctx.registry.checks_in_group(group) {
            let uuid = RunId::now();
            let mut kwargs = check.default_kwargs();
            kwargs.set_uuid(&uuid);
            kwargs.set_primary(true);
            if check.auto_action {
                kwargs.set_queue_action(stage);
            }
            let item = QueueItem::new(check.name.clone(), kwargs);
            match self
                .ctx
                .queues
                .primary
                .send(item.to_json(), SendOptions::new())
                .await
            {
                Ok(message_id) => report.enqueued.push(Enqueued {
                    check: check.name.clone(),
                    uuid,
                    message_id,
                }),
                Err(e) => {
                    tracing::error!(stage, group, check = %check.name, error = %e, "could not queue check");
                    report.failures.insert(check.name.clone(), e.to_string());
                }
            }
        }
        tracing::info!(
            stage,
            group,
            queued = report.enqueued.len(),
            failed = report.failures.len(),
            "schedule group fired"
        );
        report
    }

    /// Tick once a minute and fire whatever came due since the last tick,
    /// until `shutdown` flips or its sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let stage = self.ctx.stage.clone();
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last = OffsetDateTime::now_utc();
        tracing::info!(stage = %stage, groups = self.table.entries(&stage).len(), "scheduler started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let now = OffsetDateTime::now_utc();
                    for (at, group) in self.table.due_groups(&stage, last, now) {
                        tracing::debug!(group = %group, at = %at, "schedule due");
                        self.fire_stage(&stage, &group).await;
                    }
                    last = now;
                }
            }
        }
        tracing::info!("scheduler stopped");
    }
}
