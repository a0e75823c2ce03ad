//! Checks on the dispatcher's own plumbing and the shared services.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use foursight_engine::clients::{ApiError, HealthStatus};
use foursight_engine::{
    CheckDescriptor, CheckError, CheckFn, Connection, RegistryBuilder, TIME_LIMIT_NOTE,
};
use foursight_interchange::{CheckResult, CheckStatus, Kwargs};
use foursight_queue::{deduplicate, DedupOptions, StopReason};

use crate::pipeline::HOURLY_CHECKS;

/// Time kept back from a dedup pass so the result can still be written.
const DEDUP_MARGIN: Duration = Duration::from_secs(10);

pub fn register(builder: &mut RegistryBuilder) {
    builder
        .check(
            CheckDescriptor::new("deduplicate_secondary_queue", DeduplicateSecondaryQueue)
                .describe("Collapse repeated items on the secondary queue")
                .group(HOURLY_CHECKS),
        )
        .check(
            CheckDescriptor::new("search_cluster_health", SearchClusterHealth)
                .describe("Health of the environment's search cluster")
                .group(HOURLY_CHECKS),
        );
}

struct DeduplicateSecondaryQueue;

#[async_trait]
impl CheckFn for DeduplicateSecondaryQueue {
    async fn run(
        &self,
        conn: &Connection,
        _kwargs: &Kwargs,
        result: &mut CheckResult,
    ) -> Result<(), CheckError> {
        let max_sid = conn.api.max_sid().await?;
        let budget = conn.budget.with_margin(DEDUP_MARGIN).remaining();
        let options = DedupOptions::new(budget, max_sid, result.uuid.as_str());
        let report = deduplicate(conn.queues.secondary.as_ref(), &options).await?;

        let troubled = report.problems > 0 || report.send_failures > 0;
        result.status = if troubled {
            CheckStatus::Warn
        } else {
            CheckStatus::Pass
        };
        result.summary = format!(
            "Processed {} items: {} kept, {} folded into kept copies, {} duplicates dropped",
            report.processed(),
            report.replaced,
            report.repeat_replaced,
            report.deduplicated
        );
        if report.stop_reason == StopReason::Budget {
            result.add_note(TIME_LIMIT_NOTE);
        }
        if troubled {
            result.add_note(&format!(
                "{} unreadable items, {} failed re-sends",
                report.problems, report.send_failures
            ));
        }
        tracing::info!(
            processed = report.processed(),
            deduplicated = report.deduplicated,
            max_sid = report.max_sid,
            stop = ?report.stop_reason,
            "secondary queue deduplicated"
        );
        result.brief_output = serde_json::to_value(&report).unwrap_or_default();
        Ok(())
    }
}

struct SearchClusterHealth;

#[async_trait]
impl CheckFn for SearchClusterHealth {
    async fn run(
        &self,
        conn: &Connection,
        _kwargs: &Kwargs,
        result: &mut CheckResult,
    ) -> Result<(), CheckError> {
        let health = match conn.search.cluster_health().await {
            Ok(health) => health,
            Err(ApiError::NotConfigured { service }) => {
                result.status = CheckStatus::Ignore;
                result.summary = format!("No {} configured for {}", service, conn.environment.name);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let (status, word) = match health.status {
            HealthStatus::Green => (CheckStatus::Pass, "healthy"),
            HealthStatus::Yellow => (CheckStatus::Warn, "degraded"),
            HealthStatus::Red => (CheckStatus::Fail, "down"),
        };
        result.status = status;
        result.summary = format!("Search cluster is {}", word);
        result.brief_output = json!(health);
        Ok(())
    }
}
