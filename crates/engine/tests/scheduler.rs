use std::collections::BTreeSet;

use async_trait::async_trait;

use foursight_engine::testing::Fixture;
use foursight_engine::{
    ActionDescriptor, ActionFn, CheckDescriptor, CheckError, CheckFn, Connection, ParamSpec,
    Registry, ScheduleTable, Scheduler,
};
use foursight_interchange::{ActionResult, CheckResult, CheckStatus, Kwargs};

struct Pass;

#[async_trait]
impl CheckFn for Pass {
    async fn run(
        &self,
        _conn: &Connection,
        _kwargs: &Kwargs,
        result: &mut CheckResult,
    ) -> Result<(), CheckError> {
        result.status = CheckStatus::Pass;
        Ok(())
    }
}

#[async_trait]
impl ActionFn for Pass {
    async fn run(
        &self,
        _conn: &Connection,
        _kwargs: &Kwargs,
        _result: &mut ActionResult,
    ) -> Result<(), CheckError> {
        Ok(())
    }
}

fn fixture(stage: &str) -> (Fixture, Scheduler) {
    let mut builder = Registry::builder();
    builder
        .check(
            CheckDescriptor::new("runs_to_start", Pass)
                .group("ten_min_checks")
                .action("start_runs")
                .auto_action()
                .param(ParamSpec::new("limit").default_value(50)),
        )
        .check(CheckDescriptor::new("runs_to_poll", Pass).group("ten_min_checks"))
        .check(CheckDescriptor::new("health", Pass).group("hourly_checks"))
        .action(ActionDescriptor::new("start_runs", Pass));
    let fx = Fixture::new(builder.build().unwrap(), stage);

    let mut table = ScheduleTable::new();
    table.insert("prod", "ten_min_checks", "cron(0/10 * * * ? *)").unwrap();
    table.insert("dev", "ten_min_checks", "cron(0/10 * * * ? *)").unwrap();
    table.disable("dev", "ten_min_checks");
    let scheduler = Scheduler::new(fx.ctx.clone(), table);
    (fx, scheduler)
}

#[tokio::test]
async fn firing_enqueues_one_primary_item_per_check() {
    let (fx, scheduler) = fixture("prod");
    let report = scheduler.fire("ten_min_checks").await;
    assert!(!report.disabled);
    assert_eq!(report.enqueued.len(), 2);

    let items = fx.primary_items();
    let targets: BTreeSet<&str> = items.iter().map(|i| i.target.as_str()).collect();
    assert_eq!(targets, BTreeSet::from(["runs_to_poll", "runs_to_start"]));
    assert!(items.iter().all(|i| i.kwargs.primary()));

    let uuids: BTreeSet<&str> = items.iter().filter_map(|i| i.kwargs.uuid_str()).collect();
    assert_eq!(uuids.len(), 2, "run ids must be fresh per item");

    let start = items.iter().find(|i| i.target == "runs_to_start").unwrap();
    assert_eq!(start.kwargs.queue_action(), Some("prod"));
    assert_eq!(start.kwargs.get_i64("limit"), Some(50));
    let poll = items.iter().find(|i| i.target == "runs_to_poll").unwrap();
    assert_eq!(poll.kwargs.queue_action(), None);
}

#[tokio::test]
async fn disabled_group_enqueues_nothing() {
    let (fx, scheduler) = fixture("dev");
    let report = scheduler.fire("ten_min_checks").await;
    assert!(report.disabled);
    assert!(report.enqueued.is_empty());
    assert!(fx.primary.is_empty());
}

#[tokio::test]
async fn successive_firings_get_distinct_run_ids() {
    let (fx, scheduler) = fixture("prod");
    scheduler.fire("hourly_checks").await;
    scheduler.fire("hourly_checks").await;
    let uuids: BTreeSet<String> = fx
        .primary_items()
        .iter()
        .filter_map(|i| i.kwargs.uuid_str().map(str::to_string))
        .collect();
    assert_eq!(uuids.len(), 2);
}

#[tokio::test]
async fn send_failures_are_reported_per_check() {
    let (fx, scheduler) = fixture("prod");
    fx.primary.fail_next_sends(1);
    let report = scheduler.fire("ten_min_checks").await;
    assert_eq!(report.enqueued.len(), 1);
    assert_eq!(report.failures.len(), 1);
}
