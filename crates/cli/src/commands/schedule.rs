use foursight_engine::{Registry, ScheduleTable};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::print_json;
use crate::OutputFormat;

/// The schedule table of `stage` with the next firing of each group.
pub(crate) fn cmd_schedule(
    table: &ScheduleTable,
    registry: &Registry,
    stage: &str,
    output: OutputFormat,
) {
    let now = OffsetDateTime::now_utc();
    let rows: Vec<Value> = table
        .entries(stage)
        .iter()
        .map(|entry| {
            let disabled = table.is_disabled(stage, &entry.group);
            let next = if disabled {
                None
            } else {
                table
                    .next_firing(stage, &entry.group, now)
                    .and_then(|t| t.format(&Rfc3339).ok())
            };
            let checks: Vec<String> = registry
                .checks_in_group(&entry.group)
                .iter()
                .map(|c| c.name.clone())
                .collect();
            json!({
                "group": entry.group,
                "expression": entry.expression,
                "disabled": disabled,
                "next": next,
                "checks": checks,
            })
        })
        .collect();

    match output {
        OutputFormat::Json => print_json(&json!({ "stage": stage, "groups": rows })),
        OutputFormat::Text => {
            if rows.is_empty() {
                println!("no schedules for stage '{}'", stage);
                return;
            }
            println!("stage {}", stage);
            for row in &rows {
                let next = match (&row["disabled"], row["next"].as_str()) {
                    (Value::Bool(true), _) => "disabled".to_string(),
                    (_, Some(next)) => format!("next {}", next),
                    (_, None) => "never".to_string(),
                };
                println!(
                    "  {:<16} {:<28} {} ({} checks)",
                    row["group"].as_str().unwrap_or(""),
                    row["expression"].as_str().unwrap_or(""),
                    next,
                    row["checks"].as_array().map(Vec::len).unwrap_or(0)
                );
            }
        }
    }
}
