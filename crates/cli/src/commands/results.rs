use foursight_engine::Context;
use foursight_interchange::RunId;
use serde_json::{json, Value};
use time::OffsetDateTime;

use super::{field, print_json, print_record, CmdResult};
use crate::OutputFormat;

/// Which stored records to read.
pub(crate) enum ResultView {
    Latest,
    Primary,
    History {
        from: Option<String>,
        to: Option<String>,
    },
}

pub(crate) async fn cmd_results(
    ctx: &Context,
    name: &str,
    view: ResultView,
    env: Option<&str>,
    output: OutputFormat,
) -> CmdResult {
    let environment = ctx.environment(env)?;
    let store = ctx.results(&environment.name)?;

    let (from, to) = match view {
        ResultView::Latest => return show_one(store.get_latest(name).await?, name, output),
        ResultView::Primary => return show_one(store.get_primary(name).await?, name, output),
        ResultView::History { from, to } => (from, to),
    };

    let from = match from {
        Some(text) => RunId::parse(&text)?,
        None => RunId::from_datetime(OffsetDateTime::UNIX_EPOCH),
    };
    let to = match to {
        Some(text) => RunId::parse(&text)?,
        None => RunId::now(),
    };
    let records = store
        .list_between::<Value>(name, &from, &to)
        .await?
        .collect()
        .await?;

    match output {
        OutputFormat::Json => print_json(&json!({ "name": name, "results": records })),
        OutputFormat::Text => {
            if records.is_empty() {
                println!("no results for '{}' between {} and {}", name, from, to);
            }
            for record in &records {
                println!(
                    "{} [{}] {}",
                    field(record, "uuid"),
                    field(record, "status"),
                    field(record, "summary")
                );
            }
        }
    }
    Ok(())
}

fn show_one(record: Option<Value>, name: &str, output: OutputFormat) -> CmdResult {
    match record {
        Some(record) => {
            print_record(&record, output);
            Ok(())
        }
        None => Err(format!("no result for '{}'", name).into()),
    }
}
