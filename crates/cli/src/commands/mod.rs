//! Subcommand implementations and shared output helpers.

mod envs;
mod invoke;
mod results;
mod run;
mod schedule;

use serde_json::Value;

use crate::OutputFormat;

pub(crate) use envs::cmd_envs;
pub(crate) use invoke::{cmd_action, cmd_check, CheckArgs};
pub(crate) use results::{cmd_results, ResultView};
pub(crate) use run::cmd_run;
pub(crate) use schedule::cmd_schedule;

pub(crate) type CmdResult = Result<(), Box<dyn std::error::Error>>;

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

/// One stored check or action result.
fn print_record(record: &Value, output: OutputFormat) {
    match output {
        OutputFormat::Json => print_json(record),
        OutputFormat::Text => {
            println!(
                "{} [{}] {}",
                field(record, "name"),
                field(record, "status"),
                field(record, "uuid")
            );
            for key in ["summary", "description"] {
                let text = field(record, key);
                if !text.is_empty() {
                    println!("  {}", text);
                }
            }
            // Checks carry brief_output, actions carry output.
            for key in ["brief_output", "output"] {
                if let Some(value) = record.get(key).filter(|v| !v.is_null()) {
                    println!("  {}: {}", key, value);
                }
            }
        }
    }
}

fn field<'a>(record: &'a Value, key: &str) -> &'a str {
    record.get(key).and_then(Value::as_str).unwrap_or("")
}
