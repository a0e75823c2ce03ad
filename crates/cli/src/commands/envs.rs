use foursight_engine::Context;
use serde_json::{json, Value};

use super::print_json;
use crate::admin::describe_environment;
use crate::OutputFormat;

pub(crate) fn cmd_envs(ctx: &Context, output: OutputFormat) {
    let default = ctx.environments.default_name();
    match output {
        OutputFormat::Json => {
            let envs: Vec<Value> = ctx
                .environments
                .iter()
                .map(|env| describe_environment(env, default == Some(env.name.as_str())))
                .collect();
            print_json(&json!({ "environments": envs }));
        }
        OutputFormat::Text => {
            if ctx.environments.is_empty() {
                println!("no environments configured");
                return;
            }
            for env in ctx.environments.iter() {
                let marker = if default == Some(env.name.as_str()) { "*" } else { " " };
                println!("{} {:<16} {}", marker, env.name, env.api_url);
            }
        }
    }
}
