mod admin;
mod commands;
mod deploy;
mod logging;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use foursight_engine::Config;

use commands::{CheckArgs, CmdResult, ResultView};

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Scheduled health checks and remediation for a data portal.
#[derive(Parser)]
#[command(
    name = "foursight",
    version,
    about = "Scheduled health checks and remediation for a data portal"
)]
struct Cli {
    /// Configuration file (default: ./foursight.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Log format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler, the worker pools and the admin server
    Run {
        /// Do not start the admin HTTP server
        #[arg(long)]
        no_admin: bool,
    },

    /// Run a check now and store its result
    Check {
        /// Registered check name
        name: String,
        /// Check arguments as a JSON object
        #[arg(long)]
        kwargs: Option<String>,
        /// Also store the result as the primary result
        #[arg(long)]
        primary: bool,
        /// Run the linked action if the result calls for it
        #[arg(long)]
        queue_action: bool,
        /// Environment to run against (default: the configured default)
        #[arg(long)]
        env: Option<String>,
    },

    /// Run an action against a stored check result
    Action {
        /// Registered action name
        name: String,
        /// The check whose result drives the action
        #[arg(long)]
        check_name: String,
        /// Run id of that check result (default: its latest result)
        #[arg(long)]
        uuid: Option<String>,
        /// Environment to run against (default: the configured default)
        #[arg(long)]
        env: Option<String>,
    },

    /// Show the schedule table and when each group fires next
    Schedule {
        /// Stage to show (default: the configured stage)
        #[arg(long)]
        stage: Option<String>,
    },

    /// List configured environments
    Envs,

    /// Read stored results
    Results {
        /// Check or action name
        name: String,
        /// Show the primary result instead of the latest
        #[arg(long, conflicts_with = "history")]
        primary: bool,
        /// List every result between --from and --to
        #[arg(long)]
        history: bool,
        /// Earliest run id, inclusive
        #[arg(long, requires = "history")]
        from: Option<String>,
        /// Latest run id, inclusive
        #[arg(long, requires = "history")]
        to: Option<String>,
        /// Environment to read (default: the configured default)
        #[arg(long)]
        env: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_format);
    let output = cli.output;

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            report_error(&e.to_string(), output);
            process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            report_error(&format!("failed to create tokio runtime: {}", e), output);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(dispatch_command(cli.command, config, output)) {
        report_error(&e.to_string(), output);
        process::exit(1);
    }
}

async fn dispatch_command(command: Commands, config: Config, output: OutputFormat) -> CmdResult {
    let deployment = deploy::build(&config).await?;
    match command {
        Commands::Run { no_admin } => commands::cmd_run(deployment, &config, !no_admin).await,
        Commands::Check {
            name,
            kwargs,
            primary,
            queue_action,
            env,
        } => {
            let args = CheckArgs {
                name: &name,
                kwargs: kwargs.as_deref(),
                primary,
                queue_action,
                env,
            };
            commands::cmd_check(deployment.ctx, args, output).await
        }
        Commands::Action {
            name,
            check_name,
            uuid,
            env,
        } => {
            commands::cmd_action(
                deployment.ctx,
                &name,
                &check_name,
                uuid.as_deref(),
                env,
                output,
            )
            .await
        }
        Commands::Schedule { stage } => {
            let stage = stage.unwrap_or_else(|| config.stage.clone());
            commands::cmd_schedule(
                &deployment.schedule,
                &deployment.ctx.registry,
                &stage,
                output,
            );
            Ok(())
        }
        Commands::Envs => {
            commands::cmd_envs(&deployment.ctx, output);
            Ok(())
        }
        Commands::Results {
            name,
            primary,
            history,
            from,
            to,
            env,
        } => {
            let view = if history {
                ResultView::History { from, to }
            } else if primary {
                ResultView::Primary
            } else {
                ResultView::Latest
            };
            commands::cmd_results(&deployment.ctx, &name, view, env.as_deref(), output).await
        }
    }
}

pub(crate) fn report_error(msg: &str, output: OutputFormat) {
    match output {
        OutputFormat::Text => eprintln!("error: {}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}
