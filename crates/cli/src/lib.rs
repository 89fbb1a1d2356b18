pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "tollgate",
    about = "Tollgate operator CLI",
    long_about = "Operate the Tollgate approval engine: migrations, demo data, config inspection, readiness checks and timeout sweeps.",
    after_help = "Examples:\n  tollgate migrate\n  tollgate doctor --json\n  tollgate sweep --at 2026-03-04T09:00:00Z"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the demo org chart and standard purchase-order hierarchy")]
    Seed {
        #[arg(long, help = "Remove the demo dataset instead of loading it")]
        clean: bool,
    },
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, DB connectivity, schema and default hierarchy coverage")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Expire in-progress requests whose current level has timed out")]
    Sweep {
        #[arg(long, value_name = "RFC3339", help = "Evaluate timeouts as of this instant")]
        at: Option<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed { clean } => commands::seed::run(clean),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Sweep { at } => commands::sweep::run(at.as_deref()),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
