mod cmd_config;
mod cmd_report;
mod cmd_rules;
mod cmd_run;
mod cmd_serve;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mend",
    version,
    about = "Repair failing verification rules with a coding agent"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server (progress stream, abort, rule helpers)
    Serve {
        /// Address to bind (default: 127.0.0.1, or MEND_HOST)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (default: 7676, or MEND_PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Workflow config file (YAML or JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run one workflow headless; Ctrl+C aborts
    Run {
        /// Run request JSON file (`-` for stdin)
        request: PathBuf,
        /// Workflow config file (YAML or JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// List the failing rules of a rule tree
    Rules {
        /// Rule tree JSON file
        tree: PathBuf,
        /// Output failed rules and summary as JSON
        #[arg(long)]
        json: bool,
        /// Output a run request for `mend run` instead
        #[arg(long, conflicts_with = "json")]
        request: bool,
        /// Base prompt for the generated run request
        #[arg(long, default_value = "")]
        base_prompt: String,
    },
    /// Render rule analyses as a markdown report
    Report {
        /// Analyses JSON file: `[{rule, analysis}]` or `{title, analyses}`
        analyses: PathBuf,
        /// Report title
        #[arg(long)]
        title: Option<String>,
    },
    /// Print the effective workflow configuration as YAML
    Config {
        /// Workflow config file (YAML or JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.cmd {
        Command::Serve { bind, port, config } => cmd_serve::execute(bind, port, config.as_deref()),
        Command::Run {
            request,
            config,
            json,
        } => cmd_run::execute(&request, config.as_deref(), json),
        Command::Rules {
            tree,
            json,
            request,
            base_prompt,
        } => cmd_rules::execute(&tree, json, request.then_some(base_prompt.as_str())),
        Command::Report { analyses, title } => cmd_report::execute(&analyses, title.as_deref()),
        Command::Config { config } => cmd_config::execute(config.as_deref()),
    }
}

/// Logs go to stderr; stdout carries command output and headless events.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mend=info,mend_conductor=info,mend_serve=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
