//! SBDots actions client
//!
//! Sends one action to the daemon and prints what comes back. Long-running
//! actions keep printing status lines until the daemon closes the connection,
//! which is what a status bar `exec` module expects.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use sbdots_daemon::ActionRegistry;
use sbdots_ipc::{ActionRequest, ClientError, send_request, socket_path};

/// Run an SBDots action through the actions daemon
#[derive(Parser, Debug)]
#[command(name = "sbdots-actionsc")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Action to run
    #[arg(required_unless_present = "list")]
    action: Option<String>,

    /// Arguments passed to the action
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// List known actions and exit
    #[arg(long)]
    list: bool,

    /// Custom socket path
    #[arg(long, value_name = "PATH")]
    socket_path: Option<PathBuf>,
}

fn print_actions(registry: &ActionRegistry) {
    for descriptor in registry.descriptors() {
        println!("{:<24} {}", descriptor.identifier(), descriptor.mode());
    }
}

async fn run(cli: Cli, registry: &ActionRegistry) -> Result<ExitCode> {
    let Some(action) = cli.action.filter(|_| !cli.list) else {
        print_actions(registry);
        return Ok(ExitCode::SUCCESS);
    };

    if !registry.contains(&action) {
        eprintln!("Invalid action: {action}");
        eprintln!("Available actions: {}", registry.identifiers().join(", "));
        return Ok(ExitCode::FAILURE);
    }

    let path = cli.socket_path.unwrap_or_else(socket_path);
    let request = ActionRequest::new(action, cli.args);

    let mut replies = match send_request(&path, &request).await {
        Ok(replies) => replies,
        Err(ClientError::NotRunning(path)) => {
            eprintln!("Could not connect to the actions daemon at {}", path.display());
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e).context("Failed to send request"),
    };

    let mut stdout = std::io::stdout();
    while let Some(line) = replies.next().await {
        let line = line.context("Failed to read reply")?;
        writeln!(stdout, "{line}")?;
        stdout.flush()?;
    }

    Ok(ExitCode::SUCCESS)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let registry = ActionRegistry::builtin().context("Failed to load actions")?;
    run(cli, &registry).await
}
