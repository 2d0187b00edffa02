//! workspace-status: hook-side client for the workspace status daemon.
//!
//! ## Subcommands
//!
//! - `send`: report one hook event (called from assistant hooks)
//! - `list`: print the current status of every known workspace
//! - `watch`: stream status changes as JSON lines

mod client;
mod logging;

use clap::{Parser, Subcommand};
use workspace_status_protocol::{EventVerb, StatusLine, WorkspaceStatus};

#[derive(Parser)]
#[command(name = "workspace-status")]
#[command(about = "Report and inspect assistant activity per workspace")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one status event to the daemon
    Send {
        /// Workspace name the event belongs to
        #[arg(value_name = "WORKSPACE")]
        workspace: String,

        /// Event verb (session_start, working, post_tool, stop, notification, session_end)
        #[arg(value_name = "VERB")]
        verb: String,

        /// Verb-specific arguments (session id, tool name, notification type and message)
        #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Exit non-zero when the daemon cannot be reached
        #[arg(long)]
        strict: bool,
    },

    /// Print the status of every known workspace
    List {
        /// Print the raw JSON array instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print each status change as a JSON line until interrupted
    Watch,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Send {
            workspace,
            verb,
            args,
            strict,
        } => {
            if EventVerb::from_wire(&verb).is_none() {
                tracing::warn!(verb = %verb, "Sending unrecognized verb; daemon will ignore it");
            }
            let line = StatusLine::new(workspace, verb, args);
            // Hooks must never block the assistant, so failures are only logged by default.
            if let Err(e) = client::send_with_retry(&line) {
                tracing::warn!(error = %e, workspace = %line.workspace, "workspace-status send failed");
                if strict {
                    eprintln!("workspace-status: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::List { json } => match client::fetch_all_statuses() {
            Ok(statuses) => print_statuses(&statuses, json),
            Err(e) => {
                tracing::error!(error = %e, "workspace-status list failed");
                eprintln!("workspace-status: {e}");
                std::process::exit(1);
            }
        },
        Commands::Watch => {
            let result = client::watch(|status| {
                match serde_json::to_string(&status) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "Failed to encode status change"),
                }
                true
            });
            if let Err(e) = result {
                tracing::error!(error = %e, "workspace-status watch failed");
                eprintln!("workspace-status: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn print_statuses(statuses: &[WorkspaceStatus], json: bool) {
    if json {
        match serde_json::to_string_pretty(statuses) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("workspace-status: failed to encode statuses: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    for status in statuses {
        println!("{}", format_row(status));
    }
}

fn format_row(status: &WorkspaceStatus) -> String {
    let detail = if !status.tool_name.is_empty() {
        status.tool_name.clone()
    } else if !status.wait_message.is_empty() {
        format!("{}: {}", status.wait_reason, status.wait_message)
    } else {
        status.wait_reason.clone()
    };
    format!("{}\t{}\t{}", status.workspace, status.state, detail)
        .trim_end()
        .to_string()
}
