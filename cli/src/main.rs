//! Orbit CLI - OIDC login for the command line
//!
//! Orbit signs users in to an OpenID Connect provider with either the
//! browser-based authorization code flow or the device authorization grant,
//! and keeps per-profile tokens fresh in the OS keyring or a token file.

mod auth;
mod cli;
mod config;
mod error;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::cli::commands::{self, AuthContext};
use crate::cli::{AuthCommands, Cli, Commands};
use crate::config::settings::env;
use crate::error::Result;

/// Exit status for an interrupted command, as shells report SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so `orbit auth token` output stays pipeable.
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(env::LOG_LEVEL)
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupt received");
            on_interrupt.cancel();
        }
    });

    if let Err(e) = run(cli, &cancel).await {
        if e.is_cancelled() {
            eprintln!("Login cancelled.");
            std::process::exit(EXIT_INTERRUPTED);
        }
        eprintln!("Error: {e}");
        if e.is_retriable() {
            eprintln!("This may be a temporary problem; retrying may help.");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli, cancel: &CancellationToken) -> Result<()> {
    let ctx = AuthContext::load(cli.profile.as_deref())?;

    match cli.command {
        Commands::Auth { command } => match command {
            AuthCommands::Login {
                device,
                no_browser,
                force,
            } => commands::handle_login(&ctx, device, no_browser, force, cancel).await,
            AuthCommands::Logout => commands::handle_logout(&ctx).await,
            AuthCommands::Status => commands::handle_status(&ctx),
            AuthCommands::Token => commands::handle_token(&ctx, cancel).await,
        },
    }
}
