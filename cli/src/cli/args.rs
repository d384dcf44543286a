//! Command-line argument parsing.

use clap::{Parser, Subcommand};

/// Sign in to an OIDC identity provider and keep per-profile credentials fresh.
#[derive(Parser, Debug)]
#[command(name = "orbit")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Profile to operate on (defaults to the configured default profile).
    #[arg(short, long, global = true, env = "ORBIT_PROFILE")]
    pub profile: Option<String>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage authentication.
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
}

/// Authentication subcommands.
#[derive(Subcommand, Debug)]
pub enum AuthCommands {
    /// Log in to the configured identity provider.
    ///
    /// Uses the browser with a local callback by default, or the device
    /// authorization grant with --device or when no browser is available.
    Login {
        /// Use the device authorization grant.
        #[arg(long)]
        device: bool,

        /// Skip opening the browser automatically.
        #[arg(long)]
        no_browser: bool,

        /// Log in again even if a valid token is stored.
        #[arg(short, long)]
        force: bool,
    },

    /// Log out and remove stored credentials.
    Logout,

    /// Show current authentication status.
    Status,

    /// Print a valid access token, refreshing it if needed.
    Token,
}
