use clap::{Parser, Subcommand};

/// Subgate — subscription feed server for proxied endpoints
#[derive(Parser)]
#[command(name = "subgate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the feed server
    Serve {
        /// Port to bind (overrides SUBGATE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run one traffic anomaly scan and print the flags
    Scan {
        /// Trailing window to scan, in days
        #[arg(long, default_value = "30")]
        window_days: i64,
    },

    /// Manage subscription grants
    Grant {
        #[command(subcommand)]
        command: GrantCommands,
    },

    /// Manage proxy endpoints
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },
}

#[derive(Subcommand)]
pub enum GrantCommands {
    /// Create a grant and print its token and subscription URL
    Create {
        #[arg(long)]
        owner: i64,
        /// Grant lifetime in days
        #[arg(long, default_value = "30")]
        days: i64,
        #[arg(long, default_value = "Main")]
        name: String,
        #[arg(long, default_value = "5")]
        device_limit: i32,
        /// Short test grant; lifetime comes from SUBGATE_TEST_HOURS
        #[arg(long)]
        test: bool,
    },
    /// List grants
    List,
    /// Revoke a grant by token (soft; the row is kept)
    Revoke {
        #[arg(long)]
        token: String,
    },
}

#[derive(Subcommand)]
pub enum ServerCommands {
    /// Register a proxy endpoint
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value = "vless")]
        protocol: String,
        /// Management API base URL for this endpoint
        #[arg(long)]
        api_url: Option<String>,
        #[arg(long, default_value = "100")]
        capacity: i32,
    },
    /// List endpoints
    List,
}
