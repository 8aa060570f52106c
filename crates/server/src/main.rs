//! NetControl terminal server
//!
//! Serves browser shell sessions over WebSocket.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use server::client::ApiClient;
use server::config::{default_config_path, Config, EnvOverride};
use server::{logging, Server};

/// NetControl terminal server - browser shell sessions over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "netcontrol-server")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute (defaults to `serve`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the terminal server
    Serve,

    /// Inspect or control sessions of a running server
    Sessions {
        /// Server base URL (default: http://127.0.0.1:<configured port>)
        #[arg(long, global = true)]
        url: Option<String>,

        #[command(subcommand)]
        command: SessionsCommands,
    },

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show details of a session
    Info {
        /// Session ID
        session_id: String,
    },

    /// Resize a session's terminal
    Resize {
        /// Session ID
        session_id: String,

        /// Terminal rows
        #[arg(long)]
        rows: u16,

        /// Terminal columns
        #[arg(long)]
        cols: u16,
    },

    /// Close a session
    Close {
        /// Session ID
        session_id: String,
    },
}

/// Subcommands for the configuration file.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    let config_found = config_path.exists();
    let mut config = Config::load(&config_path)?;
    let overrides = config.apply_env_overrides();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            config.validate()?;

            let level = if cli.verbose {
                "debug"
            } else {
                config.server.log_level.as_str()
            };
            let _guard = logging::init(level, config.server.log_dir.as_deref())?;
            if !config_found {
                tracing::debug!("Config file not found at {:?}, using defaults", config_path);
            }
            for env_override in &overrides {
                env_override.log();
            }

            tracing::info!(
                config = %config_path.display(),
                address = %config.bind_addr(),
                "NetControl terminal server starting"
            );
            Server::new(config).run().await?;
        }
        Commands::Sessions { url, command } => {
            report_overrides(&overrides);
            let url = url.unwrap_or_else(|| format!("http://127.0.0.1:{}", config.server.port));
            run_sessions_command(&url, command).await?;
        }
        Commands::Config(command) => match command {
            ConfigCommands::Init { force } => {
                if config_path.exists() && !force {
                    anyhow::bail!(
                        "Config file already exists: {} (use --force to overwrite)",
                        config_path.display()
                    );
                }
                Config::default().save(&config_path)?;
                println!("Wrote {}", config_path.display());
            }
            ConfigCommands::Show => {
                report_overrides(&overrides);
                print!("{}", config.to_toml()?);
            }
        },
    }

    Ok(())
}

/// Commands other than `serve` run without a subscriber, so rejected
/// overrides go straight to stderr.
fn report_overrides(overrides: &[EnvOverride]) {
    for env_override in overrides {
        if let EnvOverride::Ignored { var, value, reason } = env_override {
            eprintln!("warning: ignoring invalid {var} in environment ({value}): {reason}");
        }
    }
}

async fn run_sessions_command(url: &str, command: SessionsCommands) -> anyhow::Result<()> {
    let client = ApiClient::new(url)?;

    match command {
        SessionsCommands::List { json } => {
            let sessions = client.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("No active sessions.");
            } else {
                for id in sessions {
                    println!("{}", id);
                }
            }
        }
        SessionsCommands::Info { session_id } => {
            let session = client.info(&session_id).await?;
            println!("Session:  {}", session.id);
            println!(
                "  PID:      {}",
                session
                    .pid
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            println!("  Size:     {}x{}", session.rows, session.cols);
            println!("  State:    {}", session.state);
            println!("  Attached: {}", if session.attached { "yes" } else { "no" });
        }
        SessionsCommands::Resize {
            session_id,
            rows,
            cols,
        } => {
            client.resize(&session_id, rows, cols).await?;
            println!("Session {} resized to {}x{}", session_id, rows, cols);
        }
        SessionsCommands::Close { session_id } => {
            client.close(&session_id).await?;
            println!("Session {} closed", session_id);
        }
    }

    Ok(())
}
