use clap::{Parser, Subcommand};

use aider_acp_agent::AgentConfig;

#[derive(Parser)]
#[command(name = "aider-acp", about = "ACP adapter for the aider CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Remaining args passed through to aider
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the ACP agent over stdio (default)
    Acp {
        /// Command used to launch aider (default: `aider`, or
        /// AIDER_ACP_COMMAND)
        #[arg(long)]
        aider_command: Option<String>,

        /// Edit format to request from aider
        /// (whole|diff|diff-fenced|udiff|editor-diff|editor-whole)
        #[arg(long)]
        edit_format: Option<String>,

        /// Remaining args passed through to aider
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol stream; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Acp {
            aider_command,
            edit_format,
            args,
        }) => {
            let config = AgentConfig::create(aider_command, edit_format, args)?;
            aider_acp_agent::run(config).await
        }
        // No subcommand: serve with any trailing args handed to aider.
        None => {
            let config = AgentConfig::create(None, None, cli.args)?;
            aider_acp_agent::run(config).await
        }
    }
}
