use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use oncall_watch::core::settings::Settings;
use std::io;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod daemon;

#[derive(Parser)]
#[command(name = "oncall-watch")]
#[command(
    author,
    version,
    about = "Self-refreshing poll cache for PagerDuty on-call and incident data"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the polling daemon
    Daemon,

    /// Fetch everything once and show the current status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Report unknown instead of good when no data could be fetched
        #[arg(long)]
        require_data: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn default_filter(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

fn init_logging(debug: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(debug)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon => {
            let settings = Settings::load()?;
            init_logging(settings.debug);
            daemon::run(settings).await
        }
        Commands::Status { json, require_data } => {
            let settings = Settings::load()?;
            init_logging(settings.debug);
            cli::status::run(settings, json, require_data).await
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    }
}
