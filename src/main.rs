use clap::{Parser, Subcommand};
use ingestor::cli::load::LoadOptions;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ingestor")]
#[command(about = "Buffered metric ingestion service", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Send synthetic metrics to a running ingestor
    Load {
        #[arg(long, default_value = "http://127.0.0.1:7300")]
        url: String,

        #[arg(long, default_value_t = 100)]
        count: usize,

        #[arg(long, default_value_t = 8)]
        concurrency: usize,

        /// Defaults to this machine's hostname
        #[arg(long)]
        source_name: Option<String>,

        #[arg(long, default_value = "load_test")]
        metric_name: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
    Validate,
}

// `run` builds its own runtime with a bounded shutdown.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ingestor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = ingestor::config::resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run) | None => {
            ingestor::cli::run::run(config_path)?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                ingestor::cli::config::init(stdout)?;
            }
            ConfigAction::Validate => {
                ingestor::cli::config::validate(config_path)?;
            }
        },
        Some(Commands::Load {
            url,
            count,
            concurrency,
            source_name,
            metric_name,
        }) => {
            let runtime = tokio::runtime::Runtime::new()?;
            let report = runtime.block_on(ingestor::cli::load::run(LoadOptions {
                url,
                count,
                concurrency,
                source_name,
                metric_name,
            }))?;
            println!(
                "accepted: {}  rejected: {}  failed: {}",
                report.accepted, report.rejected, report.failed
            );
        }
    }

    Ok(())
}
