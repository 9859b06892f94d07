use facegate::{
    common::config::DEFAULT_CONFIG_PATH,
    core::{FaceAnalyzer, OnnxFaceAnalyzer},
    service::server,
    Config,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facegate")]
#[command(about = "Face and card access control servers")]
struct Cli {
    /// Enable development mode (verbose logging)
    #[arg(long, global = true)]
    dev: bool,

    /// Config file (defaults to configs/facegate.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the photo ingestion and status broadcast servers
    Serve,
    /// Run the card membership server
    Cards,
    /// Validate (and optionally recognize) a single image
    Analyze {
        image: PathBuf,
        /// Also search the identity store
        #[arg(short, long)]
        recognize: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.dev);

    let config = Config::load(cli.config.as_deref())
        .with_context(|| format!("Failed to load config (default path: {})", DEFAULT_CONFIG_PATH))?;

    match cli.command {
        Commands::Serve => {
            let analyzer = OnnxFaceAnalyzer::new(&config).context("Failed to load face models")?;
            server::run_face_servers(&config, Arc::new(analyzer)).await?;
        }
        Commands::Cards => {
            server::run_card_server(&config).await?;
        }
        Commands::Analyze { image, recognize } => {
            let analyzer = OnnxFaceAnalyzer::new(&config).context("Failed to load face models")?;

            let validation = analyzer.validate(&image);
            println!("Faces: {} ({})", validation.face_count, validation.message);

            if recognize && validation.has_face {
                println!("Result: {:?}", analyzer.recognize(&image));
            }
        }
    }

    Ok(())
}

fn setup_logging(dev_mode: bool) {
    if dev_mode {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }
}
