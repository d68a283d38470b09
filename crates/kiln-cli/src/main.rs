//! Thin command-line shell over the build engine: wiring, logging and an
//! exit code. Everything else lives in the library crates.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kiln_data_build::{BuildEvent, ProjectBuilder};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[clap(name = "kiln")]
#[clap(about = "Incremental content build pipeline", version, author)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build every package of a project, or a single one
    #[clap(name = "build")]
    Build {
        /// Project root directory.
        project: PathBuf,
        /// Only build the named package.
        #[clap(long)]
        package: Option<String>,
    },
}

fn log_events(mut events: mpsc::UnboundedReceiver<BuildEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                BuildEvent::Start { package, platform } => {
                    info!("building '{package}' for '{platform}'");
                }
                BuildEvent::Compile { source } => info!("compiling {}", source.display()),
                BuildEvent::Success { source, outputs } => {
                    info!("built {} ({} output(s))", source.display(), outputs);
                }
                BuildEvent::Ignore { source, reason } => {
                    info!("skipped {} ({reason})", source.display());
                }
                BuildEvent::Error { source, errors } => {
                    error!("failed {}: {}", source.display(), errors.join("; "));
                }
                BuildEvent::Finish {
                    package,
                    platform,
                    counts,
                    success,
                } => {
                    info!(
                        "finished '{package}' for '{platform}': {} built, {} skipped, {} error(s), success = {success}",
                        counts.succeeded, counts.skipped, counts.errors
                    );
                }
            }
        }
    });
}

async fn run(command: Commands) -> Result<bool, Box<dyn std::error::Error>> {
    match command {
        Commands::Build { project, package } => {
            let mut builder = ProjectBuilder::open(&project).await?;

            let package_names = match package {
                Some(name) => vec![name],
                None => builder.package_names(),
            };

            let mut success = true;
            for name in package_names {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                log_events(events_rx);
                let summary = builder
                    .package_builder(&name)?
                    .with_events(events_tx)
                    .build()
                    .await?;
                success &= summary.success;
            }

            builder.dispose().await?;
            Ok(success)
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    std::process::exit(match run(cli.command).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            warn!("build aborted: {e}");
            2
        }
    });
}
