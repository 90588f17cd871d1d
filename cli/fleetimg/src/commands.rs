//! CLI commands.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::info;

use fleetimage_manager::{Config, ImageManager};

/// Fetch, cache and stage device images.
#[derive(Debug, Parser)]
#[command(name = "fleetimg")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download a device image, serving from the cache when fresh.
    Get {
        /// Device type slug.
        slug: String,

        /// Destination file for the image bytes.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Download a device image and stage it at a temporary location.
    ///
    /// Archives are extracted into a directory, other images are copied to
    /// a file. Prints the staging path; deleting it is up to you.
    Stage {
        /// Device type slug.
        slug: String,
    },

    /// Purge the image cache, forcing the next download to re-fetch.
    Clean,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = Config::from_env()?;
        let manager = ImageManager::from_config(config)?;

        match self.command {
            Commands::Get { slug, output } => get(&manager, &slug, &output).await,
            Commands::Stage { slug } => stage(&manager, &slug).await,
            Commands::Clean => {
                manager.clean_cache().await?;
                info!("image cache cleaned");
                Ok(())
            }
        }
    }
}

async fn get(manager: &ImageManager, slug: &str, output: &Path) -> Result<()> {
    let mut handle = manager.get(slug).await?;

    if let Some(mut progress) = handle.take_progress() {
        tokio::spawn(async move {
            let mut last_logged = 0u8;
            while let Some(event) = progress.recv().await {
                match event.percentage {
                    Some(percent) if percent >= last_logged.saturating_add(10) => {
                        info!(percent, bytes = event.bytes_received, "downloading");
                        last_logged = percent;
                    }
                    _ => {}
                }
            }
        });
    }

    let mut file = File::create(output)
        .await
        .with_context(|| format!("creating {}", output.display()))?;

    let mut written = 0u64;
    while let Some(chunk) = handle.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    info!(bytes = written, path = %output.display(), "image written");
    Ok(())
}

async fn stage(manager: &ImageManager, slug: &str) -> Result<()> {
    let handle = manager.get(slug).await?;
    let staged = manager.stage(handle).await?;

    println!("{}", staged.display());
    Ok(())
}
