//! Command-line front end for the update loader.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use ota_loader::{AppLoader, Config, SledStore, Update, UpdateStore};
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch the manifest and download the update if it is new
    Load {
        /// Manifest URL (defaults to the configured update URL)
        #[arg(long)]
        url: Option<String>,
    },
    /// Print the latest stored update
    Latest,
    /// List every stored update
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let store = Arc::new(
        SledStore::open(config.database_path()).context("failed to open store")?,
    );

    match cli.command {
        Commands::Load { url } => {
            let url = match url {
                Some(raw) => Url::parse(&raw).context("invalid manifest url")?,
                None => config.update_url.clone(),
            };
            match load(config, store, url).await? {
                Some(update) => print_update(&update),
                None => println!("No update needed"),
            }
        }
        Commands::Latest => match store.latest()? {
            Some(update) => print_update(&update),
            None => println!("No stored update"),
        },
        Commands::List => {
            for update in store.list()? {
                print_update(&update);
            }
        }
    }

    Ok(())
}

async fn load(
    config: Config,
    store: Arc<SledStore>,
    url: Url,
) -> Result<Option<Update>> {
    let known = Arc::clone(&store);
    let loader = AppLoader::from_config(config, store, tokio::runtime::Handle::current())?;

    let (tx, rx) = oneshot::channel();
    let error_tx = Arc::new(std::sync::Mutex::new(Some(tx)));
    let success_tx = Arc::clone(&error_tx);

    loader.load(
        url,
        move |update| {
            let stored = known.has(&update.id).unwrap_or(false);
            tracing::info!(update_id = %update.id, stored, "manifest received");
            !stored
        },
        move |update| {
            if let Some(tx) = success_tx.lock().ok().and_then(|mut tx| tx.take()) {
                let _ = tx.send(Ok(update));
            }
        },
        move |err| {
            if let Some(tx) = error_tx.lock().ok().and_then(|mut tx| tx.take()) {
                let _ = tx.send(Err(err));
            }
        },
    );

    rx.await
        .map_err(|_| anyhow!("loader finished without reporting a result"))?
        .map_err(Into::into)
}

fn print_update(update: &Update) {
    println!(
        "{}  created={}  runtime={}  channel={}  assets={}",
        update.id,
        update.created_at,
        update.runtime_version,
        update.release_channel,
        update.assets.len()
    );
    for asset in &update.assets {
        let marker = if asset.is_launch_asset { "*" } else { " " };
        match asset.local_path() {
            Some(path) => println!("  {marker} {} -> {}", asset.name, path.display()),
            None => println!("  {marker} {} (unresolved)", asset.name),
        }
    }
}
