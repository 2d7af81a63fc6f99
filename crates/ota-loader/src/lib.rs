//! Over-the-air update loader with asset verification and transactional persistence.
//!
//! An [`AppLoader`] fetches a manifest from an update server, asks the caller whether
//! the described update should be downloaded, resolves every asset (download, SHA-256
//! check, atomic rename into the update directory) and commits the finished update to
//! an [`UpdateStore`]. Exactly one of the success and error callbacks fires per load.
//!
//! ```ignore
//! use ota_loader::{AppLoader, Config, SledStore};
//! use reqwest::Url;
//! use std::sync::Arc;
//!
//! # async fn demo() -> ota_loader::Result<()> {
//! let url = Url::parse("https://updates.example.com/manifest").unwrap();
//! let config = Config::new(url.clone(), "1.0.0").release_channel("production");
//! let store = Arc::new(SledStore::open("./ota/db")?);
//!
//! let known = Arc::clone(&store);
//! let loader = AppLoader::new(config, store, "./ota/assets", tokio::runtime::Handle::current())?;
//! loader.load(
//!     url,
//!     move |update| !known.has(&update.id).unwrap_or(false),
//!     |update| match update {
//!         Some(update) => println!("update {} ready", update.id),
//!         None => println!("already up to date"),
//!     },
//!     |err| eprintln!("update failed ({:?}): {err}", err.class()),
//! );
//! # Ok(())
//! # }
//! ```

mod asset;
mod config;
mod error;
mod fetcher;
mod loader;
mod manifest;
mod retry;
mod store;
mod update;

pub use asset::{file_name_for, hash_file, AssetFetcher};
pub use config::{Config, RELEASE_CHANNEL_HEADER, RUNTIME_VERSION_HEADER};
pub use error::{
    AssetError, ErrorClass, LoaderError, ManifestError, Result, StoreError, TransportError,
};
pub use fetcher::{HttpClient, HttpClientBuilder, HttpFetcher};
pub use loader::{AppLoader, LoadStage};
pub use manifest::{ManifestAsset, ManifestFetcher, SignedManifest, UpdateManifest};
pub use retry::RetryPolicy;
pub use store::{CommitOutcome, SledStore, UpdateStore};
pub use update::{Asset, Update, UpdateStatus};
