use crate::asset::{self, AssetFetcher};
use crate::config::Config;
use crate::error::{LoaderError, Result, StoreError};
use crate::fetcher::{HttpClient, HttpFetcher};
use crate::manifest::ManifestFetcher;
use crate::store::{CommitOutcome, UpdateStore};
use crate::update::{Asset, Update, UpdateStatus};
use reqwest::Url;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::task::{self, JoinHandle};

/// Stages a load passes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    /// Requesting and validating the manifest.
    FetchingManifest,
    /// Waiting for the caller's decision.
    AwaitingDecision,
    /// Resolving assets.
    DownloadingAssets,
    /// Writing the update to the store.
    Committing,
    /// Finished, successfully or not.
    Done,
}

impl LoadStage {
    /// Whether `next` may follow `self`.
    pub fn can_advance_to(self, next: LoadStage) -> bool {
        use LoadStage::*;
        matches!(
            (self, next),
            (FetchingManifest, AwaitingDecision)
                | (AwaitingDecision, DownloadingAssets)
                | (DownloadingAssets, Committing)
                | (_, Done)
        ) && self != Done
    }
}

struct StageTracker {
    stage: LoadStage,
    url: Url,
}

impl StageTracker {
    fn new(url: &Url) -> Self {
        Self {
            stage: LoadStage::FetchingManifest,
            url: url.clone(),
        }
    }

    fn advance(&mut self, next: LoadStage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "invalid load transition {:?} -> {:?}",
            self.stage,
            next
        );
        tracing::debug!(url = %self.url, from = ?self.stage, to = ?next, "load stage");
        self.stage = next;
    }
}

/// Loads one update from an update server into the local store.
///
/// A loader is single use: [`AppLoader::load`] and [`AppLoader::run`] consume it, so a
/// decision callback cannot start a second load on the same instance.
pub struct AppLoader<F, S> {
    config: Arc<Config>,
    store: Arc<S>,
    directory: PathBuf,
    completion: Handle,
    fetcher: Arc<F>,
}

impl<S> AppLoader<HttpClient, S>
where
    S: UpdateStore + 'static,
{
    /// Create a loader that keeps assets under [`Config::assets_directory`].
    pub fn from_config(config: Config, store: Arc<S>, completion: Handle) -> Result<Self> {
        let directory = config.assets_directory();
        Self::new(config, store, directory, completion)
    }

    /// Create a loader using a default reqwest client.
    ///
    /// Assets are written below `directory`, which takes precedence over
    /// `config.update_directory`. Callbacks run on a task spawned onto `completion`.
    pub fn new(
        config: Config,
        store: Arc<S>,
        directory: impl Into<PathBuf>,
        completion: Handle,
    ) -> Result<Self> {
        let client = HttpClient::builder()
            .build()
            .map_err(|err| LoaderError::config(format!("http client: {err}")))?;
        Self::with_fetcher(config, store, directory, completion, client)
    }
}

impl<F, S> AppLoader<F, S>
where
    F: HttpFetcher + 'static,
    S: UpdateStore + 'static,
{
    /// Create a loader with a custom transport.
    pub fn with_fetcher(
        config: Config,
        store: Arc<S>,
        directory: impl Into<PathBuf>,
        completion: Handle,
        fetcher: F,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            store,
            directory: directory.into(),
            completion,
            fetcher: Arc::new(fetcher),
        })
    }

    /// Start loading the update described by the manifest at `url`.
    ///
    /// Returns immediately. `on_manifest` decides whether the update is downloaded;
    /// afterwards exactly one of `on_success` and `on_error` is called, once all network
    /// and disk work for this load has finished. `on_success(None)` means the caller
    /// declined the update. Dropping the returned handle does not cancel the load.
    pub fn load<M, OnSuccess, OnError>(
        self,
        url: Url,
        on_manifest: M,
        on_success: OnSuccess,
        on_error: OnError,
    ) -> JoinHandle<()>
    where
        M: FnOnce(&Update) -> bool + Send + 'static,
        OnSuccess: FnOnce(Option<Update>) + Send + 'static,
        OnError: FnOnce(LoaderError) + Send + 'static,
    {
        let completion = self.completion.clone();
        completion.spawn(async move {
            match self.run(url, on_manifest).await {
                Ok(update) => on_success(update),
                Err(err) => {
                    tracing::warn!(class = ?err.class(), "update load failed: {err}");
                    on_error(err)
                }
            }
        })
    }

    /// The load operation as a future: manifest, decision, assets, commit.
    pub async fn run<M>(self, url: Url, on_manifest: M) -> Result<Option<Update>>
    where
        M: FnOnce(&Update) -> bool,
    {
        let mut stage = StageTracker::new(&url);
        if !self.config.is_allowed(&url) {
            stage.advance(LoadStage::Done);
            return Err(LoaderError::DisallowedUrl(url.to_string()));
        }

        let manifests = ManifestFetcher::new(Arc::clone(&self.fetcher), Arc::clone(&self.config))?;
        let update = match manifests.fetch_manifest(&url).await {
            Ok(update) => update,
            Err(err) => {
                stage.advance(LoadStage::Done);
                return Err(err.into());
            }
        };

        stage.advance(LoadStage::AwaitingDecision);
        let accepted = panic::catch_unwind(AssertUnwindSafe(|| on_manifest(&update)))
            .map_err(|_| LoaderError::DecisionPanicked)?;
        if !accepted {
            tracing::debug!(update_id = %update.id, "update declined");
            stage.advance(LoadStage::Done);
            return Ok(None);
        }

        if let Some(existing) = self.with_store({
            let id = update.id.clone();
            move |store| store.get(&id)
        })
        .await?
        {
            tracing::debug!(update_id = %existing.id, "update already in store");
            stage.advance(LoadStage::Done);
            return Ok(Some(existing));
        }

        stage.advance(LoadStage::DownloadingAssets);
        let (update, staging) = self.resolve_assets(update).await?;

        // Dropping `staging` removes every file this load wrote; it is only kept once the
        // record referencing it has been inserted.
        stage.advance(LoadStage::Committing);
        let (update, outcome) = self.commit(update).await?;
        if outcome == CommitOutcome::Inserted {
            if let Some(staging) = staging {
                let kept = staging.keep();
                tracing::debug!(update_id = %update.id, path = ?kept, "assets kept");
            }
        }
        stage.advance(LoadStage::Done);
        Ok(Some(update))
    }

    /// Resolve every asset, reusing verified copies already known to the store.
    ///
    /// Downloads land in a directory private to this load, returned alongside the update;
    /// it is `None` when nothing had to be downloaded.
    async fn resolve_assets(&self, mut update: Update) -> Result<(Update, Option<TempDir>)> {
        tokio::fs::create_dir_all(&self.directory).await?;

        let mut pending = Vec::new();
        for (index, asset) in update.assets.iter_mut().enumerate() {
            match self.reusable_copy(asset).await? {
                Some(path) => {
                    tracing::debug!(asset = %asset.name, path = ?path, "reusing stored asset");
                    asset.local_path = Some(path);
                }
                None => pending.push((index, asset.clone())),
            }
        }
        if pending.is_empty() {
            return Ok((update, None));
        }

        let staging = tempfile::Builder::new()
            .prefix(&staging_prefix(&update.id))
            .tempdir_in(&self.directory)?;
        let (indices, to_fetch): (Vec<usize>, Vec<Asset>) = pending.into_iter().unzip();
        let fetched = AssetFetcher::new(Arc::clone(&self.fetcher), &self.config)
            .resolve_all(to_fetch, staging.path(), self.config.max_concurrent_downloads)
            .await?;

        for (index, asset) in indices.into_iter().zip(fetched) {
            update.assets[index] = asset;
        }
        Ok((update, Some(staging)))
    }

    async fn reusable_copy(&self, asset: &Asset) -> Result<Option<PathBuf>> {
        let hash = asset.expected_hash.clone();
        let stored = self.with_store(move |store| store.asset_by_hash(&hash)).await?;
        let Some(path) = stored.and_then(|stored| stored.local_path) else {
            return Ok(None);
        };
        if asset::verify_existing(&path, &asset.expected_hash).await {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }

    async fn commit(&self, mut update: Update) -> Result<(Update, CommitOutcome)> {
        let record = update.clone();
        let outcome = self.with_store(move |store| store.commit(&record)).await?;
        update.status = UpdateStatus::Ready;
        if outcome == CommitOutcome::Inserted {
            return Ok((update, outcome));
        }

        // Another load committed the same id first; report the stored record.
        let id = update.id.clone();
        let stored = self.with_store(move |store| store.get(&id)).await?;
        Ok((stored.unwrap_or(update), outcome))
    }

    async fn with_store<T, Op>(&self, op: Op) -> Result<T>
    where
        T: Send + 'static,
        Op: FnOnce(&S) -> std::result::Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let value = task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| LoaderError::Task(format!("task join error: {err}")))??;
        Ok(value)
    }
}

/// Directory name prefix for a load's downloads, derived from the update id.
fn staging_prefix(id: &str) -> String {
    let mut prefix: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(32)
        .collect();
    prefix.push('-');
    prefix
}
