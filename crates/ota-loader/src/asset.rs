use crate::config::Config;
use crate::error::AssetError;
use crate::fetcher::HttpFetcher;
use crate::retry::RetryPolicy;
use crate::update::Asset;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;

/// Downloads assets, verifies their digest and places them in an update directory.
pub struct AssetFetcher<F> {
    fetcher: Arc<F>,
    headers: Arc<Vec<(String, String)>>,
    retry: RetryPolicy,
}

impl<F> Clone for AssetFetcher<F> {
    fn clone(&self) -> Self {
        Self {
            fetcher: Arc::clone(&self.fetcher),
            headers: Arc::clone(&self.headers),
            retry: self.retry.clone(),
        }
    }
}

impl<F> AssetFetcher<F>
where
    F: HttpFetcher + 'static,
{
    /// Create an asset fetcher sharing the loader's transport and configuration.
    pub fn new(fetcher: Arc<F>, config: &Config) -> Self {
        Self {
            fetcher,
            headers: Arc::new(config.headers()),
            retry: config.retry.clone(),
        }
    }

    /// Download `asset` into `dir`, verify it and return it with its local path set.
    pub async fn resolve(&self, asset: Asset, dir: &Path) -> Result<Asset, AssetError> {
        self.resolve_with(asset, dir, &CancellationToken::new()).await
    }

    async fn resolve_with(
        &self,
        mut asset: Asset,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Asset, AssetError> {
        let bytes = self.download(&asset, cancel).await?;
        if cancel.is_cancelled() {
            return Err(AssetError::Cancelled(asset.name));
        }

        let target = dir.join(file_name_for(&asset));
        let name = asset.name.clone();
        let expected = asset.expected_hash.clone();
        let dir = dir.to_path_buf();
        let destination = target.clone();

        // The write is not interruptible so the file is either persisted or removed.
        task::spawn_blocking(move || write_verified(&bytes, &dir, &destination, &name, &expected))
            .await
            .map_err(|err| AssetError::Task(format!("task join error: {err}")))??;

        asset.local_path = Some(target);
        Ok(asset)
    }

    async fn download(
        &self,
        asset: &Asset,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, AssetError> {
        let attempts = self.retry.attempts();
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(AssetError::Cancelled(asset.name.clone())),
                result = self.fetcher.fetch_bytes(&asset.url, &self.headers) => result,
            };

            match result {
                Ok(bytes) => return Ok(bytes),
                Err(source) if attempt >= attempts || !source.is_retryable() => {
                    return Err(AssetError::Fetch {
                        name: asset.name.clone(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(err) => {
                    let delay = self.retry.backoff_after(attempt);
                    tracing::warn!(
                        asset = %asset.name,
                        attempt,
                        ?delay,
                        "asset download failed, retrying: {err}"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AssetError::Cancelled(asset.name.clone())),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Resolve every asset, at most `limit` at a time.
    ///
    /// The first failure cancels the remaining downloads. The call returns only after
    /// every task has finished; files written by this call are removed on failure.
    pub async fn resolve_all(
        &self,
        assets: Vec<Asset>,
        dir: &Path,
        limit: usize,
    ) -> Result<Vec<Asset>, AssetError> {
        let cancel = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(limit.max(1)));
        let mut tasks = JoinSet::new();

        for (index, asset) in assets.into_iter().enumerate() {
            let fetcher = self.clone();
            let cancel = cancel.clone();
            let permits = Arc::clone(&permits);
            let dir = dir.to_path_buf();
            tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return (index, Err(AssetError::Cancelled(asset.name.clone()))),
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(err) => return (index, Err(AssetError::Task(err.to_string()))),
                    },
                };
                (index, fetcher.resolve_with(asset, &dir, &cancel).await)
            });
        }

        let mut resolved = Vec::new();
        let mut failure: Option<AssetError> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok((index, result)) => result.map(|asset| (index, asset)),
                Err(err) => Err(AssetError::Task(err.to_string())),
            };
            match outcome {
                Ok(entry) => resolved.push(entry),
                Err(AssetError::Cancelled(_)) => {}
                Err(err) => {
                    if failure.is_none() {
                        tracing::debug!("cancelling remaining downloads: {err}");
                        cancel.cancel();
                        failure = Some(err);
                    }
                }
            }
        }

        if let Some(err) = failure {
            remove_files(resolved.iter().filter_map(|(_, asset)| asset.local_path()));
            return Err(err);
        }

        resolved.sort_by_key(|(index, _)| *index);
        Ok(resolved.into_iter().map(|(_, asset)| asset).collect())
    }
}

/// File name used for an asset inside the update directory.
///
/// Names are derived from the content digest, keeping the extension of the logical name.
pub fn file_name_for(asset: &Asset) -> String {
    match Path::new(&asset.name).extension().and_then(|ext| ext.to_str()) {
        Some(ext) if !ext.is_empty() => format!("{}.{ext}", asset.expected_hash),
        _ => asset.expected_hash.clone(),
    }
}

/// Hex encoded SHA-256 digest of a file on disk.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Whether `path` exists and hashes to `expected`.
pub async fn verify_existing(path: &Path, expected: &str) -> bool {
    let path = path.to_path_buf();
    let expected = expected.to_ascii_lowercase();
    task::spawn_blocking(move || matches!(hash_file(&path), Ok(actual) if actual == expected))
        .await
        .unwrap_or(false)
}

/// Best-effort removal of asset files.
pub fn remove_files<'a>(paths: impl IntoIterator<Item = &'a Path>) {
    for path in paths {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!("failed to remove asset file {:?}: {}", path, err);
            }
        }
    }
}

/// Write `bytes` to a temporary file in `dir`, check the digest and move it to `target`.
fn write_verified(
    bytes: &[u8],
    dir: &Path,
    target: &Path,
    name: &str,
    expected: &str,
) -> Result<(), AssetError> {
    let io_error = |source: io::Error| AssetError::Io {
        name: name.to_string(),
        path: target.to_path_buf(),
        source,
    };

    let mut temp = NamedTempFile::new_in(dir).map_err(io_error)?;
    let mut hasher = Sha256::new();
    for chunk in bytes.chunks(64 * 1024) {
        temp.write_all(chunk).map_err(io_error)?;
        hasher.update(chunk);
    }
    temp.flush().map_err(io_error)?;

    let actual = hex::encode(hasher.finalize());
    if actual != expected {
        // Dropping `temp` removes the partial file.
        return Err(AssetError::IntegrityMismatch {
            name: name.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }

    temp.as_file().sync_all().map_err(io_error)?;
    temp.persist(target)
        .map_err(|err| io_error(err.error))?;
    Ok(())
}
