//! Loader configuration.

use crate::error::{LoaderError, Result};
use crate::retry::RetryPolicy;
use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::VerifyingKey;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Header carrying the runtime version the client is able to run.
pub const RUNTIME_VERSION_HEADER: &str = "ota-runtime-version";
/// Header carrying the release channel the client follows.
pub const RELEASE_CHANNEL_HEADER: &str = "ota-release-channel";

/// Immutable settings shared by every loader component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// URL of the update server's manifest endpoint.
    #[serde(with = "url_format")]
    pub update_url: Url,
    /// Release channel to request.
    #[serde(default = "default_channel")]
    pub release_channel: String,
    /// Runtime version of the running application.
    pub runtime_version: String,
    /// Extra headers sent with every request.
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    /// Root directory for the update database and downloaded assets.
    ///
    /// Read by [`AppLoader::from_config`](crate::AppLoader::from_config);
    /// [`AppLoader::new`](crate::AppLoader::new) takes an explicit asset directory instead.
    #[serde(default = "default_update_directory")]
    pub update_directory: PathBuf,
    /// Additional origins that `load` may be pointed at.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Base64 encoded Ed25519 public key; when set, manifests must be signed.
    #[serde(default)]
    pub verifying_key: Option<String>,
    /// Retry schedule for asset downloads.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Maximum number of assets downloaded at the same time.
    #[serde(default = "default_concurrency")]
    pub max_concurrent_downloads: usize,
}

fn default_channel() -> String {
    "default".to_string()
}

fn default_update_directory() -> PathBuf {
    PathBuf::from(".ota-updates")
}

fn default_concurrency() -> usize {
    4
}

impl Config {
    /// Create a configuration for the given update URL and runtime version.
    pub fn new(update_url: Url, runtime_version: impl Into<String>) -> Self {
        Self {
            update_url,
            release_channel: default_channel(),
            runtime_version: runtime_version.into(),
            request_headers: BTreeMap::new(),
            update_directory: default_update_directory(),
            allowed_origins: Vec::new(),
            verifying_key: None,
            retry: RetryPolicy::default(),
            max_concurrent_downloads: default_concurrency(),
        }
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let config: Config = serde_json::from_slice(&raw)
            .map_err(|err| LoaderError::config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the release channel.
    pub fn release_channel(mut self, channel: impl Into<String>) -> Self {
        self.release_channel = channel.into();
        self
    }

    /// Add a request header sent with every request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.insert(name.into(), value.into());
        self
    }

    /// Set the update directory.
    pub fn update_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.update_directory = dir.into();
        self
    }

    /// Allow an additional origin for `load`.
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    /// Require manifests signed by the given key.
    pub fn verifying_key(mut self, key: &VerifyingKey) -> Self {
        self.verifying_key = Some(general_purpose::STANDARD.encode(key.to_bytes()));
        self
    }

    /// Set the asset retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set the download concurrency.
    pub fn max_concurrent_downloads(mut self, limit: usize) -> Self {
        self.max_concurrent_downloads = limit;
        self
    }

    /// Directory holding downloaded assets.
    pub fn assets_directory(&self) -> PathBuf {
        self.update_directory.join("assets")
    }

    /// Location of the update database.
    pub fn database_path(&self) -> PathBuf {
        self.update_directory.join("db")
    }

    /// Check the configuration for values the loader cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.runtime_version.trim().is_empty() {
            return Err(LoaderError::config("runtime version must not be empty"));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(LoaderError::config("max concurrent downloads must be positive"));
        }
        for origin in &self.allowed_origins {
            Url::parse(origin)
                .map_err(|err| LoaderError::config(format!("allowed origin {origin}: {err}")))?;
        }
        self.parsed_verifying_key()?;
        Ok(())
    }

    /// Decode the configured verifying key, if any.
    pub fn parsed_verifying_key(&self) -> Result<Option<VerifyingKey>> {
        let Some(encoded) = &self.verifying_key else {
            return Ok(None);
        };
        let raw = general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|err| LoaderError::config(format!("malformed verifying key: {err}")))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| LoaderError::config("verifying key must be 32 bytes"))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|err| LoaderError::config(format!("invalid verifying key: {err}")))?;
        Ok(Some(key))
    }

    /// Whether `url` belongs to the update server or an allowed origin.
    pub fn is_allowed(&self, url: &Url) -> bool {
        if url.origin() == self.update_url.origin() {
            return true;
        }
        self.allowed_origins
            .iter()
            .filter_map(|origin| Url::parse(origin).ok())
            .any(|allowed| allowed.origin() == url.origin())
    }

    /// Headers attached to manifest and asset requests.
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            (RUNTIME_VERSION_HEADER.to_string(), self.runtime_version.clone()),
            (RELEASE_CHANNEL_HEADER.to_string(), self.release_channel.clone()),
        ];
        headers.extend(
            self.request_headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        headers
    }
}

pub(crate) mod url_format {
    use reqwest::Url;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(url: &Url, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(url.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Url, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Url::parse(&raw).map_err(serde::de::Error::custom)
    }
}
