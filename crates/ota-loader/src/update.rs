use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A single file belonging to an update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    /// Logical name, also used as the file name inside the update directory.
    pub name: String,
    /// Expected SHA-256 digest (hex encoded, lowercase).
    pub expected_hash: String,
    /// Remote location of the asset.
    #[serde(with = "crate::config::url_format")]
    pub url: Url,
    /// Optional MIME type announced by the manifest.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Whether this is the entry point the application launches.
    #[serde(default)]
    pub is_launch_asset: bool,
    /// Location on disk, set once the asset has been downloaded and verified.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
}

impl Asset {
    /// Create an unresolved asset.
    pub fn new(name: impl Into<String>, url: Url, expected_hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expected_hash: expected_hash.into().to_ascii_lowercase(),
            url,
            content_type: None,
            is_launch_asset: false,
            local_path: None,
        }
    }

    /// True once the asset has a verified local copy.
    pub fn is_resolved(&self) -> bool {
        self.local_path.is_some()
    }

    /// Local path, if resolved.
    pub fn local_path(&self) -> Option<&Path> {
        self.local_path.as_deref()
    }
}

/// Download status of an update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum UpdateStatus {
    /// Parsed from a manifest, assets not yet resolved.
    Pending,
    /// Every asset resolved and the record committed.
    Ready,
}

/// An application update described by a manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    /// Unique identity assigned by the server.
    pub id: String,
    /// Unix timestamp (seconds) when the update was published.
    pub created_at: u64,
    /// Runtime version the update is compatible with.
    pub runtime_version: String,
    /// Release channel the manifest was requested for.
    pub release_channel: String,
    /// Assets in manifest order, launch asset first.
    pub assets: Vec<Asset>,
    /// Download status.
    pub status: UpdateStatus,
}

impl Update {
    /// The asset the application launches, if the manifest declared one.
    pub fn launch_asset(&self) -> Option<&Asset> {
        self.assets.iter().find(|asset| asset.is_launch_asset)
    }

    /// First asset without a verified local copy.
    pub fn first_unresolved(&self) -> Option<&Asset> {
        self.assets.iter().find(|asset| !asset.is_resolved())
    }

    /// True when every asset is resolved.
    pub fn is_fully_resolved(&self) -> bool {
        self.first_unresolved().is_none()
    }
}
