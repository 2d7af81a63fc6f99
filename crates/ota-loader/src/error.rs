use std::path::PathBuf;

/// Convenient result alias for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Failures raised by an [`HttpFetcher`](crate::HttpFetcher) implementation.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The request could not be sent or the body could not be read.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The server answered with a non-success status code.
    #[error("server responded with HTTP {status} for {url}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// URL that was requested.
        url: String,
    },
    /// Any other transport level failure (used by alternative fetchers).
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether repeating the request may succeed.
    ///
    /// Client errors are final except for request timeouts and rate limiting.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Status { status, .. } => {
                !(400..500).contains(status) || *status == 408 || *status == 429
            }
            TransportError::Request(_) | TransportError::Other(_) => true,
        }
    }
}

/// Errors that can occur while fetching and validating a manifest.
#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    /// The manifest request did not complete.
    #[error("manifest request failed: {0}")]
    Transport(#[from] TransportError),
    /// The manifest body could not be decoded from JSON.
    #[error("manifest decoding failed: {0}")]
    Decode(#[from] serde_json::Error),
    /// The manifest decoded but is missing or has invalid required fields.
    #[error("manifest is malformed: {0}")]
    Malformed(String),
    /// A signature was required but the manifest did not carry one.
    #[error("manifest is not signed")]
    MissingSignature,
    /// The manifest signature did not verify against the configured key.
    #[error("manifest signature invalid")]
    SignatureInvalid,
    /// The manifest targets a different runtime version than the one configured.
    #[error("manifest targets runtime {manifest}, expected {expected}")]
    IncompatibleRuntime {
        /// Runtime version declared by the manifest.
        manifest: String,
        /// Runtime version from the configuration.
        expected: String,
    },
}

/// Errors that can occur while resolving a single asset.
#[derive(thiserror::Error, Debug)]
pub enum AssetError {
    /// Every download attempt failed.
    #[error("asset {name} could not be downloaded after {attempts} attempts: {source}")]
    Fetch {
        /// Logical name of the asset.
        name: String,
        /// Number of attempts made.
        attempts: u32,
        /// Error of the last attempt.
        #[source]
        source: TransportError,
    },
    /// The downloaded bytes do not hash to the declared value.
    #[error("asset {name} failed integrity check (expected {expected}, got {actual})")]
    IntegrityMismatch {
        /// Logical name of the asset.
        name: String,
        /// Expected SHA-256 digest.
        expected: String,
        /// Actual SHA-256 digest.
        actual: String,
    },
    /// Writing the asset to its destination failed.
    #[error("asset {name} could not be written to {path:?}: {source}")]
    Io {
        /// Logical name of the asset.
        name: String,
        /// Destination that was being written.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The download was abandoned because a sibling asset failed.
    #[error("asset {0} download cancelled")]
    Cancelled(String),
    /// A download task panicked or was torn down unexpectedly.
    #[error("asset task failed: {0}")]
    Task(String),
}

/// Errors raised by the persistent store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The underlying database reported an error.
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    /// A record could not be encoded or decoded.
    #[error("record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    /// The update is not fully resolved and cannot be committed.
    #[error("update {id} has unresolved asset {asset}")]
    Unresolved {
        /// Update identity.
        id: String,
        /// Name of the first unresolved asset.
        asset: String,
    },
}

/// How a caller should react to a failed load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network conditions; retrying later may succeed.
    Transient,
    /// The update itself is unacceptable; retrying will not help.
    Permanent,
    /// Local storage or filesystem failure.
    Local,
}

/// Terminal error of a load operation, delivered to the error callback.
#[derive(thiserror::Error, Debug)]
pub enum LoaderError {
    /// The requested URL is not permitted by the configuration.
    #[error("url {0} is not an allowed update origin")]
    DisallowedUrl(String),
    /// The configuration is not usable.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Fetching or validating the manifest failed.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    /// Resolving one of the update's assets failed.
    #[error(transparent)]
    Asset(#[from] AssetError),
    /// Committing the update failed.
    #[error("storage failed: {0}")]
    Storage(#[from] StoreError),
    /// Preparing the update directory failed.
    #[error("filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),
    /// The decision callback panicked.
    #[error("manifest callback panicked")]
    DecisionPanicked,
    /// A background task could not be joined.
    #[error("task failed: {0}")]
    Task(String),
}

impl LoaderError {
    /// Helper for wrapping configuration failures.
    pub fn config(msg: impl Into<String>) -> Self {
        LoaderError::Config(msg.into())
    }

    /// Classify the error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            LoaderError::Manifest(ManifestError::Transport(source))
            | LoaderError::Asset(AssetError::Fetch { source, .. })
                if source.is_retryable() =>
            {
                ErrorClass::Transient
            }
            LoaderError::Asset(AssetError::Io { .. })
            | LoaderError::Asset(AssetError::Task(_))
            | LoaderError::Asset(AssetError::Cancelled(_)) => ErrorClass::Local,
            LoaderError::Storage(_) | LoaderError::Io(_) | LoaderError::Task(_) => ErrorClass::Local,
            LoaderError::DisallowedUrl(_)
            | LoaderError::Config(_)
            | LoaderError::DecisionPanicked
            | LoaderError::Manifest(_)
            | LoaderError::Asset(_) => ErrorClass::Permanent,
        }
    }

    /// True when the failure is worth retrying later.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_transient() {
        let err = LoaderError::from(ManifestError::Transport(TransportError::Status {
            status: 500,
            url: "https://updates.example.com/manifest".into(),
        }));
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[test]
    fn integrity_and_trust_failures_are_permanent() {
        let integrity = LoaderError::from(AssetError::IntegrityMismatch {
            name: "a.bin".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        });
        assert_eq!(integrity.class(), ErrorClass::Permanent);

        let trust = LoaderError::from(ManifestError::SignatureInvalid);
        assert_eq!(trust.class(), ErrorClass::Permanent);
        assert!(!trust.is_retryable());
    }

    #[test]
    fn client_errors_are_permanent() {
        let status = |status| TransportError::Status {
            status,
            url: "https://cdn.example.com/a.bin".into(),
        };
        assert!(!status(404).is_retryable());
        assert!(!status(403).is_retryable());
        assert!(status(408).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());

        let missing = LoaderError::from(AssetError::Fetch {
            name: "a.bin".into(),
            attempts: 1,
            source: status(404),
        });
        assert_eq!(missing.class(), ErrorClass::Permanent);

        let manifest = LoaderError::from(ManifestError::Transport(status(410)));
        assert_eq!(manifest.class(), ErrorClass::Permanent);
    }

    #[test]
    fn storage_failures_are_local() {
        let err = LoaderError::from(StoreError::Unresolved {
            id: "42".into(),
            asset: "a.bin".into(),
        });
        assert_eq!(err.class(), ErrorClass::Local);
    }
}
