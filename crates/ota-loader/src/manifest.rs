use crate::config::Config;
use crate::error::{ManifestError, Result};
use crate::fetcher::HttpFetcher;
use crate::update::{Asset, Update, UpdateStatus};
use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// An asset entry as it appears in the manifest body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestAsset {
    /// Logical file name.
    pub name: String,
    /// Absolute URL, or a URL relative to the manifest location.
    pub url: String,
    /// Expected SHA-256 digest (hex encoded).
    pub hash: String,
    /// Optional MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// The data covered by the manifest signature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignedManifest {
    /// Server assigned update identity.
    pub id: String,
    /// Unix timestamp (seconds) when the update was published.
    pub created_at: u64,
    /// Runtime version the update targets.
    pub runtime_version: String,
    /// Entry point of the update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_asset: Option<ManifestAsset>,
    /// Remaining assets, in order.
    #[serde(default)]
    pub assets: Vec<ManifestAsset>,
}

/// Manifest body returned by the update server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateManifest {
    #[serde(flatten)]
    pub signed: SignedManifest,
    /// Base64 encoded Ed25519 signature over the canonical JSON of [`SignedManifest`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl UpdateManifest {
    /// Render the signed payload to the canonical JSON bytes that were signed.
    pub fn signing_bytes(&self) -> std::result::Result<Vec<u8>, ManifestError> {
        Ok(serde_json::to_vec(&self.signed)?)
    }

    /// Parse the Ed25519 signature from the manifest.
    pub fn parsed_signature(&self) -> std::result::Result<Signature, ManifestError> {
        let encoded = self
            .signature
            .as_deref()
            .ok_or(ManifestError::MissingSignature)?;
        let raw = general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|_| ManifestError::SignatureInvalid)?;
        let array: [u8; 64] = raw
            .try_into()
            .map_err(|_| ManifestError::SignatureInvalid)?;
        Ok(Signature::from_bytes(&array))
    }

    /// Convert the manifest into an [`Update`], resolving asset URLs against `base`.
    pub fn into_update(
        self,
        base: &Url,
        release_channel: &str,
    ) -> std::result::Result<Update, ManifestError> {
        let signed = self.signed;
        if signed.id.trim().is_empty() {
            return Err(ManifestError::Malformed("update id is empty".into()));
        }
        if signed.runtime_version.trim().is_empty() {
            return Err(ManifestError::Malformed("runtime version is empty".into()));
        }

        let mut names = HashSet::new();
        let mut assets = Vec::with_capacity(signed.assets.len() + 1);
        let entries = signed
            .launch_asset
            .into_iter()
            .map(|entry| (entry, true))
            .chain(signed.assets.into_iter().map(|entry| (entry, false)));

        for (entry, is_launch_asset) in entries {
            if !names.insert(entry.name.clone()) {
                return Err(ManifestError::Malformed(format!(
                    "asset {} listed twice",
                    entry.name
                )));
            }
            let mut asset = parse_asset(entry, base)?;
            asset.is_launch_asset = is_launch_asset;
            assets.push(asset);
        }

        Ok(Update {
            id: signed.id,
            created_at: signed.created_at,
            runtime_version: signed.runtime_version,
            release_channel: release_channel.to_string(),
            assets,
            status: UpdateStatus::Pending,
        })
    }
}

fn parse_asset(entry: ManifestAsset, base: &Url) -> std::result::Result<Asset, ManifestError> {
    if entry.name.trim().is_empty() {
        return Err(ManifestError::Malformed("asset name is empty".into()));
    }
    let hash = entry.hash.to_ascii_lowercase();
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ManifestError::Malformed(format!(
            "asset {} has invalid sha256 {:?}",
            entry.name, entry.hash
        )));
    }
    let url = base.join(&entry.url).map_err(|err| {
        ManifestError::Malformed(format!("asset {} has invalid url: {err}", entry.name))
    })?;

    let mut asset = Asset::new(entry.name, url, hash);
    asset.content_type = entry.content_type;
    Ok(asset)
}

/// Fetches manifests and turns them into trusted [`Update`] records.
pub struct ManifestFetcher<F> {
    fetcher: Arc<F>,
    config: Arc<Config>,
    verifying_key: Option<VerifyingKey>,
}

impl<F> ManifestFetcher<F>
where
    F: HttpFetcher,
{
    /// Create a manifest fetcher using the given transport and configuration.
    pub fn new(fetcher: Arc<F>, config: Arc<Config>) -> Result<Self> {
        let verifying_key = config.parsed_verifying_key()?;
        Ok(Self {
            fetcher,
            config,
            verifying_key,
        })
    }

    /// Retrieve, verify and parse the manifest at `url`.
    pub async fn fetch_manifest(&self, url: &Url) -> std::result::Result<Update, ManifestError> {
        let mut headers = self.config.headers();
        headers.push(("accept".to_string(), "application/json".to_string()));

        let bytes = self.fetcher.fetch_bytes(url, &headers).await?;
        let manifest: UpdateManifest = serde_json::from_slice(&bytes)?;
        self.verify_manifest(&manifest)?;

        if manifest.signed.runtime_version != self.config.runtime_version {
            return Err(ManifestError::IncompatibleRuntime {
                manifest: manifest.signed.runtime_version,
                expected: self.config.runtime_version.clone(),
            });
        }

        let update = manifest.into_update(url, &self.config.release_channel)?;
        tracing::debug!(
            update_id = %update.id,
            assets = update.assets.len(),
            "manifest parsed"
        );
        Ok(update)
    }

    fn verify_manifest(&self, manifest: &UpdateManifest) -> std::result::Result<(), ManifestError> {
        let Some(key) = &self.verifying_key else {
            return Ok(());
        };
        let signature = manifest.parsed_signature()?;
        let payload = manifest.signing_bytes()?;
        key.verify(&payload, &signature)
            .map_err(|_| ManifestError::SignatureInvalid)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use ed25519_dalek::{Signer, SigningKey};
    use std::sync::Mutex;

    const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    struct StaticFetcher {
        body: Vec<u8>,
        seen_headers: Mutex<Vec<(String, String)>>,
    }

    impl StaticFetcher {
        fn new(body: Vec<u8>) -> Self {
            Self {
                body,
                seen_headers: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl HttpFetcher for StaticFetcher {
        async fn fetch_bytes(
            &self,
            _url: &Url,
            headers: &[(String, String)],
        ) -> std::result::Result<Vec<u8>, TransportError> {
            *self.seen_headers.lock().unwrap() = headers.to_vec();
            Ok(self.body.clone())
        }
    }

    fn manifest_url() -> Url {
        Url::parse("https://updates.example.com/v1/manifest").unwrap()
    }

    fn config() -> Config {
        Config::new(manifest_url(), "1.0.0").release_channel("beta")
    }

    fn signed() -> SignedManifest {
        SignedManifest {
            id: "42".into(),
            created_at: 1_700_000_000,
            runtime_version: "1.0.0".into(),
            launch_asset: Some(ManifestAsset {
                name: "bundle.js".into(),
                url: "assets/bundle.js".into(),
                hash: HASH.to_uppercase(),
                content_type: Some("application/javascript".into()),
            }),
            assets: vec![ManifestAsset {
                name: "a.bin".into(),
                url: "https://cdn.example.com/a.bin".into(),
                hash: HASH.into(),
                content_type: None,
            }],
        }
    }

    fn fetcher_for(manifest: &UpdateManifest, config: Config) -> (Arc<StaticFetcher>, ManifestFetcher<StaticFetcher>) {
        let transport = Arc::new(StaticFetcher::new(serde_json::to_vec(manifest).unwrap()));
        let fetcher = ManifestFetcher::new(transport.clone(), Arc::new(config)).unwrap();
        (transport, fetcher)
    }

    #[tokio::test]
    async fn parses_unsigned_manifest() {
        let manifest = UpdateManifest {
            signed: signed(),
            signature: None,
        };
        let (transport, fetcher) = fetcher_for(&manifest, config());

        let update = fetcher.fetch_manifest(&manifest_url()).await.unwrap();
        assert_eq!(update.id, "42");
        assert_eq!(update.release_channel, "beta");
        assert_eq!(update.status, UpdateStatus::Pending);
        assert_eq!(update.assets.len(), 2);

        let launch = update.launch_asset().unwrap();
        assert_eq!(launch.name, "bundle.js");
        assert_eq!(launch.expected_hash, HASH);
        assert_eq!(
            launch.url.as_str(),
            "https://updates.example.com/v1/assets/bundle.js"
        );
        assert!(!update.assets[1].is_launch_asset);

        let headers = transport.seen_headers.lock().unwrap().clone();
        assert!(headers.contains(&("ota-release-channel".into(), "beta".into())));
        assert!(headers.contains(&("accept".into(), "application/json".into())));
    }

    #[tokio::test]
    async fn verifies_signature_when_key_configured() {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let payload = serde_json::to_vec(&signed()).unwrap();
        let manifest = UpdateManifest {
            signed: signed(),
            signature: Some(general_purpose::STANDARD.encode(signing_key.sign(&payload).to_bytes())),
        };
        let (_, fetcher) = fetcher_for(&manifest, config().verifying_key(&signing_key.verifying_key()));

        assert!(fetcher.fetch_manifest(&manifest_url()).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_tampered_or_unsigned_manifest() {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let payload = serde_json::to_vec(&signed()).unwrap();
        let mut tampered = signed();
        tampered.id = "43".into();
        let manifest = UpdateManifest {
            signed: tampered,
            signature: Some(general_purpose::STANDARD.encode(signing_key.sign(&payload).to_bytes())),
        };
        let config = config().verifying_key(&signing_key.verifying_key());
        let (_, fetcher) = fetcher_for(&manifest, config.clone());
        assert!(matches!(
            fetcher.fetch_manifest(&manifest_url()).await,
            Err(ManifestError::SignatureInvalid)
        ));

        let unsigned = UpdateManifest {
            signed: signed(),
            signature: None,
        };
        let (_, fetcher) = fetcher_for(&unsigned, config);
        assert!(matches!(
            fetcher.fetch_manifest(&manifest_url()).await,
            Err(ManifestError::MissingSignature)
        ));
    }

    #[tokio::test]
    async fn rejects_incompatible_runtime() {
        let mut body = signed();
        body.runtime_version = "2.0.0".into();
        let manifest = UpdateManifest {
            signed: body,
            signature: None,
        };
        let (_, fetcher) = fetcher_for(&manifest, config());
        assert!(matches!(
            fetcher.fetch_manifest(&manifest_url()).await,
            Err(ManifestError::IncompatibleRuntime { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_malformed_bodies() {
        let transport = Arc::new(StaticFetcher::new(br#"{"id": "42"}"#.to_vec()));
        let fetcher = ManifestFetcher::new(transport, Arc::new(config())).unwrap();
        assert!(matches!(
            fetcher.fetch_manifest(&manifest_url()).await,
            Err(ManifestError::Decode(_))
        ));

        let mut body = signed();
        body.assets[0].hash = "not-a-hash".into();
        let manifest = UpdateManifest {
            signed: body,
            signature: None,
        };
        let (_, fetcher) = fetcher_for(&manifest, config());
        assert!(matches!(
            fetcher.fetch_manifest(&manifest_url()).await,
            Err(ManifestError::Malformed(_))
        ));
    }

    #[test]
    fn duplicate_asset_names_are_rejected() {
        let mut body = signed();
        body.assets[0].name = "bundle.js".into();
        let manifest = UpdateManifest {
            signed: body,
            signature: None,
        };
        assert!(matches!(
            manifest.into_update(&manifest_url(), "default"),
            Err(ManifestError::Malformed(_))
        ));
    }
}
