//! Durable record of committed updates, backed by [Sled](https://github.com/spacejam/sled).
//!
//! Three trees are kept in one database:
//!
//! * `updates` maps an update id to the JSON encoded [`Update`],
//! * `assets` maps an asset digest to the JSON encoded resolved [`Asset`],
//! * `meta` holds the id of the latest update.
//!
//! A commit writes all three in a single transaction, so readers either see the whole
//! update or nothing of it.

use crate::error::StoreError;
use crate::update::{Asset, Update, UpdateStatus};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use sled::Transactional;
use std::path::Path;

const UPDATES_TREE: &str = "updates";
const ASSETS_TREE: &str = "assets";
const META_TREE: &str = "meta";
const LATEST_KEY: &[u8] = b"latest";

/// Result of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The update was written.
    Inserted,
    /// An update with the same id was already stored; nothing changed.
    AlreadyPresent,
}

/// Persistent store of downloaded updates.
pub trait UpdateStore: Send + Sync {
    /// Atomically persist a fully resolved update.
    fn commit(&self, update: &Update) -> Result<CommitOutcome, StoreError>;

    /// Whether an update with this id has been committed.
    fn has(&self, id: &str) -> Result<bool, StoreError>;

    /// The most recently created committed update.
    fn latest(&self) -> Result<Option<Update>, StoreError>;

    /// Look up a committed update.
    fn get(&self, id: &str) -> Result<Option<Update>, StoreError>;

    /// All committed updates, oldest first.
    fn list(&self) -> Result<Vec<Update>, StoreError>;

    /// A committed asset with the given digest, if any.
    fn asset_by_hash(&self, hash: &str) -> Result<Option<Asset>, StoreError>;
}

/// Sled backed [`UpdateStore`].
#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
    updates: sled::Tree,
    assets: sled::Tree,
    meta: sled::Tree,
}

impl SledStore {
    /// Open (or create) a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Wrap an already opened database.
    pub fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            updates: db.open_tree(UPDATES_TREE)?,
            assets: db.open_tree(ASSETS_TREE)?,
            meta: db.open_tree(META_TREE)?,
            db,
        })
    }

    fn decode_update(raw: &[u8]) -> Result<Update, StoreError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

impl UpdateStore for SledStore {
    fn commit(&self, update: &Update) -> Result<CommitOutcome, StoreError> {
        if let Some(asset) = update.first_unresolved() {
            return Err(StoreError::Unresolved {
                id: update.id.clone(),
                asset: asset.name.clone(),
            });
        }

        let mut committed = update.clone();
        committed.status = UpdateStatus::Ready;
        let record = serde_json::to_vec(&committed)?;
        let asset_records = committed
            .assets
            .iter()
            .map(|asset| Ok((asset.expected_hash.clone(), serde_json::to_vec(asset)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        let id = committed.id.as_bytes();

        let outcome = (&self.updates, &self.assets, &self.meta)
            .transaction(
                |(updates, assets, meta)| -> ConflictableTransactionResult<CommitOutcome, StoreError> {
                    if updates.get(id)?.is_some() {
                        return Ok(CommitOutcome::AlreadyPresent);
                    }

                    updates.insert(id, record.as_slice())?;
                    for (hash, raw) in &asset_records {
                        assets.insert(hash.as_bytes(), raw.as_slice())?;
                    }

                    let newer = match meta.get(LATEST_KEY)? {
                        Some(current_id) => match updates.get(current_id)? {
                            Some(raw) => {
                                let current = Self::decode_update(&raw)
                                    .map_err(ConflictableTransactionError::Abort)?;
                                committed.created_at >= current.created_at
                            }
                            None => true,
                        },
                        None => true,
                    };
                    if newer {
                        meta.insert(LATEST_KEY, id)?;
                    }
                    Ok(CommitOutcome::Inserted)
                },
            )
            .map_err(|err| match err {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => StoreError::Database(err),
            })?;

        if outcome == CommitOutcome::Inserted {
            self.db.flush()?;
            tracing::info!(update_id = %committed.id, "update committed");
        } else {
            tracing::debug!(update_id = %committed.id, "update already committed");
        }
        Ok(outcome)
    }

    fn has(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.updates.contains_key(id.as_bytes())?)
    }

    fn latest(&self) -> Result<Option<Update>, StoreError> {
        match self.meta.get(LATEST_KEY)? {
            Some(id) => match self.updates.get(id)? {
                Some(raw) => Self::decode_update(&raw).map(Some),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    fn get(&self, id: &str) -> Result<Option<Update>, StoreError> {
        self.updates
            .get(id.as_bytes())?
            .map(|raw| Self::decode_update(&raw))
            .transpose()
    }

    fn list(&self) -> Result<Vec<Update>, StoreError> {
        let mut updates = self
            .updates
            .iter()
            .map(|item| {
                let (_, raw) = item?;
                Self::decode_update(&raw)
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        updates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(updates)
    }

    fn asset_by_hash(&self, hash: &str) -> Result<Option<Asset>, StoreError> {
        self.assets
            .get(hash.to_ascii_lowercase().as_bytes())?
            .map(|raw| serde_json::from_slice::<Asset>(&raw).map_err(StoreError::from))
            .transpose()
    }
}
