// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Durable per-site authorization whitelist.
//!
//! One [`WhitelistEntry`] records that an origin is pre-authorized to see a
//! specific wallet over a specific protocol. The invariant "at most one entry
//! per `(origin_url, protocol)`" is maintained by the broker, which is the
//! single writer; this store only guarantees that every write is all-or-
//! nothing and that readers are notified of mutations.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::models::{Protocol, WalletId};

use super::StoragePaths;

/// Error type for whitelist storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error during file operations
    Io(io::Error),
    /// JSON serialization/deserialization error
    Json(serde_json::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "I/O error: {e}"),
            StorageError::Json(e) => write!(f, "JSON error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            StorageError::Json(e) => Some(e),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Json(e)
    }
}

/// Result type for whitelist storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable record that a site is pre-authorized to view a wallet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WhitelistEntry {
    /// Normalized site origin (`scheme://host[:port]`).
    pub origin_url: String,
    /// Protocol the authorization covers.
    pub protocol: Protocol,
    /// The wallet the site may see.
    pub wallet_id: WalletId,
    /// Optional dApp-supplied identity the token is bound to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_auth_id: Option<String>,
    /// Opaque token handed back to the page agent on repeated connects.
    pub auth_token: String,
    /// When the user approved this site.
    pub created_at: DateTime<Utc>,
}

/// On-disk document. Read and written wholesale.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WhitelistRecord {
    whitelist: Vec<WhitelistEntry>,
}

/// File-backed whitelist store with an invalidate-on-write cache.
///
/// `list()` serves from the cache once populated; `replace()` rewrites the
/// record atomically, refreshes the cache, and bumps the subscription
/// generation so observers never diverge from durable state for more than
/// one event-loop turn.
#[derive(Debug)]
pub struct WhitelistStore {
    path: PathBuf,
    cache: Mutex<Option<Vec<WhitelistEntry>>>,
    generation: watch::Sender<u64>,
}

impl WhitelistStore {
    /// Open the store, creating the connector directory if needed.
    pub fn open(paths: &StoragePaths) -> StorageResult<Self> {
        fs::create_dir_all(paths.connector_dir())?;
        let (generation, _) = watch::channel(0);
        Ok(Self {
            path: paths.whitelist_file(),
            cache: Mutex::new(None),
            generation,
        })
    }

    /// Return the full persisted whitelist.
    pub fn list(&self) -> StorageResult<Vec<WhitelistEntry>> {
        let mut cache = self.cache_lock();
        if let Some(entries) = cache.as_ref() {
            return Ok(entries.clone());
        }
        let entries = self.read_record()?;
        *cache = Some(entries.clone());
        Ok(entries)
    }

    /// Atomically overwrite the whitelist. Callers read-modify-write the
    /// full list; no partial-write state is ever observable.
    pub fn replace(&self, entries: Vec<WhitelistEntry>) -> StorageResult<()> {
        let temp = self.path.with_extension("tmp");
        {
            let file = File::create(&temp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(
                &mut writer,
                &WhitelistRecord {
                    whitelist: entries.clone(),
                },
            )?;
            writer.flush()?;
        }
        fs::rename(&temp, &self.path)?;

        *self.cache_lock() = Some(entries);
        self.generation.send_modify(|g| *g += 1);
        Ok(())
    }

    /// Lookup used by the broker before deciding whether to prompt.
    pub fn find_for(
        &self,
        origin_url: &str,
        protocol: Protocol,
    ) -> StorageResult<Option<WhitelistEntry>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|entry| entry.origin_url == origin_url && entry.protocol == protocol))
    }

    /// Drop the cache and reload from disk.
    pub fn refresh(&self) -> StorageResult<Vec<WhitelistEntry>> {
        let entries = self.read_record()?;
        *self.cache_lock() = Some(entries.clone());
        Ok(entries)
    }

    /// Subscribe to mutations. The watched value is a generation counter
    /// bumped on every successful `replace()`.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    fn read_record(&self) -> StorageResult<Vec<WhitelistEntry>> {
        match File::open(&self.path) {
            Ok(file) => {
                let record: WhitelistRecord = serde_json::from_reader(BufReader::new(file))?;
                Ok(record.whitelist)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn cache_lock(&self) -> MutexGuard<'_, Option<Vec<WhitelistEntry>>> {
        // A poisoned lock only means a reader panicked mid-clone; the cached
        // data itself is still consistent with disk.
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
