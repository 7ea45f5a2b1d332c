//! Persistent, hash-keyed store of manifests.
//!
//! Layout of a store directory:
//!
//! * `<key>.dmrpp.json`: manifest payloads, where `<key>` is the MD5 hex digest of the
//!   manifest's logical name
//! * `index/`: a sled database mapping each key to an [IndexEntry]
//! * a ledger (default `ledger.txt`) with one line per addition or removal
//!
//! Each name has an in-memory reader/writer lock. Readers hold the read lock for as long as they
//! keep a [ManifestHandle]. Storing takes the write lock and waits for readers. Removal never
//! waits: it fails with [DmrppError::StoreLockContention] while any lock on the name is held.
//! Locks coordinate tasks within one process only.

use crate::error::DmrppError;
use crate::metrics::record_store_lookup;
use crate::models::Manifest;

use bytes::Bytes;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Default name of the ledger file.
pub const DEFAULT_LEDGER_NAME: &str = "ledger.txt";

const PAYLOAD_SUFFIX: &str = ".dmrpp.json";

/// Index record of one stored manifest.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IndexEntry {
    /// Logical name
    pub name: String,
    /// Payload size in bytes
    pub size: u64,
    /// Access sequence number, larger is more recent
    pub last_access: u64,
}

/// A stored manifest as listed by [ManifestStore::entries].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoreEntry {
    pub key: String,
    #[serde(flatten)]
    pub entry: IndexEntry,
}

/// Result of [ManifestStore::store].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOutcome {
    /// No manifest was stored under the name
    Stored,
    /// Identical bytes were already stored
    AlreadyPresent,
    /// Different bytes were stored and have been replaced
    Replaced,
}

/// Ledger operation.
#[derive(Clone, Copy, Debug, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
enum LedgerOp {
    Add,
    Remove,
}

/// In-memory reader/writer locks by key.
type LockTable = Mutex<HashMap<String, Arc<RwLock<()>>>>;

/// Forget locks nobody holds.
fn release_idle_locks(locks: &LockTable) {
    let mut locks = locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    locks.retain(|_, lock| Arc::strong_count(lock) > 1);
}

/// Returns the store key of a logical name.
pub fn key_of(name: &str) -> String {
    format!("{:x}", md5::compute(name))
}

/// Read access to a stored manifest.
///
/// The manifest cannot be replaced or removed while the handle is alive.
#[derive(Debug)]
pub struct ManifestHandle {
    name: String,
    key: String,
    path: PathBuf,
    guard: Option<OwnedRwLockReadGuard<()>>,
    locks: Arc<LockTable>,
}

impl Drop for ManifestHandle {
    fn drop(&mut self) {
        self.guard.take();
        release_idle_locks(&self.locks);
    }
}

impl ManifestHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the serialised manifest.
    pub async fn bytes(&self) -> Result<Bytes, DmrppError> {
        tokio::fs::read(&self.path)
            .await
            .map(Bytes::from)
            .map_err(|err| DmrppError::store_io(&self.path, err))
    }

    /// Read and deserialise the manifest.
    pub async fn manifest(&self) -> Result<Manifest, DmrppError> {
        Manifest::from_json(&self.bytes().await?)
    }
}

/// Manifest store.
#[derive(Debug)]
pub struct ManifestStore {
    root: PathBuf,
    ledger_path: PathBuf,
    size_limit: Option<u64>,
    index: sled::Db,
    locks: Arc<LockTable>,
    ledger: tokio::sync::Mutex<()>,
}

impl ManifestStore {
    /// Open or create a store.
    ///
    /// # Arguments
    ///
    /// * `root`: Store directory, created if absent
    /// * `size_limit`: Optional limit on the total payload size in bytes
    /// * `ledger_name`: File name of the ledger inside `root`
    pub fn open(root: &Path, size_limit: Option<u64>, ledger_name: &str) -> Result<Self, DmrppError> {
        std::fs::create_dir_all(root).map_err(|err| DmrppError::store_io(root, err))?;
        let index = sled::open(root.join("index"))?;
        tracing::info!(
            "opened manifest store {} with {} entries",
            root.display(),
            index.len()
        );
        Ok(Self {
            root: root.to_path_buf(),
            ledger_path: root.join(ledger_name),
            size_limit,
            index,
            locks: Arc::new(Mutex::new(HashMap::new())),
            ledger: tokio::sync::Mutex::new(()),
        })
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}{}", key, PAYLOAD_SUFFIX))
    }

    /// Returns the lock of a key, creating it if needed.
    fn lock_of(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn index_entry(&self, key: &str) -> Result<Option<IndexEntry>, DmrppError> {
        match self.index.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn put_index_entry(&self, key: &str, entry: &IndexEntry) -> Result<(), DmrppError> {
        self.index.insert(key, serde_json::to_vec(entry)?)?;
        Ok(())
    }

    /// Mark an entry as just used.
    fn touch(&self, key: &str, mut entry: IndexEntry) -> Result<(), DmrppError> {
        entry.last_access = self.index.generate_id()?;
        self.put_index_entry(key, &entry)
    }

    async fn append_ledger(&self, op: LedgerOp, name: &str, key: &str) -> Result<(), DmrppError> {
        let line = format!(
            "{},{},{},{}\n",
            OffsetDateTime::now_utc().format(&Rfc3339)?,
            op,
            name,
            key
        );
        let io_error = |err| DmrppError::store_io(&self.ledger_path, err);
        let _guard = self.ledger.lock().await;
        let mut ledger = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.ledger_path)
            .await
            .map_err(io_error)?;
        ledger.write_all(line.as_bytes()).await.map_err(io_error)?;
        ledger.flush().await.map_err(io_error)
    }

    /// Look up a manifest and lock it for reading.
    ///
    /// Returns `None` if no manifest is stored under the name.
    ///
    /// # Arguments
    ///
    /// * `name`: Logical name of the manifest
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub async fn is_available(&self, name: &str) -> Result<Option<ManifestHandle>, DmrppError> {
        let key = key_of(name);
        let guard = self.lock_of(&key).read_owned().await;
        let path = self.payload_path(&key);
        let entry = match self.index_entry(&key)? {
            Some(entry) => tokio::fs::try_exists(&path)
                .await
                .map_err(|err| DmrppError::store_io(&path, err))?
                .then_some(entry),
            None => None,
        };
        let Some(entry) = entry else {
            record_store_lookup(false);
            drop(guard);
            release_idle_locks(&self.locks);
            return Ok(None);
        };
        self.touch(&key, entry)?;
        record_store_lookup(true);
        Ok(Some(ManifestHandle {
            name: name.to_string(),
            key,
            path,
            guard: Some(guard),
            locks: self.locks.clone(),
        }))
    }

    /// Read a stored manifest.
    ///
    /// # Arguments
    ///
    /// * `name`: Logical name of the manifest
    pub async fn get(&self, name: &str) -> Result<Manifest, DmrppError> {
        match self.is_available(name).await? {
            Some(handle) => handle.manifest().await,
            None => Err(DmrppError::ManifestNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Store a manifest under a logical name.
    ///
    /// Waits for readers of the same name. Storing identical bytes again is not an error.
    /// When a size limit is set, least recently used entries are purged afterwards. A manifest
    /// whose chunk maps do not fit its variables is refused.
    ///
    /// # Arguments
    ///
    /// * `name`: Logical name of the manifest
    /// * `manifest`: Manifest to store
    #[tracing::instrument(level = "DEBUG", skip(self, manifest))]
    pub async fn store(&self, name: &str, manifest: &Manifest) -> Result<StoreOutcome, DmrppError> {
        manifest.check_chunk_maps()?;
        let payload = manifest.to_json()?;
        let key = key_of(name);
        let guard = self.lock_of(&key).write_owned().await;
        let path = self.payload_path(&key);

        let existing = match self.index_entry(&key)? {
            Some(entry) => match tokio::fs::read(&path).await {
                Ok(bytes) => Some((entry, bytes)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
                Err(err) => return Err(DmrppError::store_io(&path, err)),
            },
            None => None,
        };
        let outcome = match existing {
            Some((entry, bytes)) if bytes == payload => {
                self.touch(&key, entry)?;
                tracing::debug!("manifest {} already stored", name);
                drop(guard);
                release_idle_locks(&self.locks);
                return Ok(StoreOutcome::AlreadyPresent);
            }
            Some(_) => StoreOutcome::Replaced,
            None => StoreOutcome::Stored,
        };

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4()));
        tokio::fs::write(&temp_path, &payload)
            .await
            .map_err(|err| DmrppError::store_io(&temp_path, err))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|err| DmrppError::store_io(&path, err))?;
        let entry = IndexEntry {
            name: name.to_string(),
            size: payload.len() as u64,
            last_access: self.index.generate_id()?,
        };
        self.put_index_entry(&key, &entry)?;
        self.index.flush_async().await?;
        self.append_ledger(LedgerOp::Add, name, &key).await?;
        tracing::info!("stored manifest {} ({:?}, {} bytes)", name, outcome, entry.size);

        // The write guard keeps the new entry out of the purge.
        self.purge().await?;
        drop(guard);
        release_idle_locks(&self.locks);
        Ok(outcome)
    }

    /// Remove a stored manifest.
    ///
    /// Fails with [DmrppError::StoreLockContention] rather than waiting if the manifest is locked.
    ///
    /// # Arguments
    ///
    /// * `name`: Logical name of the manifest
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub async fn remove(&self, name: &str) -> Result<(), DmrppError> {
        let key = key_of(name);
        let guard = self
            .lock_of(&key)
            .try_write_owned()
            .map_err(|_| DmrppError::StoreLockContention {
                name: name.to_string(),
            })?;
        let result = match self.index_entry(&key)? {
            Some(entry) => self.remove_locked(&key, &entry, &guard).await,
            None => Err(DmrppError::ManifestNotFound {
                name: name.to_string(),
            }),
        };
        drop(guard);
        release_idle_locks(&self.locks);
        result
    }

    /// Remove an entry whose write lock is held.
    async fn remove_locked(
        &self,
        key: &str,
        entry: &IndexEntry,
        _guard: &OwnedRwLockWriteGuard<()>,
    ) -> Result<(), DmrppError> {
        let path = self.payload_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(DmrppError::store_io(&path, err)),
        }
        self.index.remove(key)?;
        self.append_ledger(LedgerOp::Remove, &entry.name, key).await?;
        tracing::info!("removed manifest {}", entry.name);
        Ok(())
    }

    /// Evict least recently used entries until the store fits its size limit.
    ///
    /// Locked entries are never evicted, so the store may stay over its limit while they are
    /// held. Returns the names evicted.
    pub async fn purge(&self) -> Result<Vec<String>, DmrppError> {
        let Some(size_limit) = self.size_limit else {
            return Ok(Vec::new());
        };
        let mut entries = self.entries()?;
        let mut total: u64 = entries.iter().map(|entry| entry.entry.size).sum();
        entries.sort_by_key(|entry| entry.entry.last_access);

        let mut evicted = Vec::new();
        for StoreEntry { key, entry } in entries {
            if total <= size_limit {
                break;
            }
            let Ok(guard) = self.lock_of(&key).try_write_owned() else {
                tracing::debug!("not purging locked manifest {}", entry.name);
                continue;
            };
            self.remove_locked(&key, &entry, &guard).await?;
            total -= entry.size;
            evicted.push(entry.name);
        }
        if total > size_limit {
            tracing::warn!(
                "manifest store holds {} bytes, over its limit of {}",
                total,
                size_limit
            );
        }
        release_idle_locks(&self.locks);
        Ok(evicted)
    }

    /// List the stored manifests.
    pub fn entries(&self) -> Result<Vec<StoreEntry>, DmrppError> {
        self.index
            .iter()
            .map(|item| {
                let (key, value) = item?;
                Ok(StoreEntry {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    entry: serde_json::from_slice(&value)?,
                })
            })
            .collect()
    }
}
