//! Content-addressed audio cache with single-flight computation.
//!
//! Entries are keyed by a SHA-256 digest of the canonical request tuple
//! `(text, voice, speed)` and are written once, atomically. For a given key at
//! most one computation runs at a time; callers arriving while it runs wait on
//! the key's lock and are then served its bytes as a hit.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::{Result, TtsError};
use crate::request::SynthesisRequest;

/// Bumped whenever the canonical encoding or the audio format changes.
const KEY_VERSION: &str = "tts-cache-v2";

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Digest of the canonical encoding of `(text, voice_id, speed)`.
    ///
    /// Text and voice are length-prefixed so no two tuples share an encoding;
    /// speed is encoded from its exact bits so distinct factors never merge.
    pub fn derive(text: &str, voice_id: &str, speed: f32) -> Self {
        let canonical = format!(
            "{KEY_VERSION}\n{}:{text}\n{}:{voice_id}\n{:08x}",
            text.len(),
            voice_id.len(),
            speed.to_bits()
        );
        let digest = Sha256::digest(canonical.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self(key)
    }

    pub fn for_request(request: &SynthesisRequest) -> Self {
        Self::derive(&request.text, &request.voice_id, request.speed)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &self.to_hex()[..12])
    }
}

/// Persisted key -> bytes storage. Entries are never updated in place.
pub trait AudioStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> io::Result<Option<Vec<u8>>>;

    /// Store bytes under `key`. Must be atomic: readers see all or nothing.
    fn put(&self, key: &CacheKey, bytes: &[u8]) -> io::Result<()>;

    fn contains(&self, key: &CacheKey) -> io::Result<bool>;
}

/// One `<hex key>.wav` file per entry in a flat directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    dir: PathBuf,
}

impl FsStore {
    /// Open (and create if needed) a cache directory.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.wav", key.to_hex()))
    }
}

impl AudioStore for FsStore {
    fn get(&self, key: &CacheKey) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put(&self, key: &CacheKey, bytes: &[u8]) -> io::Result<()> {
        // temp file in the same directory so the rename stays on one filesystem
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_for(key)).map_err(|e| e.error)?;
        Ok(())
    }

    fn contains(&self, key: &CacheKey) -> io::Result<bool> {
        Ok(self.path_for(key).is_file())
    }
}

/// Process-local store, for tests and ephemeral deployments.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<CacheKey, Arc<Vec<u8>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "memory store lock poisoned")
}

impl AudioStore for MemoryStore {
    fn get(&self, key: &CacheKey) -> io::Result<Option<Vec<u8>>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).map(|bytes| bytes.as_ref().clone()))
    }

    fn put(&self, key: &CacheKey, bytes: &[u8]) -> io::Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(*key, Arc::new(bytes.to_vec()));
        Ok(())
    }

    fn contains(&self, key: &CacheKey) -> io::Result<bool> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.contains_key(key))
    }
}

/// Per-key lock. While callers share it, it also carries the bytes the last
/// holder computed, so waiters are served even if persisting them failed.
type Slot = Arc<Mutex<Option<Arc<Vec<u8>>>>>;
type InFlight = DashMap<CacheKey, Slot>;

#[derive(Clone)]
pub struct SynthesisCache {
    store: Arc<dyn AudioStore>,
    // per-key locks for computations currently running or awaited
    in_flight: Arc<InFlight>,
}

impl SynthesisCache {
    pub fn new(store: Arc<dyn AudioStore>) -> Self {
        Self {
            store,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn AudioStore> {
        &self.store
    }

    /// Number of keys with a computation running or awaited.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Return the cached bytes for `request`, or run `compute` and persist its
    /// output. The flag is `true` on a cache hit.
    ///
    /// With `use_cache == false` the store is neither read nor written.
    ///
    /// The miss path runs on a spawned task that owns the key lock, so dropping
    /// the returned future does not abort a computation other callers are
    /// waiting on. Callers that waited on a successful computation get its
    /// bytes as a hit, whether or not the write succeeded. If `compute` fails
    /// nothing is written, and the next waiter runs the miss path itself.
    pub async fn get_or_compute<F, Fut>(
        &self,
        request: &SynthesisRequest,
        compute: F,
    ) -> Result<(Vec<u8>, bool)>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        if !request.use_cache {
            return compute().await.map(|bytes| (bytes, false));
        }

        let key = CacheKey::for_request(request);
        let lease = KeyLease::acquire(&self.in_flight, key).await;

        if let Some(bytes) = lease.published() {
            debug!(%key, bytes = bytes.len(), "Served from in-flight computation");
            return Ok((bytes.as_ref().clone(), true));
        }
        if let Some(bytes) = self.lookup(key).await {
            debug!(%key, bytes = bytes.len(), "Cache hit");
            return Ok((bytes, true));
        }

        let store = Arc::clone(&self.store);
        let task = tokio::spawn(async move {
            let mut lease = lease;
            let bytes = Arc::new(compute().await?);
            persist(store, key, &bytes).await;
            lease.publish(Arc::clone(&bytes));
            drop(lease);
            Ok::<_, TtsError>(Arc::try_unwrap(bytes).unwrap_or_else(|shared| shared.as_ref().clone()))
        });

        let bytes = task.await.map_err(|e| {
            TtsError::SynthesisFailed(anyhow::anyhow!("synthesis task failed: {e}"))
        })??;
        Ok((bytes, false))
    }

    /// Whether an entry exists for `key`, without reading it.
    pub async fn contains(&self, key: CacheKey) -> bool {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.contains(&key)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(%key, "Cache existence check failed: {e}");
                false
            }
            Err(e) => {
                warn!(%key, "Cache existence task failed: {e}");
                false
            }
        }
    }

    /// Read errors are logged and treated as a miss; the recomputed entry
    /// replaces whatever was unreadable.
    async fn lookup(&self, key: CacheKey) -> Option<Vec<u8>> {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.get(&key)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(%key, "Cache read failed, treating as miss: {e}");
                None
            }
            Err(e) => {
                warn!(%key, "Cache read task failed, treating as miss: {e}");
                None
            }
        }
    }
}

/// A caller's hold on a key's slot. Dropping it, on any path including
/// cancellation and panics, unlocks the key and removes the slot from the
/// table once no other caller holds it.
struct KeyLease {
    in_flight: Arc<InFlight>,
    key: CacheKey,
    slot: Slot,
    guard: Option<OwnedMutexGuard<Option<Arc<Vec<u8>>>>>,
}

impl KeyLease {
    async fn acquire(in_flight: &Arc<InFlight>, key: CacheKey) -> Self {
        let slot = in_flight.entry(key).or_default().value().clone();
        let mut lease = Self {
            in_flight: Arc::clone(in_flight),
            key,
            slot,
            guard: None,
        };
        lease.guard = Some(Arc::clone(&lease.slot).lock_owned().await);
        lease
    }

    fn published(&self) -> Option<Arc<Vec<u8>>> {
        self.guard.as_ref().and_then(|guard| (**guard).clone())
    }

    fn publish(&mut self, bytes: Arc<Vec<u8>>) {
        if let Some(guard) = self.guard.as_mut() {
            **guard = Some(bytes);
        }
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        // the table and this lease account for two references
        self.in_flight
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) <= 2);
    }
}

/// Write a fresh entry. Failure is logged; the caller keeps the bytes either way.
async fn persist(store: Arc<dyn AudioStore>, key: CacheKey, bytes: &Arc<Vec<u8>>) {
    let task_bytes = Arc::clone(bytes);
    let written = tokio::task::spawn_blocking(move || store.put(&key, &task_bytes)).await;

    match written {
        Ok(Ok(())) => info!(%key, bytes = bytes.len(), "Cached synthesized audio"),
        Ok(Err(e)) => warn!(%key, "Failed to persist cache entry: {e}"),
        Err(e) => warn!(%key, "Cache write task failed: {e}"),
    }
}
