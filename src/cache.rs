//! Content-addressed audio cache.
//!
//! Blobs live on disk, one file per fingerprint plus a small JSON sidecar
//! carrying codec and duration. Writes land in a temp file and are renamed
//! into place, so a finalized entry is always complete. The in-memory index
//! (sizes, `last_access`) is rebuilt from the directory at startup.
//!
//! Reads are concurrent; `last_access` updates are batched in memory and
//! folded into the index on a periodic flush so the read path never
//! contends on bookkeeping. Eviction (`sweep`) runs from one serialized
//! context: once total blob size exceeds the configured bound it deletes
//! entries in ascending `last_access` order until under the low-water mark.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::fingerprint::Fingerprint;
use crate::job::unix_ms;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata persisted next to each blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioMeta {
    pub codec: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    size: u64,
    last_access: u64,
    meta: AudioMeta,
}

pub struct AudioCache {
    dir: PathBuf,
    max_bytes: u64,
    low_water_bytes: u64,
    index: DashMap<Fingerprint, IndexEntry>,
    total_bytes: AtomicU64,
    touches: Mutex<HashMap<Fingerprint, u64>>,
    sweep_gate: tokio::sync::Mutex<()>,
}

impl AudioCache {
    /// Opens (or creates) the cache directory and rebuilds the index from
    /// the sidecars found there.
    pub async fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        tokio::fs::create_dir_all(&config.dir).await?;
        let cache = Self {
            dir: config.dir.clone(),
            max_bytes: config.max_bytes,
            low_water_bytes: config.low_water_bytes,
            index: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            touches: Mutex::new(HashMap::new()),
            sweep_gate: tokio::sync::Mutex::new(()),
        };
        cache.scan().await?;
        info!(
            entries = cache.index.len(),
            bytes = cache.total(),
            dir = %cache.dir.display(),
            "audio cache opened"
        );
        Ok(cache)
    }

    async fn scan(&self) -> Result<(), CacheError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".meta") else {
                continue;
            };
            let Some(fingerprint) = Fingerprint::parse_hex(stem) else {
                warn!(file = name, "unparseable sidecar name; skipping");
                continue;
            };
            let blob = self.blob_path(fingerprint);
            let Ok(stat) = tokio::fs::metadata(&blob).await else {
                warn!(%fingerprint, "sidecar without blob; skipping");
                continue;
            };
            let raw = tokio::fs::read(&path).await?;
            let meta: AudioMeta = match serde_json::from_slice(&raw) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(%fingerprint, %err, "corrupt sidecar; skipping");
                    continue;
                }
            };
            let last_access = stat
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or_else(unix_ms);
            let size = stat.len();
            self.index
                .insert(fingerprint, IndexEntry { size, last_access, meta });
            self.total_bytes.fetch_add(size, Ordering::Relaxed);
        }
        Ok(())
    }

    fn blob_path(&self, fingerprint: Fingerprint) -> PathBuf {
        self.dir.join(fingerprint.to_string())
    }

    fn meta_path(&self, fingerprint: Fingerprint) -> PathBuf {
        self.dir.join(format!("{fingerprint}.meta"))
    }

    /// Reads an entry's bytes and metadata. Concurrent-safe; records a
    /// batched access-time touch.
    pub async fn get(&self, fingerprint: Fingerprint) -> Result<Option<(Bytes, AudioMeta)>, CacheError> {
        let meta = match self.index.get(&fingerprint) {
            Some(entry) => entry.meta.clone(),
            None => return Ok(None),
        };
        let bytes = match tokio::fs::read(self.blob_path(fingerprint)).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Swept between index lookup and read.
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        self.touch(fingerprint);
        Ok(Some((bytes, meta)))
    }

    /// Metadata-only hit check for admission; touches on hit.
    pub fn peek(&self, fingerprint: Fingerprint) -> Option<AudioMeta> {
        let meta = self.index.get(&fingerprint).map(|entry| entry.meta.clone())?;
        self.touch(fingerprint);
        Some(meta)
    }

    /// Stores an entry. Idempotent: a second put for the same fingerprint is
    /// a no-op that only refreshes `last_access`. Returns whether this call
    /// created the entry.
    pub async fn put(
        &self,
        fingerprint: Fingerprint,
        audio: &[u8],
        meta: AudioMeta,
    ) -> Result<bool, CacheError> {
        if self.index.contains_key(&fingerprint) {
            self.touch(fingerprint);
            return Ok(false);
        }

        // Temp-write then rename so readers never observe partial blobs.
        let tmp = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, audio).await?;
        tokio::fs::rename(&tmp, self.blob_path(fingerprint)).await?;

        let tmp = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let sidecar = serde_json::to_vec(&meta).unwrap_or_default();
        tokio::fs::write(&tmp, sidecar).await?;
        tokio::fs::rename(&tmp, self.meta_path(fingerprint)).await?;

        let size = audio.len() as u64;
        match self.index.entry(fingerprint) {
            Entry::Occupied(_) => {
                // A concurrent put landed first; the files are identical.
                self.touch(fingerprint);
                Ok(false)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(IndexEntry { size, last_access: unix_ms(), meta });
                self.total_bytes.fetch_add(size, Ordering::Relaxed);
                debug!(%fingerprint, size, "cached audio entry");
                Ok(true)
            }
        }
    }

    /// Records an access without reading bytes. Batched; folded into the
    /// index by [`flush_touches`](Self::flush_touches).
    pub fn touch(&self, fingerprint: Fingerprint) {
        self.touches.lock().insert(fingerprint, unix_ms());
    }

    /// Applies the batched access times to the index.
    pub fn flush_touches(&self) {
        let drained: Vec<(Fingerprint, u64)> = self.touches.lock().drain().collect();
        for (fingerprint, at) in drained {
            if let Some(mut entry) = self.index.get_mut(&fingerprint) {
                if at > entry.last_access {
                    entry.last_access = at;
                }
            }
        }
    }

    /// Evicts entries in ascending `last_access` order until total size is
    /// under the low-water mark. No-op while total size is within the bound.
    /// Serialized: concurrent sweeps queue behind one another.
    pub async fn sweep(&self) -> Result<usize, CacheError> {
        let _gate = self.sweep_gate.lock().await;
        self.flush_touches();
        if self.total() <= self.max_bytes {
            return Ok(0);
        }

        let mut candidates: Vec<(u64, Fingerprint, u64)> = self
            .index
            .iter()
            .map(|entry| (entry.last_access, *entry.key(), entry.size))
            .collect();
        candidates.sort_unstable();

        let mut evicted = 0usize;
        for (_, fingerprint, size) in candidates {
            if self.total() <= self.low_water_bytes {
                break;
            }
            self.index.remove(&fingerprint);
            self.total_bytes.fetch_sub(size, Ordering::Relaxed);
            if let Err(err) = tokio::fs::remove_file(self.blob_path(fingerprint)).await {
                warn!(%fingerprint, %err, "failed to remove swept blob");
            }
            if let Err(err) = tokio::fs::remove_file(self.meta_path(fingerprint)).await {
                warn!(%fingerprint, %err, "failed to remove swept sidecar");
            }
            evicted += 1;
        }
        if evicted > 0 {
            info!(evicted, bytes = self.total(), "cache sweep finished");
        }
        Ok(evicted)
    }

    pub fn total(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
