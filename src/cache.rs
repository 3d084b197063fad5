// src/cache.rs
//! Response cache keyed by (source, subject, query).
//!
//! `FileCache` stores one JSON document per key under a flat directory and
//! writes through a temp file + rename, so readers never see a torn entry.
//! Only live `Success` and `NoDataFound` answers are stored; errors and blocks
//! are never cached.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::text::normalize_key;
use crate::types::{EnrichmentPayload, EnrichmentSubject, ReliabilityTier};

/// Stable cache key: sha256 over source type, subject id, normalized name and
/// the source-specific query text.
pub fn cache_key(source_type: &str, subject: &EnrichmentSubject, query: &str) -> String {
    let mut h = Sha256::new();
    for part in [
        source_type,
        subject.id.as_str(),
        normalize_key(&subject.name).as_str(),
        query,
    ] {
        h.update(part.as_bytes());
        h.update([0x1f]);
    }
    format!("{:x}", h.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub source_type: String,
    pub subject_id: String,
    pub created_at: DateTime<Utc>,
    /// `None` records a confirmed "no data" answer.
    #[serde(default)]
    pub payload: Option<EnrichmentPayload>,
    pub raw_response: String,
    pub confidence: f64,
    pub tier: ReliabilityTier,
    /// What the original live query cost.
    pub cost: f64,
}

impl CacheEntry {
    pub fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        match ttl {
            None => false,
            Some(ttl) => match chrono::Duration::from_std(ttl) {
                Ok(ttl) => now - self.created_at > ttl,
                Err(_) => false,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCacheStats {
    pub entries: usize,
    pub no_data_entries: usize,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSummary {
    pub total_entries: usize,
    pub total_cost: f64,
    pub by_source: BTreeMap<String, SourceCacheStats>,
}

impl CacheSummary {
    fn from_entries<'a>(entries: impl IntoIterator<Item = &'a CacheEntry>) -> Self {
        let mut s = CacheSummary::default();
        for e in entries {
            s.total_entries += 1;
            s.total_cost += e.cost;
            let per = s.by_source.entry(e.source_type.clone()).or_default();
            per.entries += 1;
            per.cost += e.cost;
            if e.payload.is_none() {
                per.no_data_entries += 1;
            }
        }
        s
    }
}

/// Storage seam for cached answers. Implementations treat I/O failures as
/// misses and report them through the returned `io::Result` on writes only.
pub trait ResponseCache: Send + Sync {
    /// Fresh entry for `key`, if any. Expired or unreadable entries are
    /// removed and reported as a miss.
    fn get(&self, key: &str, ttl: Option<Duration>) -> Option<CacheEntry>;
    fn put(&self, entry: &CacheEntry) -> io::Result<()>;
    fn purge(&self, key: &str) -> io::Result<()>;
    /// Remove every entry for one source. Returns how many were removed.
    fn purge_source(&self, source_type: &str) -> io::Result<usize>;
    fn entries(&self) -> Vec<CacheEntry>;

    fn summary(&self) -> CacheSummary {
        CacheSummary::from_entries(self.entries().iter())
    }
}

// ------------------------------------------------------------
// File-backed cache
// ------------------------------------------------------------

pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn read_entry(path: &Path) -> io::Result<CacheEntry> {
        let s = fs::read_to_string(path)?;
        serde_json::from_str(&s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl ResponseCache for FileCache {
    fn get(&self, key: &str, ttl: Option<Duration>) -> Option<CacheEntry> {
        let path = self.path_for(key);
        let entry = match Self::read_entry(&path) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(target: "enrich::cache", key, error = %e, "unreadable cache entry, dropping");
                let _ = fs::remove_file(&path);
                return None;
            }
        };
        if entry.is_expired(ttl, Utc::now()) {
            debug!(target: "enrich::cache", key, "cache entry expired");
            let _ = fs::remove_file(&path);
            return None;
        }
        Some(entry)
    }

    fn put(&self, entry: &CacheEntry) -> io::Result<()> {
        let path = self.path_for(&entry.key);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&json)?;
        f.sync_all()?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn purge(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn purge_source(&self, source_type: &str) -> io::Result<usize> {
        let mut removed = 0;
        for e in self.entries() {
            if e.source_type == source_type {
                self.purge(&e.key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn entries(&self) -> Vec<CacheEntry> {
        let Ok(rd) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        rd.filter_map(|de| de.ok())
            .map(|de| de.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .filter_map(|p| Self::read_entry(&p).ok())
            .collect()
    }
}

// ------------------------------------------------------------
// In-memory cache
// ------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "cache lock poisoned")
}

impl ResponseCache for MemoryCache {
    fn get(&self, key: &str, ttl: Option<Duration>) -> Option<CacheEntry> {
        let mut map = self.inner.lock().ok()?;
        let expired = map.get(key)?.is_expired(ttl, Utc::now());
        if expired {
            map.remove(key);
            return None;
        }
        map.get(key).cloned()
    }

    fn put(&self, entry: &CacheEntry) -> io::Result<()> {
        let mut map = self.inner.lock().map_err(|_| poisoned())?;
        map.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    fn purge(&self, key: &str) -> io::Result<()> {
        let mut map = self.inner.lock().map_err(|_| poisoned())?;
        map.remove(key);
        Ok(())
    }

    fn purge_source(&self, source_type: &str) -> io::Result<usize> {
        let mut map = self.inner.lock().map_err(|_| poisoned())?;
        let before = map.len();
        map.retain(|_, e| e.source_type != source_type);
        Ok(before - map.len())
    }

    fn entries(&self) -> Vec<CacheEntry> {
        self.inner
            .lock()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}
