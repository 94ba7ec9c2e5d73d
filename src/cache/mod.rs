//! Response cache: resource bodies keyed by request path, kept in an
//! [`OrderedIndex`] and refreshed in place once their freshness budget runs
//! out.

mod backing;

pub use backing::{Backing, FsBacking, Identity, Kind, Metadata};

#[cfg(test)]
pub(crate) use backing::MemoryBacking;

use crate::http::mime::MimeType;
use crate::index::{IndexPolicy, OrderedIndex};
use crate::util::{lock, now_millis};
use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::DateTime;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::cmp::Ordering;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Freshness budget for a cached body (5 minutes).
pub const DEFAULT_FRESHNESS_MS: u64 = 300_000;
/// Entries untouched for this long are evicted by the sweep (1 day).
pub const DEFAULT_MAX_AGE_MS: u64 = 86_400_000;
pub const DEFAULT_MAX_ENTRIES: usize = 1024;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 9;

/// Errors produced while resolving a cache entry.
#[derive(Debug)]
pub enum CacheError {
    NotFound,
    Forbidden,
    IsDirectory,
    Io(io::Error),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::NotFound => write!(f, "no such resource"),
            CacheError::Forbidden => write!(f, "access forbidden"),
            CacheError::IsDirectory => write!(f, "resource is a directory"),
            CacheError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(e: io::Error) -> Self {
        CacheError::Io(e)
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Age after which an entry is revalidated against its backing.
    pub freshness_ms: u64,
    /// Age after which the sweep evicts an entry.
    pub max_age_ms: u64,
    pub max_entries: usize,
    pub compression_level: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            freshness_ms: DEFAULT_FRESHNESS_MS,
            max_age_ms: DEFAULT_MAX_AGE_MS,
            max_entries: DEFAULT_MAX_ENTRIES,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// Immutable snapshot of a cached resource.
#[derive(Debug)]
pub struct Content {
    pub mime: MimeType,
    pub etag: String,
    pub last_modified: String,
    pub identity: Identity,
    pub body: Bytes,
    /// Deflate-encoded body, present for text-like content.
    pub compressed: Option<Bytes>,
}

/// One cached resource. The content is swapped atomically on reload, so
/// responses that already hold a snapshot keep serving it.
#[derive(Debug)]
pub struct CacheEntry {
    path: String,
    stamp: AtomicU64,
    content: ArcSwap<Content>,
}

impl CacheEntry {
    fn new(path: &str, content: Content, now: u64) -> Self {
        Self {
            path: path.to_string(),
            stamp: AtomicU64::new(now),
            content: ArcSwap::from_pointee(content),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Time of the last population or revalidation, in milliseconds.
    pub fn stamp(&self) -> u64 {
        self.stamp.load(atomic::Ordering::Acquire)
    }

    pub fn content(&self) -> Arc<Content> {
        self.content.load_full()
    }

    fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.stamp())
    }
}

/// Orders cache entries by path.
pub struct ByPath;

impl IndexPolicy<Arc<CacheEntry>> for ByPath {
    type Key = str;

    fn key<'a>(&self, item: &'a Arc<CacheEntry>) -> &'a str {
        &item.path
    }

    fn compare(&self, a: &str, b: &str) -> Ordering {
        a.cmp(b)
    }

    fn destroy(&self, item: Arc<CacheEntry>) {
        trace!(path = %item.path, "Cache entry released");
    }

    fn describe(&self, item: &Arc<CacheEntry>) -> String {
        format!("{} (stamp {})", item.path, item.stamp())
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    revalidations: AtomicU64,
    reloads: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub revalidations: u64,
    pub reloads: u64,
    pub evictions: u64,
}

pub struct Cache {
    index: Mutex<OrderedIndex<Arc<CacheEntry>, ByPath>>,
    backing: Arc<dyn Backing>,
    settings: CacheSettings,
    counters: Counters,
}

impl Cache {
    pub fn new(backing: Arc<dyn Backing>, settings: CacheSettings) -> Self {
        Self {
            index: Mutex::new(OrderedIndex::with_limit(ByPath, settings.max_entries)),
            backing,
            settings,
            counters: Counters::default(),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        lock(&self.index).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve `path`, serving the cached entry while it is younger than
    /// `budget_ms` and revalidating it against the backing otherwise.
    pub fn lookup_or_populate(
        &self,
        path: &str,
        budget_ms: u64,
    ) -> Result<Arc<CacheEntry>, CacheError> {
        self.lookup_or_populate_at(path, budget_ms, now_millis())
    }

    pub fn lookup_or_populate_at(
        &self,
        path: &str,
        budget_ms: u64,
        now: u64,
    ) -> Result<Arc<CacheEntry>, CacheError> {
        let found = lock(&self.index).search(path).cloned();

        if let Some(entry) = found {
            if entry.age(now) < budget_ms {
                self.counters.hits.fetch_add(1, atomic::Ordering::Relaxed);
                trace!(path, "Cache hit");
                return Ok(entry);
            }
            return self.refresh(entry, now);
        }

        self.counters.misses.fetch_add(1, atomic::Ordering::Relaxed);
        let meta = self.file_metadata(path)?;
        let entry = Arc::new(CacheEntry::new(path, self.load(path, meta)?, now));

        let mut index = lock(&self.index);
        if let Some(existing) = index.search(path) {
            // Another worker populated the same path first.
            return Ok(Arc::clone(existing));
        }
        match index.try_insert(Arc::clone(&entry)) {
            Ok(()) => debug!(path, "Cache entry added"),
            Err(_) => warn!(path, entries = index.len(), "Cache full, serving uncached"),
        }
        Ok(entry)
    }

    /// Revalidate a stale entry. Runs outside the index lock.
    fn refresh(&self, entry: Arc<CacheEntry>, now: u64) -> Result<Arc<CacheEntry>, CacheError> {
        let meta = match self.file_metadata(&entry.path) {
            Ok(meta) => meta,
            Err(e) => {
                if matches!(e, CacheError::NotFound | CacheError::IsDirectory) {
                    lock(&self.index).remove(&entry.path);
                    debug!(path = %entry.path, "Cache entry dropped, resource gone");
                }
                return Err(e);
            }
        };

        if meta.identity == entry.content().identity {
            self.counters
                .revalidations
                .fetch_add(1, atomic::Ordering::Relaxed);
            debug!(path = %entry.path, "Cache entry revalidated");
        } else {
            let content = self.load(&entry.path, meta)?;
            entry.content.store(Arc::new(content));
            self.counters.reloads.fetch_add(1, atomic::Ordering::Relaxed);
            debug!(path = %entry.path, "Cache entry reloaded");
        }
        entry.stamp.store(now, atomic::Ordering::Release);
        Ok(entry)
    }

    fn file_metadata(&self, path: &str) -> Result<Metadata, CacheError> {
        let meta = self.backing.metadata(path)?;
        if meta.kind == Kind::Directory {
            return Err(CacheError::IsDirectory);
        }
        Ok(meta)
    }

    fn load(&self, path: &str, meta: Metadata) -> Result<Content, CacheError> {
        let body = self.backing.read(path)?;
        let mime = MimeType::from_path(path);
        let compressed = if mime.is_compressible() {
            Some(deflate(&body, self.settings.compression_level)?)
        } else {
            None
        };

        let Identity { inode, size, mtime } = meta.identity;
        Ok(Content {
            mime,
            etag: format!("\"{inode}-{size}-{mtime}\""),
            last_modified: http_date(mtime),
            identity: meta.identity,
            body,
            compressed,
        })
    }

    /// Evict entries older than the configured maximum age.
    pub fn sweep(&self) -> usize {
        self.sweep_at(now_millis())
    }

    pub fn sweep_at(&self, now: u64) -> usize {
        let max_age = self.settings.max_age_ms;
        let candidates: Vec<String> = lock(&self.index)
            .iter()
            .filter(|entry| entry.age(now) >= max_age)
            .map(|entry| entry.path.clone())
            .collect();

        let mut evicted = 0;
        for path in candidates {
            let mut index = lock(&self.index);
            // Revalidated since the walk.
            let expired = index
                .search(path.as_str())
                .is_some_and(|entry| entry.age(now) >= max_age);
            if expired && index.remove(path.as_str()) {
                evicted += 1;
                debug!(path = %path, "Cache entry expired");
            }
        }

        self.counters
            .evictions
            .fetch_add(evicted as u64, atomic::Ordering::Relaxed);
        evicted
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.counters.hits.load(atomic::Ordering::Relaxed),
            misses: self.counters.misses.load(atomic::Ordering::Relaxed),
            revalidations: self.counters.revalidations.load(atomic::Ordering::Relaxed),
            reloads: self.counters.reloads.load(atomic::Ordering::Relaxed),
            evictions: self.counters.evictions.load(atomic::Ordering::Relaxed),
        }
    }

    /// Log every cached path at debug level.
    pub fn dump(&self) {
        lock(&self.index).dump("cache");
    }
}

fn deflate(data: &[u8], level: u32) -> io::Result<Bytes> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder.write_all(data)?;
    Ok(Bytes::from(encoder.finish()?))
}

/// IMF-fixdate rendering of a Unix timestamp, as used by `Last-Modified`.
pub fn http_date(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    const B: u64 = 1_000;

    fn cache_with(files: &[(&str, &[u8])]) -> (Cache, Arc<MemoryBacking>) {
        let backing = Arc::new(MemoryBacking::default());
        for (path, body) in files {
            backing.put(path, body, 1_700_000_000);
        }
        let cache = Cache::new(
            backing.clone(),
            CacheSettings {
                max_age_ms: 10 * B,
                ..Default::default()
            },
        );
        (cache, backing)
    }

    #[test]
    fn test_miss_populates() {
        let (cache, backing) = cache_with(&[("/a.bin", b"abc")]);
        let entry = cache.lookup_or_populate_at("/a.bin", B, 0).unwrap();

        assert_eq!(entry.path(), "/a.bin");
        assert_eq!(&entry.content().body[..], b"abc");
        assert!(entry.content().compressed.is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(backing.reads(), 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_fresh_hit_is_unchanged() {
        let (cache, backing) = cache_with(&[("/a", b"abc")]);
        let first = cache.lookup_or_populate_at("/a", B, 1_000).unwrap();
        let body = first.content().body.as_ptr();

        backing.put("/a", b"changed", 1_700_000_001);
        let second = cache.lookup_or_populate_at("/a", B, 1_000 + B - 1).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.content().body.as_ptr(), body);
        assert_eq!(second.stamp(), 1_000);
        assert_eq!(backing.reads(), 1);
    }

    #[test]
    fn test_stale_unchanged_refreshes_stamp_only() {
        let (cache, backing) = cache_with(&[("/a", b"abc")]);
        let first = cache.lookup_or_populate_at("/a", B, 1_000).unwrap();
        let body = first.content().body.as_ptr();

        let second = cache.lookup_or_populate_at("/a", B, 1_000 + B + 1).unwrap();
        assert_eq!(second.stamp(), 1_000 + B + 1);
        assert_eq!(second.content().body.as_ptr(), body);
        assert_eq!(backing.reads(), 1);
        assert_eq!(cache.stats().revalidations, 1);
    }

    #[test]
    fn test_stale_changed_reloads_content() {
        let (cache, backing) = cache_with(&[("/a", b"abc")]);
        let first = cache.lookup_or_populate_at("/a", B, 1_000).unwrap();
        let old = first.content();

        backing.put("/a", b"new body", 1_700_000_100);
        let second = cache.lookup_or_populate_at("/a", B, 1_000 + B + 1).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(&second.content().body[..], b"new body");
        assert_ne!(second.content().etag, old.etag);
        // Holders of the previous snapshot still see the old body.
        assert_eq!(&old.body[..], b"abc");
        assert_eq!(cache.stats().reloads, 1);
    }

    #[test]
    fn test_stale_deleted_is_dropped() {
        let (cache, backing) = cache_with(&[("/a", b"abc")]);
        cache.lookup_or_populate_at("/a", B, 0).unwrap();
        backing.delete("/a");

        assert!(matches!(
            cache.lookup_or_populate_at("/a", B, B + 1),
            Err(CacheError::NotFound)
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_missing_resource() {
        let (cache, _) = cache_with(&[]);
        assert!(matches!(
            cache.lookup_or_populate_at("/nope", B, 0),
            Err(CacheError::NotFound)
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_text_is_compressed() {
        let text = "hello world ".repeat(100);
        let (cache, _) = cache_with(&[("/index.html", text.as_bytes())]);
        let content = cache.lookup_or_populate_at("/index.html", B, 0).unwrap().content();

        let compressed = content.compressed.clone().unwrap();
        assert!(compressed.len() < content.body.len());

        let mut decoded = String::new();
        ZlibDecoder::new(&compressed[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, text);
    }

    #[test]
    fn test_validators() {
        let (cache, _) = cache_with(&[("/a.txt", b"abcd")]);
        let content = cache.lookup_or_populate_at("/a.txt", B, 0).unwrap().content();
        assert_eq!(content.etag, "\"1-4-1700000000\"");
        assert_eq!(content.last_modified, "Tue, 14 Nov 2023 22:13:20 GMT");
        assert_eq!(content.mime, MimeType::Text);
    }

    #[test]
    fn test_full_cache_serves_uncached() {
        let backing = Arc::new(MemoryBacking::default());
        backing.put("/a", b"1", 0);
        backing.put("/b", b"2", 0);
        let cache = Cache::new(
            backing.clone(),
            CacheSettings {
                max_entries: 1,
                ..Default::default()
            },
        );

        cache.lookup_or_populate_at("/a", B, 0).unwrap();
        let b = cache.lookup_or_populate_at("/b", B, 0).unwrap();
        assert_eq!(&b.content().body[..], b"2");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_sweep_evicts_old_entries() {
        let (cache, _) = cache_with(&[("/a", b"1"), ("/b", b"2"), ("/c", b"3")]);
        cache.lookup_or_populate_at("/a", B, 0).unwrap();
        cache.lookup_or_populate_at("/b", B, 0).unwrap();
        cache.lookup_or_populate_at("/c", B, 5 * B).unwrap();

        assert_eq!(cache.sweep_at(10 * B - 1), 0);
        assert_eq!(cache.sweep_at(10 * B), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 2);

        let c = cache.lookup_or_populate_at("/c", B, 10 * B).unwrap();
        assert_eq!(c.path(), "/c");
    }

    #[test]
    fn test_http_date() {
        assert_eq!(http_date(0), "Thu, 01 Jan 1970 00:00:00 GMT");
    }
}
