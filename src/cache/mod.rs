//! 最小新鲜度缓存
//!
//! 目录式键值存储, 每个键一个文件 (`<md5(key)>.entry`):
//!
//! ```text
//! {"key": "...", "store_time": 1700000000.5, "expire_time": 1700003600.5, "crc32": 123, "length": 42}\n
//! <payload JSON>
//! ```
//!
//! 与普通 TTL 缓存的区别: 读取时额外给出 `min_recency`, 写入时间早于
//! `now - min_recency` 的条目即使尚未过期也视为未命中。
//!
//! 读写失败 (I/O、CRC 不符、截断、解析失败) 一律按未命中处理, 只记录告警。
//! 写入先写临时文件再 rename, 并发写入后写者生效。

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::observability::metrics::{CACHE_HITS, CACHE_MISSES, CACHE_WRITES};
use crate::query::types::SchemaRow;
use crate::{Result, SelectError};

/// 条目文件扩展名
const ENTRY_EXTENSION: &str = "entry";

// ═══════════════════════════════════════════════════════════════════════════
// 缓存内容
// ═══════════════════════════════════════════════════════════════════════════

/// 持久化的查询结果: schema 与原始记录一起保存, 保证字段映射与记录同一时期
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResults {
    pub source_schema: Vec<SchemaRow>,
    pub rows: Vec<JsonValue>,
}

/// 条目头
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryHeader {
    key: String,
    store_time: f64,
    expire_time: Option<f64>,
    crc32: u32,
    length: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// 统计
// ═══════════════════════════════════════════════════════════════════════════

/// 缓存统计
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub writes: AtomicU64,
}

/// 缓存统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

impl CacheStatsSnapshot {
    /// 命中率
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            return 0.0;
        }
        self.hits as f64 / (self.hits + self.misses) as f64
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 缓存
// ═══════════════════════════════════════════════════════════════════════════

/// 最小新鲜度缓存
#[derive(Debug, Clone)]
pub struct MinimumRecencyCache {
    directory: PathBuf,
    stats: Arc<CacheStats>,
}

impl MinimumRecencyCache {
    /// 打开 (必要时创建) 缓存目录
    pub fn open<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).map_err(|e| {
            SelectError::Cache(format!(
                "Failed to create cache directory {}: {}",
                directory.display(),
                e
            ))
        })?;
        Ok(Self {
            directory,
            stats: Arc::new(CacheStats::default()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// 读取; 条目写入时间早于 `min_recency` 秒前时视为未命中
    pub fn get<T: DeserializeOwned>(&self, key: &str, min_recency: u64) -> Option<T> {
        match self.read_entry(key, min_recency) {
            Ok(Some(value)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                CACHE_HITS.inc();
                debug!("Cache hit for {}", key);
                Some(value)
            }
            Ok(None) => {
                self.record_miss(key);
                None
            }
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                self.record_miss(key);
                None
            }
        }
    }

    /// 写入; `expire` 秒后过期 (None 表示不过期)
    pub fn set<T: Serialize>(&self, key: &str, value: &T, expire: Option<u64>) -> Result<()> {
        self.write_entry(key, value, now(), expire)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        CACHE_WRITES.inc();
        debug!("Cache entry stored for {}", key);
        Ok(())
    }

    /// 删除条目, 返回是否存在
    pub fn delete(&self, key: &str) -> bool {
        fs::remove_file(self.entry_path(key)).is_ok()
    }

    /// 清空全部条目, 返回删除数量
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION)
                && fs::remove_file(&path).is_ok()
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
        }
    }

    fn record_miss(&self, key: &str) {
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        CACHE_MISSES.inc();
        debug!("Cache miss for {}", key);
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.directory
            .join(format!("{:x}.{}", md5::compute(key.as_bytes()), ENTRY_EXTENSION))
    }

    fn read_entry<T: DeserializeOwned>(&self, key: &str, min_recency: u64) -> Result<Option<T>> {
        let bytes = match fs::read(self.entry_path(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let split = bytes
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| SelectError::Cache("entry header is truncated".into()))?;
        let header: EntryHeader = serde_json::from_slice(&bytes[..split])?;
        let payload = &bytes[split + 1..];

        if header.key != key {
            return Err(SelectError::Cache(format!(
                "entry belongs to a different key: {}",
                header.key
            )));
        }
        if payload.len() as u64 != header.length {
            return Err(SelectError::Cache(format!(
                "entry payload is truncated: {} of {} bytes",
                payload.len(),
                header.length
            )));
        }
        if crc32fast::hash(payload) != header.crc32 {
            return Err(SelectError::Cache("entry checksum mismatch".into()));
        }

        let current = now();
        if header.expire_time.map_or(false, |expire| expire <= current) {
            return Ok(None);
        }
        if header.store_time < current - min_recency as f64 {
            return Ok(None);
        }

        Ok(Some(serde_json::from_slice(payload)?))
    }

    fn write_entry<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        store_time: f64,
        expire: Option<u64>,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        let header = EntryHeader {
            key: key.to_string(),
            store_time,
            expire_time: expire.map(|seconds| store_time + seconds as f64),
            crc32: crc32fast::hash(&payload),
            length: payload.len() as u64,
        };

        let path = self.entry_path(key);
        let tmp_path = self
            .directory
            .join(format!(".{:016x}.tmp", rand::random::<u64>()));

        let written = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            serde_json::to_writer(&mut file, &header)?;
            file.write_all(b"\n")?;
            file.write_all(&payload)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp_path, &path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(SelectError::Cache(format!(
                "Failed to write cache entry {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }
}

/// 当前时间 (秒, 含小数)
fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn cache() -> (TempDir, MinimumRecencyCache) {
        let dir = TempDir::new().unwrap();
        let cache = MinimumRecencyCache::open(dir.path().join("default")).unwrap();
        (dir, cache)
    }

    fn envelope() -> CachedResults {
        CachedResults {
            source_schema: vec![SchemaRow::new("key", "str", None)],
            rows: vec![json!({"key": "ALPHA-1"}), json!({"key": "ALPHA-2"})],
        }
    }

    #[test]
    fn test_round_trip_within_recency() {
        let (_dir, cache) = cache();
        cache.set("k", &envelope(), Some(3600)).unwrap();
        let loaded: Option<CachedResults> = cache.get("k", 60);
        assert_eq!(loaded, Some(envelope()));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().writes, 1);
    }

    #[test]
    fn test_stale_entry_is_miss() {
        let (_dir, cache) = cache();
        cache.write_entry("k", &envelope(), now() - 120.0, None).unwrap();
        assert!(cache.get::<CachedResults>("k", 60).is_none());
        assert!(cache.get::<CachedResults>("k", 600).is_some());
    }

    #[test]
    fn test_expired_entry_is_miss() {
        let (_dir, cache) = cache();
        cache
            .write_entry("k", &envelope(), now() - 120.0, Some(60))
            .unwrap();
        assert!(cache.get::<CachedResults>("k", 3600).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_corrupted_entry_is_miss() {
        let (_dir, cache) = cache();
        cache.set("k", &envelope(), None).unwrap();
        let path = cache.entry_path("k");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0x01;
        fs::write(&path, bytes).unwrap();
        assert!(cache.get::<CachedResults>("k", 3600).is_none());

        fs::write(&path, b"not a header").unwrap();
        assert!(cache.get::<CachedResults>("k", 3600).is_none());
    }

    #[test]
    fn test_delete_and_clear() {
        let (_dir, cache) = cache();
        cache.set("a", &json!(1), None).unwrap();
        cache.set("b", &json!(2), None).unwrap();
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.clear().unwrap(), 1);
        assert!(cache.get::<JsonValue>("b", 3600).is_none());
    }
}
