use super::{write_atomic, CacheEntry};
use crate::error::StoreError;
use crate::metadata::VideoMetadata;
use chrono::{DateTime, Utc};
use log::warn;
use lru::LruCache;
use std::collections::HashMap;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 视频 ID -> 元数据的持久化缓存。
///
/// 整个映射保存在一个 json 文件里，每次写入都会重写整个文件。
/// 内存中按 LRU 限制条目数量，超出容量时淘汰最久未访问的条目。
pub struct MetadataCache {
    store: LruCache<String, CacheEntry>,
    path: PathBuf,
}

impl MetadataCache {
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store: LruCache::new(capacity),
            path: path.into(),
        }
    }

    /// 从磁盘加载，文件不存在或已损坏时得到空缓存
    pub async fn load(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let mut cache = Self::new(path, capacity);

        let raw = match fs::read(&cache.path).await {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("无法读取元数据缓存 {}: {}", cache.path.display(), e);
                }
                return cache;
            }
        };

        let entries: HashMap<String, CacheEntry> = match serde_json::from_slice(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("元数据缓存 {} 已损坏，忽略: {}", cache.path.display(), e);
                return cache;
            }
        };

        // 按缓存时间从旧到新插入，最新的条目最后被淘汰
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort_by_key(|(_, entry)| entry.cached_at);
        for (video_id, entry) in entries {
            cache.store.put(video_id, entry);
        }
        cache
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn get(&mut self, video_id: &str) -> Option<&CacheEntry> {
        self.store.get(video_id)
    }

    /// 仅返回仍在新鲜期内的条目，过期条目保留但不返回
    pub fn get_fresh(&mut self, video_id: &str, now: DateTime<Utc>) -> Option<&CacheEntry> {
        self.store.get(video_id).filter(|entry| entry.is_fresh(now))
    }

    pub fn insert(&mut self, video_id: String, data: VideoMetadata, cached_at: DateTime<Utc>) {
        self.store.put(video_id, CacheEntry { data, cached_at });
    }

    pub async fn save(&self) -> Result<(), StoreError> {
        let snapshot: HashMap<&String, &CacheEntry> = self.store.iter().collect();
        let json = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic(&self.path, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(title: &str) -> VideoMetadata {
        VideoMetadata {
            title: title.to_string(),
            description: String::new(),
            duration: "1:00".to_string(),
            view_count: 1,
            thumbnail: String::new(),
            channel: "channel".to_string(),
            upload_date: "2024-01-01".to_string(),
            available: true,
        }
    }

    #[tokio::test]
    async fn missing_or_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        assert!(MetadataCache::load(&path, 10).await.is_empty());

        std::fs::write(&path, b"[1, 2").unwrap();
        assert!(MetadataCache::load(&path, 10).await.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let now = Utc::now();

        let mut cache = MetadataCache::new(&path, 10);
        cache.insert("abc".to_string(), sample("first"), now);
        cache.save().await.unwrap();

        let mut reloaded = MetadataCache::load(&path, 10).await;
        let entry = reloaded.get("abc").unwrap();
        assert_eq!(entry.data.title, "first");
        assert_eq!(entry.cached_at, now);
    }

    #[test]
    fn stale_entries_are_kept_but_not_fresh() {
        let mut cache = MetadataCache::new("unused.json", 10);
        let now = Utc::now();
        cache.insert("old".to_string(), sample("old"), now - Duration::hours(25));
        cache.insert("new".to_string(), sample("new"), now - Duration::minutes(23 * 60 + 59));

        assert!(cache.get_fresh("old", now).is_none());
        assert!(cache.get("old").is_some());
        assert!(cache.get_fresh("new", now).is_some());
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let now = Utc::now();

        let mut cache = MetadataCache::new(&path, 10);
        cache.insert("a".to_string(), sample("a"), now - Duration::hours(3));
        cache.insert("b".to_string(), sample("b"), now - Duration::hours(2));
        cache.insert("c".to_string(), sample("c"), now - Duration::hours(1));
        cache.save().await.unwrap();

        let mut small = MetadataCache::load(&path, 2).await;
        assert_eq!(small.len(), 2);
        assert!(small.get("a").is_none());
        assert!(small.get("c").is_some());
    }
}
