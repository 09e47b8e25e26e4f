use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, warn};
use std::path::PathBuf;

use super::{today, MetadataCache, UsageRecord, UsageStore};
use crate::metadata::VideoMetadata;

/// 每日 API 配额和元数据缓存。
///
/// 构造时从磁盘加载一次，之后每次修改立即写回。磁盘读写失败只记录日志，
/// 内存中的状态继续有效，所以落盘是尽力而为的。
///
/// 本身不加锁，多个请求共享时需要放在同一把锁后面（见 `AppContext`）。
/// 多个进程共用同一组文件时仍可能互相覆盖。
pub struct QuotaManager {
    daily_limit: u64,
    usage: UsageRecord,
    usage_store: UsageStore,
    cache: MetadataCache,
}

impl QuotaManager {
    pub async fn load(
        daily_limit: u64,
        quota_file: impl Into<PathBuf>,
        cache_file: impl Into<PathBuf>,
        cache_capacity: usize,
    ) -> Self {
        let usage_store = UsageStore::new(quota_file);
        let usage = usage_store.load(today()).await;
        let cache = MetadataCache::load(cache_file, cache_capacity).await;
        debug!(
            "配额已加载: {}/{} ({}), 缓存条目 {}",
            usage.used,
            daily_limit,
            usage.date,
            cache.len()
        );

        Self {
            daily_limit,
            usage,
            usage_store,
            cache,
        }
    }

    pub fn daily_limit(&self) -> u64 {
        self.daily_limit
    }

    pub fn used_today(&mut self) -> u64 {
        self.roll_over(today());
        self.usage.used
    }

    pub fn can_use_api(&mut self) -> bool {
        self.roll_over(today());
        self.usage.used < self.daily_limit
    }

    /// 不检查上限，调用方应先调用 `can_use_api`
    pub async fn use_quota(&mut self, amount: u64) {
        self.roll_over(today());
        self.usage.used = self.usage.used.saturating_add(amount);
        debug!("消耗配额 {}，今日已用 {}/{}", amount, self.usage.used, self.daily_limit);
        self.persist_usage().await;
    }

    /// 有余量时预先记上一次调用，返回记账的日期。
    ///
    /// 调用外部接口前先占住配额，锁可以在等待响应期间释放；
    /// 调用失败后用返回的日期交给 `release_quota` 退还。
    pub async fn reserve_quota(&mut self) -> Option<NaiveDate> {
        if !self.can_use_api() {
            return None;
        }
        self.use_quota(1).await;
        Some(self.usage.date)
    }

    /// 退还 `reserve_quota` 占用的一次配额，日期已经变了就不再退还
    pub async fn release_quota(&mut self, reserved_on: NaiveDate) {
        self.roll_over(today());
        if self.usage.date != reserved_on {
            debug!("预占配额的日期 {} 已过，不再退还", reserved_on);
            return;
        }
        self.usage.used = self.usage.used.saturating_sub(1);
        debug!("退还 1 次配额，今日已用 {}/{}", self.usage.used, self.daily_limit);
        self.persist_usage().await;
    }

    pub fn remaining_quota(&mut self) -> u64 {
        self.roll_over(today());
        self.daily_limit.saturating_sub(self.usage.used)
    }

    pub fn cached(&mut self, video_id: &str, now: DateTime<Utc>) -> Option<VideoMetadata> {
        self.cache.get_fresh(video_id, now).map(|entry| entry.data.clone())
    }

    pub async fn store_metadata(&mut self, video_id: &str, data: VideoMetadata, now: DateTime<Utc>) {
        self.cache.insert(video_id.to_string(), data, now);

        if let Err(e) = self.cache.save().await {
            warn!(
                "保存元数据缓存 {} 失败，仅保留内存缓存: {}",
                self.cache.path().display(),
                e
            );
        }
    }

    async fn persist_usage(&self) {
        if let Err(e) = self.usage_store.save(&self.usage).await {
            warn!(
                "保存配额文件 {} 失败，仅保留内存计数: {}",
                self.usage_store.path().display(),
                e
            );
        }
    }

    // 进程跨天运行时，前一天的计数不能用来限制今天的调用
    fn roll_over(&mut self, today: NaiveDate) {
        if self.usage.date != today {
            debug!("日期从 {} 变为 {}，重置配额计数", self.usage.date, today);
            self.usage = UsageRecord::empty(today);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Days;

    async fn manager(dir: &tempfile::TempDir, limit: u64) -> QuotaManager {
        QuotaManager::load(
            limit,
            dir.path().join("usage.json"),
            dir.path().join("cache.json"),
            100,
        )
        .await
    }

    #[tokio::test]
    async fn exhausting_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut quota = manager(&dir, 3).await;

        for _ in 0..3 {
            assert!(quota.can_use_api());
            quota.use_quota(1).await;
        }
        assert!(!quota.can_use_api());
        assert_eq!(quota.remaining_quota(), 0);

        // 超出上限后剩余量不会变成负数
        quota.use_quota(1).await;
        assert_eq!(quota.remaining_quota(), 0);
        assert_eq!(quota.used_today(), 4);
    }

    #[tokio::test]
    async fn usage_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut quota = manager(&dir, 10).await;
        quota.use_quota(4).await;
        drop(quota);

        let mut reloaded = manager(&dir, 10).await;
        assert_eq!(reloaded.remaining_quota(), 6);
    }

    #[tokio::test]
    async fn yesterdays_usage_does_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let yesterday = today().checked_sub_days(Days::new(1)).unwrap();
        UsageStore::new(dir.path().join("usage.json"))
            .save(&UsageRecord { date: yesterday, used: 10 })
            .await
            .unwrap();

        let mut quota = manager(&dir, 10).await;
        assert!(quota.can_use_api());
        assert_eq!(quota.remaining_quota(), 10);
    }

    #[tokio::test]
    async fn day_change_while_running_resets() {
        let dir = tempfile::tempdir().unwrap();
        let mut quota = manager(&dir, 5).await;
        quota.use_quota(5).await;
        quota.usage.date = today().checked_sub_days(Days::new(1)).unwrap();

        assert!(quota.can_use_api());
        assert_eq!(quota.remaining_quota(), 5);
    }

    #[tokio::test]
    async fn reserve_stops_at_the_limit_and_release_refunds() {
        let dir = tempfile::tempdir().unwrap();
        let mut quota = manager(&dir, 2).await;

        let first = quota.reserve_quota().await;
        assert_eq!(first, Some(today()));
        assert!(quota.reserve_quota().await.is_some());
        assert_eq!(quota.reserve_quota().await, None);
        assert_eq!(quota.used_today(), 2);

        quota.release_quota(today()).await;
        assert_eq!(quota.remaining_quota(), 1);

        // 退还同样落盘
        let stored = UsageStore::new(dir.path().join("usage.json")).load(today()).await;
        assert_eq!(stored.used, 1);
    }

    #[tokio::test]
    async fn release_after_midnight_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut quota = manager(&dir, 5).await;
        quota.use_quota(3).await;

        let yesterday = today().checked_sub_days(Days::new(1)).unwrap();
        quota.release_quota(yesterday).await;
        assert_eq!(quota.used_today(), 3);

        // 计数已经是 0 时不会下溢
        let mut fresh = QuotaManager::load(
            5,
            dir.path().join("other.json"),
            dir.path().join("cache.json"),
            10,
        )
        .await;
        fresh.release_quota(today()).await;
        assert_eq!(fresh.used_today(), 0);
    }

    #[tokio::test]
    async fn unwritable_files_keep_memory_state() {
        let dir = tempfile::tempdir().unwrap();
        // 用目录占住文件路径，写入必然失败
        let blocked = dir.path().join("usage.json");
        std::fs::create_dir_all(blocked.join("x")).unwrap();

        let mut quota = QuotaManager::load(2, &blocked, dir.path().join("cache.json"), 10).await;
        quota.use_quota(1).await;
        assert_eq!(quota.remaining_quota(), 1);
    }
}
