mod manager;
mod metadata_cache;
mod usage_store;

pub use manager::*;
pub use metadata_cache::*;
pub use usage_store::*;

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::StoreError;
use crate::metadata::VideoMetadata;

pub const DEFAULT_DAILY_LIMIT: u64 = 10_000;
pub const DEFAULT_CACHE_CAPACITY: usize = 5_000;
pub const FRESHNESS_WINDOW_HOURS: i64 = 24;

/// 某一天已消耗的 API 调用次数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub date: NaiveDate,
    pub used: u64,
}

impl UsageRecord {
    pub fn empty(date: NaiveDate) -> Self {
        Self { date, used: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: VideoMetadata,
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.cached_at < Duration::hours(FRESHNESS_WINDOW_HOURS)
    }
}

/// 配额按本地日期计算
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

// 先写临时文件再重命名，读取方不会看到写了一半的文件
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);
    tokio::fs::write(tmp_path, contents).await?;
    tokio::fs::rename(tmp_path, path).await?;
    Ok(())
}
