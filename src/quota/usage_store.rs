use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use log::warn;
use tokio::fs;

use super::{write_atomic, UsageRecord};
use crate::error::StoreError;

/// 每日用量计数，保存在一个 json 文件中
pub struct UsageStore {
    path: PathBuf,
}

impl UsageStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取今天的用量。文件不存在、无法读取、已损坏或日期不是今天时，计数为 0
    pub async fn load(&self, today: NaiveDate) -> UsageRecord {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return UsageRecord::empty(today),
            Err(e) => {
                warn!("无法读取配额文件 {}: {}", self.path.display(), e);
                return UsageRecord::empty(today);
            }
        };

        match serde_json::from_slice::<UsageRecord>(&raw) {
            Ok(record) if record.date == today => record,
            Ok(_) => UsageRecord::empty(today),
            Err(e) => {
                warn!("配额文件 {} 已损坏，重置计数: {}", self.path.display(), e);
                UsageRecord::empty(today)
            }
        }
    }

    pub async fn save(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.path, &json).await
    }
}
