use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{format_duration, RawVideo, VideoApi, VideoMetadata, DESCRIPTION_EXCERPT_CHARS};
use crate::error::ApiError;
use crate::quota::QuotaManager;

const THUMBNAIL_PREFERENCE: [&str; 3] = ["high", "medium", "default"];

pub type SharedQuota = Arc<Mutex<QuotaManager>>;

/// 按视频 ID 获取元数据：优先使用新鲜缓存，否则在配额允许时调用外部接口。
///
/// 任何失败都返回 `None`，原因只写日志。检查缓存和预占配额在同一次加锁内完成，
/// 等待接口响应时不持有锁，所以缓存命中不会排在慢请求后面；
/// 预占保证并发请求不会超额调用，接口失败时再退还。
pub struct MetadataFetcher {
    api: Option<Arc<dyn VideoApi>>,
    quota: SharedQuota,
}

impl MetadataFetcher {
    pub fn new(api: Option<Arc<dyn VideoApi>>, quota: SharedQuota) -> Self {
        Self { api, quota }
    }

    pub async fn get_metadata(&self, video_id: &str) -> Option<VideoMetadata> {
        let (api, reserved_on) = {
            let mut quota = self.quota.lock().await;

            if let Some(cached) = quota.cached(video_id, Utc::now()) {
                debug!("元数据缓存命中: {}", video_id);
                return Some(cached);
            }

            let Some(api) = &self.api else {
                debug!("未配置 API 密钥，无法获取 {}", video_id);
                return None;
            };
            let Some(reserved_on) = quota.reserve_quota().await else {
                info!("今日 API 配额已用完，无法获取 {}", video_id);
                return None;
            };
            (api.clone(), reserved_on)
        };

        debug!("元数据缓存未命中，调用接口: {}", video_id);
        let fetched = api.fetch_video_details(video_id).await;

        let mut quota = self.quota.lock().await;
        let raw = match fetched {
            Ok(raw) => raw,
            Err(e) => {
                warn!("获取视频 {} 元数据失败: {}", video_id, e);
                quota.release_quota(reserved_on).await;
                return None;
            }
        };

        // 接口已经成功返回，字段缺失也算一次调用
        let data = match normalize(raw) {
            Ok(data) => data,
            Err(e) => {
                warn!("视频 {} 元数据无法解析: {}", video_id, e);
                return None;
            }
        };

        quota.store_metadata(video_id, data.clone(), Utc::now()).await;
        Some(data)
    }

    pub async fn remaining_quota(&self) -> u64 {
        self.quota.lock().await.remaining_quota()
    }

    /// 配置了密钥且今日仍有配额
    pub async fn is_api_available(&self) -> bool {
        self.api.is_some() && self.quota.lock().await.can_use_api()
    }

    pub fn quota(&self) -> &SharedQuota {
        &self.quota
    }
}

/// 把接口原始数据整理成缓存格式
pub fn normalize(raw: RawVideo) -> Result<VideoMetadata, ApiError> {
    let snippet = raw
        .snippet
        .ok_or_else(|| ApiError::Malformed(format!("视频 {} 缺少 snippet", raw.id)))?;
    let duration = raw
        .content_details
        .map(|details| format_duration(&details.duration))
        .unwrap_or_else(|| "Unknown".to_string());
    let view_count = raw
        .statistics
        .and_then(|stats| stats.view_count)
        .and_then(|count| count.parse().ok())
        .unwrap_or(0);
    let thumbnail = THUMBNAIL_PREFERENCE
        .iter()
        .find_map(|size| snippet.thumbnails.get(*size))
        .map(|thumb| thumb.url.clone())
        .unwrap_or_default();
    let upload_date = snippet.published_at.chars().take(10).collect();

    Ok(VideoMetadata {
        title: snippet.title,
        description: excerpt(&snippet.description, DESCRIPTION_EXCERPT_CHARS),
        duration,
        view_count,
        thumbnail,
        channel: snippet.channel_title,
        upload_date,
        available: true,
    })
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
