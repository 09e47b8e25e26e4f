use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::ApiError;

pub const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";

// 请求超时时间（10秒）
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// 外部视频元数据接口，每次成功调用消耗一个配额单位
#[async_trait]
pub trait VideoApi: Send + Sync {
    async fn fetch_video_details(&self, video_id: &str) -> Result<RawVideo, ApiError>;
}

/// `videos.list` 返回的单个视频，只保留用到的字段
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawVideo {
    pub id: String,
    pub snippet: Option<RawSnippet>,
    pub content_details: Option<RawContentDetails>,
    pub statistics: Option<RawStatistics>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSnippet {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub channel_title: String,
    #[serde(default)]
    pub published_at: String,
    #[serde(default)]
    pub thumbnails: HashMap<String, RawThumbnail>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawThumbnail {
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawContentDetails {
    pub duration: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStatistics {
    // 接口把计数作为字符串返回
    pub view_count: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<RawVideo>,
}

/// YouTube Data API v3 客户端
pub struct YouTubeClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl YouTubeClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_base_url(api_key, YOUTUBE_API_BASE)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl VideoApi for YouTubeClient {
    async fn fetch_video_details(&self, video_id: &str) -> Result<RawVideo, ApiError> {
        let response = self
            .http
            .get(format!("{}/videos", self.base_url))
            .query(&[
                ("part", "snippet,contentDetails,statistics"),
                ("id", video_id),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status));
        }

        let body = response.bytes().await?;
        let list: VideoListResponse =
            serde_json::from_slice(&body).map_err(|e| ApiError::Malformed(e.to_string()))?;

        list.items
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::NotFound(video_id.to_string()))
    }
}
