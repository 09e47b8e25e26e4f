use log::{info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::convert::Converter;
use crate::download::Downloader;
use crate::error::ApiError;
use crate::metadata::{MetadataFetcher, VideoApi, YouTubeClient};
use crate::quota::QuotaManager;

/// 进程内共享的状态，启动时构建一次，然后交给每个请求处理函数
pub struct AppContext {
    pub fetcher: MetadataFetcher,
    pub downloader: Downloader,
    pub converter: Converter,
}

impl AppContext {
    pub fn new(fetcher: MetadataFetcher, downloader: Downloader, converter: Converter) -> Self {
        Self {
            fetcher,
            downloader,
            converter,
        }
    }

    pub async fn from_config(config: &Config) -> Result<Self, ApiError> {
        let quota = QuotaManager::load(
            config.daily_limit,
            &config.quota_file,
            &config.cache_file,
            config.cache_capacity,
        )
        .await;

        let api: Option<Arc<dyn VideoApi>> = match &config.api_key {
            Some(key) => Some(Arc::new(YouTubeClient::new(key.clone())?)),
            None => {
                warn!("未设置 YOUTUBE_API_KEY，只能返回已缓存的元数据");
                None
            }
        };
        info!("每日 API 配额: {}", config.daily_limit);

        let fetcher = MetadataFetcher::new(api, Arc::new(Mutex::new(quota)));
        let downloader = Downloader::new(
            &config.ytdlp_path,
            &config.output_dir,
            config.max_concurrent_downloads,
        );
        let converter = Converter::new(
            &config.ffmpeg_path,
            &config.output_dir,
            &config.upload_dir,
            downloader.permits(),
        );
        Ok(Self::new(fetcher, downloader, converter))
    }
}
