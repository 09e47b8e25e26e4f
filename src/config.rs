use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::quota::{DEFAULT_CACHE_CAPACITY, DEFAULT_DAILY_LIMIT};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
pub const DEFAULT_QUOTA_FILE: &str = "quota_usage.json";
pub const DEFAULT_CACHE_FILE: &str = "metadata_cache.json";
pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";

/// 运行时配置，启动时从环境变量读取一次
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// 为 `None` 时只能返回已缓存的元数据
    pub api_key: Option<String>,
    pub daily_limit: u64,
    pub quota_file: PathBuf,
    pub cache_file: PathBuf,
    pub cache_capacity: usize,
    pub output_dir: PathBuf,
    pub ytdlp_path: PathBuf,
    pub ffmpeg_path: PathBuf,
    /// 上传文件转换前的暂存目录
    pub upload_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            api_key: None,
            daily_limit: DEFAULT_DAILY_LIMIT,
            quota_file: PathBuf::from(DEFAULT_QUOTA_FILE),
            cache_file: PathBuf::from(DEFAULT_CACHE_FILE),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            ytdlp_path: PathBuf::from("yt-dlp"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            max_concurrent_downloads: 2,
            max_connections: 100,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 从任意键值来源构建配置，空值视为未设置
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Ok(Self {
            bind_addr: parse_or(get("BIND_ADDR"), "BIND_ADDR", defaults.bind_addr)?,
            api_key: get("YOUTUBE_API_KEY"),
            daily_limit: parse_or(get("DAILY_QUOTA_LIMIT"), "DAILY_QUOTA_LIMIT", defaults.daily_limit)?,
            quota_file: get("QUOTA_FILE").map(PathBuf::from).unwrap_or(defaults.quota_file),
            cache_file: get("CACHE_FILE").map(PathBuf::from).unwrap_or(defaults.cache_file),
            cache_capacity: parse_nonzero(get("CACHE_CAPACITY"), "CACHE_CAPACITY", defaults.cache_capacity)?,
            output_dir: get("BASE_OUTPUT_DIR").map(PathBuf::from).unwrap_or(defaults.output_dir),
            ytdlp_path: get("YTDLP_PATH").map(PathBuf::from).unwrap_or(defaults.ytdlp_path),
            ffmpeg_path: get("FFMPEG_PATH").map(PathBuf::from).unwrap_or(defaults.ffmpeg_path),
            upload_dir: get("UPLOAD_DIR").map(PathBuf::from).unwrap_or(defaults.upload_dir),
            max_concurrent_downloads: parse_nonzero(
                get("MAX_CONCURRENT_DOWNLOADS"),
                "MAX_CONCURRENT_DOWNLOADS",
                defaults.max_concurrent_downloads,
            )?,
            max_connections: parse_nonzero(get("MAX_CONNECTIONS"), "MAX_CONNECTIONS", defaults.max_connections)?,
        })
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
    match value {
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid { key, value: v }),
        None => Ok(default),
    }
}

fn parse_nonzero(value: Option<String>, key: &'static str, default: usize) -> Result<usize, ConfigError> {
    let parsed = parse_or(value, key, default)?;
    if parsed == 0 {
        return Err(ConfigError::Invalid { key, value: "0".to_string() });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.daily_limit, 10_000);
        assert!(config.api_key.is_none());
        assert_eq!(config.output_dir, PathBuf::from("output"));
        assert_eq!(config.upload_dir, PathBuf::from("uploads"));
        assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn empty_api_key_means_no_key() {
        let config = Config::from_lookup(lookup(&[("YOUTUBE_API_KEY", "  ")])).unwrap();
        assert!(config.api_key.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("YOUTUBE_API_KEY", "abc"),
            ("DAILY_QUOTA_LIMIT", "50"),
            ("BIND_ADDR", "0.0.0.0:8080"),
            ("FFMPEG_PATH", "/opt/bin/ffmpeg"),
        ]))
        .unwrap();
        assert_eq!(config.ffmpeg_path, PathBuf::from("/opt/bin/ffmpeg"));
        assert_eq!(config.api_key.as_deref(), Some("abc"));
        assert_eq!(config.daily_limit, 50);
        assert_eq!(config.bind_addr.port(), 8080);
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = Config::from_lookup(lookup(&[("DAILY_QUOTA_LIMIT", "lots")])).unwrap_err();
        assert!(err.to_string().contains("DAILY_QUOTA_LIMIT"));
        assert!(Config::from_lookup(lookup(&[("CACHE_CAPACITY", "0")])).is_err());
    }
}
