mod client;
mod duration;
mod fetcher;

pub use client::*;
pub use duration::*;
pub use fetcher::*;

use serde::{Deserialize, Serialize};
use url::Url;

/// 描述摘要的最大字符数
pub const DESCRIPTION_EXCERPT_CHARS: usize = 200;

/// 归一化之后的视频元数据，也是缓存和接口返回的格式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub duration: String,
    pub view_count: u64,
    pub thumbnail: String,
    pub channel: String,
    pub upload_date: String,
    pub available: bool,
}

/// 从常见的 YouTube 链接中取出视频 ID，也接受直接传入的 11 位 ID
pub fn extract_video_id(input: &str) -> Option<String> {
    let input = input.trim();
    if is_video_id(input) {
        return Some(input.to_string());
    }

    let url = Url::parse(input).ok()?;
    let host = url.host_str()?.trim_start_matches("www.").trim_start_matches("m.");

    let candidate = match host {
        "youtu.be" => url.path_segments()?.next().map(str::to_string),
        "youtube.com" | "music.youtube.com" => {
            let mut segments = url.path_segments()?;
            match segments.next() {
                Some("watch") => url
                    .query_pairs()
                    .find(|(key, _)| key == "v")
                    .map(|(_, value)| value.into_owned()),
                Some("shorts") | Some("embed") | Some("live") => segments.next().map(str::to_string),
                _ => None,
            }
        }
        _ => None,
    };

    candidate.filter(|id| is_video_id(id))
}

fn is_video_id(s: &str) -> bool {
    s.len() == 11 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
