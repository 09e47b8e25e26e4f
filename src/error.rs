use std::io;

use http::StatusCode;
use thiserror::Error;

/// 调用视频元数据 API 失败
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("请求失败: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API 返回状态码 {0}")]
    Status(StatusCode),
    #[error("未找到视频 {0}")]
    NotFound(String),
    #[error("响应格式错误: {0}")]
    Malformed(String),
}

/// 读写持久化 json 文件失败
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("无效的链接: {0}")]
    InvalidUrl(String),
    #[error("非法目录名: {0}")]
    InvalidFolder(String),
    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),
    #[error("下载工具异常退出 ({status}): {stderr}")]
    ToolFailed { status: String, stderr: String },
    #[error("下载工具没有输出文件")]
    NoOutput,
    #[error("打包失败: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// 上传文件的格式转换失败
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("不支持的转换选项: {0}")]
    InvalidOption(String),
    #[error("非法名称: {0}")]
    InvalidName(String),
    #[error("没有上传文件")]
    MissingFile,
    #[error("上传内容无效: {0}")]
    Multipart(#[from] multer::Error),
    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),
    #[error("转换工具异常退出 ({status}): {stderr}")]
    ToolFailed { status: String, stderr: String },
    #[error("图片处理失败: {0}")]
    Image(#[from] image::ImageError),
    #[error("转换任务异常结束: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置项 {key} 的值无效: {value}")]
    Invalid { key: &'static str, value: String },
}
