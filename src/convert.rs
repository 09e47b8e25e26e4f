//! 上传文件的格式转换。视频提取 mp3、音频转 wav 交给外部 `ffmpeg`，
//! 图片格式转换在进程内用 `image` 完成。结果写入和下载相同的输出目录。

use chrono::Utc;
use image::{DynamicImage, ImageFormat, ImageReader};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::download::{is_safe_name, output_folder, tail_chars, SavedFile, STDERR_TAIL_CHARS};
use crate::error::ConvertError;

// 与启用的 image 编解码 feature 一致
const IMAGE_TARGETS: [ImageFormat; 6] = [
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::WebP,
    ImageFormat::Gif,
    ImageFormat::Bmp,
    ImageFormat::Tiff,
];

/// 表单里的 `convert_option`：`v2a`、`a2wav` 或 `img2<格式>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertOption {
    VideoToAudio,
    AudioToWav,
    Image(ImageFormat),
}

impl ConvertOption {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::VideoToAudio => "mp3",
            Self::AudioToWav => "wav",
            Self::Image(format) => format.extensions_str().first().copied().unwrap_or("img"),
        }
    }
}

impl FromStr for ConvertOption {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "v2a" => Ok(Self::VideoToAudio),
            "a2wav" => Ok(Self::AudioToWav),
            other => other
                .strip_prefix("img2")
                .and_then(ImageFormat::from_extension)
                .filter(|format| IMAGE_TARGETS.contains(format))
                .map(Self::Image)
                .ok_or_else(|| ConvertError::InvalidOption(s.to_string())),
        }
    }
}

pub struct Converter {
    ffmpeg: PathBuf,
    output_dir: PathBuf,
    upload_dir: PathBuf,
    permits: Arc<Semaphore>,
}

impl Converter {
    pub fn new(
        ffmpeg: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        upload_dir: impl Into<PathBuf>,
        permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            output_dir: output_dir.into(),
            upload_dir: upload_dir.into(),
            permits,
        }
    }

    /// 为一次上传分配暂存路径，同名上传互不覆盖
    pub async fn staging_path(&self, original_name: &str) -> Result<PathBuf, ConvertError> {
        fs::create_dir_all(&self.upload_dir).await?;
        let name = Path::new(original_name)
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| is_safe_name(name))
            .unwrap_or("upload");
        let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Ok(self.upload_dir.join(format!("{}_{}", stamp, name)))
    }

    /// 把暂存的 `input` 转换后写入 `folder`。
    ///
    /// 输出文件名为 `custom_name`（未给出时取上传文件名去掉扩展名）加上目标扩展名；
    /// 目录名规则和下载一致。
    pub async fn convert(
        &self,
        input: &Path,
        original_name: &str,
        option: ConvertOption,
        custom_name: Option<&str>,
        folder: Option<&str>,
    ) -> Result<SavedFile, ConvertError> {
        let folder = output_folder(folder)
            .ok_or_else(|| ConvertError::InvalidName(folder.unwrap_or_default().to_string()))?;
        let filename = format!("{}.{}", output_stem(custom_name, original_name)?, option.extension());
        let target = self.output_dir.join(&folder);
        fs::create_dir_all(&target).await?;
        let output = target.join(&filename);

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ConvertError::Io(std::io::Error::other(e)))?;

        info!("开始转换 {:?}: {} -> {}", option, original_name, output.display());
        match option {
            ConvertOption::VideoToAudio | ConvertOption::AudioToWav => {
                self.run_ffmpeg(ffmpeg_args(option, input, &output)).await?;
            }
            ConvertOption::Image(format) => {
                let input = input.to_path_buf();
                let output = output.clone();
                tokio::task::spawn_blocking(move || convert_image(&input, &output, format)).await??;
            }
        }

        info!("转换完成: {}/{}", folder, filename);
        Ok(SavedFile { folder, filename })
    }

    async fn run_ffmpeg(&self, args: Vec<String>) -> Result<(), ConvertError> {
        let output = Command::new(&self.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = tail_chars(stderr.trim(), STDERR_TAIL_CHARS);
            warn!("ffmpeg 转换失败: {}", tail);
            return Err(ConvertError::ToolFailed {
                status: output.status.to_string(),
                stderr: tail,
            });
        }
        Ok(())
    }
}

fn output_stem(custom_name: Option<&str>, original_name: &str) -> Result<String, ConvertError> {
    if let Some(name) = custom_name.map(str::trim).filter(|name| !name.is_empty()) {
        if !is_safe_name(name) {
            return Err(ConvertError::InvalidName(name.to_string()));
        }
        return Ok(name.to_string());
    }

    let stem = Path::new(original_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| is_safe_name(stem))
        .unwrap_or("converted");
    Ok(stem.to_string())
}

fn ffmpeg_args(option: ConvertOption, input: &Path, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-vn".into(),
    ];
    match option {
        ConvertOption::AudioToWav => args.extend(["-codec:a".into(), "pcm_s16le".into()]),
        _ => args.extend([
            "-codec:a".into(),
            "libmp3lame".into(),
            "-b:a".into(),
            "192k".into(),
        ]),
    }
    args.push(output.to_string_lossy().into_owned());
    args
}

fn convert_image(input: &Path, output: &Path, format: ImageFormat) -> Result<(), ConvertError> {
    let image = ImageReader::open(input)?.with_guessed_format()?.decode()?;

    // JPEG 不支持透明通道，WebP 编码器只接受 8 位 RGB(A)
    let image = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
        _ => DynamicImage::ImageRgba8(image.to_rgba8()),
    };
    image.save_with_format(output, format)?;
    Ok(())
}
