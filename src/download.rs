//! 通过外部 `yt-dlp` 下载视频或音频，每次请求输出到一个独立目录。

use chrono::Local;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_stream::wrappers::ReadDirStream;
use tokio_stream::StreamExt;
use url::Url;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::DownloadError;

// 错误信息只保留 stderr 的最后一段
pub(crate) const STDERR_TAIL_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadKind {
    Video,
    Audio,
}

/// 写入输出目录的一个文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedFile {
    pub folder: String,
    pub filename: String,
}

pub struct Downloader {
    ytdlp: PathBuf,
    output_dir: PathBuf,
    permits: Arc<Semaphore>,
}

impl Downloader {
    pub fn new(ytdlp: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, max_concurrent: usize) -> Self {
        Self {
            ytdlp: ytdlp.into(),
            output_dir: output_dir.into(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// 下载和格式转换共用同一组许可
    pub fn permits(&self) -> Arc<Semaphore> {
        self.permits.clone()
    }

    /// 下载到 `folder` 目录，未指定或为 `default` 时使用时间戳目录名
    pub async fn download(
        &self,
        url: &str,
        kind: DownloadKind,
        folder: Option<&str>,
    ) -> Result<SavedFile, DownloadError> {
        let parsed = Url::parse(url.trim()).map_err(|_| DownloadError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidUrl(url.to_string()));
        }

        let folder = output_folder(folder)
            .ok_or_else(|| DownloadError::InvalidFolder(folder.unwrap_or_default().to_string()))?;
        let target = self.output_dir.join(&folder);
        fs::create_dir_all(&target).await?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| DownloadError::Io(std::io::Error::other(e)))?;

        info!("开始下载 {:?}: {} -> {}", kind, parsed, target.display());
        let output = Command::new(&self.ytdlp)
            .args(ytdlp_args(kind, &target, parsed.as_str()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = tail_chars(stderr.trim(), STDERR_TAIL_CHARS);
            warn!("下载失败 {}: {}", parsed, tail);
            return Err(DownloadError::ToolFailed {
                status: output.status.to_string(),
                stderr: tail,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let filename = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .and_then(|line| Path::new(line).file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or(DownloadError::NoOutput)?;

        info!("下载完成: {}/{}", folder, filename);
        Ok(SavedFile { folder, filename })
    }

    /// 列出下载目录中的文件，目录不存在时返回 `None`
    pub async fn list(&self, folder: &str) -> Result<Option<Vec<String>>, DownloadError> {
        let Some(dir) = self.resolve(folder, None) else {
            return Ok(None);
        };
        let read_dir = match fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut entries = ReadDirStream::new(read_dir);
        let mut files = Vec::new();
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if entry.file_type().await?.is_file() {
                files.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        files.sort();
        Ok(Some(files))
    }

    /// 把整个目录打成 zip 包放在内存中返回，目录不存在时返回 `None`。
    /// 只包含目录下的普通文件，按文件名排序。
    pub async fn zip_folder(&self, folder: &str) -> Result<Option<Vec<u8>>, DownloadError> {
        let Some(files) = self.list(folder).await? else {
            return Ok(None);
        };
        let Some(dir) = self.resolve(folder, None) else {
            return Ok(None);
        };

        debug!("打包目录 {} ({} 个文件)", folder, files.len());
        let archive = tokio::task::spawn_blocking(move || zip_files(&dir, &files))
            .await
            .map_err(|e| DownloadError::Io(std::io::Error::other(e)))??;
        Ok(Some(archive))
    }

    /// 拼出下载文件的路径，名称中带路径分隔符或为 `..` 时返回 `None`
    pub fn resolve(&self, folder: &str, filename: Option<&str>) -> Option<PathBuf> {
        if !is_safe_name(folder) {
            return None;
        }
        let dir = self.output_dir.join(folder);
        match filename {
            Some(name) if is_safe_name(name) => Some(dir.join(name)),
            Some(_) => None,
            None => Some(dir),
        }
    }
}

/// 请求中的输出目录名，未指定、为空或为 `default` 时生成时间戳目录名。
/// 名称不安全时返回 `None`。
pub(crate) fn output_folder(requested: Option<&str>) -> Option<String> {
    match requested.map(str::trim) {
        Some(name) if !name.is_empty() && name != "default" => {
            is_safe_name(name).then(|| name.to_string())
        }
        _ => Some(Local::now().format("%Y%m%d_%H%M%S").to_string()),
    }
}

fn zip_files(dir: &Path, files: &[String]) -> Result<Vec<u8>, DownloadError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for name in files {
        writer.start_file(name.as_str(), options)?;
        let mut file = std::fs::File::open(dir.join(name))?;
        std::io::copy(&mut file, &mut writer)?;
    }
    Ok(writer.finish()?.into_inner())
}

fn ytdlp_args(kind: DownloadKind, target: &Path, url: &str) -> Vec<String> {
    let template = target.join("%(title)s.%(ext)s").to_string_lossy().into_owned();
    let mut args: Vec<String> = match kind {
        DownloadKind::Video => vec![
            "-f".into(),
            "bestvideo+bestaudio/best".into(),
            "--merge-output-format".into(),
            "mp4".into(),
        ],
        DownloadKind::Audio => vec![
            "-f".into(),
            "bestaudio/best".into(),
            "-x".into(),
            "--audio-format".into(),
            "mp3".into(),
            "--audio-quality".into(),
            "192K".into(),
        ],
    };
    args.extend([
        "--no-playlist".into(),
        "--no-progress".into(),
        "-o".into(),
        template,
        "--print".into(),
        "after_move:filepath".into(),
        "--no-simulate".into(),
        url.to_string(),
    ]);
    args
}

pub(crate) fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

pub(crate) fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_args_extract_mp3() {
        let args = ytdlp_args(DownloadKind::Audio, Path::new("out/x"), "https://youtu.be/abc");
        assert!(args.windows(2).any(|w| w[0] == "--audio-format" && w[1] == "mp3"));
        assert!(args.contains(&"-x".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/abc"));
    }

    #[test]
    fn video_args_merge_to_mp4() {
        let args = ytdlp_args(DownloadKind::Video, Path::new("out/x"), "https://youtu.be/abc");
        assert!(args.windows(2).any(|w| w[0] == "--merge-output-format" && w[1] == "mp4"));
        assert!(args.windows(2).any(|w| w[0] == "--print" && w[1] == "after_move:filepath"));
    }

    #[test]
    fn rejects_traversal_names() {
        let downloader = Downloader::new("yt-dlp", "output", 1);
        assert!(downloader.resolve("..", None).is_none());
        assert!(downloader.resolve("a/b", None).is_none());
        assert!(downloader.resolve("ok", Some("../secret")).is_none());
        assert_eq!(
            downloader.resolve("ok", Some("song.mp3")),
            Some(PathBuf::from("output").join("ok").join("song.mp3"))
        );
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new("/nonexistent/yt-dlp", dir.path(), 1);
        let err = downloader.download("not a url", DownloadKind::Video, None).await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl(_)));
        let err = downloader.download("file:///etc/passwd", DownloadKind::Audio, None).await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn lists_files_in_folder() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("batch");
        std::fs::create_dir_all(folder.join("sub")).unwrap();
        std::fs::write(folder.join("b.mp3"), b"b").unwrap();
        std::fs::write(folder.join("a.mp4"), b"a").unwrap();

        let downloader = Downloader::new("yt-dlp", dir.path(), 1);
        let files = downloader.list("batch").await.unwrap();
        assert_eq!(files, Some(vec!["a.mp4".to_string(), "b.mp3".to_string()]));
        assert_eq!(downloader.list("missing").await.unwrap(), None);
    }

    #[test]
    fn default_folder_is_a_timestamp() {
        for requested in [None, Some(""), Some("  "), Some("default")] {
            let name = output_folder(requested).unwrap();
            assert_eq!(name.len(), 15, "{name}");
            assert_eq!(name.as_bytes()[8], b'_');
            assert!(name.chars().filter(|c| *c != '_').all(|c| c.is_ascii_digit()));
        }
        assert_eq!(output_folder(Some(" mine ")).as_deref(), Some("mine"));
        assert_eq!(output_folder(Some("../up")), None);
    }

    #[tokio::test]
    async fn zips_every_file_in_folder() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("batch");
        std::fs::create_dir_all(folder.join("nested")).unwrap();
        std::fs::write(folder.join("a.mp3"), b"first").unwrap();
        std::fs::write(folder.join("b.mp4"), b"second").unwrap();

        let downloader = Downloader::new("yt-dlp", dir.path(), 1);
        let bytes = downloader.zip_folder("batch").await.unwrap().unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut contents = String::new();
        archive.by_name("b.mp4").unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "second");

        assert!(downloader.zip_folder("missing").await.unwrap().is_none());
        assert!(downloader.zip_folder("..").await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reports_the_printed_file_name() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-ytdlp.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"[info] working\" >&2\necho \"$PWD/ignored\"\necho \"/tmp/out/My Song.mp3\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let downloader = Downloader::new(&script, dir.path().join("output"), 1);
        let outcome = downloader
            .download("https://youtu.be/dQw4w9WgXcQ", DownloadKind::Audio, Some("mine"))
            .await
            .unwrap();
        assert_eq!(outcome.folder, "mine");
        assert_eq!(outcome.filename, "My Song.mp3");
        assert!(dir.path().join("output").join("mine").is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tool_failure_carries_stderr() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("failing.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"ERROR: unsupported url\" >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let downloader = Downloader::new(&script, dir.path().join("output"), 1);
        let err = downloader
            .download("https://example.com/v", DownloadKind::Video, None)
            .await
            .unwrap_err();
        match err {
            DownloadError::ToolFailed { stderr, .. } => assert!(stderr.contains("unsupported url")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
