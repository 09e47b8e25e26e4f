use crate::context::AppContext;
use crate::convert::ConvertOption;
use crate::download::{DownloadKind, SavedFile};
use crate::error::{ConvertError, DownloadError};
use crate::metadata::{extract_video_id, VideoMetadata};
use crate::server::upload::{read_convert_form, ConvertForm};
use crate::server::MAX_BODY_BYTES;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, Limited, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderValue, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

pub type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: String,
    option: DownloadKind,
    #[serde(default)]
    output_folder: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    folder: String,
    filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<VideoMetadata>,
}

#[derive(Debug, Serialize)]
struct ConvertResponse {
    folder: String,
    filename: String,
}

#[derive(Debug, Serialize)]
struct QuotaResponse {
    daily_limit: u64,
    used: u64,
    remaining: u64,
    api_available: bool,
}

#[derive(Debug, Serialize)]
struct FolderListing {
    folder: String,
    files: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

fn full(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed_unsync()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(e) => {
            warn!("序列化响应失败: {}", e);
            return empty(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    json_response(status, &ErrorBody { error: message })
}

fn empty(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(full(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// 分发一个请求。所有错误都转换成对应状态码的响应，不会返回 Err
pub async fn handle_request<B>(req: Request<B>, context: Arc<AppContext>) -> Result<Response<ResponseBody>, Infallible>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    let segments: Option<Vec<String>> = path
        .trim_matches('/')
        .split('/')
        .map(|s| urlencoding::decode(s).ok().map(|s| s.into_owned()))
        .collect();
    let Some(segments) = segments else {
        return Ok(error_response(StatusCode::BAD_REQUEST, "路径编码无效"));
    };
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["api", "metadata", video_id]) => metadata(&context, video_id).await,
        (&Method::GET, ["api", "quota"]) => quota(&context).await,
        (&Method::POST, ["api", "download"]) => download(&context, req.into_body()).await,
        (&Method::POST, ["api", "convert"]) => convert(&context, req).await,
        (&Method::GET, ["api", "downloads", folder]) => list_downloads(&context, folder).await,
        (&Method::GET, ["api", "downloads", folder, "zip"]) => zip_download(&context, folder).await,
        (&Method::GET, ["files", folder, filename]) => serve_file(&context, folder, filename).await,
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn metadata(context: &AppContext, video_id: &str) -> Response<ResponseBody> {
    match context.fetcher.get_metadata(video_id).await {
        Some(data) => json_response(StatusCode::OK, &data),
        None => error_response(StatusCode::NOT_FOUND, "unavailable"),
    }
}

async fn quota(context: &AppContext) -> Response<ResponseBody> {
    let (daily_limit, used, remaining) = {
        let mut quota = context.fetcher.quota().lock().await;
        (quota.daily_limit(), quota.used_today(), quota.remaining_quota())
    };
    let api_available = context.fetcher.is_api_available().await;

    json_response(
        StatusCode::OK,
        &QuotaResponse {
            daily_limit,
            used,
            remaining,
            api_available,
        },
    )
}

async fn download<B>(context: &AppContext, body: B) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let bytes = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("读取请求体失败: {}", e);
            return error_response(StatusCode::BAD_REQUEST, "请求体无效或过大");
        }
    };
    let request: DownloadRequest = match serde_json::from_slice(&bytes) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("请求格式错误: {}", e)),
    };

    let outcome = match context
        .downloader
        .download(&request.url, request.option, request.output_folder.as_deref())
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            let status = match &e {
                DownloadError::InvalidUrl(_) | DownloadError::InvalidFolder(_) => StatusCode::BAD_REQUEST,
                DownloadError::ToolFailed { .. } | DownloadError::NoOutput => StatusCode::BAD_GATEWAY,
                DownloadError::Io(_) | DownloadError::Zip(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return error_response(status, &e.to_string());
        }
    };

    let metadata = match extract_video_id(&request.url) {
        Some(video_id) => context.fetcher.get_metadata(&video_id).await,
        None => None,
    };

    json_response(
        StatusCode::OK,
        &DownloadResponse {
            folder: outcome.folder,
            filename: outcome.filename,
            metadata,
        },
    )
}

async fn convert<B>(context: &AppContext, req: Request<B>) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let boundary = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| multer::parse_boundary(value).ok());
    let Some(boundary) = boundary else {
        return error_response(StatusCode::BAD_REQUEST, "需要 multipart/form-data 请求");
    };

    let mut form = ConvertForm::default();
    let result = convert_upload(context, req.into_body(), boundary, &mut form).await;
    form.cleanup().await;

    match result {
        Ok(saved) => json_response(
            StatusCode::OK,
            &ConvertResponse {
                folder: saved.folder,
                filename: saved.filename,
            },
        ),
        Err(e) => {
            let status = match &e {
                ConvertError::Multipart(
                    multer::Error::StreamSizeExceeded { .. } | multer::Error::FieldSizeExceeded { .. },
                ) => StatusCode::PAYLOAD_TOO_LARGE,
                ConvertError::InvalidOption(_)
                | ConvertError::InvalidName(_)
                | ConvertError::MissingFile
                | ConvertError::Multipart(_) => StatusCode::BAD_REQUEST,
                ConvertError::Image(_) => StatusCode::UNPROCESSABLE_ENTITY,
                ConvertError::ToolFailed { .. } => StatusCode::BAD_GATEWAY,
                ConvertError::Io(_) | ConvertError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            if status.is_server_error() {
                warn!("转换失败: {}", e);
            }
            error_response(status, &e.to_string())
        }
    }
}

async fn convert_upload<B>(
    context: &AppContext,
    body: B,
    boundary: String,
    form: &mut ConvertForm,
) -> Result<SavedFile, ConvertError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    read_convert_form(body, boundary, &context.converter, form).await?;

    let option: ConvertOption = form.convert_option.as_deref().unwrap_or_default().parse()?;
    let Some((path, original)) = &form.upload else {
        return Err(ConvertError::MissingFile);
    };
    context
        .converter
        .convert(
            path,
            original,
            option,
            form.filename.as_deref(),
            form.output_folder.as_deref(),
        )
        .await
}

async fn zip_download(context: &AppContext, folder: &str) -> Response<ResponseBody> {
    let archive = match context.downloader.zip_folder(folder).await {
        Ok(Some(archive)) => archive,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "目录不存在"),
        Err(e) => {
            warn!("打包目录 {} 失败: {}", folder, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "打包失败");
        }
    };

    let length = archive.len();
    let mut response = Response::new(full(archive));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&format!("{}.zip", folder))) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    response
}

async fn list_downloads(context: &AppContext, folder: &str) -> Response<ResponseBody> {
    match context.downloader.list(folder).await {
        Ok(Some(files)) => json_response(
            StatusCode::OK,
            &FolderListing {
                folder: folder.to_string(),
                files,
            },
        ),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "目录不存在"),
        Err(e) => {
            warn!("读取下载目录 {} 失败: {}", folder, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "读取目录失败")
        }
    }
}

async fn serve_file(context: &AppContext, folder: &str, filename: &str) -> Response<ResponseBody> {
    let Some(path) = context.downloader.resolve(folder, Some(filename)) else {
        return error_response(StatusCode::BAD_REQUEST, "非法文件名");
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return error_response(StatusCode::NOT_FOUND, "文件不存在");
        }
        Err(e) => {
            warn!("打开文件 {} 失败: {}", path.display(), e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "无法读取文件");
        }
    };
    let length = match file.metadata().await {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => return error_response(StatusCode::NOT_FOUND, "文件不存在"),
        Err(e) => {
            warn!("读取文件信息 {} 失败: {}", path.display(), e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "无法读取文件");
        }
    };

    // 以流的方式返回，不把整个文件读进内存
    let stream = ReaderStream::new(file).map_ok(Frame::data);
    let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(filename)) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    response
}

fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' { c } else { '_' })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(filename)
    )
}
