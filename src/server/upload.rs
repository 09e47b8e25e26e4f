use crate::convert::Converter;
use crate::error::ConvertError;
use crate::server::MAX_UPLOAD_BYTES;
use bytes::Bytes;
use futures_util::{future, Stream, TryStreamExt};
use http_body_util::BodyStream;
use hyper::body::Body;
use log::debug;
use multer::{Constraints, Field, Multipart, SizeLimit};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// `POST /api/convert` 的表单内容，上传的文件已经写到暂存目录
#[derive(Debug, Default)]
pub struct ConvertForm {
    pub convert_option: Option<String>,
    pub filename: Option<String>,
    pub output_folder: Option<String>,
    /// 暂存路径和浏览器给出的原始文件名
    pub upload: Option<(PathBuf, String)>,
}

impl ConvertForm {
    /// 删除暂存文件，转换成功与否都要调用
    pub async fn cleanup(&mut self) {
        if let Some((path, _)) = self.upload.take() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!("删除暂存文件 {} 失败: {}", path.display(), e);
            }
        }
    }
}

/// 把请求体按 multipart 解析进 `form`。
///
/// 出错时 `form` 中已经写入的暂存文件仍然保留在里面，由调用方清理。
pub async fn read_convert_form<B>(
    body: B,
    boundary: String,
    converter: &Converter,
    form: &mut ConvertForm,
) -> Result<(), ConvertError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let constraints = Constraints::new().size_limit(SizeLimit::new().whole_stream(MAX_UPLOAD_BYTES));
    let mut multipart = Multipart::with_constraints(data_frames(body), boundary, constraints);

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                // 同一个表单里重复的文件字段只保留最后一个
                form.cleanup().await;
                let original = field.file_name().unwrap_or_default().to_string();
                let path = converter.staging_path(&original).await?;
                form.upload = Some((path.clone(), original));
                save_field(field, &path).await?;
            }
            Some("convert_option") => form.convert_option = Some(field.text().await?),
            Some("filename") => form.filename = Some(field.text().await?),
            Some("output_folder") => form.output_folder = Some(field.text().await?),
            other => debug!("忽略表单字段 {:?}", other),
        }
    }
    Ok(())
}

fn data_frames<B>(body: B) -> impl Stream<Item = Result<Bytes, B::Error>> + Send
where
    B: Body<Data = Bytes> + Send,
    B::Error: Send,
{
    BodyStream::new(body).try_filter_map(|frame| future::ready(Ok(frame.into_data().ok())))
}

async fn save_field(mut field: Field<'_>, path: &Path) -> Result<(), ConvertError> {
    let mut file = File::create(path).await?;
    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}
