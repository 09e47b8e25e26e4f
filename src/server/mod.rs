mod handler;
mod server;
mod upload;

pub use handler::*;
pub use server::*;

// POST 请求体上限
pub const MAX_BODY_BYTES: usize = 64 * 1024;

// 上传转换的整个 multipart 请求体上限
pub const MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;
