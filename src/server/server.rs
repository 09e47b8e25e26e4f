use crate::context::AppContext;
use crate::server::handler::handle_request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct MediaServer {
    addr: SocketAddr,
    context: Arc<AppContext>,
    semaphore: Arc<Semaphore>,
}

impl MediaServer {
    pub fn new(addr: SocketAddr, context: Arc<AppContext>, max_connections: usize) -> Self {
        Self {
            addr,
            context,
            semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// 运行到收到 Ctrl-C 为止
    pub async fn run(&self) -> io::Result<()> {
        self.run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }

    /// `shutdown` 完成后停止接受新连接，已建立的连接继续在后台处理
    pub async fn run_until<F>(&self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.addr).await?;

        info!("媒体下载服务运行在 http://{}", listener.local_addr()?);
        info!("- 元数据缓存有效期: 24小时");
        info!("- 最大并发连接: {}", self.semaphore.available_permits());

        tokio::pin!(shutdown);

        loop {
            // 连接数满时也要能响应 Ctrl-C
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Ok(()),
                },
                _ = &mut shutdown => {
                    info!("收到退出信号，停止接受新连接");
                    return Ok(());
                }
            };

            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        // 文件描述符耗尽之类的错误是暂时的
                        warn!("接受连接失败: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    info!("收到退出信号，停止接受新连接");
                    return Ok(());
                }
            };

            let context = self.context.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let service = service_fn(move |req: Request<Incoming>| handle_request(req, context.clone()));

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("连接 {} 异常结束: {}", peer, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::Converter;
    use crate::download::Downloader;
    use crate::metadata::MetadataFetcher;
    use crate::quota::QuotaManager;
    use tokio::sync::{oneshot, Mutex};
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn stops_while_all_connection_permits_are_taken() {
        let dir = tempfile::tempdir().unwrap();
        let quota = QuotaManager::load(
            5,
            dir.path().join("usage.json"),
            dir.path().join("cache.json"),
            10,
        )
        .await;
        let downloader = Downloader::new("/nonexistent/yt-dlp", dir.path().join("output"), 1);
        let converter = Converter::new(
            "/nonexistent/ffmpeg",
            dir.path().join("output"),
            dir.path().join("uploads"),
            downloader.permits(),
        );
        let context = Arc::new(AppContext::new(
            MetadataFetcher::new(None, Arc::new(Mutex::new(quota))),
            downloader,
            converter,
        ));

        // 0 个许可: 循环一直停在等待许可上
        let server = MediaServer::new("127.0.0.1:0".parse().unwrap(), context, 0);
        let (tx, rx) = oneshot::channel::<()>();
        let running = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = rx.await;
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        let result = timeout(Duration::from_secs(5), running).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
