use media_grab_server::config::Config;
use media_grab_server::context::AppContext;
use media_grab_server::server::MediaServer;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // .env 不存在时忽略
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;
    tokio::fs::create_dir_all(&config.output_dir).await?;

    let context = Arc::new(AppContext::from_config(&config).await?);
    let server = MediaServer::new(config.bind_addr, context, config.max_connections);
    server.run().await?;

    Ok(())
}
