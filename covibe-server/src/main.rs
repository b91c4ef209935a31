use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (COVIBE_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("COVIBE_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive("covibe_server=info".parse()?)
        .add_directive("covibe_pipeline=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = covibe_server::config::ServerConfig::parse();
    tracing::info!("Starting covibe server on {}", config.listen_addr);
    tracing::info!(
        "Site checkout: {}, publish mode: {}",
        config.site_dir.display(),
        config.publish_mode
    );

    let server = covibe_server::server::Server::new(config);
    server.run().await
}
