use hubbub::config::Config;
use hubbub::server::Server;
use hubbub::telemetry;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    telemetry::init_tracing();

    let config = Config::load()?;
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        verification_timeout_secs = config.hub.verification_timeout_secs,
        delivery_timeout_secs = config.hub.delivery_timeout_secs,
        "Loaded configuration"
    );

    let server = Server::new(&config).await?;
    server.run().await
}
