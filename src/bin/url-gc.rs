use anyhow::Context;
use expiring_short::{config, url_service::url_service_capsule};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let container = config::init_container().await?;

    container
        .read(url_service_capsule)
        .purge_expired()
        .await
        .context("Failed to delete expired URLs")?;

    container
        .read(config::db_conn_capsule)
        .close()
        .await
        .context("Failed to close database connection pool")
}
