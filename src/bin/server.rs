//! PDV sync service entry point.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pdv_sync::server::run().await
}
