#[tokio::main]
async fn main() -> anyhow::Result<()> {
    scriptsync_bridge_lib::run().await
}
