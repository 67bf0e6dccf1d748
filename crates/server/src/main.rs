#[tokio::main]
async fn main() -> anyhow::Result<()> {
    haven_server::run().await
}
