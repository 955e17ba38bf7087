use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    livepersist::run().await
}
