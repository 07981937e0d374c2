use anyhow::Result;
use wager_cli::app;

#[tokio::main]
async fn main() -> Result<()> {
    app::run().await
}
