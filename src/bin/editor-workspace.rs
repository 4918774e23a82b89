use anyhow::Result;
use editor_workspace::server::serve;

#[tokio::main]
async fn main() -> Result<()> {
    serve().await
}
