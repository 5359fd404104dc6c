use anyhow::Result;

use api::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("ci-api")?;
    api::server::run().await
}
