use std::path::Path;

use beacon::CollectorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "beacon.json".to_string());
    let config = CollectorConfig::load(Path::new(&config_path));

    beacon::run(config).await
}
