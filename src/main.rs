use clap::Parser;

use velostation::env::{setup_tracing, Env};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Env::parse().into_config();
    setup_tracing(&config.log_level);
    velostation::launch(config).await
}
