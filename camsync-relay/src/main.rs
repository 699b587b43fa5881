use std::sync::Arc;

use camsync_relay::{serve, RelayConfig, State};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = RelayConfig::from_env()?;
    serve(config, Arc::new(State::default())).await;
    Ok(())
}
