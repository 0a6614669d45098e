use plaid_sync_tool::{api::start_server, app::App, config::Config, logging};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init("info");

    let config = Config::from_env()?;
    info!(port = config.port, plaid_env = %config.plaid_env, "Plaid sync API server starting");

    let app = Arc::new(App::from_config(&config).await?);
    info!("Engine initialized");

    let served = start_server(app.clone(), config.port).await;
    app.shutdown().await;
    served
}
