use std::{error::Error, sync::Arc};

use anyhow::Context;
use log::{info, warn};
use tokio::net::TcpListener;
use vmpool::{
    config::load_config,
    infra::{azure::AzureComputeConnector, web::router},
    CloudClient,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    info!("Start vmpool - pre-provisioned VMs as build-agent capacity");

    let config = load_config()?;
    info!(
        "Loaded config: listen on {}, image {}, subscription {:?}",
        config.listen_address, config.cloud.image_name, config.cloud.subscription_id
    );

    let connector = AzureComputeConnector::new(config.cloud.operation_poll_interval());
    let client = Arc::new(CloudClient::new(&config.cloud, Arc::new(connector)));
    if let Some(error) = client.error_info() {
        warn!("Cloud client is not operational: {}", error);
    }

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("Can't listen on {}", config.listen_address))?;
    axum::serve(listener, router(client.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, terminating instances");
    client.dispose().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Can't listen for shutdown signal: {}", e);
    }
}
