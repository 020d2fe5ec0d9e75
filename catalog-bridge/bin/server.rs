use catalog_bridge::server::server_main;
use catalog_bridge_common::{
    config::{Config, Opt, ENV_PREFIX},
    tracing::initialize_tracing,
};
use clap::Parser;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();

    println!("Init config");
    let mut config = Config::load_config(ENV_PREFIX)?;
    config.overwrite_defaults_with_cli_args(Opt::parse());
    config.validate()?;

    println!("Init tracing");
    let _tracing_shutdown_handle = match initialize_tracing(config.service.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize tracing: {:?}", e);
            return Err(e);
        }
    };

    tracing::info!(
        environment = %config.environment,
        requests_queue_url = %config.requests_queue_url,
        responses_queue_url = %config.responses_queue_url,
        policy = %config.unresolved_message_policy,
        "Starting catalog bridge"
    );

    match server_main(config).await {
        Ok(_) => {
            tracing::info!("Server exited normally");
        }
        Err(e) => {
            tracing::error!("Server exited with error: {:?}", e);
            return Err(e);
        }
    }
    Ok(())
}
