use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use zane_engine::args::{Args, EngineConfig};
use zane_engine::dal::SqliteDal;
use zane_engine::swarm::SwarmClient;
use zane_engine::EngineService;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_args(&args);

    let dal = SqliteDal::new(&args.state)
        .await
        .expect("to open the engine state database");
    let swarm = SwarmClient::connect(&args.docker_host)
        .expect("to initialize the connection to the docker daemon");

    let engine = EngineService::new(dal, swarm, config);
    engine
        .start()
        .await
        .expect("to re-enqueue unfinished deployments");

    info!("engine started");
    tokio::signal::ctrl_c()
        .await
        .expect("to listen for the shutdown signal");
    info!("shutting down");
}
