use std::{process::ExitCode, sync::Arc};

use log::{error, info};
use tokio::signal;

use worker::{ClientOptions, CoordinationClient, LinearRuntime, RunConfig, Worker};

const SEED: u64 = 42;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let cfg = match RunConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("fatal ConfigError after round none: {e}");
            return ExitCode::from(2);
        }
    };

    info!(
        worker_id = cfg.worker_id.as_str(),
        epochs = cfg.epochs,
        split = cfg.split,
        dataset = cfg.dataset;
        "starting worker for {}",
        cfg.server_addr()
    );

    let cfg = Arc::new(cfg);
    let runtime = LinearRuntime::new(cfg.dataset, cfg.layers_exponent, SEED);
    let client = CoordinationClient::new(ClientOptions::from_config(&cfg));
    let worker = Worker::new(cfg, client, runtime);

    let interrupted = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
        info!("received SIGINT");
    };

    match worker.run_until(interrupted).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
