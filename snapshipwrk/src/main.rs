mod orchestrator;

use anyhow::{Context, Result};
use libsnapship::core::journal::Journal;
use libsnapship::core::pipeline;
use libsnapship::model::storage;
use orchestrator::Orchestrator;
use slog::{info, Logger};
use snapshipapp::snapshipapp_run;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/snapship/config.json";

fn main() {
    let mut vcount = 0usize;
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    for arg in std::env::args().skip(1) {
        if arg.starts_with('-') && arg.chars().skip(1).all(|c| c == 'v') {
            vcount += arg.len() - 1;
        } else {
            config_path = PathBuf::from(arg);
        }
    }

    let code = snapshipapp_run(|log| async_main(log, config_path), vcount);
    std::process::exit(code);
}

async fn async_main(log: Logger, config_path: PathBuf) -> Result<i32> {
    let config = storage::load_config(&config_path)
        .with_context(|| format!("cannot load configuration from {:?}", config_path))?;
    let journal = Journal::open(&config.transaction_log).context("cannot open transaction journal")?;

    let (cancel_tx, cancel_rx) = pipeline::cancel_token();
    let orchestrator = Orchestrator::new(config, journal, log.clone());

    let run = orchestrator.run(cancel_rx);
    tokio::pin!(run);

    let report = tokio::select! {
        report = &mut run => report?,
        _ = tokio::signal::ctrl_c() => {
            info!(log, "process signaled, draining in-flight work");
            let _ = cancel_tx.send(true);
            run.await?
        }
    };

    Ok(report.exit_code())
}
