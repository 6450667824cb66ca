mod slogext;
use anyhow::Result;
use human_panic::setup_panic;
use slog::{debug, error, info, o, trace, Drain, Level, Logger};
use slogext::{CustomFullFormat, SlogLogLogger};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::runtime::Runtime;

pub const LOG_LEVEL_VAR: &str = "SNAPSHIP_LOG";

/// Process entry scaffolding: build the slog drain stack, install the
/// log-crate bridge, run the async main on a fresh runtime and translate
/// its result into an exit code (0 success, 1 any operational failure).
pub fn snapshipapp_run<M, F>(main: M, verbose_flag_count: usize) -> i32
where
    M: FnOnce(Logger) -> F,
    F: Future<Output = Result<i32>>,
{
    setup_panic!();

    let (internal_level, external_level) = levels_for(verbose_flag_count, std::env::var(LOG_LEVEL_VAR).ok());

    let exit_code;
    {
        let (slog_drain, slog_drain_ctrl) = {
            let decorator = slog_term::TermDecorator::new().stderr().build();
            let drain = CustomFullFormat::new(decorator).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog_atomic::AtomicSwitch::new(drain);
            let ctrl = drain.ctrl();
            (drain.map(Arc::new), ctrl)
        };

        {
            let slog_internal_logger = {
                let drain = Arc::clone(&slog_drain).filter_level(internal_level).fuse();
                Logger::root(drain, o!())
            };

            let slog_external_logger = {
                let drain = Arc::clone(&slog_drain);
                Logger::root(drain, o!())
            };

            slog_scope::set_global_logger(slog_internal_logger.clone()).cancel_reset();
            SlogLogLogger::install(slog_external_logger, external_level);

            debug!(slog_internal_logger, "debug messages enabled");
            trace!(slog_internal_logger, "trace messages enabled");
            info!(slog_internal_logger, "process starting"; "snapship_version" => env!("CARGO_PKG_VERSION"));

            exit_code = {
                let runtime = Runtime::new().expect("can create runtime");
                let result = runtime.block_on(main(slog_internal_logger.clone()));
                let code = match result {
                    Ok(code) => code,
                    Err(e) => {
                        error!(slog_internal_logger, "{}", e);
                        for cause in e.chain().skip(1) {
                            info!(slog_internal_logger, "error caused by: {}", cause);
                        }
                        1
                    }
                };
                runtime.shutdown_timeout(Duration::from_secs(0));
                code
            };

            info!(slog_internal_logger, "process exiting"; "code" => exit_code);

            slog_scope::set_global_logger(Logger::root(slog::Discard, o!())).cancel_reset();
        }

        slog_drain_ctrl.set(Logger::root(slog::Discard, o!()));
    }

    exit_code
}

fn levels_for(verbose_flag_count: usize, env_override: Option<String>) -> (Level, log::LevelFilter) {
    if let Some(value) = env_override {
        let level = match value.to_lowercase().as_str() {
            "trace" => Some((Level::Trace, log::LevelFilter::Trace)),
            "debug" => Some((Level::Debug, log::LevelFilter::Info)),
            "info" => Some((Level::Info, log::LevelFilter::Info)),
            "warn" | "warning" => Some((Level::Warning, log::LevelFilter::Warn)),
            "error" => Some((Level::Error, log::LevelFilter::Error)),
            _ => None,
        };
        if let Some(levels) = level {
            return levels;
        }
    }
    match verbose_flag_count {
        0 => (Level::Info, log::LevelFilter::Info),
        1 => (Level::Debug, log::LevelFilter::Info),
        2 => (Level::Trace, log::LevelFilter::Info),
        3 => (Level::Trace, log::LevelFilter::Debug),
        _ => (Level::Trace, log::LevelFilter::Trace),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_ladder() {
        assert_eq!(levels_for(0, None).0, Level::Info);
        assert_eq!(levels_for(1, None).0, Level::Debug);
        assert_eq!(levels_for(4, None), (Level::Trace, log::LevelFilter::Trace));
    }

    #[test]
    fn env_override_beats_flags() {
        assert_eq!(levels_for(0, Some(String::from("trace"))).0, Level::Trace);
        assert_eq!(levels_for(3, Some(String::from("error"))).0, Level::Error);
        // Unrecognized value falls back to the flags.
        assert_eq!(levels_for(1, Some(String::from("loud"))).0, Level::Debug);
    }
}
