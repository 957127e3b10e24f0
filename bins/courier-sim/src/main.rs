mod config;
mod scenario;

use config::SimConfig;
use courier_core::error::DispatchFailure;
use log::LevelFilter;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum SimError {
    #[error("config: {0}")]
    Config(#[from] config::ConfigError),
    #[error("engine: {0}")]
    Engine(#[from] courier_core::config::ConfigError),
    #[error("dispatch: {0}")]
    Dispatch(#[from] DispatchFailure),
}

#[tokio::main]
async fn main() -> Result<(), SimError> {
    let args: Vec<String> = std::env::args().collect();
    let mut path = PathBuf::from("courier.toml");
    let mut i = 1;
    while i + 1 < args.len() {
        if args[i] == "--config" {
            path = PathBuf::from(&args[i + 1]);
        }
        i += 1;
    }
    let cfg = config::load_config(&path)?;
    init_logging(&cfg);
    let report = scenario::run(&cfg).await?;
    for outcome in report
        .outcomes
        .iter()
        .filter(|o| o.state != Some(courier_core::MessageState::Sent))
    {
        log::warn!(
            "{} message {} ended as {:?}",
            outcome.label,
            outcome.message_id,
            outcome.state
        );
    }
    Ok(())
}

fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

fn init_logging(cfg: &SimConfig) {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level_filter(&cfg.logging.level))
        .try_init();
}

#[cfg(test)]
mod tests;
