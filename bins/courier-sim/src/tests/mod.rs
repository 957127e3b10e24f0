use super::*;
use crate::config::{ConfigError, ScenarioConfig};
use courier_core::config::EngineConfig;
use courier_core::MessageState;
use tempfile::tempdir;

#[test]
fn config_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("courier.toml");
    let cfg = r#"
[engine]
max_roster_reconciliations = 5
transmit_timeout_ms = 2000
retry_tick_ms = 20

[logging]
level = "debug"

[scenario]
sender = "dora"
recipients = ["erin"]
devices_per_recipient = 3
"#;
    std::fs::write(&path, cfg).unwrap();
    let loaded = config::load_config(&path).unwrap();
    assert_eq!(loaded.engine.max_roster_reconciliations, 5);
    assert_eq!(loaded.engine.transmit_timeout_ms, 2000);
    assert_eq!(loaded.engine.worker_queue_depth, 64);
    assert_eq!(loaded.logging.level, "debug");
    assert_eq!(loaded.scenario.sender, "dora");
    assert_eq!(loaded.scenario.recipients, vec!["erin".to_string()]);
    assert_eq!(loaded.scenario.devices_per_recipient, 3);
    assert_eq!(loaded.scenario.offline_ms, 1_500);
}

#[test]
fn empty_file_uses_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.toml");
    std::fs::write(&path, "").unwrap();
    let loaded = config::load_config(&path).unwrap();
    assert_eq!(loaded.engine, EngineConfig::default());
    assert_eq!(loaded.logging.level, "info");
    assert_eq!(loaded.scenario.recipients.len(), 2);
}

#[test]
fn unknown_engine_keys_are_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("typo.toml");
    std::fs::write(&path, "[engine]\nmax_reconciliations = 2\n").unwrap();
    assert!(matches!(
        config::load_config(&path),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn invalid_engine_values_are_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("zero.toml");
    std::fs::write(&path, "[engine]\nretry_tick_ms = 0\n").unwrap();
    assert!(matches!(
        config::load_config(&path),
        Err(ConfigError::Engine(_))
    ));
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempdir().unwrap();
    assert!(matches!(
        config::load_config(&dir.path().join("absent.toml")),
        Err(ConfigError::Io(_))
    ));
}

#[test]
fn sender_cannot_be_a_recipient() {
    let cfg = SimConfig {
        engine: EngineConfig::default(),
        logging: config::LoggingConfig::default(),
        scenario: ScenarioConfig {
            sender: "alice".to_string(),
            recipients: vec!["@alice".to_string()],
            ..ScenarioConfig::default()
        },
    };
    assert!(matches!(cfg.validate(), Err(ConfigError::Scenario(_))));
}

#[test]
fn unknown_levels_fall_back_to_info() {
    assert_eq!(level_filter("DEBUG"), LevelFilter::Debug);
    assert_eq!(level_filter("verbose"), LevelFilter::Info);
}

#[tokio::test]
async fn scenario_sends_every_message() {
    let cfg = SimConfig {
        engine: EngineConfig {
            retry_backoff_initial_ms: 10,
            retry_backoff_max_ms: 40,
            retry_tick_ms: 5,
            ..EngineConfig::default()
        },
        logging: config::LoggingConfig::default(),
        scenario: ScenarioConfig {
            offline_ms: 60,
            settle_ms: 5_000,
            ..ScenarioConfig::default()
        },
    };
    let report = scenario::run(&cfg).await.unwrap();
    assert_eq!(report.outcomes.len(), 3);
    for outcome in report.outcomes.iter() {
        assert_eq!(outcome.state, Some(MessageState::Sent), "{}", outcome.label);
    }
    assert_eq!(report.delivered, 3);
    assert!(report.transmit_attempts >= 5);
}
