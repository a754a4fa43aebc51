use std::env;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use collector_app::CollectorConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn toml_config_validates() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("CERBO_CONFIG", fixture_path("config-valid.toml"));

    let config = CollectorConfig::load().expect("load config");
    config.validate().expect("validate config");
    assert_eq!(config.host, "192.168.1.50");
    assert_eq!(config.channel_capacity, 32);
    assert_eq!(config.modbus.retry_count, 1);
    assert_eq!(config.poller.jitter_ms, 250);
    assert_eq!(config.history_retention(), Duration::from_secs(48 * 3_600));
    assert_eq!(config.http_bind, "127.0.0.1:9100");
    assert!(config.energy_meter_is_default());

    env::remove_var("CERBO_CONFIG");
}

#[test]
fn json_config_validates() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("CERBO_CONFIG", fixture_path("config-valid.json"));

    let config = CollectorConfig::load().expect("load config");
    config.validate().expect("validate config");
    assert_eq!(config.port, 502);
    assert_eq!(config.slaves.pv_inverter, 32);
    assert!(!config.energy_meter_is_default());
    assert!(!config.poller.address_fallback);
    assert_eq!(config.modbus.max_batch_size, Some(60));
    assert_eq!(config.register_map_path.as_deref(), Some("register-map.json"));

    env::remove_var("CERBO_CONFIG");
}

#[test]
fn invalid_config_fails_validation() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("CERBO_CONFIG", fixture_path("config-invalid.toml"));

    let config = CollectorConfig::load().expect("load config");
    let err = config.validate().expect_err("slave id 0 must be rejected");
    assert!(err.to_string().contains("energy_meter_slave_id"));

    env::remove_var("CERBO_CONFIG");
}

#[test]
fn env_overrides_file_values() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("CERBO_CONFIG", fixture_path("config-valid.toml"));
    env::set_var("CERBO_HOST", "10.1.1.7");
    env::set_var("CERBO_PV_SLAVE_ID", "33");
    env::set_var("CERBO_POLL_INTERVAL_MS", "2000");

    let config = CollectorConfig::load().expect("load config");
    config.validate().expect("validate config");
    assert_eq!(config.host, "10.1.1.7");
    assert_eq!(config.slaves.pv_inverter, 33);
    assert_eq!(config.poller.poll_interval, Duration::from_millis(2_000));
    assert_eq!(config.client_config().host, "10.1.1.7");

    env::remove_var("CERBO_HOST");
    env::remove_var("CERBO_PV_SLAVE_ID");
    env::remove_var("CERBO_POLL_INTERVAL_MS");
    env::remove_var("CERBO_CONFIG");
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    let result = CollectorConfig::load_with_path(Some(fixture_path("does-not-exist.toml")));
    assert!(result.is_err());
}

#[test]
fn register_map_path_replaces_builtin_catalog() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    let mut config = CollectorConfig::load_with_path(Some(fixture_path("config-valid.toml")))
        .expect("load config");
    config.register_map_path = Some(fixture_path("register-map.json"));

    let map = config.register_map().expect("register map");
    assert_eq!(map.len(), 2);
    assert!(map.get("grid_l1_power").is_some());
}

fn fixture_path(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    path.to_string_lossy().to_string()
}

#[test]
fn daemon_and_cli_share_one_request_timeout() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    let config = CollectorConfig::load_with_path(Some(fixture_path("config-modbus-timeout.toml")))
        .expect("load config");
    config.validate().expect("validate config");
    assert_eq!(config.poller.request_timeout, Duration::from_millis(800));
    assert_eq!(config.client_config().timeout_ms, 800);

    let config = CollectorConfig::load_with_path(Some(fixture_path("config-valid.toml")))
        .expect("load config");
    assert_eq!(config.client_config().timeout_ms, 1_500);
}
