use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use modbus_client::ClientConfig;
use poller_actor::ActorConfig;
use register_map::{
    parse_descriptions_from_json, RegisterMap, SlaveAssignment, DEFAULT_ENERGY_METER_SLAVE_ID,
    MAX_SLAVE_ID, MIN_SLAVE_ID,
};
use types::DeviceIdentity;

const DEFAULT_PORT: u16 = 502;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_RESPAWN_DELAY_MS: u64 = 10_000;
const DEFAULT_HISTORY_PATH: &str = "cerbo-history.sqlite";
const DEFAULT_RETENTION_HOURS: u64 = 24;
const DEFAULT_PRUNE_INTERVAL_MS: u64 = 600_000;
const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8080";

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub host: String,
    pub port: u16,
    pub slaves: SlaveAssignment,
    pub modbus: ClientConfig,
    pub poller: ActorConfig,
    pub register_map_path: Option<String>,
    pub channel_capacity: usize,
    pub respawn_delay_ms: u64,
    pub history_path: String,
    pub history_retention_hours: u64,
    pub history_prune_interval_ms: u64,
    pub http_bind: String,
}

impl CollectorConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("device.host must be set to the Cerbo GX address");
        }
        if self.port == 0 {
            anyhow::bail!("device.port must be between 1 and 65535");
        }
        validate_slave_id("device.pv_inverter_slave_id", self.slaves.pv_inverter)?;
        validate_slave_id("device.energy_meter_slave_id", self.slaves.energy_meter)?;
        if self.poller.poll_interval.as_millis() == 0 {
            anyhow::bail!("poller.poll_interval_ms must be >= 1");
        }
        if self.poller.request_timeout.as_millis() == 0 {
            anyhow::bail!("poller.request_timeout_ms must be >= 1");
        }
        if let Some(max_batch) = self.modbus.max_batch_size {
            if max_batch == 0 {
                anyhow::bail!("modbus.max_batch_size must be >= 1");
            }
        }
        if self.modbus.connect_timeout_ms == 0 {
            anyhow::bail!("modbus.connect_timeout_ms must be >= 1");
        }
        if self.modbus.retry_backoff_ms == 0 {
            anyhow::bail!("modbus.retry_backoff_ms must be >= 1");
        }
        if self.modbus.retry_max_backoff_ms == 0 {
            anyhow::bail!("modbus.retry_max_backoff_ms must be >= 1");
        }
        if let Some(delay) = self.modbus.inter_read_delay_ms {
            if delay == 0 {
                anyhow::bail!("modbus.inter_read_delay_ms must be >= 1 when set");
            }
        }
        if self.channel_capacity == 0 {
            anyhow::bail!("channel_capacity must be >= 1");
        }
        if self.respawn_delay_ms == 0 {
            anyhow::bail!("respawn_delay_ms must be >= 1");
        }
        if self.history_path.trim().is_empty() {
            anyhow::bail!("history.path must be non-empty");
        }
        if self.history_retention_hours == 0 {
            anyhow::bail!("history.retention_hours must be >= 1");
        }
        if self.history_prune_interval_ms == 0 {
            anyhow::bail!("history.prune_interval_ms must be >= 1");
        }
        self.http_bind
            .parse::<SocketAddr>()
            .map_err(|_| anyhow::anyhow!("http.bind must be a socket address (e.g. 0.0.0.0:8080)"))?;

        Ok(())
    }

    /// The energy meter is expected at unit 30; other values work but are
    /// worth flagging at startup.
    pub fn energy_meter_is_default(&self) -> bool {
        self.slaves.energy_meter == DEFAULT_ENERGY_METER_SLAVE_ID
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Client settings with the device endpoint filled in. The request
    /// timeout is `poller.request_timeout` for the daemon and the CLI modes
    /// alike.
    pub fn client_config(&self) -> ClientConfig {
        let mut modbus = self.modbus.clone();
        modbus.host = self.host.clone();
        modbus.port = self.port;
        modbus.timeout_ms = self.request_timeout_ms();
        modbus
    }

    fn request_timeout_ms(&self) -> u64 {
        u64::try_from(self.poller.request_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn register_map(&self) -> Result<RegisterMap> {
        match &self.register_map_path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("read register map {path}"))?;
                parse_descriptions_from_json(&content)
                    .with_context(|| format!("parse register map {path}"))
            }
            None => Ok(RegisterMap::builtin(&self.slaves)),
        }
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        self.http_bind
            .parse()
            .with_context(|| format!("parse http bind address {}", self.http_bind))
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_hours.saturating_mul(3_600))
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            slaves: SlaveAssignment::default(),
            modbus: ClientConfig {
                port: DEFAULT_PORT,
                ..ClientConfig::default()
            },
            poller: ActorConfig::default(),
            register_map_path: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            respawn_delay_ms: DEFAULT_RESPAWN_DELAY_MS,
            history_path: DEFAULT_HISTORY_PATH.to_string(),
            history_retention_hours: DEFAULT_RETENTION_HOURS,
            history_prune_interval_ms: DEFAULT_PRUNE_INTERVAL_MS,
            http_bind: DEFAULT_HTTP_BIND.to_string(),
        }
    }
}

fn validate_slave_id(field: &str, value: u8) -> Result<()> {
    if !(MIN_SLAVE_ID..=MAX_SLAVE_ID).contains(&value) {
        anyhow::bail!("{field} must be between {MIN_SLAVE_ID} and {MAX_SLAVE_ID}, got {value}");
    }
    Ok(())
}

fn apply_env_overrides(config: &mut CollectorConfig) {
    if let Ok(value) = env::var("CERBO_HOST") {
        config.host = value;
    }

    if let Some(port) = parse_env_u16("CERBO_PORT") {
        config.port = port;
    }

    if let Some(slave_id) = parse_env_u8("CERBO_PV_SLAVE_ID") {
        config.slaves.pv_inverter = slave_id;
    }

    if let Some(slave_id) = parse_env_u8("CERBO_METER_SLAVE_ID") {
        config.slaves.energy_meter = slave_id;
    }

    if let Some(interval_ms) = parse_env_u64("CERBO_POLL_INTERVAL_MS") {
        config.poller.poll_interval = Duration::from_millis(interval_ms);
    }

    if let Some(timeout_ms) = parse_env_u64("CERBO_REQUEST_TIMEOUT_MS") {
        config.poller.request_timeout = Duration::from_millis(timeout_ms);
    }

    if let Some(jitter_ms) = parse_env_u64("CERBO_JITTER_MS") {
        config.poller.jitter_ms = jitter_ms;
    }

    if let Some(fallback) = parse_env_bool("CERBO_ADDRESS_FALLBACK") {
        config.poller.address_fallback = fallback;
    }

    if let Some(timeout_ms) = parse_env_u64("CERBO_CONNECT_TIMEOUT_MS") {
        config.modbus.connect_timeout_ms = timeout_ms;
    }

    if let Ok(value) = env::var("CERBO_REGISTER_MAP") {
        config.register_map_path = Some(value);
    }

    if let Ok(value) = env::var("CERBO_HISTORY_PATH") {
        config.history_path = value;
    }

    if let Some(hours) = parse_env_u64("CERBO_HISTORY_RETENTION_HOURS") {
        config.history_retention_hours = hours;
    }

    if let Ok(value) = env::var("CERBO_HTTP_BIND") {
        config.http_bind = value;
    }

    config.channel_capacity =
        parse_env_usize("CERBO_CHANNEL_CAPACITY").unwrap_or(config.channel_capacity);
    config.respawn_delay_ms =
        parse_env_u64("CERBO_RESPAWN_DELAY_MS").unwrap_or(config.respawn_delay_ms);
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    device: Option<FileDeviceConfig>,
    poller: Option<FilePollerConfig>,
    modbus: Option<FileModbusConfig>,
    register_map: Option<FileRegisterMapConfig>,
    history: Option<FileHistoryConfig>,
    http: Option<FileHttpConfig>,
    channel_capacity: Option<usize>,
    respawn_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileDeviceConfig {
    host: Option<String>,
    port: Option<u16>,
    pv_inverter_slave_id: Option<u8>,
    energy_meter_slave_id: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct FilePollerConfig {
    poll_interval_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    jitter_ms: Option<u64>,
    address_fallback: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FileModbusConfig {
    max_batch_size: Option<u16>,
    connect_timeout_ms: Option<u64>,
    timeout_ms: Option<u64>,
    retry_count: Option<usize>,
    retry_backoff_ms: Option<u64>,
    retry_max_backoff_ms: Option<u64>,
    inter_read_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileRegisterMapConfig {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileHistoryConfig {
    path: Option<String>,
    retention_hours: Option<u64>,
    prune_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileHttpConfig {
    bind: Option<String>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("CERBO_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut CollectorConfig, file: FileConfig) {
    if let Some(device) = file.device {
        if let Some(host) = device.host {
            config.host = host;
        }
        if let Some(port) = device.port {
            config.port = port;
        }
        if let Some(slave_id) = device.pv_inverter_slave_id {
            config.slaves.pv_inverter = slave_id;
        }
        if let Some(slave_id) = device.energy_meter_slave_id {
            config.slaves.energy_meter = slave_id;
        }
    }

    let poller_timeout_set = file
        .poller
        .as_ref()
        .is_some_and(|poller| poller.request_timeout_ms.is_some());

    if let Some(poller) = file.poller {
        if let Some(interval_ms) = poller.poll_interval_ms {
            config.poller.poll_interval = Duration::from_millis(interval_ms);
        }
        if let Some(timeout_ms) = poller.request_timeout_ms {
            config.poller.request_timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(jitter_ms) = poller.jitter_ms {
            config.poller.jitter_ms = jitter_ms;
        }
        if let Some(fallback) = poller.address_fallback {
            config.poller.address_fallback = fallback;
        }
    }

    if let Some(modbus) = file.modbus {
        if let Some(max_batch) = modbus.max_batch_size {
            config.modbus.max_batch_size = Some(max_batch);
        }
        if let Some(timeout_ms) = modbus.connect_timeout_ms {
            config.modbus.connect_timeout_ms = timeout_ms;
        }
        // Older name for the request timeout; `poller.request_timeout_ms` wins.
        if let Some(timeout_ms) = modbus.timeout_ms {
            if !poller_timeout_set {
                config.poller.request_timeout = Duration::from_millis(timeout_ms);
            }
        }
        if let Some(retry_count) = modbus.retry_count {
            config.modbus.retry_count = retry_count;
        }
        if let Some(backoff) = modbus.retry_backoff_ms {
            config.modbus.retry_backoff_ms = backoff;
        }
        if let Some(max_backoff) = modbus.retry_max_backoff_ms {
            config.modbus.retry_max_backoff_ms = max_backoff;
        }
        if let Some(delay) = modbus.inter_read_delay_ms {
            config.modbus.inter_read_delay_ms = Some(delay);
        }
    }

    if let Some(path) = file.register_map.and_then(|map| map.path) {
        config.register_map_path = Some(path);
    }

    if let Some(history) = file.history {
        if let Some(path) = history.path {
            config.history_path = path;
        }
        if let Some(hours) = history.retention_hours {
            config.history_retention_hours = hours;
        }
        if let Some(interval) = history.prune_interval_ms {
            config.history_prune_interval_ms = interval;
        }
    }

    if let Some(bind) = file.http.and_then(|http| http.bind) {
        config.http_bind = bind;
    }

    if let Some(capacity) = file.channel_capacity {
        config.channel_capacity = capacity;
    }
    if let Some(delay) = file.respawn_delay_ms {
        config.respawn_delay_ms = delay;
    }
}

fn parse_env_u8(key: &str) -> Option<u8> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn parse_env_u16(key: &str) -> Option<u16> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}
