use std::ops::RangeInclusive;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use modbus_client::{ClientConfig, ClientError, ModbusClient, RegisterSource};
use types::{DeviceIdentity, RegisterKind};

/// Register answered by every unit that exposes system or grid data.
pub const SCAN_REGISTER: u16 = 820;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub unit_ids: RangeInclusive<u8>,
    pub per_unit_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            unit_ids: 1..=247,
            per_unit_timeout_ms: 200,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to connect to {device}: {source}")]
    Connect {
        device: DeviceIdentity,
        #[source]
        source: ClientError,
    },
}

/// One register to try during a connection probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeTarget {
    pub address: u16,
    pub label: String,
    pub count: u16,
}

impl ProbeTarget {
    pub fn new(address: u16, label: impl Into<String>, count: u16) -> Self {
        Self {
            address,
            label: label.into(),
            count,
        }
    }
}

pub fn default_probe_targets() -> Vec<ProbeTarget> {
    vec![
        ProbeTarget::new(820, "Grid L1 Power", 1),
        ProbeTarget::new(840, "Battery Voltage", 1),
        ProbeTarget::new(1052, "Total PV Power", 2),
    ]
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    Values(Vec<u16>),
    Error(String),
}

impl ProbeResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ProbeResult::Values(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeLine {
    pub address: u16,
    pub label: String,
    pub input: ProbeResult,
    pub holding: ProbeResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub device: DeviceIdentity,
    pub unit_id: u8,
    pub lines: Vec<ProbeLine>,
}

impl ProbeReport {
    pub fn any_ok(&self) -> bool {
        self.lines
            .iter()
            .any(|line| line.input.is_ok() || line.holding.is_ok())
    }
}

/// Connects and reads each target as both input and holding registers.
pub async fn probe(
    config: ClientConfig,
    unit_id: u8,
    targets: &[ProbeTarget],
) -> Result<ProbeReport, DiscoveryError> {
    let device = DeviceIdentity {
        host: config.host.clone(),
        port: config.port,
    };
    let client = ModbusClient::connect(config)
        .await
        .map_err(|source| DiscoveryError::Connect {
            device: device.clone(),
            source,
        })?;
    Ok(probe_source(&client, device, unit_id, targets).await)
}

pub async fn probe_source<S: RegisterSource + Sync>(
    source: &S,
    device: DeviceIdentity,
    unit_id: u8,
    targets: &[ProbeTarget],
) -> ProbeReport {
    let mut lines = Vec::with_capacity(targets.len());
    for target in targets {
        let input = read_probe(source, unit_id, RegisterKind::Input, target).await;
        let holding = read_probe(source, unit_id, RegisterKind::Holding, target).await;
        lines.push(ProbeLine {
            address: target.address,
            label: target.label.clone(),
            input,
            holding,
        });
    }
    ProbeReport {
        device,
        unit_id,
        lines,
    }
}

async fn read_probe<S: RegisterSource + Sync>(
    source: &S,
    unit_id: u8,
    kind: RegisterKind,
    target: &ProbeTarget,
) -> ProbeResult {
    match source
        .read_registers(unit_id, kind, target.address, target.count)
        .await
    {
        Ok(values) => ProbeResult::Values(values),
        Err(err) => ProbeResult::Error(err.to_string()),
    }
}

/// Returns the unit ids that answer a holding read of [`SCAN_REGISTER`].
pub async fn scan_unit_ids(
    mut client_config: ClientConfig,
    config: DiscoveryConfig,
) -> Result<Vec<u8>, DiscoveryError> {
    let device = DeviceIdentity {
        host: client_config.host.clone(),
        port: client_config.port,
    };
    // One attempt per unit; the scan itself is the retry loop. The client
    // timeout bounds each unit so a late reply never lands on the next one.
    client_config.retry_count = 0;
    client_config.timeout_ms = config.per_unit_timeout_ms.max(1);
    let client = ModbusClient::connect(client_config)
        .await
        .map_err(|source| DiscoveryError::Connect { device, source })?;
    Ok(scan_source(&client, &config).await)
}

pub async fn scan_source<S: RegisterSource + Sync>(source: &S, config: &DiscoveryConfig) -> Vec<u8> {
    let mut active = Vec::new();

    for unit_id in config.unit_ids.clone() {
        match source
            .read_registers(unit_id, RegisterKind::Holding, SCAN_REGISTER, 1)
            .await
        {
            Ok(_) => {
                info!(unit_id, "unit responded");
                active.push(unit_id);
            }
            Err(err) => debug!(unit_id, error = %err, "unit did not respond"),
        }
    }

    active
}
