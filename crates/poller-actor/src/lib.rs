use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{info, warn};

use modbus_client::{ClientConfig, ClientError, ModbusClient, RegisterSource};
use register_map::RegisterMap;
use types::DeviceIdentity;

mod coordinator;

pub use coordinator::{Coordinator, Readings};

#[derive(Debug, Clone)]
pub struct ActorConfig {
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub jitter_ms: u64,
    /// Retry a failed register one address lower before giving up on it.
    pub address_fallback: bool,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(1),
            jitter_ms: 0,
            address_fallback: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("failed to connect to modbus device: {0}")]
    Connect(#[source] ClientError),
    #[error("reconnect after a failed cycle failed: {0}")]
    Reconnect(#[source] ClientError),
    #[error("all {failed} register reads failed on a dead connection")]
    Unreachable { failed: usize },
}

/// Outcome of one poll cycle as handed to consumers.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub device: DeviceIdentity,
    pub cycle: u64,
    /// False when the cycle failed as a whole; `readings` is then empty.
    pub success: bool,
    pub error: Option<String>,
    pub readings: Readings,
    pub collected_at_ms: u64,
}

impl Snapshot {
    pub fn value(&self, key: &str) -> Option<f64> {
        self.readings.get(key)
    }
}

/// Polls one Cerbo GX until shutdown, sending a [`Snapshot`] per cycle.
pub struct PollerActor {
    identity: DeviceIdentity,
    modbus_config: ClientConfig,
    map: RegisterMap,
    sender: mpsc::Sender<Snapshot>,
    shutdown: watch::Receiver<bool>,
    config: ActorConfig,
}

impl PollerActor {
    pub fn new(
        identity: DeviceIdentity,
        modbus_config: ClientConfig,
        map: RegisterMap,
        sender: mpsc::Sender<Snapshot>,
        shutdown: watch::Receiver<bool>,
        config: ActorConfig,
    ) -> Self {
        Self {
            identity,
            modbus_config,
            map,
            sender,
            shutdown,
            config,
        }
    }

    pub async fn run(self) -> Result<(), PollerError> {
        let mut modbus_config = self.modbus_config.clone();
        modbus_config.timeout_ms = self.config.request_timeout.as_millis() as u64;
        let client = ModbusClient::connect(modbus_config)
            .await
            .map_err(PollerError::Connect)?;
        self.run_with_source(client).await
    }

    /// Runs the poll loop against an already connected source. The first
    /// refresh must succeed; later failures are reported as unsuccessful
    /// snapshots and polling continues.
    pub async fn run_with_source<S>(mut self, source: S) -> Result<(), PollerError>
    where
        S: RegisterSource + Send + Sync,
    {
        let mut coordinator = Coordinator::new(source, self.map.clone(), self.config.address_fallback);
        let mut iteration = 0u64;

        let cycle_start = Instant::now();
        let first = coordinator.refresh().await?;
        record_cycle(cycle_start, true);
        info!(
            device = %self.identity,
            sensors = first.values.len(),
            "first refresh complete"
        );
        self.emit(iteration, Ok(first)).await;

        loop {
            iteration = iteration.wrapping_add(1);
            let delay = jittered_delay(self.config.poll_interval, self.config.jitter_ms, iteration);

            tokio::select! {
                _ = sleep(delay) => {},
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!(device = %self.identity, "poller shutdown requested");
                        break;
                    }
                }
            }
            if *self.shutdown.borrow() {
                info!(device = %self.identity, "poller shutdown requested");
                break;
            }

            let cycle_start = Instant::now();
            let outcome = coordinator.refresh().await;
            let elapsed = record_cycle(cycle_start, outcome.is_ok());
            let lag = elapsed.saturating_sub(self.config.poll_interval);
            match &outcome {
                Ok(readings) => info!(
                    device = %self.identity,
                    cycle = iteration,
                    sensors = readings.values.len(),
                    elapsed_ms = elapsed.as_millis(),
                    lag_ms = lag.as_millis(),
                    "poll cycle complete"
                ),
                Err(err) => warn!(
                    device = %self.identity,
                    cycle = iteration,
                    error = %err,
                    "poll cycle failed"
                ),
            }
            self.emit(iteration, outcome).await;
        }

        Ok(())
    }

    async fn emit(&self, cycle: u64, outcome: Result<Readings, PollerError>) {
        let (success, error, readings) = match outcome {
            Ok(readings) => (true, None, readings),
            Err(err) => (false, Some(err.to_string()), Readings::default()),
        };
        let snapshot = Snapshot {
            device: self.identity.clone(),
            cycle,
            success,
            error,
            readings,
            collected_at_ms: unix_ms(),
        };
        if let Err(err) = self.sender.send(snapshot).await {
            warn!(device = %self.identity, error = %err, "snapshot channel send failed");
        }
    }
}

fn record_cycle(started: Instant, success: bool) -> Duration {
    let elapsed = started.elapsed();
    histogram!("cerbo_poll_cycle_seconds").record(elapsed.as_secs_f64());
    let outcome = if success { "success" } else { "failure" };
    counter!("cerbo_poll_cycles_total", "outcome" => outcome).increment(1);
    elapsed
}

fn jittered_delay(base: Duration, jitter_ms: u64, iteration: u64) -> Duration {
    if jitter_ms == 0 {
        return base;
    }

    let jitter_window = jitter_ms.max(1);
    let seed = unix_ms().wrapping_add(iteration.wrapping_mul(1_664_525));
    let offset = seed % jitter_window;
    base + Duration::from_millis(offset)
}

pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
