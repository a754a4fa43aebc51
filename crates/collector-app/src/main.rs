use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use collector_app::api::{self, ApiState};
use collector_app::{CollectorConfig, SensorBoard};
use discovery::{default_probe_targets, probe, scan_unit_ids, DiscoveryConfig};
use history::{HistoryConfig, HistoryStore};
use poller_actor::{unix_ms, PollerActor, PollerError, Snapshot};
use register_map::{RegisterMap, SYSTEM_SLAVE_ID};

enum Mode {
    Run,
    Probe(u8),
    Scan,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let config = CollectorConfig::load_with_path(parse_config_arg(&args)).context("load config failed")?;
    config.validate().context("config validation failed")?;

    match parse_mode(&args)? {
        Mode::Probe(unit_id) => return run_probe(&config, unit_id).await,
        Mode::Scan => return run_scan(&config).await,
        Mode::Run => {}
    }

    if !config.energy_meter_is_default() {
        warn!(
            energy_meter_slave_id = config.slaves.energy_meter,
            "energy meter is normally unit 30 on the Cerbo GX; frequency reads may fail"
        );
    }

    let map = config.register_map().context("register map load failed")?;
    let identity = config.identity();
    info!(
        device = %identity,
        sensors = map.len(),
        pv_inverter_slave_id = config.slaves.pv_inverter,
        energy_meter_slave_id = config.slaves.energy_meter,
        "collector starting"
    );

    let metrics = install_metrics_recorder();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let history = HistoryStore::with_config(HistoryConfig {
        path: config.history_path.clone(),
        ..HistoryConfig::default()
    })
    .await
    .context("history init failed")?;
    let board = SensorBoard::new(identity.to_string(), &map);

    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let snapshot_handle = tokio::spawn(snapshot_task(
        rx,
        board.clone(),
        history.clone(),
        shutdown_rx.clone(),
    ));
    let prune_handle = tokio::spawn(prune_task(
        history.clone(),
        config.history_retention(),
        Duration::from_millis(config.history_prune_interval_ms),
        shutdown_rx.clone(),
    ));

    let api_state = ApiState {
        board,
        history,
        metrics,
    };
    let http_addr = config.http_addr()?;
    let http_handle = tokio::spawn(api::serve(api_state, http_addr, shutdown_rx.clone()));

    let spec = PollerSpec {
        config: config.clone(),
        map,
        sender: tx,
        shutdown: shutdown_rx.clone(),
    };
    let mut join_set = JoinSet::new();
    spawn_poller(spec.clone(), &mut join_set, Duration::from_millis(0));

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    let mut shutdown_signal = std::pin::pin!(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
                break;
            }
            maybe_result = join_set.join_next() => {
                match maybe_result {
                    Some(Ok(outcome)) => {
                        if let Err(err) = outcome {
                            warn!(device = %identity, error = %err, "poller exited with error");
                        } else {
                            info!(device = %identity, "poller exited cleanly");
                        }
                        spawn_poller(
                            spec.clone(),
                            &mut join_set,
                            Duration::from_millis(config.respawn_delay_ms),
                        );
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "poller task failed");
                        spawn_poller(
                            spec.clone(),
                            &mut join_set,
                            Duration::from_millis(config.respawn_delay_ms),
                        );
                    }
                    None => break,
                }
            }
        }
    }

    join_set.abort_all();
    while let Some(result) = join_set.join_next().await {
        if let Err(err) = result {
            if !err.is_cancelled() {
                warn!(error = %err, "poller task join failed");
            }
        }
    }
    drop(spec);

    let _ = snapshot_handle.await;
    let _ = prune_handle.await;
    match http_handle.await {
        Ok(Err(err)) => warn!(error = %err, "http server stopped with error"),
        Err(err) => warn!(error = %err, "http task join failed"),
        Ok(Ok(())) => {}
    }
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

#[derive(Clone)]
struct PollerSpec {
    config: CollectorConfig,
    map: RegisterMap,
    sender: mpsc::Sender<Snapshot>,
    shutdown: watch::Receiver<bool>,
}

fn spawn_poller(
    spec: PollerSpec,
    join_set: &mut JoinSet<Result<(), PollerError>>,
    delay: Duration,
) {
    join_set.spawn(async move {
        if delay > Duration::from_millis(0) {
            sleep(delay).await;
        }
        let actor = PollerActor::new(
            spec.config.identity(),
            spec.config.client_config(),
            spec.map,
            spec.sender,
            spec.shutdown,
            spec.config.poller.clone(),
        );
        actor.run().await
    });
}

async fn snapshot_task(
    mut rx: mpsc::Receiver<Snapshot>,
    board: SensorBoard,
    history: HistoryStore,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe_snapshot = rx.recv() => {
                match maybe_snapshot {
                    Some(snapshot) => {
                        if snapshot.success {
                            for (key, value) in &snapshot.readings.values {
                                gauge!("cerbo_sensor_value", "key" => key.clone()).set(*value);
                            }
                            let collected_at = snapshot.collected_at_ms as i64;
                            if let Err(err) = history.record(collected_at, &snapshot.readings.values).await {
                                warn!(error = %err, "history record failed");
                            }
                        }
                        gauge!("cerbo_device_available").set(if snapshot.success { 1.0 } else { 0.0 });
                        debug!(cycle = snapshot.cycle, success = snapshot.success, "snapshot applied");
                        board.update(snapshot).await;
                    }
                    None => break,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("snapshot task shutdown requested");
                    break;
                }
            }
        }
    }
}

async fn prune_task(
    history: HistoryStore,
    retention: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = sleep(interval) => {
                let cutoff = unix_ms().saturating_sub(retention.as_millis() as u64) as i64;
                match history.prune_before(cutoff).await {
                    Ok(removed) => info!(removed, cutoff_ms = cutoff, "history pruned"),
                    Err(err) => warn!(error = %err, "history prune failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prune task shutdown requested");
                    break;
                }
            }
        }
    }
}

async fn run_probe(config: &CollectorConfig, unit_id: u8) -> Result<()> {
    let report = probe(config.client_config(), unit_id, &default_probe_targets())
        .await
        .context("probe failed")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("encode probe report")?
    );
    if !report.any_ok() {
        warn!(unit_id, "no probe register answered; check the unit id and that Modbus TCP is enabled");
    }
    Ok(())
}

async fn run_scan(config: &CollectorConfig) -> Result<()> {
    let units = scan_unit_ids(config.client_config(), DiscoveryConfig::default())
        .await
        .context("unit id scan failed")?;
    if units.is_empty() {
        warn!("no unit ids answered");
    }
    for unit_id in units {
        println!("{unit_id}");
    }
    Ok(())
}

fn install_metrics_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(error = %err, "prometheus recorder install failed");
            None
        }
    }
}

fn parse_mode(args: &[String]) -> Result<Mode> {
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--scan" => return Ok(Mode::Scan),
            "--probe" => {
                let unit_id = match iter.peek() {
                    Some(next) if !next.starts_with("--") => next
                        .parse::<u8>()
                        .with_context(|| format!("invalid probe unit id {next}"))?,
                    _ => SYSTEM_SLAVE_ID,
                };
                return Ok(Mode::Probe(unit_id));
            }
            _ => {}
        }
    }
    Ok(Mode::Run)
}

fn parse_config_arg(args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            return iter.next().cloned();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(
    mut shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
