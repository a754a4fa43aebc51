use std::collections::{BTreeMap, HashMap};

use metrics::counter;
use serde::Serialize;
use tracing::{debug, info, warn};

use modbus_client::{ClientError, RegisterSource};
use register_map::{
    decode_words, scale, DeviceRole, RegisterMap, SensorDescription, BATTERY_CURRENT,
    BATTERY_POWER, BATTERY_TEMPERATURE, BATTERY_VOLTAGE, DEFAULT_BATTERY_TEMPERATURE_C,
    TOTAL_PV_POWER,
};
use types::RegisterKind;

use crate::PollerError;

/// Failures after which the PV inverter hint is logged.
const PV_HINT_THRESHOLD: u32 = 5;

/// Values produced by one refresh cycle, keyed by sensor key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Readings {
    pub values: BTreeMap<String, f64>,
    /// Register words as received, for sensors read from the wire.
    pub raw: BTreeMap<String, Vec<u16>>,
}

impl Readings {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }
}

#[derive(Debug)]
struct Attempt {
    kind: RegisterKind,
    address: u16,
    error: ClientError,
}

enum ReadOutcome {
    Served {
        words: Vec<u16>,
        kind: RegisterKind,
        address: u16,
    },
    Failed(Vec<Attempt>),
}

/// Reads every sensor of a [`RegisterMap`] once per [`Coordinator::refresh`].
///
/// A register that keeps failing is retried on every cycle. Failure counts
/// only drive log throttling and hints.
pub struct Coordinator<S> {
    source: S,
    map: RegisterMap,
    address_fallback: bool,
    fail_counts: HashMap<String, u32>,
}

impl<S> Coordinator<S>
where
    S: RegisterSource + Send + Sync,
{
    pub fn new(source: S, map: RegisterMap, address_fallback: bool) -> Self {
        Self {
            source,
            map,
            address_fallback,
            fail_counts: HashMap::new(),
        }
    }

    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Consecutive failed cycles for a sensor; zero once it reads again.
    pub fn failure_count(&self, key: &str) -> u32 {
        self.fail_counts.get(key).copied().unwrap_or(0)
    }

    pub async fn refresh(&mut self) -> Result<Readings, PollerError> {
        let mut readings = Readings::default();
        let mut polled = 0usize;
        let mut failed = 0usize;
        let mut dead_link = 0usize;
        let mut gateway_failures = 0usize;

        for description in self.map.polled() {
            polled += 1;
            match read_with_fallback(&self.source, description, self.address_fallback).await {
                ReadOutcome::Served {
                    words,
                    kind,
                    address,
                } => {
                    let previous = self
                        .fail_counts
                        .insert(description.key.clone(), 0)
                        .unwrap_or(0);
                    if previous > 0 {
                        info!(
                            key = %description.key,
                            register = description.register,
                            failures = previous,
                            "register recovered"
                        );
                    }
                    if address != description.register {
                        info!(
                            key = %description.key,
                            register = description.register,
                            served_from = address,
                            %kind,
                            "register served from adjusted address, consider fixing the map"
                        );
                    }
                    if words.is_empty() {
                        warn!(key = %description.key, %kind, address, "register returned empty data");
                        continue;
                    }

                    let raw = match decode_words(description.data_type, &words) {
                        Ok(raw) => raw,
                        Err(err) => {
                            warn!(key = %description.key, error = %err, "register decode failed");
                            continue;
                        }
                    };
                    let value = if description.multiplier != 1.0 {
                        scale(raw, description.multiplier)
                    } else {
                        raw as f64
                    };
                    if description.role == DeviceRole::PvInverter && previous > 0 {
                        info!(
                            watts = value,
                            slave_id = description.slave_id,
                            "pv inverter reading again"
                        );
                    }
                    debug!(key = %description.key, ?words, value, "register decoded");
                    readings.values.insert(description.key.clone(), value);
                    readings.raw.insert(description.key.clone(), words);
                }
                ReadOutcome::Failed(attempts) => {
                    failed += 1;
                    let count = {
                        let entry = self.fail_counts.entry(description.key.clone()).or_insert(0);
                        *entry = entry.saturating_add(1);
                        *entry
                    };
                    counter!("cerbo_register_read_failures_total", "key" => description.key.clone())
                        .increment(1);

                    let noisy = count <= 3 || count % 3 == 0;
                    if noisy {
                        warn!(
                            key = %description.key,
                            register = description.register,
                            slave_id = description.slave_id,
                            attempt = count,
                            errors = %summarize(&attempts),
                            "register read failed"
                        );
                    }
                    if attempts.iter().all(|attempt| attempt.error.is_connection_failure()) {
                        dead_link += 1;
                    }
                    if attempts.iter().any(|attempt| attempt.error.is_gateway_failure()) {
                        gateway_failures += 1;
                        if noisy {
                            warn!(
                                key = %description.key,
                                slave_id = description.slave_id,
                                "gateway target did not respond; device may be offline or on another unit id"
                            );
                        }
                    }
                    if description.role == DeviceRole::PvInverter && count >= PV_HINT_THRESHOLD {
                        info!(
                            failures = count,
                            slave_id = description.slave_id,
                            "pv inverter not answering; check it is powered and that the configured slave id matches"
                        );
                    }
                }
            }
        }

        if polled > 0 && failed == polled {
            warn!(polled, gateway_failures, "every register read failed, reconnecting");
            counter!("cerbo_reconnects_total").increment(1);
            self.source
                .reconnect()
                .await
                .map_err(PollerError::Reconnect)?;
            if dead_link == polled {
                return Err(PollerError::Unreachable { failed });
            }
        }

        finalize(&mut readings);
        debug!(
            keys = readings.values.len(),
            failed, gateway_failures, "refresh complete"
        );
        Ok(readings)
    }
}

async fn read_with_fallback<S>(
    source: &S,
    description: &SensorDescription,
    address_fallback: bool,
) -> ReadOutcome
where
    S: RegisterSource + Sync,
{
    let count = description.data_type.word_count();
    let mut attempts = Vec::new();

    for (kind, address) in attempt_plan(description.register, address_fallback) {
        match source
            .read_registers(description.slave_id, kind, address, count)
            .await
        {
            Ok(words) => {
                return ReadOutcome::Served {
                    words,
                    kind,
                    address,
                }
            }
            Err(error) => attempts.push(Attempt {
                kind,
                address,
                error,
            }),
        }
    }

    ReadOutcome::Failed(attempts)
}

/// Input before holding; then the same at `register - 1` for maps that were
/// written with one-based addresses.
fn attempt_plan(register: u16, address_fallback: bool) -> Vec<(RegisterKind, u16)> {
    let mut plan = vec![
        (RegisterKind::Input, register),
        (RegisterKind::Holding, register),
    ];
    if address_fallback && register > 0 {
        plan.push((RegisterKind::Input, register - 1));
        plan.push((RegisterKind::Holding, register - 1));
    }
    plan
}

fn summarize(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(|attempt| format!("{}@{}: {}", attempt.kind, attempt.address, attempt.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Derived and fallback values applied after all registers were read.
fn finalize(readings: &mut Readings) {
    if let (Some(voltage), Some(current)) = (
        readings.get(BATTERY_VOLTAGE),
        readings.get(BATTERY_CURRENT),
    ) {
        readings
            .values
            .insert(BATTERY_POWER.to_string(), (voltage * current).round_ties_even());
    }

    readings
        .values
        .entry(BATTERY_TEMPERATURE.to_string())
        .or_insert(DEFAULT_BATTERY_TEMPERATURE_C);

    // Rebuilt every cycle, so a live reading always replaces this.
    readings
        .values
        .entry(TOTAL_PV_POWER.to_string())
        .or_insert(0.0);
}
