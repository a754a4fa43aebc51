use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use types::DataType;

mod catalog;

pub use catalog::{
    catalog, SlaveAssignment, BATTERY_CURRENT, BATTERY_POWER, BATTERY_TEMPERATURE,
    BATTERY_VOLTAGE, DEFAULT_BATTERY_TEMPERATURE_C, DEFAULT_ENERGY_METER_SLAVE_ID,
    DEFAULT_PV_INVERTER_SLAVE_ID, SYSTEM_SLAVE_ID, TOTAL_PV_POWER,
};

/// Lowest and highest unit identifiers a Modbus TCP gateway will route.
pub const MIN_SLAVE_ID: u8 = 1;
pub const MAX_SLAVE_ID: u8 = 247;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Power,
    Voltage,
    Current,
    Temperature,
    Frequency,
    Battery,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    #[default]
    Measurement,
}

/// Which physical device behind the gateway serves a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    #[default]
    System,
    EnergyMeter,
    PvInverter,
    VeBus,
    Battery,
}

/// Where a sensor value comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    #[default]
    Register,
    /// Derived from other readings after a poll cycle; never read from the wire.
    Calculated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescription {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    pub device_class: DeviceClass,
    #[serde(default)]
    pub state_class: StateClass,
    #[serde(default)]
    pub register: u16,
    #[serde(default = "default_data_type")]
    pub data_type: DataType,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    #[serde(default)]
    pub display_precision: Option<u8>,
    #[serde(default)]
    pub role: DeviceRole,
    #[serde(default)]
    pub source: ValueSource,
}

impl SensorDescription {
    pub fn is_calculated(&self) -> bool {
        self.source == ValueSource::Calculated
    }
}

fn default_data_type() -> DataType {
    DataType::Int16
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_slave_id() -> u8 {
    SYSTEM_SLAVE_ID
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("expected {expected} register words, got {actual}")]
    ShortRead { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate sensor key {0}")]
    DuplicateKey(String),
    #[error("sensor {key} uses slave id {slave_id}, expected 1..=247")]
    InvalidSlaveId { key: String, slave_id: u8 },
    #[error("register map is empty")]
    Empty,
}

/// Decodes big-endian register words into a signed integer per `data_type`.
pub fn decode_words(data_type: DataType, words: &[u16]) -> Result<i64, DecodeError> {
    let expected = data_type.word_count() as usize;
    if words.len() < expected {
        return Err(DecodeError::ShortRead {
            expected,
            actual: words.len(),
        });
    }

    let value = match data_type {
        DataType::Uint16 => i64::from(words[0]),
        DataType::Int16 => i64::from(words[0] as i16),
        DataType::Uint32 => i64::from(join_words(words[0], words[1])),
        DataType::Int32 => i64::from(join_words(words[0], words[1]) as i32),
    };
    Ok(value)
}

pub fn scale(raw: i64, multiplier: f64) -> f64 {
    raw as f64 * multiplier
}

fn join_words(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

/// The full set of sensors the collector exposes, in display order.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterMap {
    descriptions: Vec<SensorDescription>,
}

impl RegisterMap {
    pub fn new(descriptions: Vec<SensorDescription>) -> Result<Self, MapError> {
        let map = Self { descriptions };
        map.validate()?;
        Ok(map)
    }

    pub fn builtin(slaves: &SlaveAssignment) -> Self {
        Self {
            descriptions: catalog(slaves),
        }
    }

    pub fn validate(&self) -> Result<(), MapError> {
        if self.descriptions.is_empty() {
            return Err(MapError::Empty);
        }
        let mut seen = HashSet::new();
        for description in &self.descriptions {
            if !seen.insert(description.key.as_str()) {
                return Err(MapError::DuplicateKey(description.key.clone()));
            }
            if !description.is_calculated()
                && !(MIN_SLAVE_ID..=MAX_SLAVE_ID).contains(&description.slave_id)
            {
                return Err(MapError::InvalidSlaveId {
                    key: description.key.clone(),
                    slave_id: description.slave_id,
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&SensorDescription> {
        self.descriptions.iter().find(|description| description.key == key)
    }

    pub fn descriptions(&self) -> &[SensorDescription] {
        &self.descriptions
    }

    /// Descriptions that are read from the wire each cycle.
    pub fn polled(&self) -> impl Iterator<Item = &SensorDescription> {
        self.descriptions
            .iter()
            .filter(|description| !description.is_calculated())
    }

    pub fn len(&self) -> usize {
        self.descriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptions.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct JsonRoot {
    sensors: Vec<SensorDescription>,
}

/// Loads a user-supplied register map. Accepts either a bare array or an
/// object with a `sensors` array.
pub fn parse_descriptions_from_json(data: &str) -> Result<RegisterMap, MapError> {
    let descriptions = if data.trim_start().starts_with('[') {
        serde_json::from_str::<Vec<SensorDescription>>(data)?
    } else {
        serde_json::from_str::<JsonRoot>(data)?.sensors
    };
    debug!(count = descriptions.len(), "parsed register map");
    RegisterMap::new(descriptions)
}
