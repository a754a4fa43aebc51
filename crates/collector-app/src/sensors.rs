use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use poller_actor::Snapshot;
use register_map::{DeviceClass, RegisterMap, SensorDescription, StateClass, TOTAL_PV_POWER};

pub const DEVICE_NAME: &str = "Victron Energy";
pub const DEVICE_MANUFACTURER: &str = "Victron Energy";

/// Every sensor hangs off one device entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub identifier: String,
    pub name: &'static str,
    pub manufacturer: &'static str,
}

/// One exposed sensor, bound to its description.
#[derive(Debug, Clone)]
pub struct SensorEntity {
    description: SensorDescription,
}

impl SensorEntity {
    pub fn new(description: SensorDescription) -> Self {
        Self { description }
    }

    pub fn unique_id(&self) -> &str {
        &self.description.key
    }

    pub fn description(&self) -> &SensorDescription {
        &self.description
    }

    /// The value for this key in the snapshot. PV power reads as 0 rather
    /// than unknown when there is nothing to report.
    pub fn native_value(&self, snapshot: Option<&Snapshot>) -> Option<f64> {
        let value = snapshot.and_then(|snapshot| snapshot.value(&self.description.key));
        if value.is_none() && self.description.key == TOTAL_PV_POWER {
            return Some(0.0);
        }
        value
    }

    pub fn available(&self, snapshot: Option<&Snapshot>) -> bool {
        snapshot.map(|snapshot| snapshot.success).unwrap_or(false)
    }

    pub fn state(&self, device: &DeviceInfo, snapshot: Option<&Snapshot>) -> SensorState {
        SensorState {
            unique_id: self.description.key.clone(),
            name: self.description.name.clone(),
            unit: self.description.unit.clone(),
            device_class: self.description.device_class,
            state_class: self.description.state_class,
            display_precision: self.description.display_precision,
            value: self.native_value(snapshot),
            available: self.available(snapshot),
            collected_at_ms: snapshot.map(|snapshot| snapshot.collected_at_ms),
            device: device.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorState {
    pub unique_id: String,
    pub name: String,
    pub unit: Option<String>,
    pub device_class: DeviceClass,
    pub state_class: StateClass,
    pub display_precision: Option<u8>,
    pub value: Option<f64>,
    pub available: bool,
    pub collected_at_ms: Option<u64>,
    pub device: DeviceInfo,
}

/// Latest snapshot plus the entities rendered from it. Cheap to clone.
#[derive(Clone)]
pub struct SensorBoard {
    inner: Arc<BoardInner>,
}

struct BoardInner {
    device: DeviceInfo,
    entities: Vec<SensorEntity>,
    latest: RwLock<Option<Snapshot>>,
}

impl SensorBoard {
    pub fn new(identifier: impl Into<String>, map: &RegisterMap) -> Self {
        let entities = map
            .descriptions()
            .iter()
            .cloned()
            .map(SensorEntity::new)
            .collect();
        Self {
            inner: Arc::new(BoardInner {
                device: DeviceInfo {
                    identifier: identifier.into(),
                    name: DEVICE_NAME,
                    manufacturer: DEVICE_MANUFACTURER,
                },
                entities,
                latest: RwLock::new(None),
            }),
        }
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.inner.device
    }

    pub fn entities(&self) -> &[SensorEntity] {
        &self.inner.entities
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entity(key).is_some()
    }

    pub async fn update(&self, snapshot: Snapshot) {
        *self.inner.latest.write().await = Some(snapshot);
    }

    pub async fn latest(&self) -> Option<Snapshot> {
        self.inner.latest.read().await.clone()
    }

    pub async fn states(&self) -> Vec<SensorState> {
        let latest = self.inner.latest.read().await;
        self.inner
            .entities
            .iter()
            .map(|entity| entity.state(&self.inner.device, latest.as_ref()))
            .collect()
    }

    pub async fn state(&self, key: &str) -> Option<SensorState> {
        let entity = self.entity(key)?;
        let latest = self.inner.latest.read().await;
        Some(entity.state(&self.inner.device, latest.as_ref()))
    }

    fn entity(&self, key: &str) -> Option<&SensorEntity> {
        self.inner
            .entities
            .iter()
            .find(|entity| entity.unique_id() == key)
    }
}
