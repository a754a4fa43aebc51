pub mod api;
pub mod config;
pub mod sensors;

pub use api::{router, ApiState};
pub use config::CollectorConfig;
pub use sensors::{DeviceInfo, SensorBoard, SensorEntity, SensorState};
