//! Built-in Cerbo GX register catalog.
//!
//! Voltage and current registers on the GX carry the value scaled by ten
//! (230.5 V is stored as 2305), hence the 0.1 multipliers.

use types::DataType;

use crate::{DeviceClass, DeviceRole, SensorDescription, StateClass, ValueSource};

/// The GX system service (`com.victronenergy.system`).
pub const SYSTEM_SLAVE_ID: u8 = 100;
pub const VEBUS_SLAVE_ID: u8 = 227;
pub const BATTERY_MONITOR_SLAVE_ID: u8 = 225;
pub const DEFAULT_PV_INVERTER_SLAVE_ID: u8 = 20;
pub const DEFAULT_ENERGY_METER_SLAVE_ID: u8 = 30;

/// Reported when the battery temperature register cannot be read.
pub const DEFAULT_BATTERY_TEMPERATURE_C: f64 = 25.0;

pub const BATTERY_VOLTAGE: &str = "victron_qw_battery_voltage";
pub const BATTERY_CURRENT: &str = "victron_qw_battery_current";
pub const BATTERY_TEMPERATURE: &str = "victron_qw_battery_temperature";
pub const BATTERY_POWER: &str = "victron_qw_battery_power";
pub const TOTAL_PV_POWER: &str = "total_pv_power";

/// Unit ids of the devices whose address depends on the installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveAssignment {
    pub pv_inverter: u8,
    pub energy_meter: u8,
}

impl Default for SlaveAssignment {
    fn default() -> Self {
        Self {
            pv_inverter: DEFAULT_PV_INVERTER_SLAVE_ID,
            energy_meter: DEFAULT_ENERGY_METER_SLAVE_ID,
        }
    }
}

/// Grid, battery and PV sensors with PV and energy meter reads retargeted to
/// the configured unit ids.
pub fn catalog(slaves: &SlaveAssignment) -> Vec<SensorDescription> {
    let mut descriptions = Vec::with_capacity(16);
    descriptions.extend(grid_sensors(slaves.energy_meter));
    descriptions.extend(battery_sensors());
    descriptions.extend(pv_sensors(slaves.pv_inverter));
    descriptions
}

fn grid_sensors(energy_meter: u8) -> Vec<SensorDescription> {
    let mut sensors = Vec::new();
    for (phase, register) in (1..=3).zip(820u16..) {
        sensors.push(register_sensor(
            &format!("victron_qw_grid_l{phase}"),
            &format!("Victron QW Grid L{phase}"),
            "W",
            DeviceClass::Power,
            register,
            DataType::Int16,
            1.0,
            SYSTEM_SLAVE_ID,
            DeviceRole::System,
        ));
    }

    let mut frequency = register_sensor(
        "victron_qw_grid_frequency",
        "Victron QW Grid Frequency",
        "Hz",
        DeviceClass::Frequency,
        2644,
        DataType::Uint16,
        0.01,
        energy_meter,
        DeviceRole::EnergyMeter,
    );
    frequency.display_precision = Some(2);
    sensors.push(frequency);

    for (phase, register) in (1..=3).zip(3u16..) {
        sensors.push(register_sensor(
            &format!("victron_qw_input_voltage_phase_{phase}"),
            &format!("Victron QW Input Voltage Phase {phase}"),
            "V",
            DeviceClass::Voltage,
            register,
            DataType::Uint16,
            0.1,
            VEBUS_SLAVE_ID,
            DeviceRole::VeBus,
        ));
    }

    for (phase, register) in (1..=3).zip(817u16..) {
        sensors.push(register_sensor(
            &format!("victron_qw_ac_consumption_l{phase}"),
            &format!("Victron QW AC Consumption L{phase}"),
            "W",
            DeviceClass::Power,
            register,
            DataType::Uint16,
            1.0,
            SYSTEM_SLAVE_ID,
            DeviceRole::System,
        ));
    }

    sensors
}

fn battery_sensors() -> Vec<SensorDescription> {
    let mut voltage = register_sensor(
        BATTERY_VOLTAGE,
        "Victron QW Battery Voltage",
        "V",
        DeviceClass::Voltage,
        840,
        DataType::Uint16,
        0.1,
        SYSTEM_SLAVE_ID,
        DeviceRole::System,
    );
    voltage.display_precision = Some(1);

    let current = register_sensor(
        BATTERY_CURRENT,
        "Victron QW Battery Current",
        "A",
        DeviceClass::Current,
        841,
        DataType::Int16,
        0.1,
        SYSTEM_SLAVE_ID,
        DeviceRole::System,
    );

    let mut temperature = register_sensor(
        BATTERY_TEMPERATURE,
        "Victron QW Battery Temperature",
        "°C",
        DeviceClass::Temperature,
        262,
        DataType::Int16,
        0.1,
        BATTERY_MONITOR_SLAVE_ID,
        DeviceRole::Battery,
    );
    temperature.display_precision = Some(1);

    let power = SensorDescription {
        key: BATTERY_POWER.to_string(),
        name: "Victron QW Battery Power".to_string(),
        unit: Some("W".to_string()),
        device_class: DeviceClass::Power,
        state_class: StateClass::Measurement,
        register: 0,
        data_type: DataType::Int16,
        multiplier: 1.0,
        slave_id: SYSTEM_SLAVE_ID,
        display_precision: None,
        role: DeviceRole::System,
        source: ValueSource::Calculated,
    };

    let soc = register_sensor(
        "victron_qw_battery_soc",
        "Victron QW Battery State of Charge",
        "%",
        DeviceClass::Battery,
        843,
        DataType::Uint16,
        1.0,
        SYSTEM_SLAVE_ID,
        DeviceRole::System,
    );

    vec![voltage, current, temperature, power, soc]
}

fn pv_sensors(pv_inverter: u8) -> Vec<SensorDescription> {
    vec![register_sensor(
        TOTAL_PV_POWER,
        "Total PV Power",
        "W",
        DeviceClass::Power,
        1052,
        DataType::Int32,
        1.0,
        pv_inverter,
        DeviceRole::PvInverter,
    )]
}

#[allow(clippy::too_many_arguments)]
fn register_sensor(
    key: &str,
    name: &str,
    unit: &str,
    device_class: DeviceClass,
    register: u16,
    data_type: DataType,
    multiplier: f64,
    slave_id: u8,
    role: DeviceRole,
) -> SensorDescription {
    SensorDescription {
        key: key.to_string(),
        name: name.to_string(),
        unit: Some(unit.to_string()),
        device_class,
        state_class: StateClass::Measurement,
        register,
        data_type,
        multiplier,
        slave_id,
        display_precision: None,
        role,
        source: ValueSource::Register,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lists_every_sensor_once() {
        let descriptions = catalog(&SlaveAssignment::default());
        assert_eq!(descriptions.len(), 16);
        assert_eq!(descriptions[0].key, "victron_qw_grid_l1");
        assert_eq!(descriptions[15].key, TOTAL_PV_POWER);
    }

    #[test]
    fn configured_slaves_retarget_pv_and_meter() {
        let slaves = SlaveAssignment {
            pv_inverter: 32,
            energy_meter: 31,
        };
        let descriptions = catalog(&slaves);
        let pv = descriptions
            .iter()
            .find(|d| d.key == TOTAL_PV_POWER)
            .expect("pv sensor");
        assert_eq!(pv.slave_id, 32);
        assert_eq!(pv.register, 1052);
        assert_eq!(pv.data_type, DataType::Int32);

        let frequency = descriptions
            .iter()
            .find(|d| d.key == "victron_qw_grid_frequency")
            .expect("frequency sensor");
        assert_eq!(frequency.slave_id, 31);
        assert_eq!(frequency.display_precision, Some(2));
    }

    #[test]
    fn battery_power_is_calculated() {
        let descriptions = catalog(&SlaveAssignment::default());
        let calculated: Vec<_> = descriptions
            .iter()
            .filter(|d| d.is_calculated())
            .map(|d| d.key.as_str())
            .collect();
        assert_eq!(calculated, vec![BATTERY_POWER]);
    }
}
