use register_map::{
    parse_descriptions_from_json, DeviceRole, MapError, RegisterMap, SlaveAssignment, StateClass,
    ValueSource, TOTAL_PV_POWER,
};
use types::DataType;

#[test]
fn parse_json_fixture_map() {
    let data = include_str!("fixtures/register-map.json");
    let map = parse_descriptions_from_json(data).expect("json parse");
    assert_eq!(map.len(), 3);

    let grid = map.get("grid_l1").expect("grid");
    assert_eq!(grid.data_type, DataType::Int16);
    assert_eq!(grid.multiplier, 1.0);
    assert_eq!(grid.slave_id, 100);
    assert_eq!(grid.state_class, StateClass::Measurement);
    assert_eq!(grid.role, DeviceRole::System);
    assert_eq!(grid.source, ValueSource::Register);

    let pv = map.get("pv_total").expect("pv");
    assert_eq!(pv.data_type, DataType::Uint32);
    assert_eq!(pv.slave_id, 32);
    assert_eq!(pv.role, DeviceRole::PvInverter);

    let voltage = map.get("battery_voltage").expect("voltage");
    assert_eq!(voltage.display_precision, Some(1));
}

#[test]
fn parse_bare_array() {
    let data = r#"[{"key": "soc", "name": "SoC", "unit": "%", "device_class": "battery", "register": 843, "data_type": "uint16"}]"#;
    let map = parse_descriptions_from_json(data).expect("array parse");
    assert_eq!(map.polled().count(), 1);
}

#[test]
fn duplicate_keys_are_rejected() {
    let data = r#"[
        {"key": "soc", "name": "SoC", "device_class": "battery", "register": 843},
        {"key": "soc", "name": "SoC again", "device_class": "battery", "register": 844}
    ]"#;
    let err = parse_descriptions_from_json(data).expect_err("duplicate");
    assert!(matches!(err, MapError::DuplicateKey(key) if key == "soc"));
}

#[test]
fn out_of_range_slave_is_rejected() {
    let data = r#"[{"key": "x", "name": "X", "device_class": "power", "register": 1, "slave_id": 0}]"#;
    let err = parse_descriptions_from_json(data).expect_err("slave 0");
    assert!(matches!(err, MapError::InvalidSlaveId { slave_id: 0, .. }));
}

#[test]
fn unknown_data_type_is_a_parse_error() {
    let data = r#"[{"key": "x", "name": "X", "device_class": "power", "register": 1, "data_type": "float32"}]"#;
    assert!(matches!(
        parse_descriptions_from_json(data),
        Err(MapError::Json(_))
    ));
}

#[test]
fn empty_map_is_rejected() {
    assert!(matches!(
        parse_descriptions_from_json("[]"),
        Err(MapError::Empty)
    ));
}

#[test]
fn builtin_map_skips_calculated_sensors_when_polling() {
    let map = RegisterMap::builtin(&SlaveAssignment::default());
    assert_eq!(map.len(), 16);
    assert_eq!(map.polled().count(), 15);
    assert!(map.validate().is_ok());
    assert_eq!(map.get(TOTAL_PV_POWER).map(|d| d.slave_id), Some(20));
}

#[test]
fn bad_field_in_bare_array_reports_the_field_error() {
    let data = r#"[
        { "key": "pv", "name": "PV", "device_class": "power", "register": 1052, "data_type": "float32" }
    ]"#;
    let err = parse_descriptions_from_json(data).expect_err("float32 is not supported");
    let message = err.to_string();
    assert!(matches!(err, MapError::Json(_)));
    assert!(message.contains("float32"), "{message}");
    assert!(!message.contains("expected a sequence"), "{message}");
}

#[test]
fn bad_field_in_sensors_object_reports_the_field_error() {
    let data = r#"  { "sensors": [
        { "key": "pv", "name": "PV", "device_class": "power", "data_type": "float32" }
    ] }"#;
    let err = parse_descriptions_from_json(data).expect_err("float32 is not supported");
    assert!(err.to_string().contains("float32"), "{err}");
}
