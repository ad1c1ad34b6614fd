use jsonschema::JSONSchema;
use serde_json::json;

fn compiled() -> JSONSchema {
    let schema = include_str!("../schemas/device_registration.v1.json");
    let schema_json: serde_json::Value = serde_json::from_str(schema).unwrap();
    let schema_static: &'static serde_json::Value = Box::leak(Box::new(schema_json));
    JSONSchema::options().compile(schema_static).unwrap()
}

fn example() -> serde_json::Value {
    serde_json::from_str(include_str!("resources/device_registration.json")).unwrap()
}

#[test]
fn registration_example_is_valid() {
    assert!(compiled().is_valid(&example()));
}

#[test]
fn caller_supplied_fields_are_valid() {
    let mut instance = example();
    instance["deviceId"] = json!("lab-1:node-7");
    instance["source"] = json!("provisioning-script");
    instance["ts"] = json!("2024-05-01T12:00:00Z");
    assert!(compiled().is_valid(&instance));
}

#[test]
fn missing_model_is_rejected() {
    let mut instance = example();
    instance.as_object_mut().unwrap().remove("model");
    assert!(!compiled().is_valid(&instance), "model is required");
}

#[test]
fn blank_hardware_id_is_rejected() {
    let mut instance = example();
    instance["hardwareId"] = json!("   ");
    assert!(!compiled().is_valid(&instance), "hardwareId needs a non-blank character");
}

#[test]
fn telemetry_must_be_an_object() {
    let mut instance = example();
    instance["initialTelemetry"] = json!("battery=98");
    assert!(!compiled().is_valid(&instance));
}
