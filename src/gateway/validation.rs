use crate::domain::NewRegistration;
use crate::error::{PipelineError, Result};
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

const REGISTRATION_SCHEMA: &str = include_str!("../../schemas/device_registration.v1.json");

static SCHEMA: Lazy<std::result::Result<JSONSchema, String>> = Lazy::new(|| {
    let schema_json: Value = serde_json::from_str(REGISTRATION_SCHEMA)
        .map_err(|e| format!("registration schema is not JSON: {e}"))?;
    // jsonschema 0.17 expects a schema with 'static lifetime
    let schema_static: &'static Value = Box::leak(Box::new(schema_json));
    JSONSchema::options()
        .compile(schema_static)
        .map_err(|e| format!("registration schema does not compile: {e}"))
});

static DEVICE_ID: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]{0,127}$").ok());

/// Check a raw request body against the registration schema and decode it.
pub fn validate_registration(body: &Value) -> Result<NewRegistration> {
    let schema = SCHEMA
        .as_ref()
        .map_err(|e| PipelineError::Config(e.clone()))?;

    if let Err(errors) = schema.validate(body) {
        let details: Vec<String> = errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{} at {}", e, path)
                }
            })
            .collect();
        return Err(PipelineError::InvalidRequest(details.join("; ")));
    }

    let fields: NewRegistration = serde_json::from_value(body.clone())
        .map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;

    if let Some(device_id) = &fields.device_id {
        validate_device_id(device_id)?;
    }
    Ok(fields)
}

pub fn validate_device_id(device_id: &str) -> Result<()> {
    let pattern = DEVICE_ID
        .as_ref()
        .ok_or_else(|| PipelineError::Config("device id pattern does not compile".into()))?;
    if pattern.is_match(device_id) {
        Ok(())
    } else {
        Err(PipelineError::InvalidRequest(format!(
            "deviceId '{device_id}' must be 1-128 characters of letters, digits, '.', '_', ':' or '-'"
        )))
    }
}
