use prep_core::{ConfigurationError, RawParameterSet, RawValue};
use serde_json::Value;

pub const WORKFLOW_BASE: &str = "workflow_base";
pub const INPUT_PARAMETERS: &str = "input_parameters";
pub const UPDATED_SETTINGS: &str = "updated_settings";

/// Parameters that steer preparation itself rather than the calculation.
/// In a derived request they stay at the top level of the cleaned map.
pub const CONTROL_PARAMETERS: &[&str] = &["directory", "source", "copy_previous_directory"];

/// What a caller asks to run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunRequest {
    Direct(RawParameterSet),
    /// Run `base` with `parameters`, after applying `overrides` to its settings.
    Derived {
        base: String,
        parameters: RawParameterSet,
        overrides: RawParameterSet,
    },
}

impl RunRequest {
    /// Builds a request from a flat map.
    ///
    /// The `workflow_base` key is the discriminant for a derived request. Its
    /// other keys are split by `override_prefix` (stripped) into overrides;
    /// nested `input_parameters` / `updated_settings` mappings are merged in.
    pub fn from_flat(
        mut raw: RawParameterSet,
        override_prefix: &str,
    ) -> Result<Self, ConfigurationError> {
        let Some(base) = raw.remove(WORKFLOW_BASE) else {
            return Ok(RunRequest::Direct(raw));
        };
        let base = match base.as_str() {
            Some(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => {
                return Err(ConfigurationError::UnresolvableBase {
                    base: base.to_string(),
                    reason: "workflow_base must be a workflow name".to_string(),
                })
            }
        };

        let mut parameters = RawParameterSet::new();
        let mut overrides = RawParameterSet::new();
        if let Some(nested) = raw.remove(INPUT_PARAMETERS) {
            merge_mapping(&mut parameters, nested, INPUT_PARAMETERS)?;
        }
        if let Some(nested) = raw.remove(UPDATED_SETTINGS) {
            merge_mapping(&mut overrides, nested, UPDATED_SETTINGS)?;
        }
        for (key, value) in raw {
            match key.strip_prefix(override_prefix) {
                Some(stripped) if !override_prefix.is_empty() => {
                    overrides.insert(stripped.to_string(), value);
                }
                _ => {
                    parameters.insert(key, value);
                }
            }
        }
        Ok(RunRequest::Derived {
            base,
            parameters,
            overrides,
        })
    }

    pub fn parameters(&self) -> &RawParameterSet {
        match self {
            RunRequest::Direct(parameters) | RunRequest::Derived { parameters, .. } => parameters,
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self, RunRequest::Derived { .. })
    }
}

fn merge_mapping(
    into: &mut RawParameterSet,
    value: RawValue,
    field: &str,
) -> Result<(), ConfigurationError> {
    match value {
        RawValue::Json(Value::Object(map)) => {
            for (k, v) in map {
                into.insert(k, RawValue::Json(v));
            }
            Ok(())
        }
        RawValue::Json(Value::Null) => Ok(()),
        other => Err(ConfigurationError::UnresolvableInput {
            field: field.to_string(),
            reason: format!("expected a mapping, got {}", other),
        }),
    }
}
