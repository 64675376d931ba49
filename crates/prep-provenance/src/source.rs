use prep_core::{PrepError, RawValue, Result};
use serde_json::{json, Value};
use tracing::debug;

use crate::PrimaryInput;

/// Computes the source a run is registered under.
///
/// A primary input taken from a past calculation fixes the source; an explicit
/// value may restate it but never change it.
pub fn resolve_source(
    explicit: Option<&RawValue>,
    primary: Option<&PrimaryInput>,
) -> Result<Option<RawValue>> {
    let explicit = explicit.filter(|v| v.is_truthy()).map(RawValue::as_source);
    let inferred = primary
        .filter(|p| p.is_from_past_calc())
        .map(|p| p.raw.as_source());

    match (explicit, inferred) {
        (Some(explicit), Some(inferred)) => {
            if comparison_key(&explicit) != comparison_key(&inferred) {
                return Err(PrepError::ProvenanceConflict {
                    explicit: explicit.to_string(),
                    inferred: inferred.to_string(),
                });
            }
            debug!(source = %explicit, "explicit source matches past calculation");
            Ok(Some(explicit))
        }
        (None, Some(inferred)) => {
            debug!(source = %inferred, "source inferred from past calculation");
            Ok(Some(inferred))
        }
        (Some(explicit), None) => Ok(Some(explicit)),
        (None, None) => Ok(None),
    }
}

/// Past-calculation descriptors are equal when they name the same record,
/// whatever else they carry (an inline `directory`, a numeric id).
fn comparison_key(source: &RawValue) -> RawValue {
    let RawValue::Json(Value::Object(obj)) = source else {
        return source.clone();
    };
    let table = obj.get("database_table").and_then(Value::as_str);
    let id = match obj.get("database_id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    match (table, id) {
        (Some(table), Some(id)) => {
            RawValue::Json(json!({"database_table": table, "database_id": id}))
        }
        _ => source.clone(),
    }
}
