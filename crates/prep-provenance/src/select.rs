use prep_core::{CanonicalInput, CleanedParameters, ParamValue, RawParameterSet, RawValue};
use tracing::debug;

pub const DEFAULT_PRIMARY_CANDIDATES: &[&str] = &["structure", "migration_hop", "supercell_start"];

#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryInput {
    pub field: String,
    pub raw: RawValue,
    pub normalized: Option<CanonicalInput>,
}

impl PrimaryInput {
    pub fn is_from_past_calc(&self) -> bool {
        self.normalized
            .as_ref()
            .map(|input| input.is_from_past_calc())
            .unwrap_or(false)
    }
}

/// Returns the first candidate whose raw value is present and truthy.
///
/// Later candidates are never consulted once one matches. The normalized form
/// is looked up at the top level first and then inside nested parameter maps,
/// where derived requests keep their inputs.
pub fn select_primary_input<S: AsRef<str>>(
    raw: &RawParameterSet,
    cleaned: &CleanedParameters,
    candidates: &[S],
) -> Option<PrimaryInput> {
    for candidate in candidates {
        let field = candidate.as_ref();
        let Some(raw_value) = raw.get(field).filter(|v| v.is_truthy()) else {
            continue;
        };
        let normalized = find_normalized(cleaned, field).cloned();
        debug!(
            field,
            from_past_calc = ?normalized.as_ref().map(|i| i.is_from_past_calc()),
            "selected primary input"
        );
        return Some(PrimaryInput {
            field: field.to_string(),
            raw: raw_value.clone(),
            normalized,
        });
    }
    debug!("no primary input present");
    None
}

fn find_normalized<'a>(cleaned: &'a CleanedParameters, field: &str) -> Option<&'a CanonicalInput> {
    if let Some(input) = cleaned.get(field).and_then(ParamValue::as_input) {
        return Some(input);
    }
    cleaned
        .values()
        .filter_map(ParamValue::as_nested)
        .find_map(|nested| nested.get(field).and_then(ParamValue::as_input))
}
