use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::canonical_json_digest;

pub type RawParameterSet = BTreeMap<String, RawValue>;
pub type CleanedParameters = BTreeMap<String, ParamValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Structure,
    MigrationHop,
    MigrationImages,
}

impl InputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputKind::Structure => "structure",
            InputKind::MigrationHop => "migration_hop",
            InputKind::MigrationImages => "migration_images",
        }
    }
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Back-reference from a canonical input to the calculation it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PastCalculation {
    pub database_table: String,
    pub database_id: String,
    pub directory: PathBuf,
}

impl PastCalculation {
    /// The descriptor form used as a run's source.
    pub fn descriptor(&self) -> Value {
        json!({
            "database_table": self.database_table,
            "database_id": self.database_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalInput {
    pub kind: InputKind,
    pub identity: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calculation: Option<PastCalculation>,
}

impl CanonicalInput {
    pub fn new(kind: InputKind, content: Value) -> Self {
        let identity = canonical_json_digest(&content);
        Self {
            kind,
            identity,
            content,
            calculation: None,
        }
    }

    pub fn from_past_calc(kind: InputKind, content: Value, calculation: PastCalculation) -> Self {
        let mut input = Self::new(kind, content);
        input.calculation = Some(calculation);
        input
    }

    pub fn is_from_past_calc(&self) -> bool {
        self.calculation.is_some()
    }

    pub fn previous_directory(&self) -> Option<&Path> {
        self.calculation.as_ref().map(|c| c.directory.as_path())
    }

    /// JSON form written to metadata and run records.
    ///
    /// Inputs taken from a past calculation serialize as their descriptor so a
    /// reload points back at the same record; everything else keeps its content.
    pub fn descriptor(&self) -> Value {
        match &self.calculation {
            Some(calc) => {
                let mut out = calc.descriptor();
                out["directory"] = Value::String(calc.directory.to_string_lossy().to_string());
                out
            }
            None => self.content.clone(),
        }
    }
}

/// A parameter value as submitted, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Json(Value),
    Canonical(CanonicalInput),
    CanonicalList(Vec<CanonicalInput>),
    /// An in-process object with no textual form.
    Opaque { type_name: String },
}

impl RawValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            RawValue::Json(v) => is_truthy(v),
            RawValue::CanonicalList(items) => !items.is_empty(),
            RawValue::Canonical(_) | RawValue::Opaque { .. } => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RawValue::Json(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Form used when comparing and storing sources. Canonical objects are
    /// replaced by their descriptors so they compare equal to the raw
    /// descriptor they were loaded from.
    pub fn as_source(&self) -> RawValue {
        match self {
            RawValue::Canonical(input) => RawValue::Json(input.descriptor()),
            RawValue::CanonicalList(items) => {
                RawValue::Json(Value::Array(items.iter().map(|i| i.descriptor()).collect()))
            }
            other => other.clone(),
        }
    }

    pub fn to_json(&self) -> Option<Value> {
        match self.as_source() {
            RawValue::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            RawValue::Json(_) => "json",
            RawValue::Canonical(_) => "canonical_input",
            RawValue::CanonicalList(_) => "canonical_input_list",
            RawValue::Opaque { type_name } => type_name,
        }
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        RawValue::Json(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Json(Value::String(value.to_string()))
    }
}

impl From<CanonicalInput> for RawValue {
    fn from(value: CanonicalInput) -> Self {
        RawValue::Canonical(value)
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json() {
            Some(v) => write!(f, "{}", v),
            None => write!(f, "<{}>", self.type_name()),
        }
    }
}

/// Null, `false`, `""`, zero, and empty collections are all false-y.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// A parameter value after normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Json(Value),
    Input(CanonicalInput),
    Inputs(Vec<CanonicalInput>),
    Directory(PathBuf),
    Workflow(String),
    Nested(BTreeMap<String, ParamValue>),
    Opaque { type_name: String },
}

impl ParamValue {
    pub fn as_input(&self) -> Option<&CanonicalInput> {
        match self {
            ParamValue::Input(input) => Some(input),
            _ => None,
        }
    }

    pub fn as_nested(&self) -> Option<&BTreeMap<String, ParamValue>> {
        match self {
            ParamValue::Nested(map) => Some(map),
            _ => None,
        }
    }
}

impl From<RawValue> for ParamValue {
    fn from(value: RawValue) -> Self {
        match value {
            RawValue::Json(v) => ParamValue::Json(v),
            RawValue::Canonical(input) => ParamValue::Input(input),
            RawValue::CanonicalList(items) => ParamValue::Inputs(items),
            RawValue::Opaque { type_name } => ParamValue::Opaque { type_name },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryState {
    Fresh,
    PopulatedFromLiveCopy,
    PopulatedFromArchive,
    Unavailable,
}

impl DirectoryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectoryState::Fresh => "fresh",
            DirectoryState::PopulatedFromLiveCopy => "populated_from_live_copy",
            DirectoryState::PopulatedFromArchive => "populated_from_archive",
            DirectoryState::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectory {
    pub path: PathBuf,
    pub state: DirectoryState,
}

impl RunDirectory {
    pub fn fresh(path: PathBuf) -> Self {
        Self {
            path,
            state: DirectoryState::Fresh,
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.state = DirectoryState::Unavailable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn past_structure() -> CanonicalInput {
        CanonicalInput::from_past_calc(
            InputKind::Structure,
            json!({"lattice": [[1, 0, 0], [0, 1, 0], [0, 0, 1]]}),
            PastCalculation {
                database_table: "StaticEnergy".to_string(),
                database_id: "7".to_string(),
                directory: PathBuf::from("/runs/calc_7"),
            },
        )
    }

    #[test]
    fn falsy_values_cover_empty_forms() {
        for v in [
            Value::Null,
            json!(false),
            json!(""),
            json!(0),
            json!(0.0),
            json!([]),
            json!({}),
        ] {
            assert!(!is_truthy(&v), "expected false-y: {}", v);
        }
        for v in [json!(true), json!("x"), json!(2), json!([0]), json!({"a": null})] {
            assert!(is_truthy(&v), "expected truthy: {}", v);
        }
    }

    #[test]
    fn identity_depends_on_content_only() {
        let a = CanonicalInput::new(InputKind::Structure, json!({"species": ["Na", "Cl"]}));
        let b = CanonicalInput::new(InputKind::Structure, json!({"species": ["Na", "Cl"]}));
        assert_eq!(a.identity, b.identity);
        assert!(!a.is_from_past_calc());
        assert!(a.previous_directory().is_none());
    }

    #[test]
    fn canonical_source_matches_raw_descriptor() {
        let input = past_structure();
        let raw_descriptor = RawValue::Json(json!({
            "database_table": "StaticEnergy",
            "database_id": "7",
            "directory": "/runs/calc_7",
        }));
        assert_eq!(RawValue::Canonical(input).as_source(), raw_descriptor);
    }

    #[test]
    fn opaque_values_have_no_json_form() {
        let raw = RawValue::Opaque {
            type_name: "SocketHandle".to_string(),
        };
        assert!(raw.to_json().is_none());
        assert!(raw.is_truthy());
        assert_eq!(raw.to_string(), "<SocketHandle>");
    }
}
