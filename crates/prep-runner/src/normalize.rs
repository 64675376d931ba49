//! Parameter normalization: raw submitted values to canonical domain inputs.

use prep_core::{
    CanonicalInput, CleanedParameters, ConfigurationError, InputKind, ParamValue,
    PastCalculation, RawParameterSet, RawValue, Result,
};
use prep_records::RecordStore;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::registry::WorkflowRegistry;
use crate::request::{
    RunRequest, CONTROL_PARAMETERS, INPUT_PARAMETERS, UPDATED_SETTINGS, WORKFLOW_BASE,
};

#[derive(Debug, Clone, Copy)]
pub struct InputField {
    pub name: &'static str,
    pub kind: InputKind,
    pub list: bool,
}

pub const INPUT_FIELDS: &[InputField] = &[
    InputField {
        name: "structure",
        kind: InputKind::Structure,
        list: false,
    },
    InputField {
        name: "structures",
        kind: InputKind::Structure,
        list: true,
    },
    InputField {
        name: "migration_hop",
        kind: InputKind::MigrationHop,
        list: false,
    },
    InputField {
        name: "migration_images",
        kind: InputKind::MigrationImages,
        list: false,
    },
    InputField {
        name: "supercell_start",
        kind: InputKind::Structure,
        list: false,
    },
    InputField {
        name: "supercell_end",
        kind: InputKind::Structure,
        list: false,
    },
];

/// Dropped when false-y so the workflow falls back to its own default.
pub const OPTIONAL_FIELDS: &[&str] = &["command", "directory"];

fn input_field(name: &str) -> Option<&'static InputField> {
    INPUT_FIELDS.iter().find(|f| f.name == name)
}

pub struct Normalizer<'a> {
    registry: &'a WorkflowRegistry,
    store: Option<&'a dyn RecordStore>,
}

impl<'a> Normalizer<'a> {
    pub fn new(registry: &'a WorkflowRegistry, store: Option<&'a dyn RecordStore>) -> Self {
        Self { registry, store }
    }

    pub fn normalize(&self, request: &RunRequest) -> Result<CleanedParameters> {
        match request {
            RunRequest::Direct(raw) => self.clean_map(raw),
            RunRequest::Derived {
                base,
                parameters,
                overrides,
            } => {
                let base_flow = self.registry.get(base).map_err(|e| {
                    ConfigurationError::UnresolvableBase {
                        base: base.clone(),
                        reason: e.to_string(),
                    }
                })?;
                let mut inner = self.clean_map(parameters)?;
                let mut cleaned = CleanedParameters::new();
                for control in CONTROL_PARAMETERS {
                    if let Some(value) = inner.remove(*control) {
                        cleaned.insert(control.to_string(), value);
                    }
                }
                let settings: BTreeMap<String, ParamValue> = overrides
                    .iter()
                    .map(|(k, v)| (k.clone(), ParamValue::from(v.clone())))
                    .collect();
                debug!(
                    base = base_flow.name,
                    inputs = inner.len(),
                    overrides = settings.len(),
                    "expanded derived request"
                );
                cleaned.insert(
                    WORKFLOW_BASE.to_string(),
                    ParamValue::Workflow(base_flow.name.to_string()),
                );
                cleaned.insert(INPUT_PARAMETERS.to_string(), ParamValue::Nested(inner));
                cleaned.insert(UPDATED_SETTINGS.to_string(), ParamValue::Nested(settings));
                Ok(cleaned)
            }
        }
    }

    fn clean_map(&self, raw: &RawParameterSet) -> Result<CleanedParameters> {
        let mut cleaned = CleanedParameters::new();
        for (key, value) in raw {
            let field = input_field(key);
            if (field.is_some() || OPTIONAL_FIELDS.contains(&key.as_str())) && !value.is_truthy() {
                debug!(parameter = %key, "dropping empty optional parameter");
                continue;
            }
            let cleaned_value = match field {
                Some(f) if f.list => ParamValue::Inputs(self.resolve_list(f, value)?),
                Some(f) => ParamValue::Input(self.resolve_input(f.name, f.kind, value)?),
                None => ParamValue::from(value.clone()),
            };
            cleaned.insert(key.clone(), cleaned_value);
        }
        Ok(cleaned)
    }

    fn resolve_list(&self, field: &InputField, raw: &RawValue) -> Result<Vec<CanonicalInput>> {
        match raw {
            RawValue::CanonicalList(items) => items
                .iter()
                .map(|item| {
                    self.resolve_input(field.name, field.kind, &RawValue::Canonical(item.clone()))
                })
                .collect(),
            RawValue::Json(Value::String(joined)) => joined
                .split(';')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| self.resolve_input(field.name, field.kind, &RawValue::from(part)))
                .collect(),
            RawValue::Json(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    self.resolve_input(field.name, field.kind, &RawValue::Json(item.clone()))
                })
                .collect(),
            other => Ok(vec![self.resolve_input(field.name, field.kind, other)?]),
        }
    }

    /// Resolves one raw value into a canonical input of `kind`.
    ///
    /// Accepted forms: an already canonical object, a path to a readable file,
    /// a JSON document (string or mapping), or a past-calculation descriptor
    /// `{database_table, database_id[, directory]}`.
    pub fn resolve_input(
        &self,
        field: &str,
        kind: InputKind,
        raw: &RawValue,
    ) -> Result<CanonicalInput> {
        let unresolvable = |reason: String| ConfigurationError::UnresolvableInput {
            field: field.to_string(),
            reason,
        };
        match raw {
            RawValue::Canonical(input) if input.kind == kind => Ok(input.clone()),
            RawValue::Canonical(input) => Err(unresolvable(format!(
                "expected a {} but got a {}",
                kind, input.kind
            ))
            .into()),
            RawValue::CanonicalList(_) => {
                Err(unresolvable("expected a single value, got a list".to_string()).into())
            }
            RawValue::Opaque { type_name } => {
                Err(unresolvable(format!("cannot convert a {}", type_name)).into())
            }
            RawValue::Json(Value::String(text)) => {
                let path = Path::new(text.trim());
                if path.is_file() {
                    return read_input_file(kind, path).map_err(|e| unresolvable(e).into());
                }
                match serde_json::from_str::<Value>(text) {
                    Ok(parsed @ (Value::Object(_) | Value::Array(_))) => {
                        self.resolve_json(field, kind, &parsed)
                    }
                    _ => Err(unresolvable(format!(
                        "'{}' is neither a readable file nor a JSON document",
                        text
                    ))
                    .into()),
                }
            }
            RawValue::Json(value @ (Value::Object(_) | Value::Array(_))) => {
                self.resolve_json(field, kind, value)
            }
            RawValue::Json(other) => {
                Err(unresolvable(format!("unsupported value {}", other)).into())
            }
        }
    }

    fn resolve_json(&self, field: &str, kind: InputKind, value: &Value) -> Result<CanonicalInput> {
        let Some(obj) = value.as_object().filter(|o| o.contains_key("database_table")) else {
            return Ok(CanonicalInput::new(kind, value.clone()));
        };
        let table = obj
            .get("database_table")
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigurationError::UnresolvableInput {
                field: field.to_string(),
                reason: "database_table must be a string".to_string(),
            })?;
        let id = match obj.get("database_id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(ConfigurationError::UnresolvableInput {
                    field: field.to_string(),
                    reason: "database_id must be a string or integer".to_string(),
                }
                .into())
            }
        };
        let inline_directory = obj.get("directory").and_then(Value::as_str).map(PathBuf::from);

        let (directory, content) = match inline_directory {
            Some(directory) => (directory, descriptor_content(obj)),
            None => {
                let record = match self.store {
                    Some(store) => store.get(table, &id)?,
                    None => None,
                };
                let Some((directory, content)) = record.and_then(|r| {
                    let content = r.primary_input.unwrap_or_else(|| descriptor_content(obj));
                    r.directory.map(|d| (d, content))
                }) else {
                    return Err(ConfigurationError::UnknownPastCalculation {
                        field: field.to_string(),
                        table: table.to_string(),
                        id,
                    }
                    .into());
                };
                (directory, content)
            }
        };
        debug!(
            field,
            table,
            id = %id,
            directory = %directory.display(),
            "resolved past calculation"
        );
        Ok(CanonicalInput::from_past_calc(
            kind,
            content,
            PastCalculation {
                database_table: table.to_string(),
                database_id: id,
                directory,
            },
        ))
    }
}

fn descriptor_content(obj: &Map<String, Value>) -> Value {
    let mut content = obj.clone();
    content.remove("directory");
    Value::Object(content)
}

fn read_input_file(kind: InputKind, path: &Path) -> std::result::Result<CanonicalInput, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("read {}: {}", path.display(), e))?;
    let format = path
        .extension()
        .and_then(|s| s.to_str())
        .map(str::to_lowercase)
        .or_else(|| path.file_name().and_then(|s| s.to_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    Ok(CanonicalInput::new(kind, json!({ "format": format, "text": text })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prep_records::{MemoryRecordStore, RecordDraft};

    fn raw(pairs: &[(&str, Value)]) -> RawParameterSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), RawValue::Json(v.clone())))
            .collect()
    }

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "prep_normalize_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp dir");
        root
    }

    #[test]
    fn falsy_optional_fields_are_dropped() {
        let registry = WorkflowRegistry::builtin();
        let normalizer = Normalizer::new(&registry, None);
        let request = RunRequest::Direct(raw(&[
            ("command", Value::Null),
            ("directory", json!("")),
            ("structure", json!(false)),
            ("structures", json!([])),
            ("nsteps", json!(0)),
        ]));
        let cleaned = normalizer.normalize(&request).expect("normalize");
        assert_eq!(cleaned.keys().collect::<Vec<_>>(), vec!["nsteps"]);
    }

    #[test]
    fn files_and_json_strings_become_inputs() {
        let root = temp_root("files");
        let poscar = root.join("POSCAR");
        let cif = root.join("nacl.cif");
        fs::write(&poscar, "Na Cl\n1.0\n").expect("write poscar");
        fs::write(&cif, "data_NaCl\n").expect("write cif");

        let registry = WorkflowRegistry::builtin();
        let normalizer = Normalizer::new(&registry, None);
        let request = RunRequest::Direct(raw(&[
            ("structure", json!(poscar.to_string_lossy())),
            (
                "structures",
                json!(format!("{};{}", poscar.display(), cif.display())),
            ),
            ("migration_hop", json!(r#"{"isite": [0, 0, 0], "esite": [0.5, 0, 0]}"#)),
        ]));
        let cleaned = normalizer.normalize(&request).expect("normalize");

        let structure = cleaned["structure"].as_input().expect("structure input");
        assert_eq!(structure.kind, InputKind::Structure);
        assert_eq!(structure.content["format"], json!("POSCAR"));
        assert!(!structure.is_from_past_calc());

        match &cleaned["structures"] {
            ParamValue::Inputs(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[1].content["format"], json!("cif"));
                assert_eq!(items[0].identity, structure.identity);
            }
            other => panic!("expected list of inputs, got {:?}", other),
        }
        let hop = cleaned["migration_hop"].as_input().expect("hop input");
        assert_eq!(hop.kind, InputKind::MigrationHop);
        assert_eq!(hop.content["esite"], json!([0.5, 0, 0]));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn descriptor_with_directory_is_a_past_calculation() {
        let registry = WorkflowRegistry::builtin();
        let normalizer = Normalizer::new(&registry, None);
        let request = RunRequest::Direct(raw(&[(
            "structure",
            json!({
                "database_table": "Relaxation",
                "database_id": 12,
                "directory": "/runs/relax_12",
            }),
        )]));
        let cleaned = normalizer.normalize(&request).expect("normalize");
        let input = cleaned["structure"].as_input().expect("input");
        assert!(input.is_from_past_calc());
        assert_eq!(input.previous_directory(), Some(Path::new("/runs/relax_12")));
        let calc = input.calculation.as_ref().expect("calculation");
        assert_eq!(calc.database_id, "12");
    }

    #[test]
    fn descriptor_without_directory_is_looked_up_in_store() {
        let store = MemoryRecordStore::new();
        let content = CanonicalInput::new(InputKind::Structure, json!({"species": ["Mg", "O"]}));
        let dir = PathBuf::from("/runs/static_9");
        store
            .create_or_load(
                "StaticEnergy",
                "run-9",
                RecordDraft {
                    primary_input: Some(&content),
                    directory: Some(&dir),
                    ..RecordDraft::default()
                },
            )
            .expect("seed record");

        let registry = WorkflowRegistry::builtin();
        let normalizer = Normalizer::new(&registry, Some(&store));
        let found = normalizer
            .resolve_input(
                "structure",
                InputKind::Structure,
                &RawValue::Json(json!({"database_table": "StaticEnergy", "database_id": "run-9"})),
            )
            .expect("resolve");
        assert_eq!(found.previous_directory(), Some(dir.as_path()));
        assert_eq!(found.identity, content.identity);

        let err = normalizer
            .resolve_input(
                "structure",
                InputKind::Structure,
                &RawValue::Json(json!({"database_table": "StaticEnergy", "database_id": "run-10"})),
            )
            .expect_err("missing record");
        assert!(err.to_string().contains("StaticEnergy/run-10"), "{}", err);
    }

    #[test]
    fn canonical_objects_pass_through_and_kinds_are_checked() {
        let registry = WorkflowRegistry::builtin();
        let normalizer = Normalizer::new(&registry, None);
        let hop = CanonicalInput::new(InputKind::MigrationHop, json!({"hop": 1}));
        let ok = normalizer
            .resolve_input(
                "migration_hop",
                InputKind::MigrationHop,
                &RawValue::Canonical(hop.clone()),
            )
            .expect("same kind");
        assert_eq!(ok, hop);
        assert!(normalizer
            .resolve_input("structure", InputKind::Structure, &RawValue::Canonical(hop))
            .is_err());
        assert!(normalizer
            .resolve_input("structure", InputKind::Structure, &RawValue::from("no-such-file"))
            .is_err());
    }

    #[test]
    fn derived_request_expands_into_three_fields() {
        let registry = WorkflowRegistry::builtin();
        let normalizer = Normalizer::new(&registry, None);
        let flat = raw(&[
            ("workflow_base", json!("relaxation/matproj")),
            ("structure", json!({"species": ["Si"]})),
            ("directory", json!("/runs/custom")),
            ("custom__ENCUT", json!(600)),
        ]);
        let request = RunRequest::from_flat(flat, "custom__").expect("request");
        let cleaned = normalizer.normalize(&request).expect("normalize");

        assert_eq!(
            cleaned[WORKFLOW_BASE],
            ParamValue::Workflow("relaxation/matproj".to_string())
        );
        let inputs = cleaned[INPUT_PARAMETERS].as_nested().expect("inputs");
        assert!(inputs["structure"].as_input().is_some());
        assert!(!inputs.contains_key("directory"));
        assert_eq!(cleaned["directory"], ParamValue::Json(json!("/runs/custom")));
        let settings = cleaned[UPDATED_SETTINGS].as_nested().expect("settings");
        assert_eq!(settings["ENCUT"], ParamValue::Json(json!(600)));
    }

    #[test]
    fn derived_request_with_unknown_base_fails() {
        let registry = WorkflowRegistry::builtin();
        let normalizer = Normalizer::new(&registry, None);
        let request = RunRequest::Derived {
            base: "relaxation/nonexistent".to_string(),
            parameters: RawParameterSet::new(),
            overrides: RawParameterSet::new(),
        };
        let err = normalizer.normalize(&request).expect_err("unknown base");
        assert!(
            matches!(
                err,
                prep_core::PrepError::Configuration(ConfigurationError::UnresolvableBase { .. })
            ),
            "{}",
            err
        );
    }
}
