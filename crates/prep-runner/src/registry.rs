use prep_core::{CleanedParameters, ConfigurationError, ParamValue};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub type ParameterSerializer =
    fn(&CleanedParameters) -> Result<BTreeMap<String, Value>, ConfigurationError>;

pub const WORKFLOW_TYPES: &[&str] = &[
    "static-energy",
    "relaxation",
    "population-analysis",
    "band-structure",
    "density-of-states",
    "dynamics",
    "diffusion",
    "customized",
];

#[derive(Clone, Copy)]
pub struct WorkflowDescriptor {
    pub name: &'static str,
    pub parameter_names: &'static [&'static str],
    pub record_kind: Option<&'static str>,
    pub serialize: ParameterSerializer,
}

impl fmt::Debug for WorkflowDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDescriptor")
            .field("name", &self.name)
            .field("parameter_names", &self.parameter_names)
            .field("record_kind", &self.record_kind)
            .finish_non_exhaustive()
    }
}

impl WorkflowDescriptor {
    pub fn accepts(&self, parameter: &str) -> bool {
        self.parameter_names.contains(&parameter)
    }

    pub fn flow_type(&self) -> &'static str {
        self.name.split('/').next().unwrap_or(self.name)
    }

    pub fn serialize_parameters(
        &self,
        cleaned: &CleanedParameters,
    ) -> Result<BTreeMap<String, Value>, ConfigurationError> {
        (self.serialize)(cleaned)
    }
}

/// Default serializer: every cleaned value in its JSON form.
pub fn serialize_parameters(
    cleaned: &CleanedParameters,
) -> Result<BTreeMap<String, Value>, ConfigurationError> {
    cleaned
        .iter()
        .map(|(field, value)| Ok((field.clone(), serialize_value(field, value)?)))
        .collect()
}

pub fn serialize_value(field: &str, value: &ParamValue) -> Result<Value, ConfigurationError> {
    Ok(match value {
        ParamValue::Json(v) => v.clone(),
        ParamValue::Input(input) => input.descriptor(),
        ParamValue::Inputs(items) => Value::Array(items.iter().map(|i| i.descriptor()).collect()),
        ParamValue::Directory(path) => Value::String(path.to_string_lossy().to_string()),
        ParamValue::Workflow(name) => Value::String(name.clone()),
        ParamValue::Nested(map) => {
            let mut out = Map::new();
            for (key, nested) in map {
                out.insert(key.clone(), serialize_value(&format!("{}.{}", field, key), nested)?);
            }
            Value::Object(out)
        }
        ParamValue::Opaque { type_name } => {
            return Err(ConfigurationError::Unserializable {
                field: field.to_string(),
                type_name: type_name.clone(),
            })
        }
    })
}

/// Dynamics runs store the MD schedule as numbers; string forms from the
/// command line are coerced so the metadata reloads with the right types.
fn serialize_dynamics_parameters(
    cleaned: &CleanedParameters,
) -> Result<BTreeMap<String, Value>, ConfigurationError> {
    let mut out = serialize_parameters(cleaned)?;
    for key in ["temperature_start", "temperature_end", "time_step", "nsteps"] {
        if let Some(Value::String(s)) = out.get(key) {
            if let Ok(n) = serde_json::from_str::<serde_json::Number>(s.trim()) {
                out.insert(key.to_string(), Value::Number(n));
            }
        }
    }
    Ok(out)
}

const VASP_PARAMETERS: &[&str] = &[
    "structure",
    "command",
    "directory",
    "copy_previous_directory",
    "source",
];

const DYNAMICS_PARAMETERS: &[&str] = &[
    "structure",
    "command",
    "directory",
    "copy_previous_directory",
    "source",
    "temperature_start",
    "temperature_end",
    "time_step",
    "nsteps",
];

const BUILTIN: &[WorkflowDescriptor] = &[
    WorkflowDescriptor {
        name: "static-energy/matproj",
        parameter_names: VASP_PARAMETERS,
        record_kind: Some("StaticEnergy"),
        serialize: serialize_parameters,
    },
    WorkflowDescriptor {
        name: "static-energy/quality04",
        parameter_names: VASP_PARAMETERS,
        record_kind: Some("StaticEnergy"),
        serialize: serialize_parameters,
    },
    WorkflowDescriptor {
        name: "relaxation/matproj",
        parameter_names: VASP_PARAMETERS,
        record_kind: Some("Relaxation"),
        serialize: serialize_parameters,
    },
    WorkflowDescriptor {
        name: "relaxation/quality00",
        parameter_names: VASP_PARAMETERS,
        record_kind: Some("Relaxation"),
        serialize: serialize_parameters,
    },
    WorkflowDescriptor {
        name: "population-analysis/bader-matproj",
        parameter_names: VASP_PARAMETERS,
        record_kind: Some("PopulationAnalysis"),
        serialize: serialize_parameters,
    },
    WorkflowDescriptor {
        name: "band-structure/matproj",
        parameter_names: VASP_PARAMETERS,
        record_kind: Some("BandStructureCalc"),
        serialize: serialize_parameters,
    },
    WorkflowDescriptor {
        name: "density-of-states/matproj",
        parameter_names: VASP_PARAMETERS,
        record_kind: Some("DensityofStatesCalc"),
        serialize: serialize_parameters,
    },
    WorkflowDescriptor {
        name: "dynamics/matproj",
        parameter_names: DYNAMICS_PARAMETERS,
        record_kind: Some("DynamicsRun"),
        serialize: serialize_dynamics_parameters,
    },
    WorkflowDescriptor {
        name: "dynamics/mit",
        parameter_names: DYNAMICS_PARAMETERS,
        record_kind: Some("DynamicsRun"),
        serialize: serialize_dynamics_parameters,
    },
    WorkflowDescriptor {
        name: "diffusion/neb-all-paths",
        parameter_names: &[
            "structure",
            "migrating_specie",
            "command",
            "directory",
            "source",
        ],
        record_kind: Some("DiffusionAnalysis"),
        serialize: serialize_parameters,
    },
    WorkflowDescriptor {
        name: "diffusion/neb-single-path",
        parameter_names: &[
            "supercell_start",
            "supercell_end",
            "migration_hop",
            "command",
            "directory",
            "copy_previous_directory",
            "source",
        ],
        record_kind: Some("MigrationHop"),
        serialize: serialize_parameters,
    },
    WorkflowDescriptor {
        name: "diffusion/from-images",
        parameter_names: &["migration_images", "structures", "command", "directory", "source"],
        record_kind: None,
        serialize: serialize_parameters,
    },
    WorkflowDescriptor {
        name: "customized/vasp",
        parameter_names: &[
            "workflow_base",
            "input_parameters",
            "updated_settings",
            "directory",
            "copy_previous_directory",
            "source",
        ],
        record_kind: Some("Customized"),
        serialize: serialize_parameters,
    },
];

/// Canonical `<type>/<preset>` form with dashes.
pub fn canonical_workflow_name(name: &str) -> Result<String, ConfigurationError> {
    let malformed = || ConfigurationError::MalformedWorkflowName {
        name: name.to_string(),
    };
    let (flow_type, preset) = name.split_once('/').ok_or_else(malformed)?;
    if flow_type.is_empty() || preset.is_empty() || preset.contains('/') {
        return Err(malformed());
    }
    Ok(format!(
        "{}/{}",
        flow_type.replace('_', "-"),
        preset.replace('_', "-")
    ))
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: BTreeMap<&'static str, WorkflowDescriptor>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for descriptor in BUILTIN {
            registry.register(*descriptor);
        }
        registry
    }

    pub fn register(&mut self, descriptor: WorkflowDescriptor) {
        self.workflows.insert(descriptor.name, descriptor);
    }

    pub fn get(&self, name: &str) -> Result<&WorkflowDescriptor, ConfigurationError> {
        let canonical = canonical_workflow_name(name)?;
        self.workflows
            .get(canonical.as_str())
            .ok_or_else(|| ConfigurationError::UnknownWorkflow {
                name: name.to_string(),
            })
    }

    pub fn list_all(&self) -> Vec<&'static str> {
        self.workflows.keys().copied().collect()
    }

    pub fn list_by_type(&self, flow_type: &str) -> Result<Vec<&'static str>, ConfigurationError> {
        let flow_type = flow_type.replace('_', "-");
        if !WORKFLOW_TYPES.contains(&flow_type.as_str()) {
            return Err(ConfigurationError::UnknownWorkflowType {
                flow_type,
                allowed: WORKFLOW_TYPES.join(", "),
            });
        }
        Ok(self
            .workflows
            .values()
            .filter(|d| d.flow_type() == flow_type)
            .map(|d| d.name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prep_core::{CanonicalInput, InputKind};
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn lookup_accepts_underscored_names() {
        let registry = WorkflowRegistry::builtin();
        let flow = registry.get("static_energy/matproj").expect("known workflow");
        assert_eq!(flow.name, "static-energy/matproj");
        assert_eq!(flow.record_kind, Some("StaticEnergy"));
        assert!(flow.accepts("source"));
    }

    #[test]
    fn unknown_and_malformed_names_are_configuration_errors() {
        let registry = WorkflowRegistry::builtin();
        assert!(matches!(
            registry.get("relaxation/does-not-exist"),
            Err(ConfigurationError::UnknownWorkflow { .. })
        ));
        assert!(matches!(
            registry.get("relaxation"),
            Err(ConfigurationError::MalformedWorkflowName { .. })
        ));
        assert!(matches!(
            registry.get("a/b/c"),
            Err(ConfigurationError::MalformedWorkflowName { .. })
        ));
    }

    #[test]
    fn list_by_type_rejects_unknown_types() {
        let registry = WorkflowRegistry::builtin();
        let dynamics = registry.list_by_type("dynamics").expect("known type");
        assert_eq!(dynamics, vec!["dynamics/matproj", "dynamics/mit"]);
        let err = registry.list_by_type("chemistry").expect_err("unknown type");
        assert!(err.to_string().contains("static-energy"), "{}", err);
        assert!(registry.list_all().len() >= dynamics.len());
    }

    #[test]
    fn registered_descriptors_are_found() {
        let mut registry = WorkflowRegistry::new();
        registry.register(WorkflowDescriptor {
            name: "relaxation/custom-test",
            parameter_names: &["structure"],
            record_kind: None,
            serialize: serialize_parameters,
        });
        assert!(registry.get("relaxation/custom-test").is_ok());
        assert!(registry.get("relaxation/matproj").is_err());
    }

    #[test]
    fn default_serializer_handles_every_value_kind() {
        let mut nested = BTreeMap::new();
        nested.insert("ENCUT".to_string(), ParamValue::Json(json!(520)));
        let mut cleaned = CleanedParameters::new();
        cleaned.insert(
            "structure".to_string(),
            ParamValue::Input(CanonicalInput::new(InputKind::Structure, json!({"a": 1}))),
        );
        cleaned.insert(
            "directory".to_string(),
            ParamValue::Directory(PathBuf::from("/runs/x")),
        );
        cleaned.insert(
            "workflow_base".to_string(),
            ParamValue::Workflow("relaxation/matproj".to_string()),
        );
        cleaned.insert("updated_settings".to_string(), ParamValue::Nested(nested));
        let out = serialize_parameters(&cleaned).expect("serialize");
        assert_eq!(out["structure"], json!({"a": 1}));
        assert_eq!(out["directory"], json!("/runs/x"));
        assert_eq!(out["workflow_base"], json!("relaxation/matproj"));
        assert_eq!(out["updated_settings"], json!({"ENCUT": 520}));
    }

    #[test]
    fn opaque_values_fail_with_their_path() {
        let mut nested = BTreeMap::new();
        nested.insert(
            "callback".to_string(),
            ParamValue::Opaque {
                type_name: "Closure".to_string(),
            },
        );
        let mut cleaned = CleanedParameters::new();
        cleaned.insert("updated_settings".to_string(), ParamValue::Nested(nested));
        match serialize_parameters(&cleaned) {
            Err(ConfigurationError::Unserializable { field, type_name }) => {
                assert_eq!(field, "updated_settings.callback");
                assert_eq!(type_name, "Closure");
            }
            other => panic!("expected unserializable error, got {:?}", other),
        }
    }

    #[test]
    fn dynamics_serializer_coerces_schedule_numbers() {
        let registry = WorkflowRegistry::builtin();
        let flow = registry.get("dynamics/matproj").expect("known workflow");
        let mut cleaned = CleanedParameters::new();
        cleaned.insert("nsteps".to_string(), ParamValue::Json(json!("1000")));
        cleaned.insert("time_step".to_string(), ParamValue::Json(json!("2.5")));
        cleaned.insert("command".to_string(), ParamValue::Json(json!("100")));
        let out = flow.serialize_parameters(&cleaned).expect("serialize");
        assert_eq!(out["nsteps"], json!(1000));
        assert_eq!(out["time_step"], json!(2.5));
        assert_eq!(out["command"], json!("100"));
    }
}
