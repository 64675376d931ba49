//! The write-once metadata sidecar of a run.

use anyhow::{Context, Result};
use prep_core::{create_new_bytes, CleanedParameters, ConfigurationError, RawParameterSet, RawValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::registry::WorkflowDescriptor;
use crate::request::RunRequest;

const RESERVED_KEYS: &[&str] = &["workflow_name", "run_id"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub workflow_name: String,
    pub run_id: String,
    #[serde(flatten)]
    pub parameters: BTreeMap<String, Value>,
}

impl MetadataDocument {
    /// Serializes every cleaned parameter through the workflow's serializer.
    ///
    /// Fails on the first value that has no textual form.
    pub fn build(
        workflow: &WorkflowDescriptor,
        run_id: &str,
        cleaned: &CleanedParameters,
    ) -> std::result::Result<Self, ConfigurationError> {
        let mut parameters = workflow.serialize_parameters(cleaned)?;
        for key in RESERVED_KEYS {
            if parameters.remove(*key).is_some() {
                warn!(parameter = *key, "parameter shadows a metadata header and was dropped");
            }
        }
        Ok(Self {
            workflow_name: workflow.name.to_string(),
            run_id: run_id.to_string(),
            parameters,
        })
    }

    pub fn to_yaml(&self) -> std::result::Result<String, ConfigurationError> {
        serde_yaml::to_string(self).map_err(|e| ConfigurationError::MetadataEncode {
            reason: e.to_string(),
        })
    }

    /// The recorded parameters as a flat raw map.
    ///
    /// The run directory is left out so a re-run gets a directory of its own.
    pub fn into_parameters(self) -> RawParameterSet {
        self.parameters
            .into_iter()
            .filter(|(key, _)| key != "directory")
            .map(|(key, value)| (key, RawValue::Json(value)))
            .collect()
    }

    /// Rebuilds the request that produced this document.
    pub fn into_request(
        self,
        override_prefix: &str,
    ) -> std::result::Result<RunRequest, ConfigurationError> {
        RunRequest::from_flat(self.into_parameters(), override_prefix)
    }
}

/// Writes `text` as `filename` inside `directory`, refusing to replace an
/// existing document.
pub fn write_metadata(
    directory: &Path,
    filename: &str,
    text: &str,
) -> std::result::Result<PathBuf, ConfigurationError> {
    let path = directory.join(filename);
    let created = create_new_bytes(&path, text.as_bytes()).map_err(|source| {
        ConfigurationError::MetadataWrite {
            path: path.clone(),
            source,
        }
    })?;
    if !created {
        return Err(ConfigurationError::MetadataAlreadyWritten { path });
    }
    debug!(path = %path.display(), "metadata written");
    Ok(path)
}

pub fn load_metadata(path: &Path) -> Result<MetadataDocument> {
    let raw_yaml = fs::read_to_string(path)
        .with_context(|| format!("read metadata {}", path.display()))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw_yaml)
        .with_context(|| format!("parse metadata {}", path.display()))?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    serde_json::from_value(json_value)
        .with_context(|| format!("metadata {} is missing workflow_name or run_id", path.display()))
}
