//! Run preparation: turn a submitted parameter map into a cleaned parameter
//! map, a ready working directory, a registered run record and a metadata
//! snapshot, in that order, before anything is handed to an executor.

pub mod config;
pub mod directory;
pub mod metadata;
pub mod normalize;
pub mod registry;
pub mod request;

pub use config::{load_config, load_config_with, PrepConfig};
pub use directory::{
    archive_path, copy_dir_filtered, copy_forward, default_strategies, resolve_directory,
    ArchiveCopy, Attempt, LiveCopy, RecoveryStrategy,
};
pub use metadata::{load_metadata, write_metadata, MetadataDocument};
pub use normalize::{Normalizer, INPUT_FIELDS, OPTIONAL_FIELDS};
pub use registry::{canonical_workflow_name, WorkflowDescriptor, WorkflowRegistry, WORKFLOW_TYPES};
pub use request::RunRequest;

use prep_core::{
    CleanedParameters, ConfigurationError, ParamValue, RawValue, Result, RunDirectory,
};
use prep_provenance::{resolve_source, select_primary_input, PrimaryInput};
use prep_records::{RecordDraft, RecordStore, RunRecord};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Identifies the run being prepared. Passed in by the caller rather than read
/// from any ambient execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub workflow_name: String,
    pub run_id: String,
}

impl RunContext {
    pub fn new(workflow_name: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            run_id: run_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepOptions {
    pub register_run: bool,
}

impl Default for PrepOptions {
    fn default() -> Self {
        Self { register_run: true }
    }
}

#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub workflow_name: String,
    pub run_id: String,
    /// What the executor receives.
    pub parameters: CleanedParameters,
    pub directory: RunDirectory,
    pub primary_input: Option<PrimaryInput>,
    pub source: Option<RawValue>,
    pub record: Option<RunRecord>,
    pub record_created: bool,
    pub metadata_path: PathBuf,
}

pub struct Preparer<'a> {
    registry: &'a WorkflowRegistry,
    store: &'a dyn RecordStore,
    config: &'a PrepConfig,
    strategies: Vec<Box<dyn RecoveryStrategy>>,
}

impl<'a> Preparer<'a> {
    pub fn new(
        registry: &'a WorkflowRegistry,
        store: &'a dyn RecordStore,
        config: &'a PrepConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
            strategies: default_strategies(),
        }
    }

    /// Replaces the ordered recovery strategies used for copy-forward.
    pub fn with_strategies(mut self, strategies: Vec<Box<dyn RecoveryStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Prepares one run.
    ///
    /// Every check that needs no filesystem access (workflow lookup,
    /// normalization, provenance, serializability) runs before the directory is
    /// touched, and a directory that already holds a metadata document is
    /// refused before anything is copied into it. The metadata document is
    /// encoded before registration and written last, so its presence means
    /// every other step succeeded.
    pub fn prepare(
        &self,
        ctx: &RunContext,
        request: &RunRequest,
        options: &PrepOptions,
    ) -> Result<PreparedRun> {
        let workflow = self.registry.get(&ctx.workflow_name)?;
        info!(workflow = workflow.name, run_id = %ctx.run_id, "preparing run");

        let normalizer = Normalizer::new(self.registry, Some(self.store));
        let mut cleaned = normalizer.normalize(request)?;
        let raw = request.parameters();

        let primary =
            select_primary_input(raw, &cleaned, &self.config.primary_input_candidates);
        let source = resolve_source(raw.get("source"), primary.as_ref())?;
        if let Some(value) = &source {
            if value.to_json().is_none() {
                return Err(ConfigurationError::Unserializable {
                    field: "source".to_string(),
                    type_name: value.type_name().to_string(),
                }
                .into());
            }
        }
        workflow.serialize_parameters(&cleaned)?;

        let mut directory = resolve_directory(raw.get("directory"), &self.config.runs_root)?;
        let metadata_target = directory.path.join(&self.config.metadata_filename);
        if metadata_target.exists() {
            return Err(ConfigurationError::MetadataAlreadyWritten {
                path: metadata_target,
            }
            .into());
        }
        if raw
            .get("copy_previous_directory")
            .map(RawValue::is_truthy)
            .unwrap_or(false)
        {
            directory = copy_forward(
                directory,
                primary.as_ref(),
                &self.config.primary_input_candidates,
                &self.config.reserved_prefix,
                &self.strategies,
            )?;
        }
        info!(
            directory = %directory.path.display(),
            state = directory.state.as_str(),
            "run directory resolved"
        );

        apply_resolved(&mut cleaned, workflow, &directory, source.as_ref());
        let undeclared: Vec<&str> = cleaned
            .keys()
            .map(String::as_str)
            .filter(|key| !workflow.accepts(key))
            .collect();
        if !undeclared.is_empty() {
            warn!(
                workflow = workflow.name,
                parameters = ?undeclared,
                "parameters not declared by workflow"
            );
        }

        let document = MetadataDocument::build(workflow, &ctx.run_id, &cleaned)?;
        let text = document.to_yaml()?;


        let registration = match (options.register_run, workflow.record_kind) {
            (true, Some(record_kind)) => {
                let draft = RecordDraft {
                    primary_input: primary.as_ref().and_then(|p| p.normalized.as_ref()),
                    source: source.as_ref(),
                    directory: Some(&directory.path),
                };
                let registration = self.store.create_or_load(record_kind, &ctx.run_id, draft)?;
                info!(
                    record_kind,
                    record_id = %registration.record().record_id,
                    created = registration.was_created(),
                    "run registered"
                );
                Some(registration)
            }
            (true, None) => {
                debug!(
                    workflow = workflow.name,
                    "workflow has no record type, skipping registration"
                );
                None
            }
            (false, _) => {
                debug!("registration disabled");
                None
            }
        };

        let metadata_path =
            write_metadata(&directory.path, &self.config.metadata_filename, &text)?;
        info!(path = %metadata_path.display(), "metadata written");

        let record_created = registration.as_ref().map(|r| r.was_created()).unwrap_or(false);
        Ok(PreparedRun {
            workflow_name: workflow.name.to_string(),
            run_id: ctx.run_id.clone(),
            parameters: cleaned,
            directory,
            primary_input: primary,
            source,
            record: registration.map(|r| r.into_record()),
            record_created,
            metadata_path,
        })
    }
}

/// Puts the resolved directory and source into the cleaned map when the
/// workflow declares them, and removes them otherwise.
fn apply_resolved(
    cleaned: &mut CleanedParameters,
    workflow: &WorkflowDescriptor,
    directory: &RunDirectory,
    source: Option<&RawValue>,
) {
    if workflow.accepts("directory") {
        cleaned.insert(
            "directory".to_string(),
            ParamValue::Directory(directory.path.clone()),
        );
    } else {
        cleaned.remove("directory");
    }
    match source {
        Some(value) if workflow.accepts("source") => {
            cleaned.insert("source".to_string(), ParamValue::from(value.clone()));
        }
        _ => {
            cleaned.remove("source");
        }
    }
}
