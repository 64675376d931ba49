use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::value::RunDirectory;

pub type Result<T> = std::result::Result<T, PrepError>;

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Workflow,
    Normalize,
    Directory,
    Provenance,
    Register,
    Metadata,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Workflow => "workflow",
            Stage::Normalize => "normalize",
            Stage::Directory => "directory",
            Stage::Provenance => "provenance",
            Stage::Register => "register",
            Stage::Metadata => "metadata",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PrepError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("provenance error: {0}")]
    Provenance(#[from] ProvenanceError),

    #[error("directory resolution error: {0}")]
    DirectoryResolution(#[from] DirectoryResolutionError),

    #[error(
        "provenance conflict: explicit source {explicit} does not match the source \
         inferred from the primary input {inferred}"
    )]
    ProvenanceConflict { explicit: String, inferred: String },

    #[error("record store error: {0}")]
    Store(#[from] StoreError),
}

impl PrepError {
    pub fn stage(&self) -> Stage {
        match self {
            PrepError::Configuration(e) => e.stage(),
            PrepError::Provenance(_) | PrepError::DirectoryResolution(_) => Stage::Directory,
            PrepError::ProvenanceConflict { .. } => Stage::Provenance,
            PrepError::Store(_) => Stage::Register,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            PrepError::Configuration(_) => "configuration_error",
            PrepError::Provenance(_) => "provenance_error",
            PrepError::DirectoryResolution(_) => "directory_resolution_error",
            PrepError::ProvenanceConflict { .. } => "provenance_conflict_error",
            PrepError::Store(_) => "record_store_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("unknown workflow '{name}'")]
    UnknownWorkflow { name: String },

    #[error("workflow name '{name}' must look like '<type>/<preset>'")]
    MalformedWorkflowName { name: String },

    #[error("workflow type '{flow_type}' is not allowed; use one of: {allowed}")]
    UnknownWorkflowType { flow_type: String, allowed: String },

    #[error("derived workflow base '{base}' cannot be resolved: {reason}")]
    UnresolvableBase { base: String, reason: String },

    #[error("parameter '{field}' cannot be resolved: {reason}")]
    UnresolvableInput { field: String, reason: String },

    #[error("parameter '{field}' references unknown past calculation {table}/{id}")]
    UnknownPastCalculation {
        field: String,
        table: String,
        id: String,
    },

    #[error("parameter '{field}' of type {type_name} has no serializable form")]
    Unserializable { field: String, type_name: String },

    #[error("metadata document cannot be encoded: {reason}")]
    MetadataEncode { reason: String },

    #[error("metadata document already written: {}", path.display())]
    MetadataAlreadyWritten { path: PathBuf },

    #[error("failed to write metadata document {}: {source}", path.display())]
    MetadataWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration file {}: {reason}", path.display())]
    InvalidConfig { path: PathBuf, reason: String },
}

impl ConfigurationError {
    pub fn stage(&self) -> Stage {
        match self {
            ConfigurationError::UnknownWorkflow { .. }
            | ConfigurationError::MalformedWorkflowName { .. }
            | ConfigurationError::UnknownWorkflowType { .. }
            | ConfigurationError::InvalidConfig { .. } => Stage::Workflow,
            ConfigurationError::UnresolvableBase { .. }
            | ConfigurationError::UnresolvableInput { .. }
            | ConfigurationError::UnknownPastCalculation { .. } => Stage::Normalize,
            ConfigurationError::Unserializable { .. }
            | ConfigurationError::MetadataEncode { .. }
            | ConfigurationError::MetadataAlreadyWritten { .. }
            | ConfigurationError::MetadataWrite { .. } => Stage::Metadata,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvenanceError {
    #[error(
        "no primary input detected, which is required for copying a previous \
         directory (candidates: {candidates})"
    )]
    NoPrimaryInput { candidates: String },

    #[error(
        "primary input '{field}' is not from a past calculation, so there is no \
         previous directory to copy"
    )]
    NotFromPastCalculation { field: String },
}

#[derive(Debug, Error)]
pub enum DirectoryResolutionError {
    #[error("failed to create run directory {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "unable to locate the previous calculation to copy; neither {} nor its .zip \
         archive exists on this file system",
        previous.display()
    )]
    PreviousMissing { previous: PathBuf },

    #[error(
        "run directory {} is the previous calculation's directory {} or lies inside it",
        target.display(),
        previous.display()
    )]
    OverlapsPrevious { previous: PathBuf, target: PathBuf },

    #[error("failed to unpack archive {}: {reason}", archive.display())]
    Archive { archive: PathBuf, reason: String },

    #[error("archive {} did not unpack to {}", archive.display(), expected.display())]
    ArchiveLayout { archive: PathBuf, expected: PathBuf },

    #[error(
        "copy into {} was interrupted and the directory is unusable: {source}",
        directory.path.display()
    )]
    Unusable {
        directory: RunDirectory,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store I/O failure at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("record at {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("record field '{field}' has no serializable form")]
    Unserializable { field: String },

    #[error("record store lock poisoned")]
    Poisoned,
}
