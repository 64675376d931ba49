//! Persistent run records keyed by an external run identifier.
//!
//! Registration is a create-or-load: the first caller for a key creates the
//! record, every later caller (including a concurrent one in another process)
//! loads that same record.

mod file;
mod memory;

pub use file::FileRecordStore;
pub use memory::MemoryRecordStore;

use chrono::Utc;
use prep_core::{sha256_bytes, CanonicalInput, RawValue, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub record_id: String,
    pub record_kind: String,
    pub external_id: String,
    #[serde(default)]
    pub primary_input: Option<Value>,
    #[serde(default)]
    pub source: Option<Value>,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    pub created_at: String,
}

/// Values attached to a record when it is first created.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordDraft<'a> {
    pub primary_input: Option<&'a CanonicalInput>,
    pub source: Option<&'a RawValue>,
    pub directory: Option<&'a Path>,
}

impl RunRecord {
    pub fn from_draft(
        record_kind: &str,
        external_id: &str,
        draft: RecordDraft<'_>,
    ) -> Result<Self, StoreError> {
        let source = match draft.source {
            Some(raw) => Some(raw.to_json().ok_or_else(|| StoreError::Unserializable {
                field: "source".to_string(),
            })?),
            None => None,
        };
        Ok(Self {
            record_id: record_id_for(record_kind, external_id),
            record_kind: record_kind.to_string(),
            external_id: external_id.to_string(),
            primary_input: draft.primary_input.map(CanonicalInput::descriptor),
            source,
            directory: draft.directory.map(Path::to_path_buf),
            created_at: Utc::now().to_rfc3339(),
        })
    }
}

pub fn record_id_for(record_kind: &str, external_id: &str) -> String {
    let digest = sha256_bytes(format!("{}\0{}", record_kind, external_id).as_bytes());
    digest[..16].to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Created(RunRecord),
    Loaded(RunRecord),
}

impl Registration {
    pub fn was_created(&self) -> bool {
        matches!(self, Registration::Created(_))
    }

    pub fn record(&self) -> &RunRecord {
        match self {
            Registration::Created(r) | Registration::Loaded(r) => r,
        }
    }

    pub fn into_record(self) -> RunRecord {
        match self {
            Registration::Created(r) | Registration::Loaded(r) => r,
        }
    }
}

pub trait RecordStore: Send + Sync {
    /// Creates the record for `(record_kind, external_id)` from `draft`, or
    /// loads the existing one untouched.
    fn create_or_load(
        &self,
        record_kind: &str,
        external_id: &str,
        draft: RecordDraft<'_>,
    ) -> Result<Registration, StoreError>;

    fn get(&self, record_kind: &str, external_id: &str) -> Result<Option<RunRecord>, StoreError>;
}
