mod error;
mod value;

pub use error::{
    ConfigurationError, DirectoryResolutionError, PrepError, ProvenanceError, Result, Stage,
    StoreError,
};
pub use value::{
    is_truthy, CanonicalInput, CleanedParameters, DirectoryState, InputKind, ParamValue,
    PastCalculation, RawParameterSet, RawValue, RunDirectory,
};

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest of a JSON value with object keys in sorted order.
///
/// `serde_json::Map` is a `BTreeMap` unless `preserve_order` is enabled, so
/// serializing the value directly is already canonical.
pub fn canonical_json_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("sha256:{}", sha256_bytes(&bytes))
}

fn temp_sibling(path: &Path) -> std::path::PathBuf {
    let ts = chrono::Utc::now().timestamp_micros();
    let pid = std::process::id();
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    path.with_file_name(format!(".{}.tmp.{}.{}.{}", name, pid, ts, seq))
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Writes `bytes` to `path` only if nothing exists there yet.
///
/// The content is staged in a temp file and linked into place, so a reader
/// never observes a partially written file and exactly one concurrent writer
/// wins. Returns `Ok(false)` when the path was already taken.
pub fn create_new_bytes(path: &Path, bytes: &[u8]) -> io::Result<bool> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = temp_sibling(path);
    write_synced(&tmp, bytes)?;
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}
