//! Run directory lifecycle: create the working directory and, on request,
//! repopulate it from a previous calculation.
//!
//! Recovery is an ordered list of strategies. Each one either recovers the
//! previous directory into the target or reports that it does not apply; the
//! first that recovers wins. The copies are blocking, are not cancellable and
//! are not rolled back: a failure part way through leaves the target marked
//! [`DirectoryState::Unavailable`] in the returned error.

use chrono::Utc;
use prep_core::{
    ensure_dir, ConfigurationError, DirectoryResolutionError, DirectoryState, PrepError,
    ProvenanceError, RawValue, Result, RunDirectory,
};
use prep_provenance::PrimaryInput;
use std::ffi::OsString;
use std::fs;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Resolves the raw `directory` parameter into an existing directory.
///
/// Without a value a fresh, uniquely named directory is created under
/// `runs_root`. A given directory is created if missing and reused otherwise.
pub fn resolve_directory(raw: Option<&RawValue>, runs_root: &Path) -> Result<RunDirectory> {
    let requested = match raw.filter(|v| v.is_truthy()) {
        None => None,
        Some(value) => match value.as_str() {
            Some(s) => Some(PathBuf::from(s)),
            None => {
                return Err(ConfigurationError::UnresolvableInput {
                    field: "directory".to_string(),
                    reason: format!("expected a path, got {}", value),
                }
                .into())
            }
        },
    };
    let path = match requested {
        Some(path) => {
            ensure_dir(&path).map_err(|source| DirectoryResolutionError::Create {
                path: path.clone(),
                source,
            })?;
            path
        }
        None => create_unique_dir(runs_root)?,
    };
    debug!(directory = %path.display(), "run directory ready");
    Ok(RunDirectory::fresh(path))
}

fn create_unique_dir(runs_root: &Path) -> Result<PathBuf> {
    ensure_dir(runs_root).map_err(|source| DirectoryResolutionError::Create {
        path: runs_root.to_path_buf(),
        source,
    })?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let mut n = 0u32;
    loop {
        let candidate = runs_root.join(format!("prep-run-{}-{}", stamp, n));
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(source) => {
                return Err(DirectoryResolutionError::Create {
                    path: candidate,
                    source,
                }
                .into())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Recovered(DirectoryState),
    NotApplicable,
}

pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Copies `previous` into `target`, skipping names that start with
    /// `reserved_prefix`.
    fn attempt(&self, previous: &Path, target: &RunDirectory, reserved_prefix: &str)
        -> Result<Attempt>;
}

/// The previous directory still exists on this file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveCopy;

impl RecoveryStrategy for LiveCopy {
    fn name(&self) -> &'static str {
        "live_copy"
    }

    fn attempt(
        &self,
        previous: &Path,
        target: &RunDirectory,
        reserved_prefix: &str,
    ) -> Result<Attempt> {
        if !previous.is_dir() {
            return Ok(Attempt::NotApplicable);
        }
        copy_into(previous, target, reserved_prefix)?;
        Ok(Attempt::Recovered(DirectoryState::PopulatedFromLiveCopy))
    }
}

/// The previous directory was archived to `<previous>.zip`.
///
/// The archive is unpacked beside the previous directory, copied from, and the
/// unpacked tree removed again. The archive itself is never modified.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveCopy;

pub fn archive_path(previous: &Path) -> PathBuf {
    let mut name: OsString = previous.as_os_str().to_owned();
    name.push(".zip");
    PathBuf::from(name)
}

/// Top-level entries an extraction created; removed again on drop.
struct UnpackedGuard {
    paths: Vec<PathBuf>,
}

impl Drop for UnpackedGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            let removed = if path.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            match removed {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to remove unpacked archive entry"
                    );
                }
            }
        }
    }
}

fn new_top_level_entries<R: io::Read + io::Seek>(
    zip: &zip::ZipArchive<R>,
    extract_dir: &Path,
) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    for name in zip.file_names() {
        let entry = match Path::new(name).components().next() {
            Some(Component::Normal(first)) => extract_dir.join(first),
            _ => continue,
        };
        if !out.contains(&entry) && entry.symlink_metadata().is_err() {
            out.push(entry);
        }
    }
    out
}

impl RecoveryStrategy for ArchiveCopy {
    fn name(&self) -> &'static str {
        "archive_copy"
    }

    fn attempt(
        &self,
        previous: &Path,
        target: &RunDirectory,
        reserved_prefix: &str,
    ) -> Result<Attempt> {
        let archive = archive_path(previous);
        if !archive.is_file() {
            return Ok(Attempt::NotApplicable);
        }
        let extract_dir = previous
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let archive_error = |reason: String| DirectoryResolutionError::Archive {
            archive: archive.clone(),
            reason,
        };

        let file = fs::File::open(&archive).map_err(|e| archive_error(e.to_string()))?;
        let mut zip = zip::ZipArchive::new(file).map_err(|e| archive_error(e.to_string()))?;
        let _guard = UnpackedGuard {
            paths: new_top_level_entries(&zip, extract_dir),
        };
        zip.extract(extract_dir)
            .map_err(|e| archive_error(e.to_string()))?;
        debug!(archive = %archive.display(), into = %extract_dir.display(), "archive unpacked");

        if !previous.is_dir() {
            return Err(DirectoryResolutionError::ArchiveLayout {
                archive: archive.clone(),
                expected: previous.to_path_buf(),
            }
            .into());
        }
        copy_into(previous, target, reserved_prefix)?;
        Ok(Attempt::Recovered(DirectoryState::PopulatedFromArchive))
    }
}

pub fn default_strategies() -> Vec<Box<dyn RecoveryStrategy>> {
    vec![Box::new(LiveCopy), Box::new(ArchiveCopy)]
}

fn copy_into(previous: &Path, target: &RunDirectory, reserved_prefix: &str) -> Result<()> {
    copy_dir_filtered(previous, &target.path, reserved_prefix).map_err(|source| {
        warn!(
            directory = %target.path.display(),
            error = %source,
            "copy-forward interrupted, run directory is unusable"
        );
        PrepError::from(DirectoryResolutionError::Unusable {
            directory: target.clone().unavailable(),
            source,
        })
    })
}

/// Copies a previous run's directory into `directory` when requested.
///
/// The primary input must come from a past calculation; its back-reference
/// names the previous directory.
pub fn copy_forward(
    directory: RunDirectory,
    primary: Option<&PrimaryInput>,
    candidates: &[String],
    reserved_prefix: &str,
    strategies: &[Box<dyn RecoveryStrategy>],
) -> Result<RunDirectory> {
    let primary = primary.ok_or_else(|| ProvenanceError::NoPrimaryInput {
        candidates: candidates.join(", "),
    })?;
    let previous = primary
        .normalized
        .as_ref()
        .and_then(|input| input.previous_directory())
        .ok_or_else(|| ProvenanceError::NotFromPastCalculation {
            field: primary.field.clone(),
        })?;
    ensure_outside_previous(previous, &directory.path)?;

    for strategy in strategies {
        match strategy.attempt(previous, &directory, reserved_prefix)? {
            Attempt::Recovered(state) => {
                info!(
                    strategy = strategy.name(),
                    previous = %previous.display(),
                    directory = %directory.path.display(),
                    "previous directory copied forward"
                );
                return Ok(RunDirectory {
                    path: directory.path,
                    state,
                });
            }
            Attempt::NotApplicable => {
                debug!(
                    strategy = strategy.name(),
                    previous = %previous.display(),
                    "not applicable"
                );
            }
        }
    }
    Err(DirectoryResolutionError::PreviousMissing {
        previous: previous.to_path_buf(),
    }
    .into())
}

/// Fails when `target` is `previous` itself or lies below it; copying a tree
/// onto itself truncates every file in it.
fn ensure_outside_previous(previous: &Path, target: &Path) -> Result<()> {
    // A previous directory that does not exist cannot hold the existing target.
    let previous_real = match fs::canonicalize(previous) {
        Ok(real) => real,
        Err(_) => return Ok(()),
    };
    let target_real = fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
    if target_real.starts_with(&previous_real) {
        return Err(DirectoryResolutionError::OverlapsPrevious {
            previous: previous.to_path_buf(),
            target: target.to_path_buf(),
        }
        .into());
    }
    Ok(())
}

/// Recursively copies `src` into `dst`, merging with existing content.
///
/// Any entry whose file name starts with `reserved_prefix` is skipped at every
/// depth, along with everything below it. Symlinked directories are copied
/// as directories unless the link leads back to a directory being copied.
pub fn copy_dir_filtered(src: &Path, dst: &Path, reserved_prefix: &str) -> io::Result<()> {
    let mut ancestors = vec![fs::canonicalize(src)?];
    copy_tree(src, dst, reserved_prefix, &mut ancestors)
}

fn copy_tree(
    src: &Path,
    dst: &Path,
    reserved_prefix: &str,
    ancestors: &mut Vec<PathBuf>,
) -> io::Result<()> {
    let reserved = |name: &std::ffi::OsStr| {
        !reserved_prefix.is_empty() && name.to_string_lossy().starts_with(reserved_prefix)
    };
    let walker = walkdir::WalkDir::new(src)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !reserved(e.file_name()));
    ensure_dir(dst)?;
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        let rel = match path.strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_symlink() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            match fs::canonicalize(path) {
                Ok(real) if real.is_dir() => {
                    let link_dir = path
                        .parent()
                        .and_then(|p| fs::canonicalize(p).ok())
                        .unwrap_or_default();
                    if link_dir.starts_with(&real) || ancestors.iter().any(|a| a.starts_with(&real))
                    {
                        warn!(link = %path.display(), "symlink cycle, not followed");
                        continue;
                    }
                    ancestors.push(real.clone());
                    copy_tree(&real, &target, reserved_prefix, ancestors)?;
                    ancestors.pop();
                }
                Ok(real) if real.is_file() => {
                    fs::copy(real, &target)?;
                }
                Ok(_) => {}
                Err(_) => {
                    // Keep dangling links as links.
                    let link_target = fs::read_link(path)?;
                    if target.exists() || target.symlink_metadata().is_ok() {
                        let _ = fs::remove_file(&target);
                    }
                    #[cfg(unix)]
                    {
                        symlink(&link_target, &target)?;
                    }
                    #[cfg(not(unix))]
                    {
                        let _ = link_target;
                    }
                }
            }
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(path, target)?;
        }
    }
    Ok(())
}
