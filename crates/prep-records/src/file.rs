use prep_core::{create_new_bytes, ensure_dir, sha256_bytes, StoreError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{RecordDraft, RecordStore, Registration, RunRecord};

/// One JSON document per record under `<root>/<record_kind>/`.
///
/// Creation links a fully written temp file into place, so the first writer
/// for a key wins even across processes and nobody reads a partial record.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    root: PathBuf,
}

impl FileRecordStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        ensure_dir(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, record_kind: &str, external_id: &str) -> PathBuf {
        let hash = sha256_bytes(external_id.as_bytes());
        self.root.join(sanitize(record_kind)).join(format!(
            "{}-{}.json",
            sanitize(external_id),
            &hash[..8]
        ))
    }

    fn load(path: &Path) -> Result<Option<RunRecord>, StoreError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

impl RecordStore for FileRecordStore {
    fn create_or_load(
        &self,
        record_kind: &str,
        external_id: &str,
        draft: RecordDraft<'_>,
    ) -> Result<Registration, StoreError> {
        let path = self.record_path(record_kind, external_id);
        if let Some(existing) = Self::load(&path)? {
            debug!(path = %path.display(), "run record loaded");
            return Ok(Registration::Loaded(existing));
        }
        let record = RunRecord::from_draft(record_kind, external_id, draft)?;
        let mut bytes = serde_json::to_vec_pretty(&record).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        bytes.push(b'\n');
        let created = create_new_bytes(&path, &bytes).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        if created {
            debug!(path = %path.display(), record_id = %record.record_id, "run record created");
            return Ok(Registration::Created(record));
        }
        debug!(path = %path.display(), "lost creation race, loading winner");
        match Self::load(&path)? {
            Some(existing) => Ok(Registration::Loaded(existing)),
            None => Err(StoreError::Corrupt {
                path,
                reason: "record vanished after creation race".to_string(),
            }),
        }
    }

    fn get(&self, record_kind: &str, external_id: &str) -> Result<Option<RunRecord>, StoreError> {
        Self::load(&self.record_path(record_kind, external_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prep_core::{CanonicalInput, InputKind};
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "prep_records_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    fn walk_count(dir: &Path) -> usize {
        fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| {
                        let p = e.path();
                        if p.is_dir() {
                            walk_count(&p)
                        } else {
                            1
                        }
                    })
                    .sum()
            })
            .unwrap_or(0)
    }

    #[test]
    fn registering_twice_loads_first_record() {
        let root = temp_root("twice");
        let store = FileRecordStore::open(&root).expect("open");
        let input = CanonicalInput::new(InputKind::Structure, json!({"species": ["Fe"]}));
        let first = store
            .create_or_load(
                "StaticEnergy",
                "flow/run:1",
                RecordDraft {
                    primary_input: Some(&input),
                    ..RecordDraft::default()
                },
            )
            .expect("first");
        let second = store
            .create_or_load("StaticEnergy", "flow/run:1", RecordDraft::default())
            .expect("second");
        assert!(first.was_created());
        assert!(!second.was_created());
        assert_eq!(first.record(), second.record());
        assert_eq!(walk_count(&root), 1);
        assert_eq!(
            store.get("StaticEnergy", "flow/run:1").expect("get"),
            Some(first.into_record())
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn concurrent_registrations_create_one_record() {
        let root = temp_root("race");
        let store = Arc::new(FileRecordStore::open(&root).expect("open"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store
                        .create_or_load("Relaxation", "shared-run", RecordDraft::default())
                        .expect("register")
                })
            })
            .collect();
        let results: Vec<Registration> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();
        assert_eq!(results.iter().filter(|r| r.was_created()).count(), 1);
        assert_eq!(walk_count(&root), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_record_is_none_and_corrupt_record_errors() {
        let root = temp_root("corrupt");
        let store = FileRecordStore::open(&root).expect("open");
        assert_eq!(store.get("Relaxation", "absent").expect("get"), None);

        let path = store.record_path("Relaxation", "broken");
        ensure_dir(path.parent().expect("parent")).expect("kind dir");
        fs::write(&path, b"{not json").expect("write");
        let err = store.get("Relaxation", "broken").expect_err("corrupt");
        assert!(matches!(err, StoreError::Corrupt { .. }), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn sanitized_names_stay_distinct() {
        let root = temp_root("sanitize");
        let store = FileRecordStore::open(&root).expect("open");
        assert_ne!(store.record_path("K", "a/b"), store.record_path("K", "a_b"));
        assert!(!sanitize("../../etc").starts_with('.'));
        let _ = fs::remove_dir_all(root);
    }
}
