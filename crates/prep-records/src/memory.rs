use prep_core::StoreError;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::{RecordDraft, RecordStore, Registration, RunRecord};

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<(String, String), RunRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryRecordStore {
    fn create_or_load(
        &self,
        record_kind: &str,
        external_id: &str,
        draft: RecordDraft<'_>,
    ) -> Result<Registration, StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        let key = (record_kind.to_string(), external_id.to_string());
        if let Some(existing) = records.get(&key) {
            return Ok(Registration::Loaded(existing.clone()));
        }
        let record = RunRecord::from_draft(record_kind, external_id, draft)?;
        records.insert(key, record.clone());
        Ok(Registration::Created(record))
    }

    fn get(&self, record_kind: &str, external_id: &str) -> Result<Option<RunRecord>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records
            .get(&(record_kind.to_string(), external_id.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prep_core::RawValue;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn second_registration_loads_first() {
        let store = MemoryRecordStore::new();
        let first = store
            .create_or_load("Relaxation", "run-1", RecordDraft::default())
            .expect("first");
        let source = RawValue::from("other");
        let second = store
            .create_or_load(
                "Relaxation",
                "run-1",
                RecordDraft {
                    source: Some(&source),
                    ..RecordDraft::default()
                },
            )
            .expect("second");
        assert!(first.was_created());
        assert!(!second.was_created());
        assert_eq!(first.record(), second.record());
        assert_eq!(second.record().source, None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn concurrent_registrations_converge() {
        let store = Arc::new(MemoryRecordStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store
                        .create_or_load("Relaxation", "shared", RecordDraft::default())
                        .expect("register")
                })
            })
            .collect();
        let results: Vec<Registration> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();
        assert_eq!(results.iter().filter(|r| r.was_created()).count(), 1);
        assert_eq!(store.len(), 1);
        let ids: Vec<&str> = results.iter().map(|r| r.record().record_id.as_str()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }
}
