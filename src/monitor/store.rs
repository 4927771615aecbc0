use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::flags::Flags;
use super::record::MonitorRecord;
use super::MonitorId;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("Duplicate monitor name: {0}")]
    DuplicateName(String),
    #[error("Monitor store is full ({0} records)")]
    Full(usize),
}

/// Dense, insertion-ordered storage for every monitor record.
///
/// Ids are indices into a single `Vec`, so iteration walks contiguous memory
/// and a state transition never moves a record. The store is owned by the
/// controller; nothing else holds a reference to a record.
#[derive(Debug, Default)]
pub struct MonitorStore {
    records: Vec<MonitorRecord>,
    by_name: HashMap<Arc<str>, MonitorId>,
}

impl MonitorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            by_name: HashMap::with_capacity(capacity),
        }
    }

    pub fn reserve(&mut self, additional: usize) {
        self.records.reserve(additional);
        self.by_name.reserve(additional);
    }

    /// Adds a record and assigns its id. Names must be unique.
    pub fn insert(&mut self, mut record: MonitorRecord) -> Result<MonitorId, StoreError> {
        if self.by_name.contains_key(&record.name) {
            return Err(StoreError::DuplicateName(record.name.to_string()));
        }
        let index = u32::try_from(self.records.len()).map_err(|_| StoreError::Full(self.records.len()))?;
        let id = MonitorId(index);
        record.id = id;
        self.by_name.insert(Arc::clone(&record.name), id);
        self.records.push(record);
        Ok(id)
    }

    pub fn get(&self, id: MonitorId) -> Option<&MonitorRecord> {
        self.records.get(id.index())
    }

    pub fn get_mut(&mut self, id: MonitorId) -> Option<&mut MonitorRecord> {
        self.records.get_mut(id.index())
    }

    pub fn find(&self, name: &str) -> Option<MonitorId> {
        self.by_name.get(name).copied()
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sets or clears `Disabled`. Disabling wipes every phase flag at once.
    /// Returns the previous value, or `None` for an unknown id.
    pub fn set_disabled(&mut self, id: MonitorId, disabled: bool) -> Option<bool> {
        let record = self.records.get_mut(id.index())?;
        let was = record.is_disabled();
        if disabled {
            record.flags.insert(Flags::DISABLED);
            record.clear_phases();
        } else {
            record.flags.remove(Flags::DISABLED);
        }
        Some(was)
    }

    /// Visits every record in insertion order.
    pub fn for_each(&mut self, mut visitor: impl FnMut(&mut MonitorRecord)) {
        for record in &mut self.records {
            visitor(record);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MonitorRecord> {
        self.records.iter()
    }

    /// Applies `mutator` once to each id that exists. Returns how many were touched.
    pub fn batch_apply(&mut self, ids: &[MonitorId], mut mutator: impl FnMut(&mut MonitorRecord)) -> usize {
        let mut applied = 0;
        for id in ids {
            if let Some(record) = self.records.get_mut(id.index()) {
                mutator(record);
                applied += 1;
            }
        }
        applied
    }
}
