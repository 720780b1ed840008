//! In-memory implementation of the [`StateStore`] trait.
//!
//! Nothing survives the process; useful for tests and dry runs.

use crate::error::{Result, StoreError};
use crate::types::{FunctionRecord, Job, RebootMarker, Versioned};
use crate::StateStore;
use parking_lot::Mutex;

#[derive(Default)]
struct Slots {
    job: Option<Versioned<Job>>,
    function: Option<Versioned<FunctionRecord>>,
    reboot_marker: Option<RebootMarker>,
}

/// State store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    slots: Mutex<Slots>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn create<T: Clone>(slot: &mut Option<Versioned<T>>, record: &T) -> Result<Versioned<T>> {
    if slot.is_some() {
        return Err(StoreError::AlreadyExists);
    }
    let stored = Versioned {
        version: 1,
        record: record.clone(),
    };
    *slot = Some(stored.clone());
    Ok(stored)
}

fn update<T: Clone>(
    slot: &mut Option<Versioned<T>>,
    expected_version: u64,
    record: &T,
) -> Result<Versioned<T>> {
    let current = slot.as_ref().ok_or(StoreError::NotFound)?;
    if current.version != expected_version {
        return Err(StoreError::VersionConflict {
            expected: expected_version,
            found: current.version,
        });
    }
    let stored = Versioned {
        version: current.version + 1,
        record: record.clone(),
    };
    *slot = Some(stored.clone());
    Ok(stored)
}

impl StateStore for MemoryStore {
    fn load_job(&self) -> Result<Option<Versioned<Job>>> {
        Ok(self.slots.lock().job.clone())
    }

    fn create_job(&self, job: &Job) -> Result<Versioned<Job>> {
        create(&mut self.slots.lock().job, job)
    }

    fn update_job(&self, expected_version: u64, job: &Job) -> Result<Versioned<Job>> {
        update(&mut self.slots.lock().job, expected_version, job)
    }

    fn clear_job(&self) -> Result<bool> {
        Ok(self.slots.lock().job.take().is_some())
    }

    fn load_function(&self) -> Result<Option<Versioned<FunctionRecord>>> {
        Ok(self.slots.lock().function.clone())
    }

    fn create_function(&self, function: &FunctionRecord) -> Result<Versioned<FunctionRecord>> {
        create(&mut self.slots.lock().function, function)
    }

    fn update_function(
        &self,
        expected_version: u64,
        function: &FunctionRecord,
    ) -> Result<Versioned<FunctionRecord>> {
        update(&mut self.slots.lock().function, expected_version, function)
    }

    fn clear_function(&self) -> Result<bool> {
        let mut slots = self.slots.lock();
        slots.reboot_marker = None;
        Ok(slots.function.take().is_some())
    }

    fn set_reboot_marker(&self, marker: &RebootMarker) -> Result<()> {
        self.slots.lock().reboot_marker = Some(marker.clone());
        Ok(())
    }

    fn take_reboot_marker(&self) -> Result<Option<RebootMarker>> {
        Ok(self.slots.lock().reboot_marker.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FunctionStatus;
    use serde_json::Map;

    fn function(name: &str) -> FunctionRecord {
        FunctionRecord {
            function_name: name.into(),
            parameter_values: Map::new(),
            status: FunctionStatus::Running,
            start_time: 0,
            end_time: None,
            response: None,
            finished_event_sent: false,
        }
    }

    #[test]
    fn function_slot_holds_one_record() {
        let store = MemoryStore::new();
        store.create_function(&function("a")).unwrap();
        assert!(matches!(
            store.create_function(&function("b")),
            Err(StoreError::AlreadyExists)
        ));
        assert!(store.clear_function().unwrap());
        store.create_function(&function("b")).unwrap();
    }

    #[test]
    fn versions_advance_on_update() {
        let store = MemoryStore::new();
        store.create_function(&function("a")).unwrap();
        let v2 = store.update_function(1, &function("a")).unwrap();
        let v3 = store.update_function(v2.version, &function("a")).unwrap();
        assert_eq!(v3.version, 3);
        assert!(store.update_function(2, &function("a")).is_err());
    }
}
