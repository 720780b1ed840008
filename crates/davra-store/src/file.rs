//! File-backed implementation of the [`StateStore`] trait.

use crate::error::{Result, StoreError};
use crate::layout::StateLayout;
use crate::types::{FunctionRecord, Job, RebootMarker, Versioned};
use crate::StateStore;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Records written by agents that predate versioning are bare documents.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredRecord<T> {
    Versioned(Versioned<T>),
    Bare(T),
}

/// JSON-file state store rooted at the installation directory.
///
/// Writes go to a temporary file that is renamed over the target, so a crash
/// never leaves a half-written record. A process-wide lock makes each
/// check-and-write atomic.
pub struct FileStore {
    layout: StateLayout,
    lock: Mutex<()>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let layout = StateLayout::new(root);
        fs::create_dir_all(layout.root())?;
        Ok(Self {
            layout,
            lock: Mutex::new(()),
        })
    }

    /// The layout this store writes to.
    #[must_use]
    pub const fn layout(&self) -> &StateLayout {
        &self.layout
    }

    fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<Versioned<T>>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<StoredRecord<T>>(&bytes) {
            Ok(StoredRecord::Versioned(record)) => Ok(Some(record)),
            Ok(StoredRecord::Bare(record)) => Ok(Some(Versioned { version: 1, record })),
            Err(e) => {
                let quarantine = path.with_extension("json.corrupt");
                warn!(path = %path.display(), error = %e, "Unreadable record moved aside");
                fs::rename(path, &quarantine)?;
                Ok(None)
            }
        }
    }

    fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn remove_dir(dir: &Path) -> Result<bool> {
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn create<T>(&self, dir: &Path, file: &Path, record: &T) -> Result<Versioned<T>>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let _guard = self.lock.lock();
        if Self::read_record::<T>(file)?.is_some() {
            return Err(StoreError::AlreadyExists);
        }
        Self::remove_dir(dir)?;
        fs::create_dir_all(dir)?;
        let stored = Versioned {
            version: 1,
            record: record.clone(),
        };
        Self::write_atomic(file, &stored)?;
        debug!(path = %file.display(), "Record created");
        Ok(stored)
    }

    fn update<T>(&self, file: &Path, expected_version: u64, record: &T) -> Result<Versioned<T>>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let _guard = self.lock.lock();
        let current = Self::read_record::<T>(file)?.ok_or(StoreError::NotFound)?;
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
        Self::write_atomic(file, &stored)?;
        Ok(stored)
    }

    fn clear(&self, dir: &Path, file: &Path) -> Result<bool> {
        let _guard = self.lock.lock();
        let existed = file.exists();
        Self::remove_dir(dir)?;
        Ok(existed)
    }
}

impl StateStore for FileStore {
    // =========================================================================
    // Job Operations
    // =========================================================================

    fn load_job(&self) -> Result<Option<Versioned<Job>>> {
        Self::read_record(&self.layout.job_file())
    }

    fn create_job(&self, job: &Job) -> Result<Versioned<Job>> {
        self.create(&self.layout.job_dir(), &self.layout.job_file(), job)
    }

    fn update_job(&self, expected_version: u64, job: &Job) -> Result<Versioned<Job>> {
        self.update(&self.layout.job_file(), expected_version, job)
    }

    fn clear_job(&self) -> Result<bool> {
        self.clear(&self.layout.job_dir(), &self.layout.job_file())
    }

    // =========================================================================
    // Function Operations
    // =========================================================================

    fn load_function(&self) -> Result<Option<Versioned<FunctionRecord>>> {
        Self::read_record(&self.layout.function_file())
    }

    fn create_function(&self, function: &FunctionRecord) -> Result<Versioned<FunctionRecord>> {
        self.create(
            &self.layout.function_dir(),
            &self.layout.function_file(),
            function,
        )
    }

    fn update_function(
        &self,
        expected_version: u64,
        function: &FunctionRecord,
    ) -> Result<Versioned<FunctionRecord>> {
        self.update(&self.layout.function_file(), expected_version, function)
    }

    fn clear_function(&self) -> Result<bool> {
        self.clear(&self.layout.function_dir(), &self.layout.function_file())
    }

    // =========================================================================
    // Reboot Marker
    // =========================================================================

    fn set_reboot_marker(&self, marker: &RebootMarker) -> Result<()> {
        let _guard = self.lock.lock();
        fs::create_dir_all(self.layout.function_dir())?;
        Self::write_atomic(&self.layout.reboot_marker_file(), marker)
    }

    fn take_reboot_marker(&self) -> Result<Option<RebootMarker>> {
        let _guard = self.lock.lock();
        let path = self.layout.reboot_marker_file();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&path)?;
        match serde_json::from_slice(&bytes) {
            Ok(marker) => Ok(Some(marker)),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable reboot marker");
                Ok(None)
            }
        }
    }
}
