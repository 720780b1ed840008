//! Crash-durable state for the Davra agent.
//!
//! The agent keeps at most one job and at most one function invocation on the
//! device. Both live in a [`StateStore`] as versioned records, so that "is a job
//! running" is always answered from persisted state and every mutation is a
//! compare-and-swap against the version the caller read.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────────────────┐      ┌──────────────────────────┐
//!   │ StateStore (trait)       │      │ ConfigStore              │
//!   │  job slot      v1,v2,... │      │  config.json key/value   │
//!   │  function slot v1,v2,... │      │  watch::channel notify   │
//!   │  reboot marker           │      └──────────────────────────┘
//!   └────────────┬─────────────┘
//!        ┌───────┴────────┐
//!   FileStore        MemoryStore
//!   (JSON files)     (tests)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use davra_store::{FileStore, StateStore};
//!
//! let store = FileStore::open("/usr/bin/davra").unwrap();
//! if let Some(current) = store.load_job().unwrap() {
//!     println!("job {} at version {}", current.record.job_id, current.version);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod file;
pub mod layout;
pub mod memory;
pub mod types;

pub use config::ConfigStore;
pub use error::{Result, StoreError};
pub use file::FileStore;
pub use layout::StateLayout;
pub use memory::MemoryStore;
pub use types::{
    AssignmentStatus, CapabilityDetails, DeviceAssignment, FunctionRecord, FunctionStatus, Job,
    JobAction, JobConfig, RebootMarker, Versioned, FUNCTION_UUID_KEY,
};

/// Persistence for the current job, the current function and the reboot marker.
///
/// Each slot holds at most one record. Creation fails when the slot is occupied,
/// updates succeed only against the version the caller last read.
pub trait StateStore: Send + Sync {
    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Load the current job, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or decoded.
    fn load_job(&self) -> Result<Option<Versioned<Job>>>;

    /// Persist a new job at version 1.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if a job is already persisted.
    fn create_job(&self, job: &Job) -> Result<Versioned<Job>>;

    /// Replace the current job if its version still equals `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no job is persisted, or
    /// `StoreError::VersionConflict` if the version moved on.
    fn update_job(&self, expected_version: u64, job: &Job) -> Result<Versioned<Job>>;

    /// Remove the current job. Returns `false` if there was none.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be removed.
    fn clear_job(&self) -> Result<bool>;

    // =========================================================================
    // Function Operations
    // =========================================================================

    /// Load the current function, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or decoded.
    fn load_function(&self) -> Result<Option<Versioned<FunctionRecord>>>;

    /// Persist a new function at version 1.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if a function is already persisted.
    fn create_function(&self, function: &FunctionRecord) -> Result<Versioned<FunctionRecord>>;

    /// Replace the current function if its version still equals `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no function is persisted, or
    /// `StoreError::VersionConflict` if the version moved on.
    fn update_function(
        &self,
        expected_version: u64,
        function: &FunctionRecord,
    ) -> Result<Versioned<FunctionRecord>>;

    /// Remove the current function and anything stored beside it, including the
    /// reboot marker. Returns `false` if there was no function.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be removed.
    fn clear_function(&self) -> Result<bool>;

    // =========================================================================
    // Reboot Marker
    // =========================================================================

    /// Record that a purposeful reboot is about to happen.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be written.
    fn set_reboot_marker(&self, marker: &RebootMarker) -> Result<()>;

    /// Read and remove the reboot marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be read or removed.
    fn take_reboot_marker(&self) -> Result<Option<RebootMarker>>;
}
