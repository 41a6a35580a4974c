//! Sweep generation and resumable scatter-gather execution state.
//!
//! A sweep definition expands into an immutable registry of cases. Workers
//! report each case's outcome into its own status record (scatter); a single
//! consolidation pass folds those records into one table (gather); the
//! planner reads that table to decide what still has to run.

pub mod consolidate;
pub mod error;
pub mod expand;
pub mod fsutil;
pub mod plan;
pub mod registry;
pub mod status;
pub mod value;

pub use consolidate::{consolidate, ConsolidatedStatusRegistry, SweepProgress};
pub use error::{Result, SweepError};
pub use expand::{expand, swept_parameters, BaseDefaults, CaseAssignment, Overrides};
pub use plan::plan;
pub use registry::{
    build, CaseId, CaseRecord, CaseRenderer, NoopRenderer, RegistryBuilder, SweepLayout,
    SweepManifest, SweepRegistry,
};
pub use status::{CaseOutcome, CaseState, CaseStatus, StatusRead, StatusStore};
pub use value::{ParamValue, RangeScale, RangeSpec, ValueSpec};
