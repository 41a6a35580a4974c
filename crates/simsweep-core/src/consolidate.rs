use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SweepError};
use crate::fsutil::atomic_write_bytes;
use crate::registry::{CaseId, SweepLayout, SweepRegistry};
use crate::status::{CaseState, CaseStatus, StatusRead, StatusStore};

/// One row of `run_status.csv`.
#[derive(Debug, Serialize, Deserialize)]
struct StatusRow {
    case_id: u32,
    status: CaseState,
    timestamp: Option<DateTime<Utc>>,
    duration_secs: f64,
    result_path: String,
    error_detail: Option<String>,
    note: Option<String>,
}

impl From<&CaseStatus> for StatusRow {
    fn from(s: &CaseStatus) -> Self {
        Self {
            case_id: s.case_id.0,
            status: s.status,
            timestamp: s.timestamp,
            duration_secs: s.duration_secs,
            result_path: s.result_path.clone(),
            error_detail: s.error_detail.clone(),
            note: s.note.clone(),
        }
    }
}

impl From<StatusRow> for CaseStatus {
    fn from(r: StatusRow) -> Self {
        Self {
            case_id: CaseId(r.case_id),
            status: r.status,
            timestamp: r.timestamp,
            duration_secs: r.duration_secs,
            result_path: r.result_path,
            error_detail: r.error_detail,
            note: r.note,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
}

impl SweepProgress {
    pub fn is_finished(&self) -> bool {
        self.completed == self.total
    }
}

/// One status per registered case, in case_id order. Derived data: it can
/// always be rebuilt from the registry and the per-case records.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidatedStatusRegistry {
    statuses: Vec<CaseStatus>,
}

impl ConsolidatedStatusRegistry {
    pub fn statuses(&self) -> &[CaseStatus] {
        &self.statuses
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn get(&self, case_id: CaseId) -> Option<&CaseStatus> {
        // rows are dense and ordered when produced by `consolidate`
        match self.statuses.get(case_id.index()) {
            Some(s) if s.case_id == case_id => Some(s),
            _ => self.statuses.iter().find(|s| s.case_id == case_id),
        }
    }

    pub fn progress(&self) -> SweepProgress {
        let mut progress = SweepProgress {
            total: self.statuses.len(),
            ..SweepProgress::default()
        };
        for s in &self.statuses {
            match s.status {
                CaseState::Completed => progress.completed += 1,
                CaseState::Failed => progress.failed += 1,
                CaseState::Pending => progress.pending += 1,
            }
        }
        progress
    }

    /// The consolidated table last published at `location`, if any.
    pub fn load(location: &Path) -> Result<Option<Self>> {
        let path = SweepLayout::new(location).consolidated_path();
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let mut statuses = Vec::new();
        for row in reader.deserialize::<StatusRow>() {
            let row = row.map_err(|e| SweepError::malformed(&path, e.to_string()))?;
            statuses.push(CaseStatus::from(row));
        }
        Ok(Some(Self { statuses }))
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for s in &self.statuses {
            writer.serialize(StatusRow::from(s))?;
        }
        writer
            .into_inner()
            .map_err(|e| SweepError::Io(e.into_error()))
    }
}

/// Gather every per-case record into one table and publish it atomically.
///
/// Walks the full registry, never a directory listing. A missing record
/// becomes `pending` ("execution incomplete"); an unreadable one becomes
/// `failed` ("status record corrupted"). Neither aborts the pass.
pub fn consolidate(registry: &SweepRegistry) -> Result<ConsolidatedStatusRegistry> {
    let store = StatusStore::new(registry.location());
    let mut statuses = Vec::with_capacity(registry.len());
    for case in registry.cases() {
        let status = match store.read_status(case.case_id) {
            StatusRead::Present(status) => status,
            StatusRead::Missing => CaseStatus::incomplete(case),
            StatusRead::Corrupt(reason) => {
                warn!(case_id = %case.case_id, %reason, "corrupt status record");
                CaseStatus::corrupted(case, &reason)
            }
        };
        statuses.push(status);
    }
    let consolidated = ConsolidatedStatusRegistry { statuses };
    atomic_write_bytes(
        &registry.layout().consolidated_path(),
        &consolidated.encode()?,
    )?;

    let progress = consolidated.progress();
    info!(
        location = %registry.location().display(),
        total = progress.total,
        completed = progress.completed,
        failed = progress.failed,
        pending = progress.pending,
        "status consolidated"
    );
    Ok(consolidated)
}
