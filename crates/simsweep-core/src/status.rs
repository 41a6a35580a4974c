use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::fsutil::atomic_write_json_pretty;
use crate::registry::{CaseId, CaseRecord, SweepLayout};

const STATUS_SCHEMA: &str = "case_status_v1";

pub const NOTE_INCOMPLETE: &str = "execution incomplete";
pub const NOTE_CORRUPTED: &str = "status record corrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    Pending,
    Completed,
    Failed,
}

impl CaseState {
    pub fn as_str(self) -> &'static str {
        match self {
            CaseState::Pending => "pending",
            CaseState::Completed => "completed",
            CaseState::Failed => "failed",
        }
    }

    /// Pending and failed cases are eligible for (re)execution.
    pub fn needs_run(self) -> bool {
        !matches!(self, CaseState::Completed)
    }
}

impl fmt::Display for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CaseState::Pending),
            "completed" => Ok(CaseState::Completed),
            "failed" => Ok(CaseState::Failed),
            other => Err(format!("unknown case status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseStatus {
    pub case_id: CaseId,
    pub status: CaseState,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_secs: f64,
    pub result_path: String,
    #[serde(default)]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl CaseStatus {
    /// Stand-in for a case with no terminal record: crashed, killed, or
    /// never scheduled.
    pub fn incomplete(case: &CaseRecord) -> Self {
        Self {
            case_id: case.case_id,
            status: CaseState::Pending,
            timestamp: None,
            duration_secs: 0.0,
            result_path: case.result_path_text(),
            error_detail: None,
            note: Some(NOTE_INCOMPLETE.to_string()),
        }
    }

    pub fn corrupted(case: &CaseRecord, reason: &str) -> Self {
        Self {
            case_id: case.case_id,
            status: CaseState::Failed,
            timestamp: None,
            duration_secs: 0.0,
            result_path: case.result_path_text(),
            error_detail: Some(format!("{NOTE_CORRUPTED}: {reason}")),
            note: Some(NOTE_CORRUPTED.to_string()),
        }
    }

    fn check(&self, expected: CaseId) -> std::result::Result<(), String> {
        if self.case_id != expected {
            return Err(format!(
                "record names case {} but lives under case {}",
                self.case_id, expected
            ));
        }
        if !self.duration_secs.is_finite() || self.duration_secs < 0.0 {
            return Err(format!("invalid duration {}", self.duration_secs));
        }
        match (self.status, self.error_detail.is_some()) {
            (CaseState::Failed, false) => Err("failed record without error detail".to_string()),
            (CaseState::Completed, true) => {
                Err("completed record carries an error detail".to_string())
            }
            (CaseState::Pending, _) => Err("pending is not a terminal record".to_string()),
            _ => Ok(()),
        }
    }
}

/// What one execution attempt reports for its case.
#[derive(Debug, Clone, PartialEq)]
pub enum CaseOutcome {
    Completed { duration: Duration },
    Failed { duration: Duration, error: String },
}

impl CaseOutcome {
    pub fn state(&self) -> CaseState {
        match self {
            CaseOutcome::Completed { .. } => CaseState::Completed,
            CaseOutcome::Failed { .. } => CaseState::Failed,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            CaseOutcome::Completed { duration } | CaseOutcome::Failed { duration, .. } => *duration,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StatusRecord {
    schema_version: String,
    #[serde(flatten)]
    status: CaseStatus,
}

/// Result of reading one case's record. Never an error: a fault while
/// reading is itself a finding about that case.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusRead {
    Missing,
    Corrupt(String),
    Present(CaseStatus),
}

/// Per-case status records under a sweep location.
///
/// Every operation touches only the directory of the case it names, so
/// workers on distinct cases share nothing and take no locks.
#[derive(Debug, Clone)]
pub struct StatusStore {
    layout: SweepLayout,
}

impl StatusStore {
    pub fn new(location: &Path) -> Self {
        Self {
            layout: SweepLayout::new(location),
        }
    }

    pub fn layout(&self) -> &SweepLayout {
        &self.layout
    }

    /// Atomically replace the case's record. Writing again (a retry, or a
    /// duplicate worker) replaces the previous record; last write wins.
    pub fn write_status(&self, case: &CaseRecord, outcome: &CaseOutcome) -> Result<CaseStatus> {
        let status = CaseStatus {
            case_id: case.case_id,
            status: outcome.state(),
            timestamp: Some(Utc::now()),
            duration_secs: outcome.duration().as_secs_f64(),
            result_path: case.result_path_text(),
            error_detail: match outcome {
                CaseOutcome::Failed { error, .. } => Some(error.clone()),
                CaseOutcome::Completed { .. } => None,
            },
            note: None,
        };
        let record = StatusRecord {
            schema_version: STATUS_SCHEMA.to_string(),
            status,
        };
        atomic_write_json_pretty(&self.layout.status_path(case.case_id), &record)?;
        debug!(
            case_id = %case.case_id,
            status = %record.status.status,
            duration_secs = record.status.duration_secs,
            "case status written"
        );
        Ok(record.status)
    }

    pub fn read_status(&self, case_id: CaseId) -> StatusRead {
        let path = self.layout.status_path(case_id);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StatusRead::Missing,
            Err(e) => return StatusRead::Corrupt(format!("unreadable: {e}")),
        };
        let record: StatusRecord = match serde_json::from_slice(&bytes) {
            Ok(r) => r,
            Err(e) => return StatusRead::Corrupt(e.to_string()),
        };
        if record.schema_version != STATUS_SCHEMA {
            return StatusRead::Corrupt(format!(
                "unsupported schema_version {}",
                record.schema_version
            ));
        }
        match record.status.check(case_id) {
            Ok(()) => StatusRead::Present(record.status),
            Err(reason) => StatusRead::Corrupt(reason),
        }
    }

    /// Drop the case's record so the next consolidation sees it as pending.
    /// This is the only way a completed case becomes runnable again.
    pub fn reset(&self, case_id: CaseId) -> Result<bool> {
        match fs::remove_file(self.layout.status_path(case_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::{ensure_dir, staging_path};
    use indexmap::IndexMap;
    use std::path::PathBuf;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "simsweep_status_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    fn record(id: u32) -> CaseRecord {
        CaseRecord {
            case_id: CaseId(id),
            assignment: IndexMap::new(),
            artifact_path: PathBuf::from(format!("cases/case_{id}")),
            result_path: PathBuf::from(format!("cases/case_{id}/results.raw")),
        }
    }

    #[test]
    fn completed_outcome_round_trips() {
        let root = temp_root("completed");
        let store = StatusStore::new(&root);
        let written = store
            .write_status(
                &record(2),
                &CaseOutcome::Completed {
                    duration: Duration::from_millis(1500),
                },
            )
            .expect("write");
        assert_eq!(written.status, CaseState::Completed);
        assert_eq!(written.duration_secs, 1.5);
        assert_eq!(written.result_path, "cases/case_2/results.raw");
        assert_eq!(store.read_status(CaseId(2)), StatusRead::Present(written));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_outcome_keeps_error_detail() {
        let root = temp_root("failed");
        let store = StatusStore::new(&root);
        store
            .write_status(
                &record(1),
                &CaseOutcome::Failed {
                    duration: Duration::from_secs(2),
                    error: "timestep too small".into(),
                },
            )
            .expect("write");
        match store.read_status(CaseId(1)) {
            StatusRead::Present(s) => {
                assert_eq!(s.status, CaseState::Failed);
                assert_eq!(s.error_detail.as_deref(), Some("timestep too small"));
            }
            other => panic!("unexpected read: {:?}", other),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn rewriting_replaces_the_prior_record() {
        let root = temp_root("rewrite");
        let store = StatusStore::new(&root);
        let case = record(4);
        store
            .write_status(
                &case,
                &CaseOutcome::Failed {
                    duration: Duration::from_secs(1),
                    error: "no convergence".into(),
                },
            )
            .expect("first");
        store
            .write_status(
                &case,
                &CaseOutcome::Completed {
                    duration: Duration::from_secs(3),
                },
            )
            .expect("retry");
        match store.read_status(CaseId(4)) {
            StatusRead::Present(s) => {
                assert_eq!(s.status, CaseState::Completed);
                assert!(s.error_detail.is_none());
            }
            other => panic!("unexpected read: {:?}", other),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_and_garbage_records_are_distinguished() {
        let root = temp_root("garbage");
        let store = StatusStore::new(&root);
        assert_eq!(store.read_status(CaseId(1)), StatusRead::Missing);

        let path = store.layout().status_path(CaseId(1));
        ensure_dir(path.parent().expect("parent")).expect("case dir");
        fs::write(&path, b"{\"schema_version\": \"case_status_v1\", \"case_id\": 1, \"sta").expect("write");
        assert!(matches!(store.read_status(CaseId(1)), StatusRead::Corrupt(_)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn record_filed_under_the_wrong_case_is_corrupt() {
        let root = temp_root("misfiled");
        let store = StatusStore::new(&root);
        store
            .write_status(
                &record(5),
                &CaseOutcome::Completed {
                    duration: Duration::from_secs(1),
                },
            )
            .expect("write");
        let from = store.layout().status_path(CaseId(5));
        let to = store.layout().status_path(CaseId(6));
        ensure_dir(to.parent().expect("parent")).expect("case dir");
        fs::copy(&from, &to).expect("copy");
        match store.read_status(CaseId(6)) {
            StatusRead::Corrupt(reason) => assert!(reason.contains("case 5"), "{}", reason),
            other => panic!("unexpected read: {:?}", other),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn interrupted_write_never_exposes_a_partial_record() {
        let root = temp_root("interrupted");
        let store = StatusStore::new(&root);
        let case = record(3);
        let first = store
            .write_status(
                &case,
                &CaseOutcome::Completed {
                    duration: Duration::from_secs(1),
                },
            )
            .expect("write");

        // a writer killed after staging but before the rename
        let target = store.layout().status_path(CaseId(3));
        let staged = staging_path(&target, "tmp");
        fs::write(&staged, b"{\"schema_version\": \"case_status_v1\", \"case_i").expect("stage");

        assert_eq!(store.read_status(CaseId(3)), StatusRead::Present(first));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reset_makes_the_case_missing_again() {
        let root = temp_root("reset");
        let store = StatusStore::new(&root);
        store
            .write_status(
                &record(1),
                &CaseOutcome::Completed {
                    duration: Duration::from_secs(1),
                },
            )
            .expect("write");
        assert!(store.reset(CaseId(1)).expect("reset"));
        assert!(!store.reset(CaseId(1)).expect("second reset"));
        assert_eq!(store.read_status(CaseId(1)), StatusRead::Missing);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn state_text_round_trips() {
        for state in [CaseState::Pending, CaseState::Completed, CaseState::Failed] {
            assert_eq!(state.as_str().parse::<CaseState>(), Ok(state));
        }
        assert!("running".parse::<CaseState>().is_err());
    }
}
