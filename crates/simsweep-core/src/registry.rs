use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SweepError};
use crate::expand::CaseAssignment;
use crate::fsutil::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, sync_parent};
use crate::value::ParamValue;

pub const REGISTRY_FILE: &str = "registry.csv";
pub const MANIFEST_FILE: &str = "sweep_manifest.json";
pub const CONSOLIDATED_FILE: &str = "run_status.csv";
pub const STATUS_FILE: &str = "run_status.json";
pub const CASES_DIR: &str = "cases";
pub const DEFAULT_RESULT_FILE: &str = "results.raw";

const MANIFEST_SCHEMA: &str = "sweep_manifest_v1";

/// Dense 1-based case identifier, fixed by expansion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(pub u32);

impl CaseId {
    pub fn from_index(index: usize) -> Self {
        CaseId(index as u32 + 1)
    }

    pub fn index(self) -> usize {
        (self.0 as usize).saturating_sub(1)
    }

    pub fn dir_name(self) -> String {
        format!("case_{}", self.0)
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Paths inside one sweep run location. Everything recorded in the
/// registry is relative to `root` so a sweep can be moved as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepLayout {
    root: PathBuf,
}

impl SweepLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn consolidated_path(&self) -> PathBuf {
        self.root.join(CONSOLIDATED_FILE)
    }

    pub fn case_dir(&self, case_id: CaseId) -> PathBuf {
        self.root.join(artifact_rel(case_id))
    }

    pub fn status_path(&self, case_id: CaseId) -> PathBuf {
        self.case_dir(case_id).join(STATUS_FILE)
    }

    pub fn resolve(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }
}

fn artifact_rel(case_id: CaseId) -> PathBuf {
    Path::new(CASES_DIR).join(case_id.dir_name())
}

fn result_rel(case_id: CaseId, result_file: &str) -> PathBuf {
    artifact_rel(case_id).join(result_file)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseRecord {
    pub case_id: CaseId,
    pub assignment: CaseAssignment,
    /// Per-case directory, relative to the sweep root.
    pub artifact_path: PathBuf,
    /// Where the job is expected to deposit its output, relative to the sweep root.
    pub result_path: PathBuf,
}

impl CaseRecord {
    fn new(case_id: CaseId, assignment: CaseAssignment, result_file: &str) -> Self {
        Self {
            case_id,
            assignment,
            artifact_path: artifact_rel(case_id),
            result_path: result_rel(case_id, result_file),
        }
    }

    pub fn result_path_text(&self) -> String {
        self.result_path.to_string_lossy().replace('\\', "/")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepManifest {
    pub schema_version: String,
    pub sweep: String,
    pub testbench: String,
    pub case_count: usize,
    pub swept_parameters: Vec<String>,
    pub definition_digest: String,
    pub result_file: String,
    pub created_at: DateTime<Utc>,
}

impl SweepManifest {
    pub fn load(location: &Path) -> Result<Self> {
        let path = SweepLayout::new(location).manifest_path();
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SweepError::RegistryMissing {
                    path: location.to_path_buf(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| SweepError::malformed(&path, e.to_string()))
    }
}

/// The immutable, ordered set of cases in a sweep.
#[derive(Debug, Clone)]
pub struct SweepRegistry {
    layout: SweepLayout,
    parameters: Vec<String>,
    cases: Vec<CaseRecord>,
}

impl SweepRegistry {
    pub fn load(location: &Path) -> Result<Self> {
        let layout = SweepLayout::new(location);
        let path = layout.registry_path();
        if !path.exists() {
            return Err(SweepError::RegistryMissing {
                path: location.to_path_buf(),
            });
        }
        let mut reader = csv::Reader::from_path(&path)?;
        let headers = reader.headers()?.clone();
        let columns: Vec<&str> = headers.iter().collect();
        if columns.len() < 2
            || columns.first() != Some(&"case_id")
            || columns.last() != Some(&"result_path")
        {
            return Err(SweepError::malformed(
                &path,
                "header must be case_id, <parameters...>, result_path",
            ));
        }
        let parameters: Vec<String> = columns[1..columns.len() - 1]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut cases = Vec::new();
        for (row_idx, row) in reader.records().enumerate() {
            let row = row?;
            let expected = CaseId::from_index(row_idx);
            let case_id = row
                .get(0)
                .and_then(|s| s.parse::<u32>().ok())
                .map(CaseId)
                .ok_or_else(|| SweepError::malformed(&path, format!("bad case_id on row {}", row_idx + 1)))?;
            if case_id != expected {
                return Err(SweepError::malformed(
                    &path,
                    format!("case ids must be dense and ordered: expected {expected}, found {case_id}"),
                ));
            }
            let mut assignment = CaseAssignment::with_capacity(parameters.len());
            for (i, name) in parameters.iter().enumerate() {
                let text = row.get(i + 1).unwrap_or_default();
                assignment.insert(name.clone(), ParamValue::parse_text(text));
            }
            let result_path = PathBuf::from(row.get(parameters.len() + 1).unwrap_or_default());
            cases.push(CaseRecord {
                case_id,
                assignment,
                artifact_path: artifact_rel(case_id),
                result_path,
            });
        }
        Ok(Self {
            layout,
            parameters,
            cases,
        })
    }

    pub fn layout(&self) -> &SweepLayout {
        &self.layout
    }

    pub fn location(&self) -> &Path {
        self.layout.root()
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn cases(&self) -> &[CaseRecord] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn get(&self, case_id: CaseId) -> Option<&CaseRecord> {
        if case_id.0 == 0 {
            return None;
        }
        self.cases.get(case_id.index())
    }

    pub fn case_ids(&self) -> impl Iterator<Item = CaseId> + '_ {
        self.cases.iter().map(|c| c.case_id)
    }
}

/// Materializes per-case inputs while the sweep is still being staged.
pub trait CaseRenderer {
    fn render(&self, case: &CaseRecord, artifact_dir: &Path) -> Result<()>;
}

/// Creates the case directories and nothing else.
pub struct NoopRenderer;

impl CaseRenderer for NoopRenderer {
    fn render(&self, _case: &CaseRecord, _artifact_dir: &Path) -> Result<()> {
        Ok(())
    }
}

struct StagingGuard {
    path: PathBuf,
    published: bool,
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if !self.published {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

/// Builds a sweep run location from an expansion.
///
/// The whole location is staged next to its final path and published with
/// a single rename, so a reader sees either no registry or a complete one.
pub struct RegistryBuilder {
    location: PathBuf,
    sweep: String,
    testbench: String,
    swept_parameters: Vec<String>,
    definition_digest: String,
    result_file: String,
    force: bool,
}

impl RegistryBuilder {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        let location = location.into();
        let sweep = location
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "sweep".to_string());
        Self {
            location,
            sweep,
            testbench: String::new(),
            swept_parameters: Vec::new(),
            definition_digest: String::new(),
            result_file: DEFAULT_RESULT_FILE.to_string(),
            force: false,
        }
    }

    pub fn testbench(mut self, name: impl Into<String>) -> Self {
        self.testbench = name.into();
        self
    }

    pub fn swept_parameters(mut self, names: Vec<String>) -> Self {
        self.swept_parameters = names;
        self
    }

    pub fn definition_digest(mut self, digest: impl Into<String>) -> Self {
        self.definition_digest = digest.into();
        self
    }

    pub fn result_file(mut self, name: impl Into<String>) -> Self {
        self.result_file = name.into();
        self
    }

    /// Destroy any prior sweep at the location (registry, artifacts and
    /// every status record) instead of refusing to build.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn build(
        self,
        assignments: Vec<CaseAssignment>,
        renderer: &dyn CaseRenderer,
    ) -> Result<SweepRegistry> {
        if self.location.exists() && !self.force {
            return Err(SweepError::AlreadyExists {
                path: self.location.clone(),
            });
        }
        if assignments.is_empty() {
            return Err(SweepError::config(self.sweep.as_str(), "expansion produced no cases"));
        }

        let parent = self
            .location
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        ensure_dir(&parent)?;
        let staging = crate::fsutil::staging_path(&self.location, "staging");
        ensure_dir(&staging)?;
        let mut guard = StagingGuard {
            path: staging.clone(),
            published: false,
        };
        let staged = SweepLayout::new(&staging);

        let parameters: Vec<String> = assignments[0].keys().cloned().collect();
        let mut cases = Vec::with_capacity(assignments.len());
        for (index, assignment) in assignments.into_iter().enumerate() {
            let keys_match = assignment.len() == parameters.len()
                && assignment.keys().zip(parameters.iter()).all(|(a, b)| a == b);
            if !keys_match {
                return Err(SweepError::config(
                    self.sweep.as_str(),
                    format!("case {} does not bind the same parameters as case 1", index + 1),
                ));
            }
            let record = CaseRecord::new(CaseId::from_index(index), assignment, &self.result_file);
            let artifact_dir = staged.resolve(&record.artifact_path);
            ensure_dir(&artifact_dir)?;
            renderer.render(&record, &artifact_dir)?;
            cases.push(record);
        }

        atomic_write_bytes(&staged.registry_path(), &encode_registry(&parameters, &cases)?)?;
        let manifest = SweepManifest {
            schema_version: MANIFEST_SCHEMA.to_string(),
            sweep: self.sweep.clone(),
            testbench: self.testbench.clone(),
            case_count: cases.len(),
            swept_parameters: self.swept_parameters.clone(),
            definition_digest: self.definition_digest.clone(),
            result_file: self.result_file.clone(),
            created_at: Utc::now(),
        };
        atomic_write_json_pretty(&staged.manifest_path(), &manifest)?;

        if self.location.exists() {
            warn!(
                sweep = %self.sweep,
                location = %self.location.display(),
                "force rebuild: removing prior sweep and all of its status"
            );
            fs::remove_dir_all(&self.location)?;
        }
        fs::rename(&staging, &self.location)?;
        guard.published = true;
        sync_parent(&self.location);

        info!(
            sweep = %self.sweep,
            cases = cases.len(),
            location = %self.location.display(),
            "sweep registry published"
        );
        Ok(SweepRegistry {
            layout: SweepLayout::new(&self.location),
            parameters,
            cases,
        })
    }
}

/// Build with defaults: no rendering, `results.raw` result files, refuse to
/// overwrite an existing location.
pub fn build(location: &Path, assignments: Vec<CaseAssignment>) -> Result<SweepRegistry> {
    RegistryBuilder::new(location).build(assignments, &NoopRenderer)
}

fn encode_registry(parameters: &[String], cases: &[CaseRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = Vec::with_capacity(parameters.len() + 2);
    header.push("case_id".to_string());
    header.extend(parameters.iter().cloned());
    header.push("result_path".to_string());
    writer.write_record(&header)?;
    for case in cases {
        let mut row = Vec::with_capacity(header.len());
        row.push(case.case_id.to_string());
        row.extend(case.assignment.values().map(|v| v.to_string()));
        row.push(case.result_path_text());
        writer.write_record(&row)?;
    }
    writer
        .into_inner()
        .map_err(|e| SweepError::Io(e.into_error()))
}
