use anyhow::{anyhow, Result};
use serde::Serialize;
use simsweep_core::{
    consolidate, expand, plan, swept_parameters, CaseId, ConsolidatedStatusRegistry,
    RegistryBuilder, StatusStore, SweepManifest, SweepProgress, SweepRegistry,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub mod config;
pub mod exec;
pub mod render;

pub use config::{
    resolve_sweep, sweep_location, validate_project, ResolvedSweep, SimSetup, SimulatorConfig,
    SweepConfig, TestbenchConfig, ValidationReport,
};
pub use exec::{execute_case, execute_planned, CaseExecutor, CommandExecutor};
pub use render::TemplateRenderer;

#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub sweep: String,
    pub testbench: String,
    pub location: PathBuf,
    pub case_count: usize,
    pub swept_parameters: Vec<String>,
    pub definition_digest: String,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub parallel: usize,
    /// Overrides the testbench's `simulator.timeout_secs`.
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallel: 1,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub sweep: String,
    pub location: PathBuf,
    pub planned: Vec<CaseId>,
    pub progress: SweepProgress,
}

/// Expand a sweep definition and publish its registry with rendered netlists.
pub fn build_sweep(project_root: &Path, sweep_name: &str, force: bool) -> Result<BuildResult> {
    let resolved = resolve_sweep(project_root, sweep_name)?;
    let assignments = expand(&resolved.testbench.parameters, &resolved.sweep.parameters)?;
    let renderer = TemplateRenderer::for_sweep(&resolved)?;
    let swept = swept_parameters(&resolved.sweep.parameters);
    let digest = resolved.definition_digest()?;

    let registry = RegistryBuilder::new(resolved.location())
        .testbench(resolved.testbench_name.clone())
        .swept_parameters(swept.clone())
        .definition_digest(digest.clone())
        .result_file(resolved.testbench.filename_raw.clone())
        .force(force)
        .build(assignments, &renderer)?;

    Ok(BuildResult {
        sweep: sweep_name.to_string(),
        testbench: resolved.testbench_name,
        location: registry.location().to_path_buf(),
        case_count: registry.len(),
        swept_parameters: swept,
        definition_digest: digest,
    })
}

/// Open the published registry of `sweep_name`.
pub fn open_sweep(project_root: &Path, sweep_name: &str) -> Result<SweepRegistry> {
    Ok(SweepRegistry::load(&sweep_location(project_root, sweep_name))?)
}

/// Cases the next run would execute, after refreshing the consolidated table.
pub fn plan_sweep(project_root: &Path, sweep_name: &str) -> Result<Vec<CaseId>> {
    let registry = open_sweep(project_root, sweep_name)?;
    let consolidated = consolidate(&registry)?;
    Ok(plan(&registry, Some(&consolidated)))
}

/// Consolidate, plan, execute the planned cases, consolidate again.
pub fn run_sweep(project_root: &Path, sweep_name: &str, options: &RunOptions) -> Result<RunResult> {
    let resolved = resolve_sweep(project_root, sweep_name)?;
    let mut executor = CommandExecutor::new(
        &resolved.testbench.simulator,
        resolved.testbench.filename_log.clone(),
    );
    if let Some(timeout) = options.timeout {
        executor = executor.with_timeout(timeout);
    }
    run_with_executor(&resolved.location(), &executor, options.parallel)
}

/// The run loop over an already-built location with any executor.
pub fn run_with_executor(
    location: &Path,
    executor: &dyn CaseExecutor,
    parallel: usize,
) -> Result<RunResult> {
    let registry = SweepRegistry::load(location)?;
    let before = consolidate(&registry)?;
    let planned = plan(&registry, Some(&before));
    let sweep = location
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    info!(
        sweep = %sweep,
        cases = registry.len(),
        planned = planned.len(),
        parallel = parallel,
        "sweep run started"
    );
    let executed = if planned.is_empty() {
        Ok(Vec::new())
    } else {
        execute_planned(&registry, executor, &planned, parallel)
    };
    // gather whatever was recorded before reporting any fault
    let after = consolidate(&registry)?;
    let progress = after.progress();
    info!(
        sweep = %sweep,
        completed = progress.completed,
        failed = progress.failed,
        pending = progress.pending,
        "sweep run finished"
    );
    let mut unrecorded = Vec::new();
    for (case_id, result) in executed? {
        if let Err(err) = result {
            warn!(case_id = %case_id, error = %err, "status record not written");
            unrecorded.push(format!("case {}: {:#}", case_id, err));
        }
    }
    if !unrecorded.is_empty() {
        return Err(anyhow!(
            "{} case(s) ran but their status could not be recorded: {}",
            unrecorded.len(),
            unrecorded.join("; ")
        ));
    }
    Ok(RunResult {
        sweep,
        location: location.to_path_buf(),
        planned,
        progress,
    })
}

/// Re-gather status without executing anything.
pub fn consolidate_sweep(
    project_root: &Path,
    sweep_name: &str,
) -> Result<ConsolidatedStatusRegistry> {
    let registry = open_sweep(project_root, sweep_name)?;
    Ok(consolidate(&registry)?)
}

/// Progress from the last published table; consolidates first when none
/// exists yet.
pub fn sweep_progress(project_root: &Path, sweep_name: &str) -> Result<SweepProgress> {
    let location = sweep_location(project_root, sweep_name);
    let registry = SweepRegistry::load(&location)?;
    match ConsolidatedStatusRegistry::load(&location)? {
        Some(table) if table.len() == registry.len() => Ok(table.progress()),
        _ => Ok(consolidate(&registry)?.progress()),
    }
}

/// Forget the recorded outcome of `case_ids` so they are planned again.
/// Returns the ids that actually had a record.
pub fn reset_cases(project_root: &Path, sweep_name: &str, case_ids: &[CaseId]) -> Result<Vec<CaseId>> {
    let registry = open_sweep(project_root, sweep_name)?;
    let unknown: Vec<String> = case_ids
        .iter()
        .filter(|id| registry.get(**id).is_none())
        .map(|id| id.to_string())
        .collect();
    if !unknown.is_empty() {
        return Err(anyhow!(
            "unknown case ids for sweep {}: {} (valid range 1..={})",
            sweep_name,
            unknown.join(", "),
            registry.len()
        ));
    }
    let store = StatusStore::new(registry.location());
    let mut cleared = Vec::new();
    for id in case_ids {
        if store.reset(*id)? {
            cleared.push(*id);
        }
    }
    consolidate(&registry)?;
    info!(sweep = sweep_name, cleared = cleared.len(), "case status reset");
    Ok(cleared)
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub sweep: String,
    pub location: PathBuf,
    pub manifest: Option<SweepManifest>,
}

/// Published sweeps under `<project>/results`, sorted by name.
pub fn list_sweeps(project_root: &Path) -> Result<Vec<SweepSummary>> {
    let results = project_root.join(config::RESULTS_DIR);
    if !results.is_dir() {
        return Ok(Vec::new());
    }
    let mut sweeps = Vec::new();
    for entry in walkdir::WalkDir::new(&results)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !entry.file_type().is_dir() || name.starts_with('.') {
            continue;
        }
        let layout = simsweep_core::SweepLayout::new(entry.path());
        if !layout.registry_path().is_file() {
            continue;
        }
        sweeps.push(SweepSummary {
            sweep: name,
            location: entry.path().to_path_buf(),
            manifest: SweepManifest::load(entry.path()).ok(),
        });
    }
    Ok(sweeps)
}

const EXAMPLE_SIM_SETUP: &str = "\
dut:
  netlist: ./netlists/dut.spice
testbenches:
  example: ./testbenches/example
sweeps:
  example_sweep: ./sweeps/example_sweep.yaml
";

const EXAMPLE_TESTBENCH: &str = "\
template: ./tb_example.spice.j2
filename_raw: results.raw
filename_log: sim.log
parameters:
  param1: 1k
  param2: 1n
";

const EXAMPLE_TEMPLATE: &str = "\
* example testbench, case {{ case_id }}
.include {{ dut_netlist }}
R1 in out {{ param1 }}
C1 out 0 {{ param2 }}
V1 in 0 AC 1
.control
ac dec 10 1 1G
write {{ result_path }}
.endc
.end
";

const EXAMPLE_SWEEP: &str = "\
testbench: example
parameters:
  param1: ['100', 1k, 10k]
  param2: [100p, 1n, 10n]
";

/// Lay out a new project. Existing files are never overwritten; the
/// returned list holds only what was created.
pub fn init_project(project_root: &Path) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    for dir in ["netlists", "testbenches", "sweeps", config::RESULTS_DIR] {
        let path = project_root.join(dir);
        if !path.exists() {
            simsweep_core::fsutil::ensure_dir(&path)?;
            created.push(path);
        }
    }
    let files = [
        (PathBuf::from(config::SIM_SETUP_FILE), EXAMPLE_SIM_SETUP),
        (
            Path::new("testbenches").join("example").join(config::TESTBENCH_CONFIG_FILE),
            EXAMPLE_TESTBENCH,
        ),
        (
            Path::new("testbenches").join("example").join("tb_example.spice.j2"),
            EXAMPLE_TEMPLATE,
        ),
        (Path::new("sweeps").join("example_sweep.yaml"), EXAMPLE_SWEEP),
    ];
    for (rel, content) in files {
        let path = project_root.join(rel);
        if path.exists() {
            continue;
        }
        if let Some(parent) = path.parent() {
            simsweep_core::fsutil::ensure_dir(parent)?;
        }
        fs::write(&path, content)?;
        created.push(path);
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use simsweep_core::{CaseRecord, CaseState, SweepError};

    fn temp_project(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "simsweep_runner_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        init_project(&root).expect("init");
        root
    }

    /// Fails the first attempt of every case listed in `flaky`.
    struct Scripted {
        flaky: Vec<u32>,
    }

    impl CaseExecutor for Scripted {
        fn execute(&self, case: &CaseRecord, dir: &Path, result: &Path) -> Result<(), String> {
            let marker = dir.join("attempted");
            if self.flaky.contains(&case.case_id.0) && !marker.exists() {
                let _ = fs::write(&marker, b"1");
                return Err("did not converge".to_string());
            }
            fs::write(result, b"raw").map_err(|e| e.to_string())
        }
    }

    #[test]
    fn init_never_overwrites() {
        let root = temp_project("init");
        let setup = root.join(config::SIM_SETUP_FILE);
        fs::write(&setup, "dut: {netlist: mine.sp}\ntestbenches: {}\nsweeps: {}\n").expect("edit");
        let created = init_project(&root).expect("init again");
        assert!(created.is_empty());
        let kept = fs::read_to_string(&setup).expect("read");
        assert!(kept.contains("mine.sp"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn scaffolded_project_validates_and_builds() {
        let root = temp_project("build");
        let report = validate_project(&root).expect("validate");
        assert!(report.is_valid(), "{:?}", report.errors);

        let built = build_sweep(&root, "example_sweep", false).expect("build");
        assert_eq!(built.case_count, 9);
        assert_eq!(built.swept_parameters, vec!["param1", "param2"]);
        let netlist = fs::read_to_string(
            built
                .location
                .join("cases")
                .join("case_2")
                .join(render::NETLIST_FILE),
        )
        .expect("netlist");
        assert!(netlist.contains("R1 in out 100\n"));
        assert!(netlist.contains("C1 out 0 1n\n"));

        let again = build_sweep(&root, "example_sweep", false).expect_err("exists");
        assert!(matches!(
            again.downcast_ref::<SweepError>(),
            Some(SweepError::AlreadyExists { .. })
        ));
        let listed = list_sweeps(&root).expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].manifest.as_ref().map(|m| m.case_count), Some(9));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unwritable_record_still_gathers_the_rest() {
        let root = temp_project("unwritable");
        let built = build_sweep(&root, "example_sweep", false).expect("build");
        let layout = simsweep_core::SweepLayout::new(&built.location);
        simsweep_core::fsutil::ensure_dir(&layout.status_path(CaseId(1)).join("blocker"))
            .expect("blocker");
        let executor = Scripted { flaky: vec![] };

        let err = run_with_executor(&built.location, &executor, 1).expect_err("write fault");
        assert!(err.to_string().contains("case 1"), "{err}");
        let table = ConsolidatedStatusRegistry::load(&built.location)
            .expect("load")
            .expect("table published after the run");
        let progress = table.progress();
        assert_eq!(progress.total, 9);
        assert_eq!(progress.completed, 8);
        assert_eq!(table.get(CaseId(1)).map(|s| s.status), Some(CaseState::Failed));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn relative_project_root_renders_an_includable_dut_path() {
        let root = temp_project("relative");
        let dut = root.join("netlists").join("dut.spice");
        fs::write(&dut, "* dut\n").expect("dut netlist");
        let cwd = std::env::current_dir().expect("cwd");
        let relative = pathdiff(&root, &cwd);
        assert!(relative.is_relative());

        let built = build_sweep(&relative, "example_sweep", false).expect("build");
        let case_dir = built.location.join("cases").join("case_1");
        let netlist = fs::read_to_string(case_dir.join(render::NETLIST_FILE)).expect("netlist");
        let include = netlist
            .lines()
            .find_map(|l| l.strip_prefix(".include "))
            .expect("include line");
        let included = Path::new(include);
        assert!(included.is_absolute(), "{include}");
        assert!(case_dir.join(included).is_file());
        let _ = fs::remove_dir_all(root);
    }

    /// `target` expressed relative to `base` through `..` components.
    fn pathdiff(target: &Path, base: &Path) -> PathBuf {
        let target = fs::canonicalize(target).expect("canonical target");
        let base = fs::canonicalize(base).expect("canonical base");
        let common = target
            .components()
            .zip(base.components())
            .take_while(|(a, b)| a == b)
            .count();
        let mut rel = PathBuf::new();
        for _ in base.components().skip(common) {
            rel.push("..");
        }
        for part in target.components().skip(common) {
            rel.push(part);
        }
        rel
    }

    #[test]
    fn rerun_executes_only_what_did_not_complete() {
        let root = temp_project("rerun");
        let built = build_sweep(&root, "example_sweep", false).expect("build");
        let executor = Scripted { flaky: vec![2, 5] };

        let first = run_with_executor(&built.location, &executor, 3).expect("first run");
        assert_eq!(first.planned.len(), 9);
        assert_eq!(first.progress.completed, 7);
        assert_eq!(first.progress.failed, 2);

        assert_eq!(
            plan_sweep(&root, "example_sweep").expect("plan"),
            vec![CaseId(2), CaseId(5)]
        );
        let second = run_with_executor(&built.location, &executor, 3).expect("second run");
        assert_eq!(second.planned, vec![CaseId(2), CaseId(5)]);
        assert!(second.progress.is_finished());

        let third = run_with_executor(&built.location, &executor, 3).expect("third run");
        assert!(third.planned.is_empty());

        let cleared = reset_cases(&root, "example_sweep", &[CaseId(4), CaseId(4)]).expect("reset");
        assert_eq!(cleared, vec![CaseId(4)]);
        let progress = sweep_progress(&root, "example_sweep").expect("progress");
        assert_eq!(progress.pending, 1);
        let table = consolidate_sweep(&root, "example_sweep").expect("consolidate");
        assert_eq!(
            table.get(CaseId(4)).map(|s| s.status),
            Some(CaseState::Pending)
        );
        assert!(reset_cases(&root, "example_sweep", &[CaseId(10)]).is_err());
        let _ = fs::remove_dir_all(root);
    }
}
