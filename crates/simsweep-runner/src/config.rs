use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use simsweep_core::fsutil::canonical_json_digest;
use simsweep_core::{BaseDefaults, Overrides};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const SIM_SETUP_FILE: &str = "sim_setup.yaml";
pub const TESTBENCH_CONFIG_FILE: &str = "config.yaml";
pub const RESULTS_DIR: &str = "results";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DutConfig {
    pub netlist: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimSetup {
    pub dut: DutConfig,
    pub testbenches: BTreeMap<String, PathBuf>,
    pub sweeps: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulatorConfig {
    #[serde(default = "default_simulator_command")]
    pub command: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            command: default_simulator_command(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_simulator_command() -> Vec<String> {
    vec!["ngspice".into(), "-b".into(), "{netlist}".into()]
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_filename_raw() -> String {
    "results.raw".to_string()
}

fn default_filename_log() -> String {
    "sim.log".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestbenchConfig {
    #[serde(default)]
    pub schematic: Option<PathBuf>,
    pub template: PathBuf,
    #[serde(default = "default_filename_raw")]
    pub filename_raw: String,
    #[serde(default = "default_filename_log")]
    pub filename_log: String,
    #[serde(default)]
    pub parameters: BaseDefaults,
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    pub testbench: String,
    pub parameters: Overrides,
}

/// A sweep with everything it references loaded and checked.
#[derive(Debug, Clone)]
pub struct ResolvedSweep {
    pub name: String,
    pub project_root: PathBuf,
    pub setup: SimSetup,
    pub testbench_name: String,
    pub testbench_dir: PathBuf,
    pub testbench: TestbenchConfig,
    pub sweep: SweepConfig,
}

impl ResolvedSweep {
    pub fn location(&self) -> PathBuf {
        sweep_location(&self.project_root, &self.name)
    }

    pub fn template_path(&self) -> PathBuf {
        self.testbench_dir.join(&self.testbench.template)
    }

    /// Absolute, since the simulator runs from inside each case directory.
    pub fn dut_netlist_path(&self) -> Result<PathBuf> {
        absolute_path(&self.project_root.join(&self.setup.dut.netlist))
    }

    /// Order-sensitive digest of what determines case identity.
    pub fn definition_digest(&self) -> Result<String> {
        let defaults: Vec<_> = self
            .testbench
            .parameters
            .iter()
            .map(|(k, v)| json!([k, v]))
            .collect();
        let overrides: Vec<_> = self
            .sweep
            .parameters
            .iter()
            .map(|(k, v)| json!([k, v]))
            .collect();
        Ok(canonical_json_digest(&json!({
            "testbench": self.testbench_name,
            "result_file": self.testbench.filename_raw,
            "defaults": defaults,
            "overrides": overrides,
        }))?)
    }
}

/// Canonical form when the path exists, else joined onto the working
/// directory with `.` components dropped.
pub fn absolute_path(path: &Path) -> Result<PathBuf> {
    if let Ok(real) = fs::canonicalize(path) {
        return Ok(real);
    }
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot determine the working directory")?
            .join(path)
    };
    Ok(joined
        .components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect())
}

pub fn sweep_location(project_root: &Path, sweep: &str) -> PathBuf {
    project_root.join(RESULTS_DIR).join(sweep)
}

pub fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("configuration file not found: {}", path.display()))?;
    serde_yaml::from_str(&raw).map_err(|e| anyhow!("invalid configuration {}: {}", path.display(), e))
}

pub fn load_sim_setup(project_root: &Path) -> Result<SimSetup> {
    load_yaml(&project_root.join(SIM_SETUP_FILE))
}

pub fn load_testbench_config(testbench_dir: &Path) -> Result<TestbenchConfig> {
    let config: TestbenchConfig = load_yaml(&testbench_dir.join(TESTBENCH_CONFIG_FILE))?;
    if config.template.extension().and_then(|s| s.to_str()) != Some("j2") {
        return Err(anyhow!(
            "invalid testbench config in {}: template must have a .j2 extension ({})",
            testbench_dir.display(),
            config.template.display()
        ));
    }
    if config.simulator.command.is_empty() {
        return Err(anyhow!(
            "invalid testbench config in {}: simulator.command must not be empty",
            testbench_dir.display()
        ));
    }
    Ok(config)
}

pub fn load_sweep_config(path: &Path) -> Result<SweepConfig> {
    let config: SweepConfig = load_yaml(path)?;
    for (name, spec) in &config.parameters {
        if let simsweep_core::ValueSpec::List(values) = spec {
            if values.is_empty() {
                return Err(anyhow!(
                    "invalid sweep config in {}: parameter {} must have at least one value",
                    path.display(),
                    name
                ));
            }
        }
    }
    Ok(config)
}

pub fn resolve_sweep(project_root: &Path, sweep_name: &str) -> Result<ResolvedSweep> {
    let setup = load_sim_setup(project_root)?;
    let sweep_rel = setup.sweeps.get(sweep_name).ok_or_else(|| {
        anyhow!(
            "sweep '{}' not found. available sweeps: {:?}",
            sweep_name,
            setup.sweeps.keys().collect::<Vec<_>>()
        )
    })?;
    let sweep = load_sweep_config(&project_root.join(sweep_rel))?;
    let testbench_rel = setup.testbenches.get(&sweep.testbench).ok_or_else(|| {
        anyhow!(
            "testbench '{}' not found. available testbenches: {:?}",
            sweep.testbench,
            setup.testbenches.keys().collect::<Vec<_>>()
        )
    })?;
    let testbench_dir = project_root.join(testbench_rel);
    let testbench = load_testbench_config(&testbench_dir)?;
    Ok(ResolvedSweep {
        name: sweep_name.to_string(),
        project_root: project_root.to_path_buf(),
        testbench_name: sweep.testbench.clone(),
        setup,
        testbench_dir,
        testbench,
        sweep,
    })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub project_root: PathBuf,
    pub testbenches: IndexMap<String, Option<String>>,
    pub sweeps: IndexMap<String, Option<String>>,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Load every testbench and sweep the project names, collecting all
/// problems instead of stopping at the first.
pub fn validate_project(project_root: &Path) -> Result<ValidationReport> {
    let setup = load_sim_setup(project_root)?;
    let mut report = ValidationReport {
        project_root: project_root.to_path_buf(),
        ..ValidationReport::default()
    };

    let mut defaults_by_testbench: BTreeMap<String, BaseDefaults> = BTreeMap::new();
    for (name, rel) in &setup.testbenches {
        match load_testbench_config(&project_root.join(rel)) {
            Ok(tb) => {
                defaults_by_testbench.insert(name.clone(), tb.parameters);
                report.testbenches.insert(name.clone(), None);
            }
            Err(e) => {
                report.errors.push(format!("testbench {}: {}", name, e));
                report.testbenches.insert(name.clone(), Some(e.to_string()));
            }
        }
    }

    for (name, rel) in &setup.sweeps {
        let checked = load_sweep_config(&project_root.join(rel)).and_then(|sweep| {
            if !setup.testbenches.contains_key(&sweep.testbench) {
                return Err(anyhow!(
                    "references non-existent testbench: {}",
                    sweep.testbench
                ));
            }
            if let Some(defaults) = defaults_by_testbench.get(&sweep.testbench) {
                simsweep_core::expand(defaults, &sweep.parameters)?;
            }
            Ok(())
        });
        match checked {
            Ok(()) => {
                report.sweeps.insert(name.clone(), None);
            }
            Err(e) => {
                report.errors.push(format!("sweep {}: {}", name, e));
                report.sweeps.insert(name.clone(), Some(e.to_string()));
            }
        }
    }
    Ok(report)
}
