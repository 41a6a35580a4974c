use anyhow::{anyhow, Result};
use simsweep_core::{CaseId, CaseOutcome, CaseRecord, CaseStatus, StatusStore, SweepRegistry};
use std::fs::{self, File};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::SimulatorConfig;
use crate::render::NETLIST_FILE;

/// Runs one case. Returning `Err` marks the case failed; the message becomes
/// its `error_detail`.
pub trait CaseExecutor: Sync {
    fn execute(&self, case: &CaseRecord, case_dir: &Path, result_path: &Path)
        -> Result<(), String>;
}

/// Spawns the simulator in the case directory.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: Vec<String>,
    timeout: Duration,
    log_file: String,
}

impl CommandExecutor {
    pub fn new(simulator: &SimulatorConfig, log_file: impl Into<String>) -> Self {
        Self {
            command: simulator.command.clone(),
            timeout: Duration::from_secs(simulator.timeout_secs),
            log_file: log_file.into(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn resolve_command(&self, case: &CaseRecord, result_path: &Path) -> Vec<String> {
        let result_name = result_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        self.command
            .iter()
            .map(|part| {
                part.replace("{netlist}", NETLIST_FILE)
                    .replace("{result}", &result_name)
                    .replace("{case_id}", &case.case_id.to_string())
            })
            .collect()
    }
}

impl CaseExecutor for CommandExecutor {
    fn execute(
        &self,
        case: &CaseRecord,
        case_dir: &Path,
        result_path: &Path,
    ) -> Result<(), String> {
        let argv = self.resolve_command(case, result_path);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| "simulator command is empty".to_string())?;
        let log_path = case_dir.join(&self.log_file);
        let log = File::create(&log_path)
            .map_err(|e| format!("cannot create log {}: {}", log_path.display(), e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| format!("cannot share log handle: {}", e))?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(case_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| format!("failed to start {}: {}", program, e))?;

        // unrepresentable deadline means no deadline
        let deadline = Instant::now().checked_add(self.timeout);
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => return Err(format!("failed waiting for simulator: {}", e)),
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!(
                    "simulation timed out after {}s",
                    self.timeout.as_secs_f64()
                ));
            }
            thread::sleep(Duration::from_millis(50));
        };

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(format!(
                "simulator exited with status {}: {}",
                code,
                log_tail(&log_path)
            ));
        }
        match fs::metadata(result_path) {
            Ok(meta) if meta.len() > 0 => Ok(()),
            Ok(_) => Err(format!("result file is empty: {}", result_path.display())),
            Err(_) => Err(format!("result file missing: {}", result_path.display())),
        }
    }
}

fn log_tail(log_path: &Path) -> String {
    fs::read_to_string(log_path)
        .ok()
        .and_then(|text| {
            text.lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .map(|l| l.trim().to_string())
        })
        .unwrap_or_else(|| "no output".to_string())
}

/// Execute one case and record its outcome. Only a failure to write the
/// status record itself is an error.
pub fn execute_case(
    registry: &SweepRegistry,
    store: &StatusStore,
    executor: &dyn CaseExecutor,
    case_id: CaseId,
) -> Result<CaseStatus> {
    let case = registry
        .get(case_id)
        .ok_or_else(|| anyhow!("case {} is not in the registry", case_id))?;
    let layout = registry.layout();
    let case_dir = layout.resolve(&case.artifact_path);
    let result_path = layout.resolve(&case.result_path);
    let started = Instant::now();
    // a stale result from an earlier attempt must not pass the check
    let attempt = match fs::remove_file(&result_path) {
        Ok(()) => executor.execute(case, &case_dir, &result_path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            executor.execute(case, &case_dir, &result_path)
        }
        Err(e) => Err(format!(
            "cannot remove stale result {}: {}",
            result_path.display(),
            e
        )),
    };
    let outcome = match attempt {
        Ok(()) => CaseOutcome::Completed {
            duration: started.elapsed(),
        },
        Err(error) => CaseOutcome::Failed {
            duration: started.elapsed(),
            error,
        },
    };
    if let CaseOutcome::Failed { error, .. } = &outcome {
        warn!(case_id = %case_id, %error, "case failed");
    } else {
        debug!(case_id = %case_id, "case completed");
    }
    Ok(store.write_status(case, &outcome)?)
}

/// Run `planned` on a pool of `parallel` workers. Each case is handed to
/// exactly one worker, and one case's error never stops the others: the
/// result holds one entry per planned case, in plan order.
pub fn execute_planned(
    registry: &SweepRegistry,
    executor: &dyn CaseExecutor,
    planned: &[CaseId],
    parallel: usize,
) -> Result<Vec<(CaseId, Result<CaseStatus>)>> {
    use rayon::prelude::*;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parallel.max(1))
        .build()
        .map_err(|e| anyhow!("failed to start worker pool: {}", e))?;
    let store = StatusStore::new(registry.location());
    Ok(pool.install(|| {
        planned
            .par_iter()
            .map(|id| (*id, execute_case(registry, &store, executor, *id)))
            .collect()
    }))
}
