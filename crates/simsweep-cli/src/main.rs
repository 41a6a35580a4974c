use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use simsweep_core::{CaseId, CaseState, ConsolidatedStatusRegistry, SweepError, SweepProgress};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "simsweep", version, about = "Parameter sweep builder and resumable runner")]
struct Cli {
    /// Project root holding sim_setup.yaml
    #[arg(long, short = 'C', global = true, default_value = ".")]
    project: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Init,
    Validate {
        #[arg(long)]
        json: bool,
    },
    Build {
        sweep: String,
        /// Discard the existing registry, artifacts and all recorded status
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
    Plan {
        sweep: String,
        #[arg(long)]
        json: bool,
    },
    Run {
        sweep: String,
        #[arg(long, short = 'j', default_value_t = 1)]
        parallel: usize,
        #[arg(long)]
        timeout_seconds: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    Consolidate {
        sweep: String,
        #[arg(long)]
        json: bool,
    },
    Status {
        sweep: String,
        /// Also list every case that is not completed
        #[arg(long)]
        cases: bool,
        #[arg(long)]
        json: bool,
    },
    Reset {
        sweep: String,
        #[arg(required = true)]
        case_ids: Vec<u32>,
        #[arg(long)]
        json: bool,
    },
    List {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.project, cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<SweepError>()
                    .map(SweepError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, err.to_string(), error_details(&err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_command(project: PathBuf, command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Init => {
            let created = simsweep_runner::init_project(&project)?;
            for path in &created {
                println!("created: {}", path.display());
            }
            if created.is_empty() {
                println!("nothing to do: project already initialized");
            }
        }
        Commands::Validate { json } => {
            let report = simsweep_runner::validate_project(&project)?;
            if json {
                return Ok(Some(json!({
                    "ok": report.is_valid(),
                    "command": "validate",
                    "report": serde_json::to_value(&report)?,
                })));
            }
            for (name, err) in &report.testbenches {
                println!("testbench {}: {}", name, err.as_deref().unwrap_or("ok"));
            }
            for (name, err) in &report.sweeps {
                println!("sweep {}: {}", name, err.as_deref().unwrap_or("ok"));
            }
            if !report.is_valid() {
                return Err(anyhow::anyhow!(
                    "project has {} configuration error(s)",
                    report.errors.len()
                ));
            }
            println!("valid: true");
        }
        Commands::Build { sweep, force, json } => {
            let result = simsweep_runner::build_sweep(&project, &sweep, force)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "build",
                    "build": serde_json::to_value(&result)?,
                })));
            }
            println!("sweep: {}", result.sweep);
            println!("testbench: {}", result.testbench);
            println!("cases: {}", result.case_count);
            println!("swept_parameters: {}", result.swept_parameters.join(", "));
            println!("location: {}", result.location.display());
        }
        Commands::Plan { sweep, json } => {
            let planned = simsweep_runner::plan_sweep(&project, &sweep)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "sweep": sweep,
                    "planned": planned,
                })));
            }
            println!("planned: {}", planned.len());
            if !planned.is_empty() {
                println!("case_ids: {}", join_ids(&planned));
            }
        }
        Commands::Run {
            sweep,
            parallel,
            timeout_seconds,
            json,
        } => {
            let options = simsweep_runner::RunOptions {
                parallel,
                timeout: timeout_seconds.map(Duration::from_secs),
            };
            let result = simsweep_runner::run_sweep(&project, &sweep, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": serde_json::to_value(&result)?,
                })));
            }
            println!("sweep: {}", result.sweep);
            println!("executed: {}", result.planned.len());
            print_progress(&result.progress);
        }
        Commands::Consolidate { sweep, json } => {
            let table = simsweep_runner::consolidate_sweep(&project, &sweep)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "consolidate",
                    "sweep": sweep,
                    "progress": progress_to_json(&table.progress()),
                })));
            }
            print_progress(&table.progress());
        }
        Commands::Status { sweep, cases, json } => {
            let progress = simsweep_runner::sweep_progress(&project, &sweep)?;
            let location = simsweep_runner::sweep_location(&project, &sweep);
            let table = if cases {
                ConsolidatedStatusRegistry::load(&location)?
            } else {
                None
            };
            if json {
                let unfinished: Vec<Value> = table
                    .iter()
                    .flat_map(|t| t.statuses())
                    .filter(|s| s.status != CaseState::Completed)
                    .map(|s| {
                        json!({
                            "case_id": s.case_id,
                            "status": s.status.as_str(),
                            "error_detail": s.error_detail,
                            "note": s.note,
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "sweep": sweep,
                    "progress": progress_to_json(&progress),
                    "unfinished": unfinished,
                })));
            }
            print_progress(&progress);
            for s in table.iter().flat_map(|t| t.statuses()) {
                if s.status == CaseState::Completed {
                    continue;
                }
                let detail = s
                    .error_detail
                    .as_deref()
                    .or(s.note.as_deref())
                    .unwrap_or("");
                println!("case {}: {} {}", s.case_id, s.status, detail);
            }
        }
        Commands::Reset {
            sweep,
            case_ids,
            json,
        } => {
            let ids: Vec<CaseId> = case_ids.into_iter().map(CaseId).collect();
            let cleared = simsweep_runner::reset_cases(&project, &sweep, &ids)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "reset",
                    "sweep": sweep,
                    "cleared": cleared,
                })));
            }
            println!("cleared: {}", cleared.len());
            if !cleared.is_empty() {
                println!("case_ids: {}", join_ids(&cleared));
            }
        }
        Commands::List { json } => {
            let sweeps = simsweep_runner::list_sweeps(&project)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list",
                    "sweeps": serde_json::to_value(&sweeps)?,
                })));
            }
            for s in &sweeps {
                match &s.manifest {
                    Some(m) => println!("{}: {} cases ({})", s.sweep, m.case_count, m.testbench),
                    None => println!("{}: manifest unreadable", s.sweep),
                }
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_details(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<SweepError>() {
        Some(SweepError::Configuration { key, .. }) => json!({ "key": key }),
        Some(SweepError::AlreadyExists { path })
        | Some(SweepError::RegistryMissing { path })
        | Some(SweepError::MalformedRegistry { path, .. }) => {
            json!({ "path": path.display().to_string() })
        }
        Some(SweepError::Render { case_id, .. }) => json!({ "case_id": case_id }),
        _ => json!({}),
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Validate { json }
        | Commands::Build { json, .. }
        | Commands::Plan { json, .. }
        | Commands::Run { json, .. }
        | Commands::Consolidate { json, .. }
        | Commands::Status { json, .. }
        | Commands::Reset { json, .. }
        | Commands::List { json } => *json,
        Commands::Init => false,
    }
}

fn progress_to_json(progress: &SweepProgress) -> Value {
    json!({
        "total": progress.total,
        "completed": progress.completed,
        "failed": progress.failed,
        "pending": progress.pending,
        "finished": progress.is_finished(),
    })
}

fn print_progress(progress: &SweepProgress) {
    println!("total: {}", progress.total);
    println!("completed: {}", progress.completed);
    println!("failed: {}", progress.failed);
    println!("pending: {}", progress.pending);
}

fn join_ids(ids: &[CaseId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_flag_is_detected_per_command() {
        let cli = Cli::parse_from(["simsweep", "run", "corners", "-j", "4", "--json"]);
        assert!(command_json_mode(&cli.command));
        let cli = Cli::parse_from(["simsweep", "--project", "/tmp/p", "init"]);
        assert!(!command_json_mode(&cli.command));
        assert_eq!(cli.project, PathBuf::from("/tmp/p"));
    }

    #[test]
    fn reset_requires_case_ids() {
        assert!(Cli::try_parse_from(["simsweep", "reset", "corners"]).is_err());
        let cli = Cli::try_parse_from(["simsweep", "reset", "corners", "3", "7"]).expect("parse");
        match cli.command {
            Commands::Reset { case_ids, .. } => assert_eq!(case_ids, vec![3, 7]),
            _ => panic!("expected reset"),
        }
    }

    #[test]
    fn sweep_errors_keep_their_code_in_json() {
        let err = anyhow::Error::new(SweepError::AlreadyExists {
            path: PathBuf::from("results/corners"),
        });
        let code = err
            .downcast_ref::<SweepError>()
            .map(SweepError::code)
            .unwrap_or("command_failed");
        let payload = json_error(code, err.to_string(), error_details(&err));
        assert_eq!(payload["error"]["code"], "already_exists");
        assert_eq!(payload["error"]["details"]["path"], "results/corners");
    }
}
