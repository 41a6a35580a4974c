use simsweep_core::fsutil::ensure_dir;
use simsweep_core::{CaseRecord, CaseRenderer, SweepError};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{ResolvedSweep, TESTBENCH_CONFIG_FILE};

pub const NETLIST_FILE: &str = "netlist.spice";

/// Placeholders every template may use in addition to its parameters.
const BUILTIN_NAMES: &[&str] = &["case_id", "dut_netlist", "result_path"];

/// Renders one netlist per case from a `{{ name }}` template and copies the
/// testbench's support files next to it.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    template: String,
    template_name: PathBuf,
    testbench_dir: PathBuf,
    dut_netlist: PathBuf,
}

impl TemplateRenderer {
    pub fn new(template: String, testbench_dir: &Path, dut_netlist: &Path) -> Self {
        Self {
            template,
            template_name: PathBuf::new(),
            testbench_dir: testbench_dir.to_path_buf(),
            dut_netlist: dut_netlist.to_path_buf(),
        }
    }

    pub fn for_sweep(resolved: &ResolvedSweep) -> anyhow::Result<Self> {
        let path = resolved.template_path();
        let template = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("template not readable {}: {}", path.display(), e))?;
        let dut_netlist = resolved.dut_netlist_path()?;
        let mut renderer = Self::new(template, &resolved.testbench_dir, &dut_netlist);
        renderer.template_name = resolved.testbench.template.clone();
        Ok(renderer)
    }

    /// Substitute every placeholder; parameters the template never mentions
    /// are appended as `.param` lines.
    pub fn render_text(&self, case: &CaseRecord) -> Result<String, String> {
        let mut used = BTreeSet::new();
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| "unterminated placeholder '{{'".to_string())?;
            let name = after[..close].trim();
            out.push_str(&self.lookup(case, name)?);
            used.insert(name.to_string());
            rest = &after[close + 2..];
        }
        out.push_str(rest);

        let missing: Vec<_> = case
            .assignment
            .iter()
            .filter(|(k, _)| !used.contains(k.as_str()))
            .collect();
        if !missing.is_empty() {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            for (name, value) in missing {
                out.push_str(&format!(".param {}={}\n", name, value));
            }
        }
        Ok(out)
    }

    fn lookup(&self, case: &CaseRecord, name: &str) -> Result<String, String> {
        if let Some(value) = case.assignment.get(name) {
            return Ok(value.to_string());
        }
        match name {
            "case_id" => Ok(case.case_id.to_string()),
            "dut_netlist" => Ok(self.dut_netlist.to_string_lossy().to_string()),
            "result_path" => Ok(case
                .result_path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()),
            "" => Err("empty placeholder".to_string()),
            other => Err(format!(
                "unknown placeholder '{}' (known: parameters, {})",
                other,
                BUILTIN_NAMES.join(", ")
            )),
        }
    }

    fn copy_support_files(&self, dst: &Path) -> Result<(), String> {
        if self.testbench_dir.as_os_str().is_empty() || !self.testbench_dir.is_dir() {
            return Ok(());
        }
        let exclude = [Path::new(TESTBENCH_CONFIG_FILE), self.template_name.as_path()];
        copy_dir_filtered(&self.testbench_dir, dst, &exclude).map_err(|e| e.to_string())
    }
}

impl CaseRenderer for TemplateRenderer {
    fn render(&self, case: &CaseRecord, artifact_dir: &Path) -> simsweep_core::Result<()> {
        let fail = |message: String| SweepError::Render {
            case_id: case.case_id,
            message,
        };
        self.copy_support_files(artifact_dir).map_err(fail)?;
        let text = self.render_text(case).map_err(fail)?;
        fs::write(artifact_dir.join(NETLIST_FILE), text)?;
        Ok(())
    }
}

/// Recursive copy skipping anything under an excluded relative path.
fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[&Path]) -> anyhow::Result<()> {
    let walker = walkdir::WalkDir::new(src)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| {
            let rel = e.path().strip_prefix(src).unwrap_or(e.path());
            if rel.as_os_str().is_empty() {
                return true;
            }
            !exclude
                .iter()
                .any(|ex| !ex.as_os_str().is_empty() && rel.starts_with(normalize(ex)))
        });
    for entry in walker {
        let entry = entry?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}
