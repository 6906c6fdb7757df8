use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};
use crate::process::{command_summary, run_output};
use crate::reporter::CommandCtx;
use crate::storage::Storage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub passed: bool,
    pub output: String,
}

pub trait IntegrityTest {
    /// `Err` only when the tester itself could not run.
    fn test(&self, path: &Path) -> Result<IntegrityReport>;
}

pub struct ZstdTester {
    binary: String,
}

impl ZstdTester {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl IntegrityTest for ZstdTester {
    fn test(&self, path: &Path) -> Result<IntegrityReport> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--test").arg("--no-progress").arg("--quiet").arg(path);
        let out = run_output(&mut cmd)?;
        Ok(IntegrityReport {
            passed: out.status.success(),
            output: if out.status.success() {
                String::new()
            } else {
                command_summary(&out)
            },
        })
    }
}

/// Test one file and report the verdict.
pub fn test_file(tester: &dyn IntegrityTest, path: &Path, ctx: &CommandCtx) -> Result<bool> {
    ctx.notice(format!("Testing download [{}]", path.display()));
    let report = tester.test(path)?;
    if report.passed {
        ctx.notice("zstd test successful");
    } else {
        ctx.error(format!(
            "Downloaded file failed zstd test: {}",
            report.output
        ));
    }
    Ok(report.passed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckTarget {
    One(String),
    All,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckSummary {
    pub checked: usize,
    pub passed: usize,
    pub failed: Vec<String>,
}

/// The `check` command. A named file that does not exist fails before any
/// testing starts; in `All` mode each file is tested independently.
pub fn check_files(
    storage: &Storage,
    tester: &dyn IntegrityTest,
    target: &CheckTarget,
    dry_run: bool,
    ctx: &CommandCtx,
) -> Result<CheckSummary> {
    let files: Vec<String> = match target {
        CheckTarget::One(rel) => {
            if !storage.exists(rel) {
                return Err(Error::msg(format!("Could not find file {rel}")));
            }
            vec![rel.clone()]
        }
        CheckTarget::All => storage.all_files()?.into_iter().map(|f| f.rel).collect(),
    };

    if dry_run {
        ctx.line("Dry-run only");
    }
    if files.is_empty() {
        ctx.line("Nothing to be checked");
        return Ok(CheckSummary::default());
    }
    if dry_run && *target == CheckTarget::All {
        ctx.line("The following files would be checked in downloads:");
    }

    let mut summary = CheckSummary::default();
    for rel in files {
        if dry_run {
            ctx.line(format!("Check [{rel}]"));
            continue;
        }
        summary.checked += 1;
        let Some(file) = storage.stat(&rel)? else {
            ctx.warn(format!("Backup file [{rel}] does not exist"));
            summary.failed.push(rel);
            continue;
        };
        match test_file(tester, &file.path, ctx) {
            Ok(true) => summary.passed += 1,
            Ok(false) => summary.failed.push(rel),
            Err(e) => {
                ctx.error(format!("Could not test [{rel}]: {e}"));
                summary.failed.push(rel);
            }
        }
    }
    Ok(summary)
}
