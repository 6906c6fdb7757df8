use std::path::Path;
use std::time::Duration;

use crate::download::throughput;
use crate::download::transport::parse_percent;
use crate::error::{Error, Result};
use crate::poller::Clock;
use crate::remote::{RemoteStore, TransferMode, remote_path};
use crate::reporter::CommandCtx;
use crate::storage::Storage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveTarget {
    One(String),
    All,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MoveSummary {
    pub moved: Vec<String>,
    pub planned: Vec<String>,
    pub failed: Vec<String>,
}

impl MoveSummary {
    pub fn ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Pick the remote from the option or the configured default and check that
/// it can be listed.
pub fn resolve_remote(
    store: &dyn RemoteStore,
    option: Option<&str>,
    configured: Option<&str>,
) -> Result<String> {
    let remote = option
        .or(configured)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| {
            Error::msg("No remote configured - specify RCLONE_REMOTE in .env file or use --remote option")
        })?;
    store.validate(remote).map_err(|e| {
        Error::msg(format!(
            "Invalid remote - please refer to rclone documentation for usage ({e})"
        ))
    })?;
    Ok(remote.to_string())
}

/// The `move` command. A named file that does not exist fails before any
/// transfer; in `All` mode a failed file is logged and the rest still move.
pub fn move_files(
    storage: &Storage,
    store: &dyn RemoteStore,
    remote: &str,
    target: &MoveTarget,
    dry_run: bool,
    clock: &dyn Clock,
    ctx: &CommandCtx,
) -> Result<MoveSummary> {
    let files: Vec<String> = match target {
        MoveTarget::One(rel) => {
            if !storage.exists(rel) {
                return Err(Error::msg(format!("Could not find file {rel}")));
            }
            vec![rel.clone()]
        }
        MoveTarget::All => storage.all_files()?.into_iter().map(|f| f.rel).collect(),
    };

    if dry_run {
        ctx.line("Dry-run only");
    }
    if files.is_empty() {
        ctx.line("Nothing to be moved");
        return Ok(MoveSummary::default());
    }
    if dry_run && *target == MoveTarget::All {
        ctx.line("The following files would be moved from downloads to remote:");
    }

    let mut summary = MoveSummary::default();
    for rel in files {
        let rp = remote_path(remote, &rel);
        if dry_run {
            ctx.line(format!("Move [{rel}] to remote [{rp}]"));
            summary.planned.push(rel);
            continue;
        }
        let Some(file) = storage.stat(&rel)? else {
            ctx.warn(format!("Backup file [{rel}] does not exist"));
            summary.failed.push(rel);
            continue;
        };
        ctx.notice(format!("Moving backup file from [{rel}] to [{rp}]"));
        match transfer(store, &file.path, &rp, file.size, TransferMode::Move, clock, ctx) {
            Ok(()) => summary.moved.push(rel),
            Err(e) if *target == MoveTarget::All => {
                ctx.error(e.to_string());
                summary.failed.push(rel);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(summary)
}

/// Copy a freshly downloaded file to secondary storage, keeping the local copy.
pub fn copy_after_download(
    store: &dyn RemoteStore,
    local: &Path,
    remote_path: &str,
    size_bytes: u64,
    clock: &dyn Clock,
    ctx: &CommandCtx,
) -> Result<()> {
    ctx.notice(format!("Copying backup file to [{remote_path}]"));
    transfer(store, local, remote_path, size_bytes, TransferMode::Copy, clock, ctx)
}

fn transfer(
    store: &dyn RemoteStore,
    local: &Path,
    remote_path: &str,
    size_bytes: u64,
    mode: TransferMode,
    clock: &dyn Clock,
    ctx: &CommandCtx,
) -> Result<()> {
    let start = clock.now();
    ctx.progress_start("");
    let res = store.transfer(local, remote_path, mode, &mut |line: &str| match parse_percent(line) {
        Some(p) => ctx.progress(p, None),
        None => ctx.debug(line),
    });
    ctx.progress_finish();
    res?;

    let elapsed = clock.now().saturating_sub(start);
    let verb = match mode {
        TransferMode::Copy => "copy",
        TransferMode::Move => "move",
    };
    ctx.notice(format!(
        "Completed {verb} to remote in {} ({})",
        human_duration(elapsed),
        throughput(size_bytes, elapsed)
    ));
    Ok(())
}

/// `"1 hour 2 minutes 5 seconds"`, omitting zero units.
pub fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let unit = |n: u64, name: &str| {
        if n == 1 {
            format!("1 {name}")
        } else {
            format!("{n} {name}s")
        }
    };
    let mut parts = Vec::new();
    if h > 0 {
        parts.push(unit(h, "hour"));
    }
    if m > 0 {
        parts.push(unit(m, "minute"));
    }
    if s > 0 || parts.is_empty() {
        parts.push(unit(s, "second"));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_read_naturally() {
        assert_eq!(human_duration(Duration::ZERO), "0 seconds");
        assert_eq!(human_duration(Duration::from_secs(61)), "1 minute 1 second");
        assert_eq!(human_duration(Duration::from_secs(7325)), "2 hours 2 minutes 5 seconds");
        assert_eq!(human_duration(Duration::from_secs(3600)), "1 hour");
    }
}
