//! Retention: delete local and remote backup files older than a cutoff.

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::Result;
use crate::remote::{RemoteStore, remote_path};
use crate::reporter::CommandCtx;
use crate::storage::Storage;

/// `now` minus whole days; an out-of-range count keeps everything.
pub fn cutoff(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    TimeDelta::try_days(days)
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Strictly older than the cutoff, at whole-second resolution. A file whose
/// mtime equals the cutoff is kept.
pub fn is_expired<Tz: chrono::TimeZone>(modified: &DateTime<Tz>, cutoff: &DateTime<Utc>) -> bool {
    modified.timestamp() < cutoff.timestamp()
}

#[derive(Debug, Clone)]
pub struct PruneOptions {
    pub cutoff_days: i64,
    pub dry_run: bool,
    pub include_remote: bool,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneReport {
    pub local_candidates: Vec<String>,
    pub local_deleted: Vec<String>,
    pub remote_candidates: Vec<String>,
    pub remote_deleted: Vec<String>,
    pub errors: usize,
    /// The remote listing could not be obtained or decoded.
    pub remote_failed: bool,
}

impl PruneReport {
    pub fn ok(&self) -> bool {
        self.errors == 0 && !self.remote_failed
    }
}

/// Run both phases. Failures are logged and counted in the report; the
/// remote phase runs even when the local phase had errors.
pub fn prune(
    storage: &Storage,
    remote: Option<(&dyn RemoteStore, &str)>,
    opts: &PruneOptions,
    ctx: &CommandCtx,
) -> Result<PruneReport> {
    let cutoff = cutoff(opts.now, opts.cutoff_days);
    let mut report = PruneReport::default();

    ctx.notice(format!(
        "Cleaning up old backups from [{}] older than {} days",
        storage.root().display(),
        opts.cutoff_days
    ));
    if opts.dry_run {
        ctx.line("Dry-run only");
    }

    prune_local(storage, &cutoff, opts.dry_run, &mut report, ctx);

    if opts.include_remote {
        match remote {
            Some((store, root)) => prune_remote(store, root, &cutoff, opts.dry_run, &mut report, ctx),
            None => {
                ctx.error("No remote configured - specify RCLONE_REMOTE in .env file");
                report.remote_failed = true;
            }
        }
    }
    Ok(report)
}

fn prune_local(
    storage: &Storage,
    cutoff: &DateTime<Utc>,
    dry_run: bool,
    report: &mut PruneReport,
    ctx: &CommandCtx,
) {
    let files = match storage.all_files() {
        Ok(files) => files,
        Err(e) => {
            ctx.error(format!("Could not list downloads: {e}"));
            report.errors += 1;
            return;
        }
    };
    report.local_candidates = files
        .into_iter()
        .filter(|f| is_expired(&f.modified, cutoff))
        .map(|f| f.rel)
        .collect();

    if report.local_candidates.is_empty() {
        ctx.line("Nothing to delete from downloads");
        return;
    }
    if dry_run {
        ctx.line("The following files would be deleted from downloads:");
        for rel in &report.local_candidates {
            ctx.line(rel.as_str());
        }
        return;
    }
    for rel in &report.local_candidates {
        ctx.notice(format!("Deleting old backup file from downloads [{rel}]"));
        match storage.delete(rel) {
            Ok(()) => report.local_deleted.push(rel.clone()),
            Err(e) => {
                ctx.error(e.to_string());
                report.errors += 1;
            }
        }
    }
}

fn prune_remote(
    store: &dyn RemoteStore,
    root: &str,
    cutoff: &DateTime<Utc>,
    dry_run: bool,
    report: &mut PruneReport,
    ctx: &CommandCtx,
) {
    let entries = match store.list(root, true) {
        Ok(entries) => entries,
        Err(e) => {
            ctx.error(e.to_string());
            report.remote_failed = true;
            return;
        }
    };
    report.remote_candidates = entries
        .into_iter()
        .filter(|e| !e.is_dir && is_expired(&e.mod_time, cutoff))
        .map(|e| e.path)
        .collect();

    if report.remote_candidates.is_empty() {
        ctx.line("Nothing to delete from remote filesystem");
        return;
    }
    if dry_run {
        ctx.line("The following files would be deleted from remote filesystem:");
        for path in &report.remote_candidates {
            ctx.line(path.as_str());
        }
        return;
    }
    for path in &report.remote_candidates {
        ctx.notice(format!("Deleting old backup file from remote filesystem [{path}]"));
        match store.delete_file(&remote_path(root, path)) {
            Ok(()) => report.remote_deleted.push(path.clone()),
            Err(e) => {
                ctx.error(e.to_string());
                report.errors += 1;
            }
        }
    }
}
