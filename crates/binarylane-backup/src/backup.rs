use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::api::{Action, BackupApi, Server};
use crate::download::Downloader;
use crate::error::{Error, Result};
use crate::poller::{Clock, PollConfig, poll_action};
use crate::reporter::CommandCtx;

/// How per-unit failures in a batch affect the process exit status.
/// Units are always all attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPolicy {
    ContinueOnError,
    FailOnError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub attempted: usize,
    pub succeeded: Vec<String>,
    /// (unit name, reason)
    pub failed: Vec<(String, String)>,
}

impl BatchSummary {
    pub fn exit_ok(&self, policy: BatchPolicy) -> bool {
        match policy {
            BatchPolicy::ContinueOnError => true,
            BatchPolicy::FailOnError => self.failed.is_empty(),
        }
    }
}

/// Run `per_unit` for every server in order. An `Err` or `Ok(false)` from
/// one server is recorded and the loop moves on to the next.
pub fn run_batch<F>(servers: &[Server], ctx: &CommandCtx, mut per_unit: F) -> BatchSummary
where
    F: FnMut(&Server) -> Result<bool>,
{
    let mut summary = BatchSummary::default();
    for server in servers {
        summary.attempted += 1;
        match per_unit(server) {
            Ok(true) => summary.succeeded.push(server.name.clone()),
            Ok(false) => summary
                .failed
                .push((server.name.clone(), "unsuccessful".to_string())),
            Err(e) => {
                ctx.error(format!("{}: {e}", server.name));
                summary.failed.push((server.name.clone(), e.to_string()));
            }
        }
    }
    let msg = format!(
        "Batch finished: {} succeeded, {} failed",
        summary.succeeded.len(),
        summary.failed.len()
    );
    if summary.failed.is_empty() {
        ctx.notice(msg);
    } else {
        let names: Vec<&str> = summary.failed.iter().map(|(n, _)| n.as_str()).collect();
        ctx.warn(format!("{msg} ({})", names.join(", ")));
    }
    summary
}

/// Take a backup of one server and wait for it. `Ok(false)` when the action
/// errored, timed out, or reported an unexpected status.
pub fn run_backup(
    api: &dyn BackupApi,
    server: &Server,
    poll: PollConfig,
    clock: &dyn Clock,
    ctx: &CommandCtx,
) -> Result<bool> {
    ctx.section(format!("Backing up {}", server.name));
    ctx.notice(format!(
        "Starting backup of {} ({} GB disk)",
        server.name, server.disk
    ));

    let action = api.create_backup(server)?;
    ctx.debug(format!("backup action {} for {}", action.id, server.name));

    ctx.progress_start("");
    let res = poll_action(api, action.id, poll, clock, &mut |a: &Action| {
        ctx.progress(a.progress.percent(), a.progress.current_step_detail.as_deref());
    });
    ctx.progress_finish();
    let res = res?;

    if res.is_success() {
        ctx.notice(format!(
            "Completed server backup {} in {:.1} seconds",
            server.name,
            res.elapsed.as_secs_f64()
        ));
        Ok(true)
    } else {
        ctx.error(format!(
            "Error backing up {} - status: {}",
            server.name,
            res.outcome.label()
        ));
        Ok(false)
    }
}

/// The `create` unit: back up one server, then download its newest backup
/// when a downloader is given. Nothing is downloaded unless the backup
/// completed.
pub fn backup_then_download(
    api: &dyn BackupApi,
    server: &Server,
    poll: PollConfig,
    clock: &dyn Clock,
    downloader: Option<&Downloader<'_>>,
    single: bool,
    ctx: &CommandCtx,
) -> Result<bool> {
    if !run_backup(api, server, poll, clock, ctx)? {
        return Ok(false);
    }
    match downloader {
        Some(d) => d.download_server(server, single, ctx),
        None => Ok(true),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSelection {
    One(String),
    All,
    Include(BTreeSet<String>),
    Exclude(BTreeSet<String>),
}

impl ServerSelection {
    /// Build a selection from CLI-style inputs. An explicit server wins;
    /// include and exclude lists are mutually exclusive.
    pub fn from_args(
        server: Option<&str>,
        all: bool,
        include: Option<&Path>,
        exclude: Option<&Path>,
    ) -> Result<Self> {
        if let Some(name) = server.map(str::trim).filter(|s| !s.is_empty()) {
            if all || include.is_some() || exclude.is_some() {
                return Err(Error::msg(
                    "specify either a server or --all/--include/--exclude, not both",
                ));
            }
            return Ok(ServerSelection::One(name.to_string()));
        }
        match (include, exclude) {
            (Some(_), Some(_)) => Err(Error::msg("--include and --exclude cannot be combined")),
            (Some(p), None) => Ok(ServerSelection::Include(load_name_list(p)?)),
            (None, Some(p)) => Ok(ServerSelection::Exclude(load_name_list(p)?)),
            (None, None) if all => Ok(ServerSelection::All),
            (None, None) => Err(Error::msg(
                "no server specified; pass a server name or --all",
            )),
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self, ServerSelection::One(_))
    }

    pub fn filter(&self, servers: Vec<Server>) -> Vec<Server> {
        match self {
            ServerSelection::One(name) => servers.into_iter().filter(|s| &s.name == name).collect(),
            ServerSelection::All => servers,
            ServerSelection::Include(names) => servers
                .into_iter()
                .filter(|s| names.contains(&s.name))
                .collect(),
            ServerSelection::Exclude(names) => servers
                .into_iter()
                .filter(|s| !names.contains(&s.name))
                .collect(),
        }
    }
}

/// Newline-delimited server names; blank lines and `#` comments are skipped.
pub fn parse_name_list(raw: &str) -> BTreeSet<String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(ToOwned::to_owned)
        .collect()
}

pub fn load_name_list(path: &Path) -> Result<BTreeSet<String>> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read name list {}: {e}", path.display())))?;
    Ok(parse_name_list(&data))
}

/// Look up one server by numeric id or by name. Name lookups prefer an
/// exact match over the first hostname search result.
pub fn resolve_server(api: &dyn BackupApi, arg: &str) -> Result<Server> {
    let arg = arg.trim();
    if let Ok(id) = arg.parse::<u64>() {
        return api.server(id);
    }
    let mut servers = api.servers(Some(arg))?;
    if servers.is_empty() {
        return Err(Error::msg(format!("No server data returned for {arg}")));
    }
    let idx = servers.iter().position(|s| s.name == arg).unwrap_or(0);
    Ok(servers.swap_remove(idx))
}

/// Servers for a selection, fetched fresh from the API.
pub fn select_servers(api: &dyn BackupApi, selection: &ServerSelection) -> Result<Vec<Server>> {
    match selection {
        ServerSelection::One(name) => Ok(vec![resolve_server(api, name)?]),
        other => {
            let servers = other.filter(api.servers(None)?);
            if servers.is_empty() {
                return Err(Error::msg("No server data returned"));
            }
            Ok(servers)
        }
    }
}
