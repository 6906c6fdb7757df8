use std::path::Path;
use std::process::Command;

use chrono::{DateTime, FixedOffset};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::process::{Stream, command_summary, is_not_found_text, run_output, run_streaming};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteEntry {
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: i64,
    pub mod_time: DateTime<FixedOffset>,
    #[serde(default)]
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Keep the local file.
    Copy,
    /// Remove the local file once the remote copy is verified.
    Move,
}

pub trait RemoteStore {
    /// Succeeds when the remote (`name:path`) can be listed.
    fn validate(&self, remote: &str) -> Result<()>;
    fn list(&self, remote: &str, recursive: bool) -> Result<Vec<RemoteEntry>>;
    /// `None` when nothing exists at `remote_path`.
    fn stat(&self, remote_path: &str) -> Result<Option<RemoteEntry>>;
    fn transfer(
        &self,
        local: &Path,
        remote_path: &str,
        mode: TransferMode,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<()>;
    fn delete_file(&self, remote_path: &str) -> Result<()>;
}

/// Join a remote root and a relative path with exactly one `/`.
pub fn remote_path(remote: &str, rel: &str) -> String {
    format!(
        "{}/{}",
        remote.trim_end_matches('/'),
        rel.trim_start_matches('/')
    )
}

pub fn parse_listing(raw: &str) -> Result<Vec<RemoteEntry>> {
    serde_json::from_str(raw)
        .map_err(|e| Error::msg(format!("Could not decode json data for remote file list: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcloneVerbosity {
    Quiet,
    Normal,
    Verbose,
}

pub struct Rclone {
    binary: String,
    verbosity: RcloneVerbosity,
}

impl Rclone {
    pub fn new(binary: impl Into<String>, verbosity: RcloneVerbosity) -> Self {
        Self {
            binary: binary.into(),
            verbosity,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        match self.verbosity {
            RcloneVerbosity::Quiet => {
                cmd.arg("--quiet");
            }
            RcloneVerbosity::Verbose => {
                cmd.arg("--verbose");
            }
            RcloneVerbosity::Normal => {}
        }
        cmd
    }
}

impl RemoteStore for Rclone {
    fn validate(&self, remote: &str) -> Result<()> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("lsd").arg("--quiet").arg(remote);
        let out = run_output(&mut cmd)?;
        if out.status.success() {
            return Ok(());
        }
        Err(Error::msg(format!(
            "Could not get remote directory list: {}",
            command_summary(&out)
        )))
    }

    fn list(&self, remote: &str, recursive: bool) -> Result<Vec<RemoteEntry>> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("lsjson");
        if recursive {
            cmd.arg("-R");
        }
        cmd.arg(remote.trim_end_matches('/'));
        let out = run_output(&mut cmd)?;
        if !out.status.success() {
            return Err(Error::msg(format!(
                "Could not get remote file list: {}",
                command_summary(&out)
            )));
        }
        parse_listing(&String::from_utf8_lossy(&out.stdout))
    }

    fn stat(&self, remote_path: &str) -> Result<Option<RemoteEntry>> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("lsjson").arg("--stat").arg(remote_path);
        let out = run_output(&mut cmd)?;
        if !out.status.success() {
            let msg = command_summary(&out);
            if is_not_found_text(&msg) {
                return Ok(None);
            }
            return Err(Error::msg(format!("Could not stat remote file: {msg}")));
        }
        let entry: RemoteEntry = serde_json::from_slice(&out.stdout)
            .map_err(|e| Error::msg(format!("Could not decode remote stat: {e}")))?;
        Ok(Some(entry))
    }

    fn transfer(
        &self,
        local: &Path,
        remote_path: &str,
        mode: TransferMode,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("--progress")
            .arg(match mode {
                TransferMode::Copy => "copyto",
                TransferMode::Move => "moveto",
            })
            .arg(local)
            .arg(remote_path);
        // rclone writes --progress output to stdout.
        let res = run_streaming(cmd, |stream, line| {
            if stream == Stream::Stdout {
                on_line(line);
            }
        })?;
        if res.success() {
            return Ok(());
        }
        Err(Error::msg(format!(
            "Could not move file to secondary storage: {}",
            res.error_summary()
        )))
    }

    fn delete_file(&self, remote_path: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("deletefile").arg(remote_path);
        let out = run_output(&mut cmd)?;
        if out.status.success() {
            return Ok(());
        }
        Err(Error::msg(format!(
            "Could not delete old backup file from remote filesystem: {}",
            command_summary(&out)
        )))
    }
}
