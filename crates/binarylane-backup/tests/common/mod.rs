#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use binarylane_backup::api::{
    Account, Action, ActionProgress, ActionStatus, BackupApi, DiskLink, DownloadLink, Image, Server,
};
use binarylane_backup::download::transport::{ProgressFn, Transport};
use binarylane_backup::poller::Clock;
use binarylane_backup::remote::{RemoteEntry, RemoteStore, TransferMode};
use binarylane_backup::reporter::{CommandCtx, MemoryReporter};
use binarylane_backup::verify::{IntegrityReport, IntegrityTest};
use binarylane_backup::{Error, Result};

pub const GB: u64 = 1024 * 1024 * 1024;

pub fn server(id: u64, name: &str, disk: u64) -> Server {
    Server {
        id,
        name: name.to_string(),
        memory: 2048,
        vcpus: 2,
        disk,
    }
}

pub fn backup_image(id: u64, server_id: u64, created_at: &str, size_gb: f64) -> Image {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "name": format!("backup-{id}"),
        "full_name": format!("server {server_id} backup {id}"),
        "created_at": created_at,
        "size_gigabytes": size_gb,
        "type": "backup",
        "public": false,
        "backup_info": {"server_id": server_id, "backup_type": "temporary"},
    }))
    .expect("image json")
}

pub fn ctx(command: &'static str) -> (CommandCtx, Arc<MemoryReporter>) {
    let mem = Arc::new(MemoryReporter::default());
    (CommandCtx::new(command, mem.clone()), mem)
}

pub fn image_url(image_id: u64) -> String {
    format!("https://dl.example.test/images/{image_id}.zst")
}

/// In-memory provider. Backup actions get id `server_id * 100` and replay
/// the scripted statuses for that server; the last status repeats.
#[derive(Default)]
pub struct FakeApi {
    pub servers: Vec<Server>,
    pub backups: HashMap<u64, Vec<Image>>,
    pub scripts: RefCell<HashMap<u64, VecDeque<&'static str>>>,
    last_status: RefCell<HashMap<u64, &'static str>>,
    /// Servers whose backup request is rejected by the provider.
    pub reject_create: HashSet<u64>,
    pub created: RefCell<Vec<u64>>,
    pub action_calls: Cell<u32>,
    pub link_calls: Cell<u32>,
}

impl FakeApi {
    pub fn with_servers(servers: Vec<Server>) -> Self {
        Self {
            servers,
            ..Self::default()
        }
    }

    pub fn script(&self, server_id: u64, statuses: &[&'static str]) {
        self.scripts
            .borrow_mut()
            .insert(server_id, statuses.iter().copied().collect());
    }

    fn all_images(&self) -> Vec<Image> {
        self.backups.values().flatten().cloned().collect()
    }
}

impl BackupApi for FakeApi {
    fn account(&self) -> Result<Account> {
        Ok(Account {
            email: "ops@example.test".into(),
            status: "active".into(),
        })
    }

    fn servers(&self, hostname: Option<&str>) -> Result<Vec<Server>> {
        Ok(self
            .servers
            .iter()
            .filter(|s| hostname.is_none_or(|h| s.name.contains(h)))
            .cloned()
            .collect())
    }

    fn server(&self, server_id: u64) -> Result<Server> {
        self.servers
            .iter()
            .find(|s| s.id == server_id)
            .cloned()
            .ok_or_else(|| Error::api(format!("Could not fetch server information {server_id}"), 404, "Not Found"))
    }

    fn create_backup(&self, server: &Server) -> Result<Action> {
        self.created.borrow_mut().push(server.id);
        if self.reject_create.contains(&server.id) {
            return Err(Error::api(
                format!("Could not initiate server backup for {}", server.name),
                500,
                "Internal Server Error",
            ));
        }
        Ok(Action {
            id: server.id * 100,
            status: ActionStatus::InProgress,
            progress: ActionProgress::default(),
        })
    }

    fn action(&self, action_id: u64) -> Result<Action> {
        self.action_calls.set(self.action_calls.get() + 1);
        let server_id = action_id / 100;
        let next = self
            .scripts
            .borrow_mut()
            .get_mut(&server_id)
            .and_then(VecDeque::pop_front);
        let status = match next {
            Some(s) => {
                self.last_status.borrow_mut().insert(server_id, s);
                s
            }
            None => self
                .last_status
                .borrow()
                .get(&server_id)
                .copied()
                .unwrap_or("in-progress"),
        };
        let percent = if status == "completed" { 100.0 } else { 50.0 };
        Ok(Action {
            id: action_id,
            status: ActionStatus::from(status.to_string()),
            progress: ActionProgress {
                percent_complete: percent,
                current_step_detail: Some(format!("Backup {status}")),
            },
        })
    }

    fn backups(&self, server: &Server) -> Result<Vec<Image>> {
        Ok(self.backups.get(&server.id).cloned().unwrap_or_default())
    }

    fn images(&self) -> Result<Vec<Image>> {
        Ok(self.all_images())
    }

    fn image(&self, image_id: u64) -> Result<Image> {
        self.all_images()
            .into_iter()
            .find(|i| i.id == image_id)
            .ok_or_else(|| Error::api(format!("Could not fetch image {image_id}"), 404, "Not Found"))
    }

    fn link(&self, image_id: u64) -> Result<DownloadLink> {
        self.link_calls.set(self.link_calls.get() + 1);
        Ok(DownloadLink {
            disks: vec![DiskLink {
                compressed_url: image_url(image_id),
                compressed_size_gigabytes: None,
            }],
            expiry: None,
        })
    }
}

/// Time only moves when something sleeps.
#[derive(Default)]
pub struct ManualClock {
    now: Cell<Duration>,
    pub sleeps: Cell<u32>,
}

impl ManualClock {
    pub fn elapsed(&self) -> Duration {
        self.now.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, d: Duration) {
        self.now.set(self.now.get() + d);
        self.sleeps.set(self.sleeps.get() + 1);
    }
}

/// Writes sparse files of a configured size without touching the network.
#[derive(Default)]
pub struct FakeTransport {
    pub sizes: HashMap<String, u64>,
    pub fetched: RefCell<Vec<String>>,
}

impl FakeTransport {
    pub fn serving(url: String, size: u64) -> Self {
        Self {
            sizes: HashMap::from([(url, size)]),
            ..Self::default()
        }
    }
}

impl Transport for FakeTransport {
    fn fetch(&self, url: &str, dest: &Path, progress: &mut ProgressFn<'_>) -> Result<u64> {
        self.fetched.borrow_mut().push(url.to_string());
        let size = *self
            .sizes
            .get(url)
            .ok_or_else(|| Error::api("Download failed", 404, "Not Found"))?;
        progress(0, Some(size));
        File::create(dest)?.set_len(size)?;
        progress(size, Some(size));
        Ok(size)
    }
}

pub struct FakeTester {
    pub pass: bool,
    pub tested: RefCell<Vec<PathBuf>>,
}

impl FakeTester {
    pub fn passing() -> Self {
        Self {
            pass: true,
            tested: RefCell::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            pass: false,
            tested: RefCell::new(Vec::new()),
        }
    }
}

impl IntegrityTest for FakeTester {
    fn test(&self, path: &Path) -> Result<IntegrityReport> {
        self.tested.borrow_mut().push(path.to_path_buf());
        Ok(IntegrityReport {
            passed: self.pass,
            output: if self.pass {
                String::new()
            } else {
                "Data corruption detected".into()
            },
        })
    }
}

/// Secondary storage double. `Move` transfers remove the local file the way
/// rclone's `moveto` does.
#[derive(Default)]
pub struct FakeRemote {
    pub invalid: bool,
    pub existing: RefCell<HashSet<String>>,
    pub listing: RefCell<Option<Vec<RemoteEntry>>>,
    pub fail_transfer: HashSet<String>,
    pub fail_delete: HashSet<String>,
    pub transfers: RefCell<Vec<(PathBuf, String, TransferMode)>>,
    pub deleted: RefCell<Vec<String>>,
}

impl FakeRemote {
    pub fn with_listing(entries: Vec<RemoteEntry>) -> Self {
        Self {
            listing: RefCell::new(Some(entries)),
            ..Self::default()
        }
    }
}

impl RemoteStore for FakeRemote {
    fn validate(&self, remote: &str) -> Result<()> {
        if self.invalid {
            return Err(Error::msg(format!(
                "Could not get remote directory list: didn't find section in config file ({remote})"
            )));
        }
        Ok(())
    }

    fn list(&self, _remote: &str, _recursive: bool) -> Result<Vec<RemoteEntry>> {
        self.listing
            .borrow()
            .clone()
            .ok_or_else(|| Error::msg("Could not get remote file list: directory not found"))
    }

    fn stat(&self, remote_path: &str) -> Result<Option<RemoteEntry>> {
        if !self.existing.borrow().contains(remote_path) {
            return Ok(None);
        }
        Ok(Some(RemoteEntry {
            path: remote_path.to_string(),
            name: remote_path.rsplit('/').next().unwrap_or_default().to_string(),
            size: 0,
            mod_time: chrono::DateTime::parse_from_rfc3339("2024-03-01T02:00:00+00:00")
                .expect("timestamp"),
            is_dir: false,
        }))
    }

    fn transfer(
        &self,
        local: &Path,
        remote_path: &str,
        mode: TransferMode,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<()> {
        if self.fail_transfer.contains(remote_path) {
            return Err(Error::msg(
                "Could not move file to secondary storage: permission denied",
            ));
        }
        on_line("Transferred:   1 GiB / 2 GiB, 50%, 10 MiB/s, ETA 1m");
        on_line("Transferred:   2 GiB / 2 GiB, 100%, 10 MiB/s, ETA 0s");
        self.transfers
            .borrow_mut()
            .push((local.to_path_buf(), remote_path.to_string(), mode));
        self.existing.borrow_mut().insert(remote_path.to_string());
        if mode == TransferMode::Move {
            std::fs::remove_file(local)?;
        }
        Ok(())
    }

    fn delete_file(&self, remote_path: &str) -> Result<()> {
        if self.fail_delete.contains(remote_path) {
            return Err(Error::msg(format!(
                "Could not delete old backup file from remote filesystem: {remote_path}: access denied"
            )));
        }
        self.deleted.borrow_mut().push(remote_path.to_string());
        Ok(())
    }
}

pub fn remote_entry(path: &str, mod_time: &str, is_dir: bool) -> RemoteEntry {
    RemoteEntry {
        path: path.to_string(),
        name: path.rsplit('/').next().unwrap_or_default().to_string(),
        size: if is_dir { -1 } else { 1024 },
        mod_time: chrono::DateTime::parse_from_rfc3339(mod_time).expect("mod time"),
        is_dir,
    }
}
