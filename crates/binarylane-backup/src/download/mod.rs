//! Resolve a backup image, fetch it into local storage and verify it.

use std::path::PathBuf;
use std::time::Duration;

use crate::api::{BackupApi, Image, Server};
use crate::error::{Error, Result};
use crate::poller::Clock;
use crate::relocate::copy_after_download;
use crate::remote::{RemoteStore, remote_path};
use crate::reporter::CommandCtx;
use crate::storage::{BYTES_PER_MB, Storage, bytes_to_gb, sizes_match};
use crate::verify::{IntegrityTest, test_file};

pub mod transport;

pub use transport::{HttpTransport, Transport, WgetTransport};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Download even when a local copy exists.
    pub force: bool,
    /// Run the integrity tester on the downloaded file.
    pub test: bool,
    /// Copy the file to secondary storage after a successful download.
    pub relocate: bool,
    pub remote: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Downloaded {
        rel: String,
        path: PathBuf,
        size_bytes: u64,
        elapsed: Duration,
    },
    AlreadyExists {
        rel: String,
    },
    AlreadyOnRemote {
        remote_path: String,
    },
    /// A local file exists but its size disagrees with the image.
    Incomplete {
        rel: String,
        size_bytes: u64,
        expected_gb: f64,
    },
    /// Removed after the integrity test failed.
    IntegrityFailed {
        rel: String,
    },
    /// Kept on disk for inspection.
    SizeMismatch {
        rel: String,
        size_bytes: u64,
        expected_gb: f64,
    },
    NoBackups,
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DownloadOutcome::Downloaded { .. })
    }

    /// Downloads and skips both leave a good copy behind; at command level
    /// neither is a failure.
    pub fn counts_as_success(&self) -> bool {
        matches!(
            self,
            DownloadOutcome::Downloaded { .. }
                | DownloadOutcome::AlreadyExists { .. }
                | DownloadOutcome::AlreadyOnRemote { .. }
        )
    }
}

/// Command-level verdict for one server. A server without backups fails a
/// single-server command outright; in a batch it is a failed unit.
pub fn outcome_ok(outcome: &DownloadOutcome, server: &Server, single: bool) -> Result<bool> {
    if single && matches!(outcome, DownloadOutcome::NoBackups) {
        return Err(Error::msg(format!("No backup data returned for {}", server.name)));
    }
    Ok(outcome.counts_as_success())
}

/// Private backup images, ordered by id.
pub fn backup_images(images: Vec<Image>) -> Vec<Image> {
    let mut out: Vec<Image> = images.into_iter().filter(Image::is_backup).collect();
    out.sort_by_key(|i| i.id);
    out
}

/// The most recently created image. Unparseable timestamps fall back to
/// comparing the raw strings.
pub fn latest_backup(images: &[Image]) -> Option<&Image> {
    images.iter().max_by(|a, b| match (a.created(), b.created()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.created_at.cmp(&b.created_at),
    })
}

pub struct Downloader<'a> {
    pub api: &'a dyn BackupApi,
    pub storage: &'a Storage,
    pub transport: &'a dyn Transport,
    pub tester: &'a dyn IntegrityTest,
    pub remote: Option<&'a dyn RemoteStore>,
    pub clock: &'a dyn Clock,
    pub options: DownloadOptions,
}

impl Downloader<'_> {
    pub fn download_latest(&self, server: &Server, ctx: &CommandCtx) -> Result<DownloadOutcome> {
        ctx.section(format!("Downloading backup for {}", server.name));
        let backups = self.api.backups(server)?;
        let Some(image) = latest_backup(&backups) else {
            ctx.warn(format!("No backup data returned for {}", server.name));
            return Ok(DownloadOutcome::NoBackups);
        };
        ctx.debug(format!(
            "latest backup for {} is image {} created {}",
            server.name, image.id, image.created_at
        ));
        self.fetch(server, image, ctx)
    }

    /// One server's unit of work for `download` and `create --download`.
    pub fn download_server(&self, server: &Server, single: bool, ctx: &CommandCtx) -> Result<bool> {
        let outcome = self.download_latest(server, ctx)?;
        outcome_ok(&outcome, server, single)
    }

    pub fn download_image(&self, image_id: u64, ctx: &CommandCtx) -> Result<DownloadOutcome> {
        let image = self.api.image(image_id)?;
        let server_id = image.owner_server_id().ok_or_else(|| {
            Error::msg(format!("Image {image_id} has no owning server; it is not a backup"))
        })?;
        let server = self.api.server(server_id)?;
        ctx.section(format!("Downloading image {image_id} for {}", server.name));
        self.fetch(&server, &image, ctx)
    }

    fn fetch(&self, server: &Server, image: &Image, ctx: &CommandCtx) -> Result<DownloadOutcome> {
        let rel = Storage::backup_rel_path(server, image)?;
        let expected_gb = image.size_gigabytes;

        if !self.options.force {
            if let Some(existing) = self.storage.stat(&rel)? {
                if sizes_match(existing.size, expected_gb) {
                    ctx.notice(format!(
                        "Backup file [{rel}] already exists, use the --force flag to over-ride"
                    ));
                    return Ok(DownloadOutcome::AlreadyExists { rel });
                }
                ctx.warn(format!(
                    "Backup file [{rel}] exists but is {:.2} GB, expected {expected_gb} GB; \
                     download may be incomplete, use the --force flag to download again",
                    bytes_to_gb(existing.size)
                ));
                return Ok(DownloadOutcome::Incomplete {
                    rel,
                    size_bytes: existing.size,
                    expected_gb,
                });
            }
            if let Some(target) = self.remote_target(&rel) {
                let (store, rp) = target?;
                if store.stat(&rp)?.is_some() {
                    ctx.notice(format!("Backup file already exists on remote [{rp}]"));
                    return Ok(DownloadOutcome::AlreadyOnRemote { remote_path: rp });
                }
            }
        }

        let link = self.api.link(image.id)?;
        let url = link
            .primary_url()
            .ok_or_else(|| Error::msg(format!("No download link found for image {}", image.id)))?;
        let path = self.storage.ensure_parent(&rel)?;

        ctx.notice(format!("Downloading [{rel}] ({expected_gb} GB)"));
        tracing::info!(command = ctx.command, url, path = %path.display(), "Downloading image");

        let start = self.clock.now();
        ctx.progress_start("");
        let res = self.transport.fetch(url, &path, &mut |done, total| {
            if let Some(total) = total.filter(|t| *t > 0) {
                ctx.progress((done.saturating_mul(100) / total).min(100) as u8, None);
            }
        });
        ctx.progress_finish();
        res?;
        let elapsed = self.clock.now().saturating_sub(start);
        ctx.notice(format!(
            "Completed download for {} in {:.1} seconds",
            server.name,
            elapsed.as_secs_f64()
        ));

        if self.options.test && !test_file(self.tester, &path, ctx)? {
            self.storage.delete(&rel)?;
            ctx.info(format!("Removed [{rel}]"));
            return Ok(DownloadOutcome::IntegrityFailed { rel });
        }

        let size_bytes = self
            .storage
            .stat(&rel)?
            .map(|f| f.size)
            .ok_or_else(|| Error::msg(format!("Downloaded file [{rel}] is missing")))?;
        if !sizes_match(size_bytes, expected_gb) {
            ctx.error(format!(
                "Download size of {:.2} GB does not match expected {expected_gb} GB",
                bytes_to_gb(size_bytes)
            ));
            return Ok(DownloadOutcome::SizeMismatch {
                rel,
                size_bytes,
                expected_gb,
            });
        }

        ctx.notice(format!(
            "Successfully downloaded {:.2} GB to [{rel}] ({})",
            bytes_to_gb(size_bytes),
            throughput(size_bytes, elapsed)
        ));

        if let Some(target) = self.remote_target(&rel) {
            let (store, rp) = target?;
            copy_after_download(store, &path, &rp, size_bytes, self.clock, ctx)?;
        }

        Ok(DownloadOutcome::Downloaded {
            rel,
            path,
            size_bytes,
            elapsed,
        })
    }

    /// Store and remote path when relocation is requested.
    fn remote_target(&self, rel: &str) -> Option<Result<(&dyn RemoteStore, String)>> {
        if !self.options.relocate {
            return None;
        }
        let res = match (self.remote, self.options.remote.as_deref()) {
            (Some(store), Some(remote)) if !remote.trim().is_empty() => {
                Ok((store, remote_path(remote, rel)))
            }
            _ => Err(Error::msg(
                "No remote configured - specify RCLONE_REMOTE or use --remote option",
            )),
        };
        Some(res)
    }
}

/// `"12.3 MB/s"`; an instant transfer reports the size alone.
pub fn throughput(bytes: u64, elapsed: Duration) -> String {
    let mb = bytes as f64 / BYTES_PER_MB;
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return format!("{mb:.1} MB");
    }
    format!("{:.1} MB/s", mb / secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: u64, created_at: &str, kind: &str, public: bool) -> Image {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "created_at": created_at,
            "size_gigabytes": 20.0,
            "type": kind,
            "public": public,
        }))
        .expect("image")
    }

    #[test]
    fn latest_is_by_creation_time_not_position() {
        let images = vec![
            image(3, "2024-03-02T02:00:00Z", "backup", false),
            image(9, "2024-03-01T02:00:00Z", "backup", false),
            image(5, "2024-03-03T01:00:00+10:00", "backup", false),
        ];
        // 01:00+10:00 on the 3rd is 15:00 UTC on the 2nd.
        assert_eq!(latest_backup(&images).map(|i| i.id), Some(5));
        assert!(latest_backup(&[]).is_none());
    }

    #[test]
    fn only_private_backups_are_listed() {
        let images = vec![
            image(7, "2024-03-02T02:00:00Z", "backup", false),
            image(2, "2024-03-02T02:00:00Z", "distribution", true),
            image(4, "2024-03-02T02:00:00Z", "backup", true),
            image(1, "2024-03-02T02:00:00Z", "backup", false),
        ];
        let ids: Vec<u64> = backup_images(images).into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 7]);
    }

    #[test]
    fn throughput_formats_megabytes_per_second() {
        let bytes = 100 * 1024 * 1024;
        assert_eq!(throughput(bytes, Duration::from_secs(4)), "25.0 MB/s");
        assert_eq!(throughput(bytes, Duration::ZERO), "100.0 MB");
    }

    #[test]
    fn skips_count_as_success_but_no_backups_depends_on_mode() {
        let server = Server {
            id: 5,
            name: "web1".into(),
            memory: 1024,
            vcpus: 1,
            disk: 20,
        };
        let skip = DownloadOutcome::AlreadyExists { rel: "web1/a.zst".into() };
        assert!(skip.counts_as_success());
        assert!(outcome_ok(&skip, &server, true).expect("verdict"));

        let none = DownloadOutcome::NoBackups;
        assert!(!outcome_ok(&none, &server, false).expect("batch verdict"));
        let err = outcome_ok(&none, &server, true).expect_err("single");
        assert_eq!(err.to_string(), "No backup data returned for web1");

        let bad = DownloadOutcome::IntegrityFailed { rel: "web1/a.zst".into() };
        assert!(!outcome_ok(&bad, &server, true).expect("verdict"));
    }

    #[test]
    fn only_downloaded_is_success() {
        assert!(!DownloadOutcome::NoBackups.is_success());
        assert!(
            DownloadOutcome::Downloaded {
                rel: "a".into(),
                path: PathBuf::from("/a"),
                size_bytes: 1,
                elapsed: Duration::ZERO,
            }
            .is_success()
        );
    }
}
