use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::api::{Image, Server};
use crate::error::{Error, Result};

pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Declared and measured sizes within this many GB are considered equal.
pub const SIZE_TOLERANCE_GB: f64 = 0.01;

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

pub fn sizes_match(bytes: u64, expected_gb: f64) -> bool {
    (bytes_to_gb(bytes) - expected_gb).abs() <= SIZE_TOLERANCE_GB
}

/// A file under the downloads root.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    /// Path relative to the root, `/`-separated.
    pub rel: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<server-name>/backup-<short-name>-<YYYYmmdd-HHMMSS>-<image-id>.zst`
    pub fn backup_rel_path(server: &Server, image: &Image) -> Result<String> {
        validate_component(&server.name)?;
        let stamp = image.created()?.format("%Y%m%d-%H%M%S");
        Ok(format!(
            "{}/backup-{}-{}-{}.zst",
            server.name,
            server.short_name(),
            stamp,
            image.id
        ))
    }

    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let rel = rel.trim().trim_start_matches('/');
        if rel.is_empty() {
            return Err(Error::msg("empty relative path"));
        }
        let rel_pb = Path::new(rel);
        if rel_pb
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(Error::msg(format!(
                "invalid relative path '{}' (contains '..')",
                rel
            )));
        }
        Ok(self.root.join(rel_pb))
    }

    pub fn ensure_parent(&self, rel: &str) -> Result<PathBuf> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        Ok(path)
    }

    pub fn stat(&self, rel: &str) -> Result<Option<StoredFile>> {
        let path = self.resolve(rel)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(StoredFile {
                rel: normalize_rel(rel),
                size: meta.len(),
                modified: to_utc(meta.modified()?),
                path,
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::msg(format!("failed to stat {}: {e}", path.display()))),
        }
    }

    pub fn exists(&self, rel: &str) -> bool {
        matches!(self.stat(rel), Ok(Some(_)))
    }

    /// Every regular file under the root, sorted by relative path.
    /// A missing root is treated as empty.
    pub fn all_files(&self) -> Result<Vec<StoredFile>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry.metadata()?;
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| Error::msg(format!("path outside downloads root: {e}")))?;
            out.push(StoredFile {
                rel: rel_string(rel),
                path: entry.path().to_path_buf(),
                size: meta.len(),
                modified: to_utc(meta.modified()?),
            });
        }
        out.sort_by(|a, b| a.rel.cmp(&b.rel));
        Ok(out)
    }

    pub fn delete(&self, rel: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        fs::remove_file(&path)
            .map_err(|e| Error::msg(format!("failed to delete {}: {e}", path.display())))
    }
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

fn validate_component(name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\')
    {
        return Err(Error::msg(format!(
            "server name '{name}' cannot be used as a directory name"
        )));
    }
    Ok(())
}

fn to_utc(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

fn rel_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn normalize_rel(rel: &str) -> String {
    rel_string(Path::new(rel.trim().trim_start_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str) -> Server {
        Server {
            id: 3,
            name: name.into(),
            memory: 1024,
            vcpus: 1,
            disk: 20,
        }
    }

    fn image(created_at: &str) -> Image {
        serde_json::from_value(serde_json::json!({
            "id": 991,
            "created_at": created_at,
            "size_gigabytes": 20.0,
            "type": "backup",
        }))
        .expect("image")
    }

    #[test]
    fn backup_path_is_deterministic() {
        let p = Storage::backup_rel_path(&server("web1.example.com"), &image("2024-03-01T02:03:04Z"))
            .expect("path");
        assert_eq!(p, "web1.example.com/backup-web1-20240301-020304-991.zst");
    }

    #[test]
    fn unusable_server_names_are_rejected() {
        assert!(Storage::backup_rel_path(&server("../etc"), &image("2024-03-01T02:03:04Z")).is_err());
        assert!(Storage::backup_rel_path(&server("  "), &image("2024-03-01T02:03:04Z")).is_err());
    }

    #[test]
    fn resolve_refuses_parent_components() {
        let s = Storage::new("/srv/backups");
        assert_eq!(
            s.resolve("web1/a.zst").expect("resolve"),
            PathBuf::from("/srv/backups/web1/a.zst")
        );
        assert!(s.resolve("../a.zst").is_err());
        assert!(s.resolve("").is_err());
    }

    #[test]
    fn tolerant_size_comparison() {
        let twenty_gb = 20 * 1024 * 1024 * 1024u64;
        assert!(sizes_match(twenty_gb, 20.0));
        // Off by a few KB: not bit-identical after division, still equal.
        assert!(sizes_match(twenty_gb - 4096, 20.0));
        assert!(bytes_to_gb(twenty_gb - 4096) != 20.0);
        assert!(!sizes_match(twenty_gb / 2, 20.0));
    }

    #[test]
    fn all_files_lists_nested_files_sorted() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let s = Storage::new(tmp.path());
        fs::create_dir_all(tmp.path().join("b")).expect("mkdir");
        fs::create_dir_all(tmp.path().join("a")).expect("mkdir");
        fs::write(tmp.path().join("b/2.zst"), b"xx").expect("write");
        fs::write(tmp.path().join("a/1.zst"), b"x").expect("write");
        let files = s.all_files().expect("list");
        let rels: Vec<_> = files.iter().map(|f| f.rel.as_str()).collect();
        assert_eq!(rels, vec!["a/1.zst", "b/2.zst"]);
        assert_eq!(files[1].size, 2);

        assert!(s.exists("a/1.zst"));
        s.delete("a/1.zst").expect("delete");
        assert!(!s.exists("a/1.zst"));
        assert!(s.stat("a").expect("stat dir").is_none());
    }

    #[test]
    fn missing_root_is_empty() {
        let s = Storage::new("/nonexistent/blbackup-test-root");
        assert!(s.all_files().expect("list").is_empty());
    }
}
