use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Account {
    pub email: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Server {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub vcpus: u32,
    /// Disk size in GB.
    #[serde(default)]
    pub disk: u64,
}

impl Server {
    /// Host part of the name, used in backup file names.
    pub fn short_name(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionStatus {
    InProgress,
    Completed,
    Errored,
    Other(String),
}

impl From<String> for ActionStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "in-progress" => ActionStatus::InProgress,
            "completed" => ActionStatus::Completed,
            "errored" => ActionStatus::Errored,
            _ => ActionStatus::Other(s),
        }
    }
}

impl From<ActionStatus> for String {
    fn from(s: ActionStatus) -> Self {
        s.as_str().to_string()
    }
}

impl ActionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ActionStatus::InProgress => "in-progress",
            ActionStatus::Completed => "completed",
            ActionStatus::Errored => "errored",
            ActionStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ActionProgress {
    pub percent_complete: f64,
    pub current_step_detail: Option<String>,
}

impl ActionProgress {
    pub fn percent(&self) -> u8 {
        self.percent_complete.clamp(0.0, 100.0).round() as u8
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Action {
    pub id: u64,
    pub status: ActionStatus,
    #[serde(default)]
    pub progress: ActionProgress,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BackupInfo {
    pub server_id: Option<u64>,
    pub backup_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Image {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub size_gigabytes: f64,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub backup_info: Option<BackupInfo>,
}

impl Image {
    /// Private images of type `backup`.
    pub fn is_backup(&self) -> bool {
        self.kind == "backup" && !self.public
    }

    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("")
    }

    pub fn owner_server_id(&self) -> Option<u64> {
        self.backup_info.as_ref().and_then(|b| b.server_id)
    }

    pub fn created(&self) -> Result<DateTime<Utc>> {
        parse_provider_timestamp(&self.created_at)
    }
}

/// Provider timestamps look like `2024-03-01T02:00:00Z`; offsets are accepted too.
pub fn parse_provider_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S")
        .map(|n| n.and_utc())
        .map_err(|e| Error::msg(format!("invalid timestamp '{raw}': {e}")))
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DiskLink {
    pub compressed_url: String,
    #[serde(default)]
    pub compressed_size_gigabytes: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DownloadLink {
    pub disks: Vec<DiskLink>,
    pub expiry: Option<String>,
}

impl DownloadLink {
    /// Images may have several disks; only the first one is fetched.
    pub fn primary_url(&self) -> Option<&str> {
        self.disks.first().map(|d| d.compressed_url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_status_maps_known_and_unknown_values() {
        let a: Action = serde_json::from_str(
            r#"{"id": 7, "status": "in-progress", "progress": {"percent_complete": 40, "current_step_detail": "Copying"}}"#,
        )
        .expect("action");
        assert_eq!(a.status, ActionStatus::InProgress);
        assert_eq!(a.progress.percent(), 40);

        let b: Action = serde_json::from_str(r#"{"id": 8, "status": "paused"}"#).expect("action");
        assert_eq!(b.status, ActionStatus::Other("paused".into()));
        assert_eq!(b.progress, ActionProgress::default());
    }

    #[test]
    fn image_backup_filter_and_owner() {
        let img: Image = serde_json::from_str(
            r#"{"id": 11, "full_name": "web1 backup", "created_at": "2024-03-01T02:00:00Z",
                "size_gigabytes": 20, "type": "backup", "public": false,
                "backup_info": {"server_id": 5, "backup_type": "temporary"}}"#,
        )
        .expect("image");
        assert!(img.is_backup());
        assert_eq!(img.owner_server_id(), Some(5));
        assert_eq!(img.size_gigabytes, 20.0);
        let created = img.created().expect("created");
        assert_eq!(created.format("%Y%m%d-%H%M%S").to_string(), "20240301-020000");
    }

    #[test]
    fn timestamps_without_zone_are_utc() {
        let a = parse_provider_timestamp("2024-03-01T02:00:00").expect("naive");
        let b = parse_provider_timestamp("2024-03-01T12:00:00+10:00").expect("offset");
        assert_eq!(a, b);
        assert!(parse_provider_timestamp("yesterday").is_err());
    }

    #[test]
    fn short_name_is_first_label() {
        let s = Server {
            id: 1,
            name: "web1.example.com".into(),
            memory: 2048,
            vcpus: 2,
            disk: 40,
        };
        assert_eq!(s.short_name(), "web1");
    }
}
