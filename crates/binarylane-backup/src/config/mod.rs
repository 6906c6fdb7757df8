use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, TimeZone, Utc};
use serde::Deserialize;

use crate::backup::BatchPolicy;
use crate::error::{Error, Result};

pub const CONFIG_ENV: &str = "BINARYLANE_CONFIG";

fn default_api_url() -> String {
    "https://api.binarylane.com.au/v2".into()
}

fn default_timeout() -> u64 {
    3600
}

fn default_poll_interval() -> u64 {
    15
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("storage/downloads")
}

fn default_zstd() -> String {
    "/usr/bin/zstd".into()
}

fn default_keeponly_days() -> i64 {
    7
}

fn default_rclone() -> String {
    "/usr/bin/rclone".into()
}

fn default_wget() -> String {
    "/usr/bin/wget".into()
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadTool {
    #[default]
    Http,
    Wget,
}

impl DownloadTool {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "http" | "" => Ok(DownloadTool::Http),
            "wget" => Ok(DownloadTool::Wget),
            other => Err(Error::msg(format!(
                "invalid DOWNLOAD_TOOL '{other}' (expected http or wget)"
            ))),
        }
    }
}

/// Timezone used when rendering timestamps for the operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisplayZone {
    #[default]
    Local,
    Utc,
    Fixed(FixedOffset),
}

impl DisplayZone {
    pub fn parse(raw: &str) -> Result<Self> {
        let s = raw.trim();
        match s.to_ascii_lowercase().as_str() {
            "" | "local" => return Ok(DisplayZone::Local),
            "utc" | "z" | "gmt" => return Ok(DisplayZone::Utc),
            _ => {}
        }
        parse_offset(s)
            .map(DisplayZone::Fixed)
            .ok_or_else(|| Error::msg(format!("invalid timezone '{s}' (use local, utc or +HH:MM)")))
    }

    pub fn format(&self, at: &DateTime<Utc>) -> String {
        const FMT: &str = "%Y-%m-%d %H:%M:%S";
        match self {
            DisplayZone::Local => at.with_timezone(&Local).format(FMT).to_string(),
            DisplayZone::Utc => at.format(FMT).to_string(),
            DisplayZone::Fixed(off) => off.from_utc_datetime(&at.naive_utc()).format(FMT).to_string(),
        }
    }
}

fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    if !rest.is_ascii() {
        return None;
    }
    let (h, m) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };
    let h: i32 = h.parse().ok()?;
    let m: i32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (h * 3600 + m * 60))
}

impl<'de> Deserialize<'de> for DisplayZone {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DisplayZone::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_token: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
    #[serde(default = "default_zstd")]
    pub zstd_binary: String,
    #[serde(default = "default_keeponly_days")]
    pub keeponly_days: i64,
    #[serde(default = "default_rclone")]
    pub rclone_binary: String,
    pub rclone_remote: Option<String>,
    pub timezone: DisplayZone,
    pub download_tool: DownloadTool,
    #[serde(default = "default_wget")]
    pub wget_binary: String,
    pub batch_fail_on_error: bool,
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_token: None,
            api_url: default_api_url(),
            timeout_secs: default_timeout(),
            poll_interval_secs: default_poll_interval(),
            downloads_dir: default_downloads_dir(),
            zstd_binary: default_zstd(),
            keeponly_days: default_keeponly_days(),
            rclone_binary: default_rclone(),
            rclone_remote: None,
            timezone: DisplayZone::Local,
            download_tool: DownloadTool::Http,
            wget_binary: default_wget(),
            batch_fail_on_error: false,
            log_file: None,
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    /// Defaults, then the optional TOML file, then the environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        let path = config_path.map(Path::to_path_buf).or(from_env);
        let mut settings = match path {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
        Self::from_toml_str(&data)
            .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))
    }

    pub fn from_toml_str(data: &str) -> Result<Self> {
        Ok(toml::from_str(data)?)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("BINARYLANE_API_TOKEN") {
            self.api_token = Some(v);
        }
        if let Some(v) = get("BINARYLANE_API_URL") {
            self.api_url = v;
        }
        if let Some(v) = get("TIMEOUT") {
            self.timeout_secs = parse_u64("TIMEOUT", &v)?;
        }
        if let Some(v) = get("POLL_INTERVAL") {
            self.poll_interval_secs = parse_u64("POLL_INTERVAL", &v)?;
        }
        if let Some(v) = get("DOWNLOADS_PATH") {
            self.downloads_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ZSTD_BINARY") {
            self.zstd_binary = v;
        }
        if let Some(v) = get("KEEPONLY_DAYS") {
            self.keeponly_days = parse_days("KEEPONLY_DAYS", &v)?;
        }
        if let Some(v) = get("RCLONE_BINARY") {
            self.rclone_binary = v;
        }
        if let Some(v) = get("RCLONE_REMOTE") {
            self.rclone_remote = Some(v);
        }
        if let Some(v) = get("DISPLAY_TIMEZONE") {
            self.timezone = DisplayZone::parse(&v)?;
        }
        if let Some(v) = get("DOWNLOAD_TOOL") {
            self.download_tool = DownloadTool::parse(&v)?;
        }
        if let Some(v) = get("WGET_BINARY") {
            self.wget_binary = v;
        }
        if let Some(v) = get("BATCH_FAIL_ON_ERROR") {
            self.batch_fail_on_error = parse_bool("BATCH_FAIL_ON_ERROR", &v)?;
        }
        if let Some(v) = get("LOG_FILE") {
            self.log_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }

    pub fn api_token(&self) -> Result<&str> {
        self.api_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::msg("BINARYLANE_API_TOKEN is not set"))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        if self.batch_fail_on_error {
            BatchPolicy::FailOnError
        } else {
            BatchPolicy::ContinueOnError
        }
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64> {
    raw.parse::<u64>()
        .map_err(|_| Error::msg(format!("invalid {key} '{raw}' (expected whole seconds)")))
}

/// Whole non-negative days; fractional input is truncated.
pub fn parse_days(key: &str, raw: &str) -> Result<i64> {
    let raw = raw.trim();
    let days = match raw.parse::<i64>() {
        Ok(d) => Some(d),
        Err(_) => raw
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite())
            .map(|d| d.trunc() as i64),
    };
    days.filter(|d| *d >= 0)
        .ok_or_else(|| Error::msg(format!("invalid {key} '{raw}' (expected a number of days)")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::msg(format!("invalid {key} '{raw}' (expected true or false)"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.timeout_secs, 3600);
        assert_eq!(s.keeponly_days, 7);
        assert_eq!(s.zstd_binary, "/usr/bin/zstd");
        assert_eq!(s.download_tool, DownloadTool::Http);
        assert_eq!(s.batch_policy(), BatchPolicy::ContinueOnError);
        assert!(s.api_token().is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut s = Settings::from_toml_str(
            r#"
timeout_secs = 120
rclone_remote = "file-remote:"
download_tool = "wget"
timezone = "+10:00"
"#,
        )
        .expect("toml");
        assert_eq!(s.timeout_secs, 120);
        assert_eq!(s.download_tool, DownloadTool::Wget);

        let vars = env(&[
            ("TIMEOUT", "90"),
            ("RCLONE_REMOTE", "b2:backups"),
            ("KEEPONLY_DAYS", "3.9"),
            ("BATCH_FAIL_ON_ERROR", "yes"),
            ("BINARYLANE_API_TOKEN", " secret "),
        ]);
        s.apply_env(|k| vars.get(k).cloned()).expect("env");
        assert_eq!(s.timeout_secs, 90);
        assert_eq!(s.rclone_remote.as_deref(), Some("b2:backups"));
        assert_eq!(s.keeponly_days, 3);
        assert_eq!(s.batch_policy(), BatchPolicy::FailOnError);
        assert_eq!(s.api_token().expect("token"), "secret");
    }

    #[test]
    fn invalid_env_values_are_rejected() {
        let mut s = Settings::default();
        let vars = env(&[("TIMEOUT", "soon")]);
        assert!(s.apply_env(|k| vars.get(k).cloned()).is_err());

        let vars = env(&[("DOWNLOAD_TOOL", "curl")]);
        assert!(s.apply_env(|k| vars.get(k).cloned()).is_err());
    }

    #[test]
    fn display_zone_parses_offsets() {
        assert_eq!(DisplayZone::parse("UTC").expect("utc"), DisplayZone::Utc);
        let z = DisplayZone::parse("+10:00").expect("offset");
        let at = DateTime::parse_from_rfc3339("2024-03-01T02:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        assert_eq!(z.format(&at), "2024-03-01 12:00:00");
        assert!(DisplayZone::parse("Mars/Olympus").is_err());
    }

    #[test]
    fn non_ascii_offsets_are_rejected() {
        assert!(DisplayZone::parse("+€1").is_err());
        assert!(DisplayZone::parse("-1€").is_err());
        assert!(DisplayZone::parse("+１０:００").is_err());
    }

    #[test]
    fn retention_days_must_not_be_negative() {
        assert_eq!(parse_days("--days", "0").expect("zero"), 0);
        assert_eq!(parse_days("--days", "-0.5").expect("truncates to zero"), 0);
        assert!(parse_days("--days", "-1").is_err());
        assert!(parse_days("KEEPONLY_DAYS", "-3.2").is_err());

        let mut s = Settings::default();
        let vars = env(&[("KEEPONLY_DAYS", "-7")]);
        assert!(s.apply_env(|k| vars.get(k).cloned()).is_err());
        assert_eq!(s.keeponly_days, 7);
    }
}
