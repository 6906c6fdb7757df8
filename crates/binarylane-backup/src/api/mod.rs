use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

pub mod models;

pub use models::{
    Account, Action, ActionProgress, ActionStatus, BackupInfo, DiskLink, DownloadLink, Image,
    Server,
};

pub const BACKUP_LABEL: &str = "API initiated backup";

/// The provider endpoints the tool uses. `ApiClient` talks HTTP; tests supply fakes.
pub trait BackupApi {
    fn account(&self) -> Result<Account>;
    fn servers(&self, hostname: Option<&str>) -> Result<Vec<Server>>;
    fn server(&self, server_id: u64) -> Result<Server>;
    fn create_backup(&self, server: &Server) -> Result<Action>;
    fn action(&self, action_id: u64) -> Result<Action>;
    fn backups(&self, server: &Server) -> Result<Vec<Image>>;
    fn images(&self) -> Result<Vec<Image>>;
    fn image(&self, image_id: u64) -> Result<Image>;
    fn link(&self, image_id: u64) -> Result<DownloadLink>;
}

pub struct ApiClient {
    base_url: String,
    token: String,
    client: Client,
}

impl ApiClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("blbackup/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn send(&self, req: RequestBuilder, context: &str) -> Result<Value> {
        let res = req
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .map_err(|e| Error::msg(format!("{context}: {e}")))?;
        let status = res.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("Unknown");
            return Err(Error::api(context, status.as_u16(), reason));
        }
        res.json::<Value>()
            .map_err(|e| Error::msg(format!("{context}: invalid response body: {e}")))
    }

    fn get_one<T: DeserializeOwned>(&self, path: &str, key: &str, context: &str) -> Result<T> {
        let body = self.send(self.client.get(self.url(path)), context)?;
        take_key(body, key, context)
    }

    // Follows `links.pages.next` until the provider stops returning one.
    fn get_list<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        key: &str,
        context: &str,
    ) -> Result<Vec<T>> {
        let mut url = reqwest::Url::parse(&self.url(path))
            .map_err(|e| Error::msg(format!("{context}: invalid url: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        let mut out = Vec::new();
        let mut req = self.client.get(url);
        loop {
            let body = self.send(req, context)?;
            let next = next_page(&body);
            let mut page: Vec<T> = take_key(body, key, context)?;
            out.append(&mut page);
            match next {
                Some(url) => req = self.client.get(url),
                None => break,
            }
        }
        Ok(out)
    }
}

fn take_key<T: DeserializeOwned>(mut body: Value, key: &str, context: &str) -> Result<T> {
    let v = body
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| Error::msg(format!("{context}: response has no '{key}' field")))?;
    serde_json::from_value(v).map_err(|e| Error::msg(format!("{context}: {e}")))
}

fn next_page(body: &Value) -> Option<String> {
    body.pointer("/links/pages/next")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

impl BackupApi for ApiClient {
    fn account(&self) -> Result<Account> {
        tracing::debug!("api::account");
        self.get_one("account", "account", "Could not fetch account information")
    }

    fn servers(&self, hostname: Option<&str>) -> Result<Vec<Server>> {
        tracing::debug!(hostname, "api::servers");
        let context = match hostname {
            Some(h) => format!("Could not fetch server information for {h}"),
            None => "Could not fetch server information".to_string(),
        };
        let query: Vec<(&str, &str)> = hostname.map(|h| vec![("hostname", h)]).unwrap_or_default();
        self.get_list("servers", &query, "servers", &context)
    }

    fn server(&self, server_id: u64) -> Result<Server> {
        tracing::debug!(server_id, "api::server");
        self.get_one(
            &format!("servers/{server_id}"),
            "server",
            &format!("Could not fetch server information {server_id}"),
        )
    }

    fn create_backup(&self, server: &Server) -> Result<Action> {
        tracing::debug!(server_id = server.id, name = %server.name, disk = server.disk, "api::create_backup");
        let context = format!("Could not initiate server backup for {}", server.name);
        let body = serde_json::json!({
            "type": "take_backup",
            "backup_type": "temporary",
            "replacement_strategy": "oldest",
            "label": BACKUP_LABEL,
        });
        let req = self
            .client
            .post(self.url(&format!("servers/{}/actions", server.id)))
            .json(&body);
        let res = self.send(req, &context)?;
        take_key(res, "action", &context)
    }

    fn action(&self, action_id: u64) -> Result<Action> {
        tracing::debug!(action_id, "api::action");
        self.get_one(
            &format!("actions/{action_id}"),
            "action",
            &format!("Could not fetch backup status {action_id}"),
        )
    }

    fn backups(&self, server: &Server) -> Result<Vec<Image>> {
        tracing::debug!(server_id = server.id, name = %server.name, "api::backups");
        self.get_list(
            &format!("servers/{}/backups", server.id),
            &[],
            "backups",
            &format!("Could not fetch list of backups for server {}", server.name),
        )
    }

    fn images(&self) -> Result<Vec<Image>> {
        tracing::debug!("api::images");
        self.get_list("images", &[], "images", "Could not fetch list of images")
    }

    fn image(&self, image_id: u64) -> Result<Image> {
        tracing::debug!(image_id, "api::image");
        self.get_one(
            &format!("images/{image_id}"),
            "image",
            &format!("Could not fetch image {image_id}"),
        )
    }

    fn link(&self, image_id: u64) -> Result<DownloadLink> {
        tracing::debug!(image_id, "api::link");
        self.get_one(
            &format!("images/{image_id}/download"),
            "link",
            &format!("Could not fetch links for image {image_id}"),
        )
    }
}
