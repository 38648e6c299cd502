use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::Config;
use crate::launch::Launcher;

/// Launcher backed by the notebook hub's REST API.
pub struct HubLauncher {
    client: Client,
    hub_url: String,
    api_token: String,
    retries: u32,
    retry_delay: Duration,
    allow_named_servers: bool,
}

impl HubLauncher {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            hub_url: config.hub_url.trim_end_matches('/').to_string(),
            api_token: config.hub_api_token.clone(),
            retries: config.launcher_retries,
            retry_delay: Duration::from_secs(config.launcher_retry_delay_s),
            allow_named_servers: config.allow_named_servers,
        }
    }

    fn api(&self, path: &str) -> String {
        format!("{}/hub/api/{}", self.hub_url, path)
    }

    fn auth_header(&self) -> String {
        format!("token {}", self.api_token)
    }
}

#[async_trait]
impl Launcher for HubLauncher {
    fn retries(&self) -> u32 {
        self.retries
    }

    fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    fn allow_named_servers(&self) -> bool {
        self.allow_named_servers
    }

    fn unique_name_from_repo(&self, repo_url: &str) -> String {
        // Repo tail for readability, hash suffix for uniqueness.
        let tail = repo_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("repo");
        let safe: String = tail
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .take(40)
            .collect();
        let mut hasher = Sha256::new();
        hasher.update(repo_url.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        format!("{safe}-{}", &digest[..6])
    }

    async fn launch(
        &self,
        image: &str,
        username: &str,
        server_name: &str,
        repo_url: &str,
        extra_args: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        // Make sure the user exists; 409 means it already does.
        let resp = self
            .client
            .post(self.api(&format!("users/{username}")))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .context("hub create user")?;
        if !resp.status().is_success() && resp.status().as_u16() != 409 {
            bail!("hub create user returned status {}", resp.status());
        }

        let mut user_options = Map::new();
        user_options.insert("image".into(), json!(image));
        user_options.insert("repo_url".into(), json!(repo_url));
        user_options.extend(extra_args.clone());

        let path = if server_name.is_empty() {
            format!("users/{username}/server")
        } else {
            format!("users/{username}/servers/{server_name}")
        };
        let resp = self
            .client
            .post(self.api(&path))
            .header("Authorization", self.auth_header())
            .json(&Value::Object(user_options))
            .send()
            .await
            .context("hub start server")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("hub start server returned status {status}: {body}");
        }

        let url = if server_name.is_empty() {
            format!("{}/user/{username}/", self.hub_url)
        } else {
            format!("{}/user/{username}/{server_name}/", self.hub_url)
        };
        info!("started server for {username} at {url}");

        let mut server_info = Map::new();
        server_info.insert("url".into(), json!(url));
        server_info.insert("image".into(), json!(image));
        server_info.insert("repo_url".into(), json!(repo_url));
        Ok(server_info)
    }
}
