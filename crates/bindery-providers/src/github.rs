use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bindery_core::config::Config;
use bindery_core::provider::{Provider, ProviderFactory};
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

const GITHUB_API: &str = "https://api.github.com";

/// Provider for `gh` specs of the form `owner/repo[/ref]`.
pub struct GitHubProvider {
    client: Client,
    owner: String,
    repo: String,
    unresolved_ref: String,
    api_token: String,
    auth_client_id: String,
    banned_specs: Vec<String>,
    /// Resolved commit sha, cached after the first lookup.
    resolved: Mutex<Option<String>>,
}

impl GitHubProvider {
    pub fn parse(spec: &str, config: &Config) -> Result<Self> {
        let mut parts = spec.splitn(3, '/');
        let owner = parts.next().unwrap_or_default();
        let repo = parts.next().unwrap_or_default();
        if owner.is_empty() || repo.is_empty() {
            bail!("Invalid GitHub spec {spec}: expected owner/repo[/ref]");
        }
        let unresolved_ref = parts.next().unwrap_or("HEAD");

        Ok(Self {
            client: Client::new(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            unresolved_ref: unresolved_ref.to_string(),
            api_token: config.github_token.clone(),
            auth_client_id: config.github_auth_client_id.clone(),
            banned_specs: config.banned_specs.clone(),
            resolved: Mutex::new(None),
        })
    }

    pub fn factory(config: &Config) -> ProviderFactory {
        let config = config.clone();
        Arc::new(move |spec| {
            let provider = GitHubProvider::parse(spec, &config)?;
            Ok(Arc::new(provider) as Arc<dyn Provider>)
        })
    }

    fn api_request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(url)
            .header("User-Agent", "bindery")
            .header("Accept", "application/vnd.github.v3+json");
        if !self.api_token.is_empty() {
            req = req.header("Authorization", format!("token {}", self.api_token));
        }
        req
    }
}

#[async_trait]
impl Provider for GitHubProvider {
    fn name(&self) -> &str {
        "GitHub"
    }

    fn is_banned(&self) -> bool {
        let spec = format!("{}/{}", self.owner, self.repo).to_lowercase();
        self.banned_specs
            .iter()
            .any(|b| spec.contains(&b.to_lowercase()))
    }

    fn get_authorization_provider(&self) -> Option<String> {
        (!self.auth_client_id.is_empty()).then(|| "github".to_string())
    }

    async fn validate_authorized_token(&self, token: &str) -> Result<bool> {
        let resp = self
            .client
            .get(format!("{GITHUB_API}/user"))
            .header("User-Agent", "bindery")
            .header("Authorization", format!("token {token}"))
            .send()
            .await
            .context("github token validation")?;
        Ok(resp.status().is_success())
    }

    fn get_authorization_url(&self, state: &str, service_url: &str) -> String {
        format!(
            "{}/oauth/authorize?provider=github&client_id={}&state={}",
            service_url.trim_end_matches('/'),
            self.auth_client_id,
            state
        )
    }

    fn get_repo_url(&self) -> String {
        format!("https://github.com/{}/{}", self.owner, self.repo)
    }

    async fn get_resolved_ref(&self) -> Result<Option<String>> {
        let mut cached = self.resolved.lock().await;
        if let Some(sha) = cached.as_ref() {
            return Ok(Some(sha.clone()));
        }

        let url = format!(
            "{GITHUB_API}/repos/{}/{}/commits/{}",
            self.owner, self.repo, self.unresolved_ref
        );
        let resp = self
            .api_request(&url)
            .send()
            .await
            .context("github ref resolution")?;

        // Missing repos and unknown refs are a "no", not an error.
        if matches!(resp.status().as_u16(), 404 | 422) {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("GitHub API returned status {}", resp.status());
        }

        let commit: Value = resp.json().await.context("github commit parse")?;
        let Some(sha) = commit.get("sha").and_then(|s| s.as_str()) else {
            return Ok(None);
        };
        debug!(
            "resolved {}/{}@{} to {sha}",
            self.owner, self.repo, self.unresolved_ref
        );
        *cached = Some(sha.to_string());
        Ok(Some(sha.to_string()))
    }

    async fn get_resolved_ref_url(&self) -> Result<String> {
        let cached = self.resolved.lock().await;
        let Some(sha) = cached.as_ref() else {
            bail!("ref not resolved yet");
        };
        Ok(format!(
            "https://github.com/{}/{}/tree/{sha}",
            self.owner, self.repo
        ))
    }

    async fn get_resolved_spec(&self) -> Result<String> {
        let cached = self.resolved.lock().await;
        let Some(sha) = cached.as_ref() else {
            bail!("ref not resolved yet");
        };
        Ok(format!("{}/{}/{sha}", self.owner, self.repo))
    }

    fn get_build_slug(&self) -> String {
        format!("{}-{}", self.owner, self.repo)
    }

    fn unresolved_ref(&self) -> &str {
        &self.unresolved_ref
    }

    fn git_credentials(&self) -> Option<String> {
        (!self.api_token.is_empty())
            .then(|| format!("username=x-access-token\npassword={}", self.api_token))
    }

    fn get_optional_envs(&self, access_token: Option<&str>) -> HashMap<String, String> {
        let mut envs = HashMap::new();
        if let Some(token) = access_token {
            envs.insert("GITHUB_TOKEN".to_string(), token.to_string());
        }
        envs
    }
}
