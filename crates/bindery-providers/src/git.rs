use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bindery_core::config::Config;
use bindery_core::provider::{Provider, ProviderFactory};
use tokio::sync::Mutex;

/// Provider for arbitrary clone URLs: spec is
/// `<url-escaped-repo-url>/<ref>`.
pub struct GitProvider {
    repo_url: String,
    escaped_url: String,
    unresolved_ref: String,
    banned_specs: Vec<String>,
    resolved: Mutex<Option<String>>,
}

fn is_commit_sha(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

impl GitProvider {
    pub fn parse(spec: &str, config: &Config) -> Result<Self> {
        let Some((escaped_url, git_ref)) = spec.rsplit_once('/') else {
            bail!("Invalid git spec {spec}: expected <escaped-url>/<ref>");
        };
        let repo_url = urlencoding::decode(escaped_url)
            .with_context(|| format!("could not decode repo url in {spec}"))?
            .into_owned();
        if repo_url.is_empty() || git_ref.is_empty() {
            bail!("Invalid git spec {spec}: expected <escaped-url>/<ref>");
        }

        Ok(Self {
            repo_url,
            escaped_url: escaped_url.to_string(),
            unresolved_ref: git_ref.to_string(),
            banned_specs: config.banned_specs.clone(),
            resolved: Mutex::new(None),
        })
    }

    pub fn factory(config: &Config) -> ProviderFactory {
        let config = config.clone();
        Arc::new(move |spec| {
            let provider = GitProvider::parse(spec, &config)?;
            Ok(Arc::new(provider) as Arc<dyn Provider>)
        })
    }

    async fn ls_remote(&self) -> Result<Option<String>> {
        let output = tokio::process::Command::new("git")
            .args(["ls-remote", "--", &self.repo_url, &self.unresolved_ref])
            .output()
            .await
            .context("failed to spawn git ls-remote")?;

        if !output.status.success() {
            bail!(
                "git ls-remote {} failed: {}",
                self.repo_url,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .split_whitespace()
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }
}

#[async_trait]
impl Provider for GitProvider {
    fn name(&self) -> &str {
        "Git"
    }

    fn is_banned(&self) -> bool {
        let url = self.repo_url.to_lowercase();
        self.banned_specs.iter().any(|b| url.contains(&b.to_lowercase()))
    }

    fn get_authorization_provider(&self) -> Option<String> {
        None
    }

    async fn validate_authorized_token(&self, _token: &str) -> Result<bool> {
        Ok(true)
    }

    fn get_authorization_url(&self, _state: &str, service_url: &str) -> String {
        service_url.to_string()
    }

    fn get_repo_url(&self) -> String {
        self.repo_url.clone()
    }

    async fn get_resolved_ref(&self) -> Result<Option<String>> {
        let mut cached = self.resolved.lock().await;
        if let Some(sha) = cached.as_ref() {
            return Ok(Some(sha.clone()));
        }

        // A full sha needs no remote round-trip.
        let sha = if is_commit_sha(&self.unresolved_ref) {
            Some(self.unresolved_ref.clone())
        } else {
            self.ls_remote().await?
        };

        if let Some(sha) = &sha {
            *cached = Some(sha.clone());
        }
        Ok(sha)
    }

    async fn get_resolved_ref_url(&self) -> Result<String> {
        Ok(self.repo_url.clone())
    }

    async fn get_resolved_spec(&self) -> Result<String> {
        let cached = self.resolved.lock().await;
        let Some(sha) = cached.as_ref() else {
            bail!("ref not resolved yet");
        };
        Ok(format!("{}/{sha}", self.escaped_url))
    }

    fn get_build_slug(&self) -> String {
        self.repo_url.clone()
    }

    fn unresolved_ref(&self) -> &str {
        &self.unresolved_ref
    }

    fn git_credentials(&self) -> Option<String> {
        None
    }

    fn get_optional_envs(&self, _access_token: Option<&str>) -> HashMap<String, String> {
        HashMap::new()
    }
}
