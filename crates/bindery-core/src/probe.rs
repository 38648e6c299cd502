use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::warn;

/// How often a registry lookup is retried on transport errors before the
/// image is assumed absent.
const REGISTRY_ATTEMPTS: u32 = 3;

/// Answers "does a built image with this name already exist?".
#[async_trait]
pub trait ImageProbe: Send + Sync {
    async fn image_exists(&self, image_name: &str) -> Result<bool>;
}

// ── Registry probe ───────────────────────────────────────────────────────

/// Checks a remote container registry for a pushed manifest.
pub struct RegistryProbe {
    client: Client,
    url: String,
    username: String,
    password: String,
}

impl RegistryProbe {
    pub fn new(url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Fetch the manifest for `repo:tag`, or `None` when the registry
    /// reports it missing. Non-404 error statuses surface as errors so the
    /// caller can retry them as transport failures.
    pub async fn get_image_manifest(&self, repo: &str, tag: &str) -> Result<Option<Value>> {
        let url = format!("{}/v2/{}/manifests/{}", self.url, repo, tag);
        let mut req = self
            .client
            .get(&url)
            .header(
                "Accept",
                "application/vnd.docker.distribution.manifest.v2+json",
            )
            .timeout(Duration::from_secs(30));
        if !self.username.is_empty() {
            req = req.basic_auth(&self.username, Some(&self.password));
        }

        let resp = req.send().await.context("registry manifest request")?;
        match resp.status().as_u16() {
            404 => Ok(None),
            _ if resp.status().is_success() => {
                let manifest: Value = resp.json().await.context("registry manifest parse")?;
                Ok(Some(manifest))
            }
            s => bail!("registry returned status {s} for {repo}:{tag}"),
        }
    }
}

#[async_trait]
impl ImageProbe for RegistryProbe {
    async fn image_exists(&self, image_name: &str) -> Result<bool> {
        let (repo, tag) = image_name
            .rsplit_once(':')
            .unwrap_or((image_name, "latest"));

        for attempt in 1..=REGISTRY_ATTEMPTS {
            match self.get_image_manifest(repo, tag).await {
                Ok(manifest) => return Ok(manifest.is_some()),
                Err(e) => {
                    warn!(attempt, "registry manifest lookup failed for {image_name}: {e}");
                }
            }
        }
        // Exhausted retries: assume the image is absent and build it.
        Ok(false)
    }
}

// ── Local docker probe ───────────────────────────────────────────────────

/// Queries the local container daemon for a by-name image.
///
/// Only meaningful in single-node deployments where the builder and this
/// service share a docker host.
pub struct LocalDockerProbe;

#[async_trait]
impl ImageProbe for LocalDockerProbe {
    async fn image_exists(&self, image_name: &str) -> Result<bool> {
        let output = tokio::process::Command::new("docker")
            .args(["image", "inspect", image_name])
            .output()
            .await
            .context("failed to spawn docker")?;

        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such image") {
            Ok(false)
        } else {
            bail!("docker image inspect {image_name} failed: {}", stderr.trim());
        }
    }
}
