use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::Api;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::events::{ClientEvent, Emitter};
use crate::metrics::{metrics, InprogressGuard};
use crate::types::RepoLabels;

/// Label selector identifying running notebook-server pods.
const SERVER_POD_SELECTOR: &str = "app=jupyterhub,component=singleuser-server";

// ── Capabilities ─────────────────────────────────────────────────────────

/// The spawning subsystem the coordinator launches servers through.
#[async_trait]
pub trait Launcher: Send + Sync {
    fn retries(&self) -> u32;
    fn retry_delay(&self) -> Duration;
    fn allow_named_servers(&self) -> bool;

    /// Deterministic, collision-resistant name derived from a repo URL, used
    /// as username or server name for unauthenticated launches.
    fn unique_name_from_repo(&self, repo_url: &str) -> String;

    /// Start a server; returns server info that must contain `url`.
    async fn launch(
        &self,
        image: &str,
        username: &str,
        server_name: &str,
        repo_url: &str,
        extra_args: &Map<String, Value>,
    ) -> Result<Map<String, Value>>;
}

/// Counts notebook-server pods per image, for quota enforcement.
#[async_trait]
pub trait PodScanner: Send + Sync {
    /// Returns `(matching, total)`: pods whose first matching container runs
    /// `image_no_tag` (tag ignored), and all server pods in the namespace.
    async fn image_pod_counts(&self, namespace: &str, image_no_tag: &str) -> Result<(usize, usize)>;
}

/// Pod scanner backed by the cluster API, with a bounded request timeout so
/// a stuck apiserver cannot pin the request.
pub struct KubePodScanner {
    client: kube::Client,
    timeout_s: u32,
}

impl KubePodScanner {
    pub fn new(client: kube::Client, timeout_s: u32) -> Self {
        Self { client, timeout_s }
    }
}

#[async_trait]
impl PodScanner for KubePodScanner {
    async fn image_pod_counts(&self, namespace: &str, image_no_tag: &str) -> Result<(usize, usize)> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default()
            .labels(SERVER_POD_SELECTOR)
            .timeout(self.timeout_s);
        let list = pods.list(&params).await.context("list server pods")?;

        let mut matching = 0;
        let mut total = 0;
        for pod in list.items {
            total += 1;
            let containers = pod.spec.map(|s| s.containers).unwrap_or_default();
            for container in containers {
                let image = container.image.unwrap_or_default();
                let image = image.rsplit_once(':').map_or(image.as_str(), |(repo, _)| repo);
                if image == image_no_tag {
                    matching += 1;
                    break;
                }
            }
        }
        Ok((matching, total))
    }
}

// ── Launch context ───────────────────────────────────────────────────────

/// Request-scoped inputs to one launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchContext {
    /// Authenticated user, when the deployment runs with auth enabled.
    pub username: Option<String>,
    pub ref_url: String,
    pub binder_launch_host: String,
    pub binder_request: String,
    pub binder_persistent_request: String,
    pub repo_token: Option<String>,
    /// Raw query arguments; `useropt.`-prefixed keys are forwarded.
    pub query_args: Vec<(String, String)>,
}

impl LaunchContext {
    /// Assemble the extra args passed to the spawner: the fixed binder
    /// fields plus `useropt.` query arguments with the prefix stripped,
    /// multi-values TAB-joined.
    fn extra_args(&self) -> Map<String, Value> {
        let mut args = Map::new();
        args.insert("binder_ref_url".into(), json!(self.ref_url));
        args.insert("binder_launch_host".into(), json!(self.binder_launch_host));
        args.insert("binder_request".into(), json!(self.binder_request));
        args.insert(
            "binder_persistent_request".into(),
            json!(self.binder_persistent_request),
        );
        args.insert(
            "repo_token".into(),
            self.repo_token.as_ref().map_or(Value::Null, |t| json!(t)),
        );

        let mut useropts: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in &self.query_args {
            if let Some(name) = key.strip_prefix("useropt.") {
                useropts.entry(name.to_string()).or_default().push(value.clone());
            }
        }
        for (name, values) in useropts {
            args.insert(name, json!(values.join("\t")));
        }
        args
    }
}

// ── Launch driver ────────────────────────────────────────────────────────

/// Enforces the per-repo quota, then launches with retries and exponential
/// backoff.
pub struct LaunchDriver {
    pub image_name: String,
    pub repo_url: String,
    pub namespace: String,
    pub labels: RepoLabels,
    pub quota: Option<u32>,
    pub auth_enabled: bool,
}

impl LaunchDriver {
    /// Returns `Ok(true)` when a server was launched, `Ok(false)` when the
    /// quota blocked it. A terminal launch failure has already been reported
    /// on the stream when this returns `Err`.
    pub async fn launch(
        &self,
        scanner: &dyn PodScanner,
        launcher: &dyn Launcher,
        emitter: &Emitter,
        ctx: &LaunchContext,
    ) -> Result<bool> {
        let _inprogress = InprogressGuard::launches();

        // The image name without tag is unique per repo; count pods running
        // it to approximate "servers running this repo".
        let image_no_tag = self
            .image_name
            .rsplit_once(':')
            .map_or(self.image_name.as_str(), |(repo, _)| repo);

        let (matching, total) = match scanner.image_pod_counts(&self.namespace, image_no_tag).await
        {
            Ok(counts) => counts,
            Err(e) => {
                emitter.fail_with_status(500, &format!("Failed to list running servers: {e}"))?;
                return Err(e);
            }
        };

        if let Some(quota) = self.quota {
            if matching >= quota as usize {
                error!(
                    "{} has exceeded quota: {matching}/{quota} ({total} total)",
                    self.repo_url
                );
                emitter.fail(&format!(
                    "Too many users running {0}! Try again soon.\n{0}の実行が集中しています。しばらく待っても改善しない場合は、管理者へお問い合わせください。",
                    self.repo_url
                ))?;
                return Ok(false);
            }
        }

        // Warn once a repo burns through half its quota.
        let crowded = self.quota.is_some_and(|q| matching as u32 * 2 >= q);
        if crowded {
            warn!(
                "Launching pod for {}: {matching} other pods running this repo ({total} total)",
                self.repo_url
            );
        } else {
            info!(
                "Launching pod for {}: {matching} other pods running this repo ({total} total)",
                self.repo_url
            );
        }

        emitter.emit(&ClientEvent::phase("launching").with_message("Launching server...\n"))?;

        let (username, server_name) = if self.auth_enabled {
            // Auth is on, so the request must carry a resolved identity;
            // launching under an anonymous repo-derived name would bypass it.
            let Some(username) = ctx.username.clone() else {
                emitter.fail("Authenticated launch requested without a logged-in user")?;
                anyhow::bail!("auth enabled but no authenticated user on the request");
            };
            let server_name = if launcher.allow_named_servers() {
                launcher.unique_name_from_repo(&self.repo_url)
            } else {
                String::new()
            };
            (username, server_name)
        } else {
            (launcher.unique_name_from_repo(&self.repo_url), String::new())
        };

        let extra_args = ctx.extra_args();
        let retries = launcher.retries().max(1);
        let mut retry_delay = launcher.retry_delay();

        for i in 0..retries {
            let attempt_start = Instant::now();
            match launcher
                .launch(&self.image_name, &username, &server_name, &self.repo_url, &extra_args)
                .await
            {
                Ok(server_info) => {
                    let duration = attempt_start.elapsed().as_secs_f64();
                    // The attempt index is only interesting on success;
                    // failures and retries all record retries=-1.
                    metrics()
                        .launch_time
                        .with_label_values(&["success", &i.to_string()])
                        .observe(duration);
                    metrics()
                        .launch_count
                        .with_label_values(&["success", &self.labels.provider, &self.labels.repo])
                        .inc();
                    info!("Launched {} in {duration:.0}s", self.repo_url);

                    let url = server_info
                        .get("url")
                        .and_then(|u| u.as_str())
                        .unwrap_or_default()
                        .to_string();
                    emitter.emit(&ClientEvent::ready(url, server_info))?;
                    return Ok(true);
                }
                Err(e) => {
                    let duration = attempt_start.elapsed().as_secs_f64();
                    let last = i + 1 == retries;
                    let status = if last { "failure" } else { "retry" };
                    metrics()
                        .launch_time
                        .with_label_values(&[status, "-1"])
                        .observe(duration);

                    if last {
                        // Retries are not counted per repo; only the final
                        // failure increments the counter.
                        metrics()
                            .launch_count
                            .with_label_values(&[
                                "failure",
                                &self.labels.provider,
                                &self.labels.repo,
                            ])
                            .inc();
                        emitter.emit(&ClientEvent::failed(e.to_string()))?;
                        return Err(e);
                    }

                    error!(
                        "Retrying launch of {} after error (duration={duration:.0}s, attempt={}): {e}",
                        self.repo_url,
                        i + 1,
                    );
                    emitter.emit(&ClientEvent::phase("launching").with_message(format!(
                        "Launch attempt {0} failed, retrying...\n起動に{0}回失敗しました。リトライしています...\n",
                        i + 1
                    )))?;
                    tokio::time::sleep(retry_delay).await;
                    // Exponential backoff for consecutive failures.
                    retry_delay *= 2;
                }
            }
        }

        // retries >= 1, so the loop always returns on its last iteration.
        anyhow::bail!("launch retries exhausted")
    }
}
