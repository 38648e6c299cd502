use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bindery_core::build::{BuildBackend, BuildFactory};
use bindery_core::types::{BuildEvent, BuildSpec, PodPhase};
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, Pod, PodSpec, ResourceRequirements,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{LogParams, PostParams};
use kube::Api;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BUILDER_CONTAINER: &str = "builder";
const PHASE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Runs one build as a pod in the build namespace and reports its phase
/// transitions and log lines on the event queue.
pub struct KubeBuild {
    events: UnboundedSender<BuildEvent>,
    client: kube::Client,
    spec: BuildSpec,
    cancel: CancellationToken,
}

impl KubeBuild {
    pub fn new(events: UnboundedSender<BuildEvent>, client: kube::Client, spec: BuildSpec) -> Self {
        Self {
            events,
            client,
            spec,
            cancel: CancellationToken::new(),
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.spec.namespace)
    }

    fn send(&self, event: BuildEvent) {
        // A dropped receiver means the request detached; nothing to report.
        let _ = self.events.send(event);
    }

    /// Assemble the build pod manifest.
    fn pod_manifest(&self) -> Pod {
        let spec = &self.spec;

        let mut args = vec![
            "--ref".to_string(),
            spec.git_ref.clone(),
            "--image".to_string(),
            spec.image_name.clone(),
            "--json-logs".to_string(),
        ];
        if !spec.appendix.is_empty() {
            args.push("--appendix".to_string());
            args.push(spec.appendix.clone());
        }
        if spec.push_secret.is_some() {
            args.push("--push".to_string());
        }
        args.push(spec.repo_url.clone());

        let mut env: Vec<EnvVar> = spec
            .optional_envs
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .collect();
        if let Some(credentials) = &spec.git_credentials {
            env.push(EnvVar {
                name: "GIT_CREDENTIAL_ENV".into(),
                value: Some(credentials.clone()),
                ..Default::default()
            });
        }

        let mut limits = BTreeMap::new();
        if !spec.memory_limit.is_empty() {
            limits.insert("memory".to_string(), Quantity(spec.memory_limit.clone()));
        }
        let mut requests = BTreeMap::new();
        if !spec.memory_request.is_empty() {
            requests.insert("memory".to_string(), Quantity(spec.memory_request.clone()));
        }
        let resources = (!limits.is_empty() || !requests.is_empty()).then(|| {
            ResourceRequirements {
                limits: (!limits.is_empty()).then_some(limits),
                requests: (!requests.is_empty()).then_some(requests),
                ..Default::default()
            }
        });

        let mut volumes: Vec<Volume> = Vec::new();
        let mut volume_mounts: Vec<VolumeMount> = Vec::new();
        if !spec.docker_host.is_empty() {
            volumes.push(Volume {
                name: "docker-socket".into(),
                host_path: Some(HostPathVolumeSource {
                    path: spec.docker_host.clone(),
                    type_: Some("Socket".into()),
                }),
                ..Default::default()
            });
            volume_mounts.push(VolumeMount {
                name: "docker-socket".into(),
                mount_path: "/var/run/docker.sock".into(),
                ..Default::default()
            });
        }
        if let Some(push_secret) = &spec.push_secret {
            volumes.push(Volume {
                name: "docker-config".into(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(push_secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            volume_mounts.push(VolumeMount {
                name: "docker-config".into(),
                mount_path: "/root/.docker".into(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let node_selector: BTreeMap<String, String> = spec
            .node_selector
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Pod {
            metadata: ObjectMeta {
                name: Some(spec.name.clone()),
                labels: Some(BTreeMap::from([
                    ("name".into(), spec.name.clone()),
                    ("component".into(), "image-builder".into()),
                ])),
                annotations: Some(BTreeMap::from([
                    ("bindery.dev/repo".into(), spec.repo_url.clone()),
                    ("bindery.dev/ref".into(), spec.git_ref.clone()),
                ])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".into()),
                containers: vec![Container {
                    name: BUILDER_CONTAINER.into(),
                    image: Some(spec.build_image.clone()),
                    args: Some(args),
                    env: (!env.is_empty()).then_some(env),
                    resources,
                    volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
                    ..Default::default()
                }],
                node_selector: (!node_selector.is_empty()).then_some(node_selector),
                volumes: (!volumes.is_empty()).then_some(volumes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Poll the pod's phase until it is deleted, pushing each transition.
    async fn watch_phases(&self) -> Result<()> {
        let pods = self.pods();
        let mut last_phase: Option<String> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(PHASE_POLL_INTERVAL) => {}
            }

            match pods.get(&self.spec.name).await {
                Ok(pod) => {
                    let phase = pod
                        .status
                        .and_then(|s| s.phase)
                        .unwrap_or_else(|| "Pending".to_string());
                    if last_phase.as_deref() != Some(phase.as_str()) {
                        debug!("build pod {} phase {phase}", self.spec.name);
                        self.send(BuildEvent::PhaseChange(PodPhase::from(phase.clone())));
                        last_phase = Some(phase);
                    }
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    self.send(BuildEvent::PhaseChange(PodPhase::Deleted));
                    return Ok(());
                }
                Err(e) => {
                    warn!("build pod {} status check failed: {e}", self.spec.name);
                }
            }
        }
    }
}

#[async_trait]
impl BuildBackend for KubeBuild {
    async fn submit(&self) -> Result<()> {
        let pods = self.pods();
        let manifest = self.pod_manifest();

        match pods.create(&PostParams::default(), &manifest).await {
            Ok(_) => {
                info!("submitted build pod {}", self.spec.name);
            }
            // Same name means same (repo, ref): attach to the existing job.
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                if self.spec.sticky_builds {
                    info!("joining existing sticky build pod {}", self.spec.name);
                } else {
                    info!("build pod {} already exists, attaching", self.spec.name);
                }
            }
            Err(e) => return Err(e).context("create build pod"),
        }

        self.send(BuildEvent::PhaseChange(PodPhase::Pending));
        self.watch_phases().await
    }

    async fn stream_logs(&self) -> Result<()> {
        let pods = self.pods();
        let params = LogParams {
            follow: true,
            container: Some(BUILDER_CONTAINER.to_string()),
            tail_lines: Some(self.spec.log_tail_lines),
            ..LogParams::default()
        };

        let stream = pods
            .log_stream(&self.spec.name, &params)
            .await
            .context("open build log stream")?;
        let mut lines = stream.lines();

        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                line = lines.next() => line,
            };
            let Some(line) = line else {
                return Ok(());
            };
            let line = line.context("read build log line")?;
            if line.is_empty() {
                continue;
            }
            // The builder emits structured JSON log lines; anything else is
            // wrapped so clients always receive JSON payloads.
            let payload = if serde_json::from_str::<Value>(&line).is_ok() {
                line
            } else {
                json!({"phase": "building", "message": format!("{line}\n")}).to_string()
            };
            self.send(BuildEvent::Log(payload));
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Creates a [`KubeBuild`] per request.
pub struct KubeBuildFactory {
    client: kube::Client,
}

impl KubeBuildFactory {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

impl BuildFactory for KubeBuildFactory {
    fn create(
        &self,
        events: UnboundedSender<BuildEvent>,
        spec: BuildSpec,
    ) -> Arc<dyn BuildBackend> {
        Arc::new(KubeBuild::new(events, self.client.clone(), spec))
    }
}
