#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use bindery_core::build::{BuildBackend, BuildFactory};
use bindery_core::launch::{Launcher, PodScanner};
use bindery_core::probe::ImageProbe;
use bindery_core::provider::{Provider, ProviderFactory};
use bindery_core::types::{BuildEvent, BuildSpec};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

// ── Frame helpers ────────────────────────────────────────────────────────

/// Drain all frames currently in the emitter channel and parse them.
pub fn drain_frames(rx: &mut UnboundedReceiver<String>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).unwrap_or(Value::String(frame)));
    }
    frames
}

pub fn phases(frames: &[Value]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| f.get("phase").and_then(|p| p.as_str()))
        .map(str::to_string)
        .collect()
}

// ── Providers ────────────────────────────────────────────────────────────

/// Provider with scripted answers.
pub struct FakeProvider {
    pub provider_name: String,
    pub banned: bool,
    pub auth_provider: Option<String>,
    pub repo_url: String,
    pub resolved_ref: Option<String>,
    pub resolve_error: bool,
    pub unresolved: String,
    pub build_slug: String,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self {
            provider_name: "GitHub".into(),
            banned: false,
            auth_provider: None,
            repo_url: "https://github.com/owner/repo".into(),
            resolved_ref: Some("abc123".into()),
            resolve_error: false,
            unresolved: "HEAD".into(),
            build_slug: "owner-repo".into(),
        }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn is_banned(&self) -> bool {
        self.banned
    }

    fn get_authorization_provider(&self) -> Option<String> {
        self.auth_provider.clone()
    }

    async fn validate_authorized_token(&self, _token: &str) -> Result<bool> {
        Ok(true)
    }

    fn get_authorization_url(&self, state: &str, service_url: &str) -> String {
        format!("{service_url}/authorize?state={state}")
    }

    fn get_repo_url(&self) -> String {
        self.repo_url.clone()
    }

    async fn get_resolved_ref(&self) -> Result<Option<String>> {
        if self.resolve_error {
            bail!("connection refused");
        }
        Ok(self.resolved_ref.clone())
    }

    async fn get_resolved_ref_url(&self) -> Result<String> {
        Ok(format!(
            "{}/tree/{}",
            self.repo_url,
            self.resolved_ref.clone().unwrap_or_default()
        ))
    }

    async fn get_resolved_spec(&self) -> Result<String> {
        Ok(format!(
            "owner/repo/{}",
            self.resolved_ref.clone().unwrap_or_default()
        ))
    }

    fn get_build_slug(&self) -> String {
        self.build_slug.clone()
    }

    fn unresolved_ref(&self) -> &str {
        &self.unresolved
    }

    fn git_credentials(&self) -> Option<String> {
        None
    }

    fn get_optional_envs(&self, _access_token: Option<&str>) -> HashMap<String, String> {
        HashMap::new()
    }
}

pub fn provider_factory(provider: FakeProvider) -> ProviderFactory {
    let provider = Arc::new(provider);
    Arc::new(move |_spec| Ok(Arc::clone(&provider) as Arc<dyn Provider>))
}

// ── Probe / scanner ──────────────────────────────────────────────────────

pub struct StubProbe {
    pub exists: bool,
}

#[async_trait]
impl ImageProbe for StubProbe {
    async fn image_exists(&self, _image_name: &str) -> Result<bool> {
        Ok(self.exists)
    }
}

pub struct StaticScanner {
    pub matching: usize,
    pub total: usize,
}

#[async_trait]
impl PodScanner for StaticScanner {
    async fn image_pod_counts(&self, _namespace: &str, _image_no_tag: &str) -> Result<(usize, usize)> {
        Ok((self.matching, self.total))
    }
}

// ── Launcher ─────────────────────────────────────────────────────────────

pub struct RecordedLaunch {
    pub image: String,
    pub username: String,
    pub server_name: String,
    pub extra_args: Map<String, Value>,
}

/// Launcher that fails the first `fail_attempts` calls, then succeeds.
pub struct FakeLauncher {
    pub retries: u32,
    pub retry_delay: Duration,
    pub named_servers: bool,
    pub fail_attempts: u32,
    pub url: String,
    attempts: AtomicU32,
    pub calls: Mutex<Vec<RecordedLaunch>>,
}

impl FakeLauncher {
    pub fn new(retries: u32, retry_delay: Duration, fail_attempts: u32) -> Self {
        Self {
            retries,
            retry_delay,
            named_servers: false,
            fail_attempts,
            url: "http://hub.example/user/someone/".into(),
            attempts: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    fn retries(&self) -> u32 {
        self.retries
    }

    fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    fn allow_named_servers(&self) -> bool {
        self.named_servers
    }

    fn unique_name_from_repo(&self, _repo_url: &str) -> String {
        "someone".into()
    }

    async fn launch(
        &self,
        image: &str,
        username: &str,
        server_name: &str,
        _repo_url: &str,
        extra_args: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedLaunch {
                image: image.to_string(),
                username: username.to_string(),
                server_name: server_name.to_string(),
                extra_args: extra_args.clone(),
            });
        if attempt < self.fail_attempts {
            bail!("spawner unavailable");
        }
        let mut info = Map::new();
        info.insert("url".into(), json!(self.url));
        info.insert("token".into(), json!("secret"));
        Ok(info)
    }
}

// ── Build backends ───────────────────────────────────────────────────────

/// Backend that does nothing on submit; events are fed to the driver's
/// queue by the test itself.
pub struct InertBuild {
    pub stopped: AtomicBool,
    pub log_streams: AtomicUsize,
}

impl InertBuild {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stopped: AtomicBool::new(false),
            log_streams: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl BuildBackend for InertBuild {
    async fn submit(&self) -> Result<()> {
        Ok(())
    }

    async fn stream_logs(&self) -> Result<()> {
        self.log_streams.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Backend whose submit pushes a scripted event sequence, then hangs up
/// (drops its sender) like a builder whose pod went away.
pub struct ScriptedBuild {
    events: Mutex<Option<UnboundedSender<BuildEvent>>>,
    script: Vec<BuildEvent>,
}

#[async_trait]
impl BuildBackend for ScriptedBuild {
    async fn submit(&self) -> Result<()> {
        let tx = self.events.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            for event in &self.script {
                let _ = tx.send(event.clone());
            }
        }
        Ok(())
    }

    async fn stream_logs(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}
}

/// Factory handing out [`ScriptedBuild`]s with a fixed script.
pub struct ScriptedBuildFactory {
    pub script: Vec<BuildEvent>,
    pub specs: Mutex<Vec<BuildSpec>>,
}

impl ScriptedBuildFactory {
    pub fn new(script: Vec<BuildEvent>) -> Self {
        Self {
            script,
            specs: Mutex::new(Vec::new()),
        }
    }
}

impl BuildFactory for ScriptedBuildFactory {
    fn create(
        &self,
        events: UnboundedSender<BuildEvent>,
        spec: BuildSpec,
    ) -> Arc<dyn BuildBackend> {
        self.specs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec);
        Arc::new(ScriptedBuild {
            events: Mutex::new(Some(events)),
            script: self.script.clone(),
        })
    }
}
