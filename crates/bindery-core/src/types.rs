use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ── Repo identification ──────────────────────────────────────────────────

/// The raw repository identifier as it arrives on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoSpec {
    /// Nickname of the repo provider (e.g. "gh").
    pub provider_prefix: String,
    /// Provider-specific path segment, trailing `/` stripped.
    pub raw_spec: String,
}

impl RepoSpec {
    pub fn new(provider_prefix: impl Into<String>, raw_spec: impl Into<String>) -> Self {
        let raw = raw_spec.into();
        Self {
            provider_prefix: provider_prefix.into(),
            raw_spec: raw.trim_end_matches('/').to_string(),
        }
    }

    /// Cache key used in logs and error messages.
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider_prefix, self.raw_spec)
    }
}

/// Labels applied to per-repo build/launch metrics.
#[derive(Debug, Clone)]
pub struct RepoLabels {
    pub provider: String,
    pub repo: String,
}

// ── Builder events ───────────────────────────────────────────────────────

/// Phase of the external builder pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    /// The builder pod is gone; the image has been pushed.
    Deleted,
    Other(String),
}

impl From<String> for PodPhase {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Deleted" => Self::Deleted,
            _ => Self::Other(s),
        }
    }
}

impl From<PodPhase> for String {
    fn from(p: PodPhase) -> Self {
        p.as_str().to_string()
    }
}

impl PodPhase {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Deleted => "Deleted",
            Self::Other(s) => s,
        }
    }
}

/// An event produced by a build backend and consumed by the build driver.
///
/// Log payloads are JSON strings emitted by the builder as-is; the driver
/// only parses them to look for a terminal `phase` marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum BuildEvent {
    #[serde(rename = "pod.phasechange")]
    PhaseChange(PodPhase),
    #[serde(rename = "log")]
    Log(String),
}

// ── Build submission ─────────────────────────────────────────────────────

/// Everything a build backend needs to submit one build job.
#[derive(Debug, Clone, Default)]
pub struct BuildSpec {
    pub name: String,
    pub namespace: String,
    pub repo_url: String,
    pub git_ref: String,
    pub image_name: String,
    pub push_secret: Option<String>,
    pub build_image: String,
    pub memory_limit: String,
    pub memory_request: String,
    pub docker_host: String,
    pub node_selector: HashMap<String, String>,
    /// Dockerfile appendix, already rendered for this request.
    pub appendix: String,
    pub log_tail_lines: i64,
    pub git_credentials: Option<String>,
    pub optional_envs: HashMap<String, String>,
    pub sticky_builds: bool,
}

// ── Per-repo launch settings ─────────────────────────────────────────────

/// Launch-time settings a provider may override per repository.
#[derive(Debug, Clone, Default)]
pub struct RepoSettings {
    /// Upper bound on concurrent servers running this repo's image.
    pub quota: Option<u32>,
}
