use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::types::RepoSettings;

/// A repository provider bound to one request's spec.
///
/// Implementations parse the provider-specific spec segment, resolve it to an
/// immutable commit-like ref, and expose the auth hooks the coordinator
/// needs. Ref resolution may hit the network; everything else is local.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable provider name used in metric labels (e.g. "GitHub").
    fn name(&self) -> &str;

    /// Whether this spec is temporarily blocked from launching.
    fn is_banned(&self) -> bool;

    /// Identifier of the authorization provider, when this repo requires an
    /// access token to clone. `None` means no auth handshake is needed.
    fn get_authorization_provider(&self) -> Option<String>;

    async fn validate_authorized_token(&self, token: &str) -> Result<bool>;

    fn get_authorization_url(&self, state: &str, service_url: &str) -> String;

    fn get_repo_url(&self) -> String;

    /// Resolve the spec's ref to a commit-like identifier. `Ok(None)` means
    /// the ref does not exist (as opposed to a transport failure).
    async fn get_resolved_ref(&self) -> Result<Option<String>>;

    /// Browse URL for the resolved ref. Only valid after a successful
    /// `get_resolved_ref`.
    async fn get_resolved_ref_url(&self) -> Result<String>;

    /// The spec pinned to the resolved ref, for persistent launch links.
    async fn get_resolved_spec(&self) -> Result<String>;

    /// Short identifier used to form build and image names.
    fn get_build_slug(&self) -> String;

    /// The ref as requested, before resolution (used for remediation hints).
    fn unresolved_ref(&self) -> &str;

    /// Git credential file contents for private clones, if any.
    fn git_credentials(&self) -> Option<String>;

    /// Extra environment for the build pod (e.g. a clone token).
    fn get_optional_envs(&self, access_token: Option<&str>) -> HashMap<String, String>;

    /// Per-repo launch settings, layered over the global config.
    fn repo_config(&self, config: &Config) -> RepoSettings {
        RepoSettings {
            quota: (config.launch_quota > 0).then_some(config.launch_quota),
        }
    }
}

/// Constructs a provider for one request from its raw spec segment.
pub type ProviderFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Provider>> + Send + Sync>;

/// Mapping from provider prefix (e.g. "gh") to its factory.
pub type RepoProviders = HashMap<String, ProviderFactory>;
