use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Map};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::build::BuildFactory;
use crate::builder::BuildDriver;
use crate::config::Config;
use crate::eventlog::EventLog;
use crate::events::{ClientEvent, Emitter};
use crate::launch::{LaunchContext, LaunchDriver, Launcher, PodScanner};
use crate::names;
use crate::probe::ImageProbe;
use crate::provider::RepoProviders;
use crate::tokenstore::TokenStore;
use crate::types::{BuildSpec, RepoLabels, RepoSpec};

/// One incoming build-and-launch request, as extracted by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub provider_prefix: String,
    pub spec: String,
    /// Opaque caller context appended to the auth provider id.
    pub userctx: Option<String>,
    /// Token supplied directly on the query string.
    pub repo_token: Option<String>,
    /// All query arguments in arrival order (`useropt.` keys forwarded).
    pub query_args: Vec<(String, String)>,
    /// Authenticated user; auth itself is enforced upstream of the handler.
    pub user: Option<String>,
    /// Host the request arrived on, for the audit-record origin.
    pub origin_host: String,
    /// Scheme + host + base prefix for composing launch URLs.
    pub launch_host: String,
}

/// Top-level glue for one request: auth handshake, ref resolution, probe,
/// then build and/or launch, all reported on the event stream.
pub struct Coordinator {
    pub config: Arc<Config>,
    pub providers: RepoProviders,
    pub probe: Arc<dyn ImageProbe>,
    pub build_factory: Arc<dyn BuildFactory>,
    pub scanner: Arc<dyn PodScanner>,
    pub launcher: Arc<dyn Launcher>,
    pub tokenstore: Arc<TokenStore>,
    pub event_log: Arc<EventLog>,
}

impl Coordinator {
    /// Run the request to completion.
    ///
    /// Expected failures (unknown provider, banned repo, unresolvable ref)
    /// are reported as terminal frames and return `Ok`. `Err` means either
    /// the client disconnected or a launch/internal failure that was already
    /// reported on the stream.
    pub async fn run(&self, req: BuildRequest, emitter: Emitter) -> Result<()> {
        let spec = RepoSpec::new(&req.provider_prefix, &req.spec);
        let key = spec.key();

        // The event stream cannot carry HTTP errors, so validation failures
        // are sent as frames too.
        let Some(factory) = self.providers.get(&spec.provider_prefix) else {
            emitter.fail(&format!(
                "No provider found for prefix {}",
                spec.provider_prefix
            ))?;
            return Ok(());
        };

        let provider = match factory(&spec.raw_spec) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to construct provider for {key}: {e}");
                emitter.fail(&e.to_string())?;
                return Ok(());
            }
        };

        if provider.is_banned() {
            emitter.emit(&ClientEvent::failed(format!(
                "Sorry, {0} has been temporarily disabled from launching. Please contact admins for more info!\n{0}が一時的に起動できなくなりました。管理者へお問い合わせください。",
                spec.raw_spec
            )))?;
            return Ok(());
        }

        // Auth handshake. A missing token is not an error: the client is
        // told where to authorize and the stream ends normally.
        let mut repo_token: Option<String> = None;
        if self.config.auth_enabled {
            if let Some(mut auth_provider_id) = provider.get_authorization_provider() {
                if let Some(userctx) = &req.userctx {
                    auth_provider_id = format!("{auth_provider_id}-{userctx}");
                }
                let user = req.user.clone().unwrap_or_default();

                let mut token = self
                    .tokenstore
                    .get_access_token_for(&user, &auth_provider_id);
                if let Some(t) = &token {
                    if !provider.validate_authorized_token(t).await.unwrap_or(false) {
                        token = None;
                    }
                }

                if let Some(query_token) = &req.repo_token {
                    info!("Repo token acquired: length={}", query_token.len());
                    let state = self.tokenstore.new_session(&user, &auth_provider_id);
                    self.tokenstore.register_token(&user, &state, query_token);
                    token = Some(query_token.clone());
                } else if token.is_none() {
                    let state = self.tokenstore.new_session(&user, &auth_provider_id);
                    let auth_url = provider.get_authorization_url(&state, &req.launch_host);
                    emitter.emit(&ClientEvent::auth(auth_url))?;
                    return Ok(());
                }
                repo_token = token;
            }
        }

        let repo_url = provider.get_repo_url();
        let labels = RepoLabels {
            provider: provider.name().to_string(),
            repo: repo_url.clone(),
        };

        let resolved_ref = match provider.get_resolved_ref().await {
            Ok(r) => r,
            Err(e) => {
                emitter.fail(&format!(
                    "Error resolving ref for {key}: {e}\nリポジトリURLを確認してください。"
                ))?;
                return Ok(());
            }
        };
        let Some(git_ref) = resolved_ref else {
            emitter.fail(&self.unresolved_ref_message(&key, provider.as_ref()))?;
            return Ok(());
        };

        let ref_url = provider
            .get_resolved_ref_url()
            .await
            .unwrap_or_else(|_| repo_url.clone());
        let resolved_spec = provider
            .get_resolved_spec()
            .await
            .unwrap_or_else(|_| spec.raw_spec.clone());

        let binder_launch_host = if self.config.badge_base_url.is_empty() {
            req.launch_host.clone()
        } else {
            self.config.badge_base_url.clone()
        };
        // Relative URLs, no leading slash.
        let binder_request = format!("v2/{}/{}", spec.provider_prefix, spec.raw_spec);
        let binder_persistent_request =
            format!("v2/{}/{}", spec.provider_prefix, resolved_spec);

        let build_slug = provider.get_build_slug();
        let build_name = names::build_name(&build_slug, &git_ref, "build-");
        let image_name = names::image_name(&self.config.image_prefix, &build_slug, &git_ref);

        let image_found = match self.probe.image_exists(&image_name).await {
            Ok(found) => found,
            Err(e) => {
                emitter.fail_with_status(
                    500,
                    &format!("Failed to check for existing image: {e}"),
                )?;
                return Err(e);
            }
        };

        let launch_ctx = LaunchContext {
            username: req.user.clone(),
            ref_url: ref_url.clone(),
            binder_launch_host: binder_launch_host.clone(),
            binder_request: binder_request.clone(),
            binder_persistent_request: binder_persistent_request.clone(),
            repo_token: repo_token.clone(),
            query_args: req.query_args.clone(),
        };
        let launch_driver = LaunchDriver {
            image_name: image_name.clone(),
            repo_url: repo_url.clone(),
            namespace: self.config.build_namespace.clone(),
            labels: labels.clone(),
            quota: provider.repo_config(&self.config).quota,
            auth_enabled: self.config.auth_enabled,
        };

        // A prebuilt image short-circuits straight to launch.
        if image_found {
            emitter.emit(&ClientEvent::built(
                &image_name,
                "Found built image, launching...\n",
            ))?;
            let launched = launch_driver
                .launch(
                    self.scanner.as_ref(),
                    self.launcher.as_ref(),
                    &emitter,
                    &launch_ctx,
                )
                .await?;
            if launched {
                self.audit_launch(&spec, &git_ref, &labels, &req);
            }
            self.tail_sleep().await;
            return Ok(());
        }

        let appendix = self.config.render_appendix(
            &format!("{binder_launch_host}{binder_request}"),
            &format!("{binder_launch_host}{binder_persistent_request}"),
            &repo_url,
            &ref_url,
        );

        let build_spec = BuildSpec {
            name: build_name,
            namespace: self.config.build_namespace.clone(),
            repo_url: repo_url.clone(),
            git_ref: git_ref.clone(),
            image_name: image_name.clone(),
            push_secret: (self.config.use_registry && !self.config.push_secret.is_empty())
                .then(|| self.config.push_secret.clone()),
            build_image: self.config.build_image.clone(),
            memory_limit: self.config.build_memory_limit.clone(),
            memory_request: self.config.build_memory_request.clone(),
            docker_host: self.config.build_docker_host.clone(),
            node_selector: self.config.build_node_selector.clone(),
            appendix,
            log_tail_lines: self.config.log_tail_lines,
            git_credentials: provider.git_credentials(),
            optional_envs: provider.get_optional_envs(repo_token.as_deref()),
            sticky_builds: self.config.sticky_builds,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let build = self.build_factory.create(events_tx, build_spec);
        let driver = BuildDriver {
            image_name: image_name.clone(),
            labels: labels.clone(),
        };

        let result = driver.drive(Arc::clone(&build), events_rx, &emitter).await;
        // Detach from the builder whether the build finished or the client
        // went away; sticky-build subscribers keep their own streams.
        build.stop();
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = emitter.fail_with_status(500, &e.to_string());
                return Err(e);
            }
        };

        if !outcome.failed {
            let launched = launch_driver
                .launch(
                    self.scanner.as_ref(),
                    self.launcher.as_ref(),
                    &emitter,
                    &launch_ctx,
                )
                .await?;
            if launched {
                self.audit_launch(&spec, &git_ref, &labels, &req);
            }
        }

        self.tail_sleep().await;
        Ok(())
    }

    fn unresolved_ref_message(&self, key: &str, provider: &dyn crate::provider::Provider) -> String {
        let mut lines = vec![
            format!("Could not resolve ref for {key}. Double check your URL."),
            "リポジトリURLを確認してください。".to_string(),
        ];

        if provider.name() == "GitHub" {
            lines.push(
                "GitHub recently changed default branches from \"master\" to \"main\"."
                    .to_string(),
            );
            lines.push(
                "GitHub は2020年に、デフォルトブランチ名を \"master\" から \"main\" へ変更しました。"
                    .to_string(),
            );
            match provider.unresolved_ref() {
                "master" => {
                    lines.push("Did you mean the \"main\" branch?".to_string());
                    lines.push("\"main\" ブランチではありませんか？".to_string());
                }
                "main" => {
                    lines.push("Did you mean the \"master\" branch?".to_string());
                    lines.push("\"master\" ブランチではありませんか？".to_string());
                }
                _ => {}
            }
        } else {
            lines.push("Is your repo public?".to_string());
            lines.push("リポジトリが公開されていない可能性があります。".to_string());
        }

        lines.join("\n")
    }

    fn audit_launch(&self, spec: &RepoSpec, git_ref: &str, labels: &RepoLabels, req: &BuildRequest) {
        let origin = if self.config.normalized_origin.is_empty() {
            req.origin_host.clone()
        } else {
            self.config.normalized_origin.clone()
        };
        let mut payload = Map::new();
        payload.insert("provider".into(), json!(labels.provider));
        payload.insert("spec".into(), json!(spec.raw_spec));
        payload.insert("ref".into(), json!(git_ref));
        payload.insert("status".into(), json!("success"));
        payload.insert("origin".into(), json!(origin));
        self.event_log.emit("bindery.dev/launch", 4, payload);
    }

    /// Browsers auto-reconnect when the server closes an event stream first,
    /// which would kick off a duplicate build. Let the client close first.
    async fn tail_sleep(&self) {
        if self.config.tail_close_delay_s > 0 {
            tokio::time::sleep(Duration::from_secs(self.config.tail_close_delay_s)).await;
        }
    }
}
