use std::collections::HashMap;

use anyhow::Result;

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    // HTTP
    pub bind: String,
    pub port: u16,
    /// Path prefix the service is mounted under (e.g. "/").
    pub base_url: String,
    /// If set, overrides the request host when composing launch URLs.
    pub badge_base_url: String,
    /// Reported as the audit-record origin instead of the request host.
    pub normalized_origin: String,

    // Image probe / registry
    pub use_registry: bool,
    pub registry_url: String,
    pub registry_username: String,
    pub registry_password: String,
    pub image_prefix: String,

    // Builder
    pub build_namespace: String,
    pub build_image: String,
    pub build_memory_limit: String,
    pub build_memory_request: String,
    pub build_docker_host: String,
    /// "key=value,key=value" node selector for build pods.
    pub build_node_selector: HashMap<String, String>,
    pub push_secret: String,
    pub log_tail_lines: i64,
    pub sticky_builds: bool,
    /// Dockerfile appendix template. Supports `{binder_url}`,
    /// `{persistent_binder_url}`, `{repo_url}` and `{ref_url}` placeholders.
    pub appendix: String,
    /// Use the scripted fake build backend instead of launching pods.
    pub fake_build: bool,

    // Launcher
    pub hub_url: String,
    pub hub_api_token: String,
    pub launcher_retries: u32,
    pub launcher_retry_delay_s: u64,
    pub allow_named_servers: bool,
    /// Default per-repo cap on concurrently running servers (0 = unlimited).
    pub launch_quota: u32,

    // Auth
    pub auth_enabled: bool,
    pub github_token: String,
    pub github_auth_client_id: String,
    /// Substrings of specs that are temporarily blocked from launching.
    pub banned_specs: Vec<String>,

    // Misc
    pub event_log_path: String,
    pub kube_request_timeout_s: u32,
    /// Delay before closing a finished stream so the client closes first.
    pub tail_close_delay_s: u64,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(_) => default,
        None => default,
    }
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse "key=value,key=value" into a node-selector map.
fn parse_selector(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some((k, v)) = entry.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8585,
            base_url: "/".into(),
            badge_base_url: String::new(),
            normalized_origin: String::new(),
            use_registry: false,
            registry_url: String::new(),
            registry_username: String::new(),
            registry_password: String::new(),
            image_prefix: String::new(),
            build_namespace: "default".into(),
            build_image: "quay.io/jupyterhub/repo2docker:main".into(),
            build_memory_limit: String::new(),
            build_memory_request: String::new(),
            build_docker_host: "/var/run/docker.sock".into(),
            build_node_selector: HashMap::new(),
            push_secret: String::new(),
            log_tail_lines: 100,
            sticky_builds: false,
            appendix: String::new(),
            fake_build: false,
            hub_url: String::new(),
            hub_api_token: String::new(),
            launcher_retries: 4,
            launcher_retry_delay_s: 4,
            allow_named_servers: false,
            launch_quota: 0,
            auth_enabled: false,
            github_token: String::new(),
            github_auth_client_id: String::new(),
            banned_specs: Vec::new(),
            event_log_path: String::new(),
            kube_request_timeout_s: 30,
            tail_close_delay_s: 60,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();
        let defaults = Config::default();

        Ok(Config {
            bind: get_str("BIND", &dotenv, &defaults.bind),
            port: get_u16("PORT", &dotenv, defaults.port),
            base_url: get_str("BASE_URL", &dotenv, &defaults.base_url),
            badge_base_url: get_str("BADGE_BASE_URL", &dotenv, ""),
            normalized_origin: get_str("NORMALIZED_ORIGIN", &dotenv, ""),
            use_registry: get_bool("USE_REGISTRY", &dotenv, defaults.use_registry),
            registry_url: get_str("REGISTRY_URL", &dotenv, ""),
            registry_username: get_str("REGISTRY_USERNAME", &dotenv, ""),
            registry_password: get_str("REGISTRY_PASSWORD", &dotenv, ""),
            image_prefix: get_str("IMAGE_PREFIX", &dotenv, ""),
            build_namespace: get_str("BUILD_NAMESPACE", &dotenv, &defaults.build_namespace),
            build_image: get_str("BUILD_IMAGE", &dotenv, &defaults.build_image),
            build_memory_limit: get_str("BUILD_MEMORY_LIMIT", &dotenv, ""),
            build_memory_request: get_str("BUILD_MEMORY_REQUEST", &dotenv, ""),
            build_docker_host: get_str(
                "BUILD_DOCKER_HOST",
                &dotenv,
                &defaults.build_docker_host,
            ),
            build_node_selector: parse_selector(&get_str("BUILD_NODE_SELECTOR", &dotenv, "")),
            push_secret: get_str("PUSH_SECRET", &dotenv, ""),
            log_tail_lines: get_i64("LOG_TAIL_LINES", &dotenv, defaults.log_tail_lines),
            sticky_builds: get_bool("STICKY_BUILDS", &dotenv, defaults.sticky_builds),
            appendix: get_str("APPENDIX", &dotenv, ""),
            fake_build: get_bool("FAKE_BUILD", &dotenv, defaults.fake_build),
            hub_url: get_str("HUB_URL", &dotenv, ""),
            hub_api_token: get_str("HUB_API_TOKEN", &dotenv, ""),
            launcher_retries: get_u32("LAUNCHER_RETRIES", &dotenv, defaults.launcher_retries),
            launcher_retry_delay_s: get_u64(
                "LAUNCHER_RETRY_DELAY_S",
                &dotenv,
                defaults.launcher_retry_delay_s,
            ),
            allow_named_servers: get_bool(
                "ALLOW_NAMED_SERVERS",
                &dotenv,
                defaults.allow_named_servers,
            ),
            launch_quota: get_u32("LAUNCH_QUOTA", &dotenv, defaults.launch_quota),
            auth_enabled: get_bool("AUTH_ENABLED", &dotenv, defaults.auth_enabled),
            github_token: get_str("GITHUB_TOKEN", &dotenv, ""),
            github_auth_client_id: get_str("GITHUB_AUTH_CLIENT_ID", &dotenv, ""),
            banned_specs: parse_list(&get_str("BANNED_SPECS", &dotenv, "")),
            event_log_path: get_str("EVENT_LOG_PATH", &dotenv, ""),
            kube_request_timeout_s: get_u32(
                "KUBE_REQUEST_TIMEOUT_S",
                &dotenv,
                defaults.kube_request_timeout_s,
            ),
            tail_close_delay_s: get_u64(
                "TAIL_CLOSE_DELAY_S",
                &dotenv,
                defaults.tail_close_delay_s,
            ),
        })
    }

    /// Render the appendix template for one request.
    pub fn render_appendix(
        &self,
        binder_url: &str,
        persistent_binder_url: &str,
        repo_url: &str,
        ref_url: &str,
    ) -> String {
        self.appendix
            .replace("{binder_url}", binder_url)
            .replace("{persistent_binder_url}", persistent_binder_url)
            .replace("{repo_url}", repo_url)
            .replace("{ref_url}", ref_url)
    }
}
