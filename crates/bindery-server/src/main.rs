mod routes;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use bindery_build::{FakeBuildFactory, KubeBuildFactory};
use bindery_core::build::BuildFactory;
use bindery_core::config::Config;
use bindery_core::coordinator::Coordinator;
use bindery_core::eventlog::EventLog;
use bindery_core::hub::HubLauncher;
use bindery_core::launch::{KubePodScanner, PodScanner};
use bindery_core::probe::{ImageProbe, LocalDockerProbe, RegistryProbe};
use bindery_core::tokenstore::TokenStore;
use bindery_providers::default_providers;
use tower_http::cors::CorsLayer;
use tracing::info;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

/// Pod scanner for cluster-less deployments (fake builds): reports an empty
/// namespace so quota checks always pass.
struct NoClusterPodScanner;

#[async_trait]
impl PodScanner for NoClusterPodScanner {
    async fn image_pod_counts(
        &self,
        _namespace: &str,
        _image_no_tag: &str,
    ) -> Result<(usize, usize)> {
        Ok((0, 0))
    }
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "bindery_server=info,bindery_core=info,bindery_build=info,bindery_providers=info,tower_http=warn"
            .into()
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    let probe: Arc<dyn ImageProbe> = if config.use_registry {
        Arc::new(RegistryProbe::new(
            &config.registry_url,
            &config.registry_username,
            &config.registry_password,
        ))
    } else {
        Arc::new(LocalDockerProbe)
    };

    // The cluster is only contacted for real builds and quota checks; fake
    // mode runs entirely without one.
    let (build_factory, scanner): (Arc<dyn BuildFactory>, Arc<dyn PodScanner>) =
        if config.fake_build {
            info!("fake_build is set; builds are scripted and no cluster is used");
            (Arc::new(FakeBuildFactory), Arc::new(NoClusterPodScanner))
        } else {
            let client = kube::Client::try_default().await?;
            (
                Arc::new(KubeBuildFactory::new(client.clone())),
                Arc::new(KubePodScanner::new(client, config.kube_request_timeout_s)),
            )
        };

    let coordinator = Arc::new(Coordinator {
        config: Arc::clone(&config),
        providers: default_providers(&config),
        probe,
        build_factory,
        scanner,
        launcher: Arc::new(HubLauncher::new(&config)),
        tokenstore: Arc::new(TokenStore::new()),
        event_log: Arc::new(EventLog::new(&config.event_log_path)),
    });

    let state = Arc::new(AppState { coordinator });

    let app = Router::new()
        .route("/build/:provider_prefix/*spec", get(routes::build_stream))
        .route("/metrics", get(routes::metrics_text))
        .route("/api/health", get(routes::health))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.bind, config.port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
