use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bindery_core::build::{BuildBackend, BuildFactory};
use bindery_core::types::{BuildEvent, BuildSpec, PodPhase};
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Scripted build backend for local development and tests: walks through
/// the normal phase sequence without touching a cluster.
pub struct FakeBuild {
    events: UnboundedSender<BuildEvent>,
    spec: BuildSpec,
    cancel: CancellationToken,
}

impl FakeBuild {
    pub fn new(events: UnboundedSender<BuildEvent>, spec: BuildSpec) -> Self {
        Self {
            events,
            spec,
            cancel: CancellationToken::new(),
        }
    }

    fn send(&self, event: BuildEvent) {
        let _ = self.events.send(event);
    }

    async fn pause(&self, d: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }
}

#[async_trait]
impl BuildBackend for FakeBuild {
    async fn submit(&self) -> Result<()> {
        info!("fake build {} submitted", self.spec.name);
        self.send(BuildEvent::PhaseChange(PodPhase::Pending));
        if !self.pause(Duration::from_millis(200)).await {
            return Ok(());
        }
        self.send(BuildEvent::PhaseChange(PodPhase::Running));
        if !self.pause(Duration::from_secs(1)).await {
            return Ok(());
        }
        self.send(BuildEvent::PhaseChange(PodPhase::Deleted));
        Ok(())
    }

    async fn stream_logs(&self) -> Result<()> {
        self.send(BuildEvent::Log(
            json!({
                "phase": "building",
                "message": format!("Step 1/1 : FROM {}\n", self.spec.build_image),
            })
            .to_string(),
        ));
        self.send(BuildEvent::Log(
            json!({
                "phase": "building",
                "message": format!("Successfully tagged {}\n", self.spec.image_name),
            })
            .to_string(),
        ));
        Ok(())
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Creates a [`FakeBuild`] per request; selected by the `fake_build` setting.
pub struct FakeBuildFactory;

impl BuildFactory for FakeBuildFactory {
    fn create(
        &self,
        events: UnboundedSender<BuildEvent>,
        spec: BuildSpec,
    ) -> Arc<dyn BuildBackend> {
        Arc::new(FakeBuild::new(events, spec))
    }
}
