use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::types::{BuildEvent, BuildSpec};

/// A backend that runs one build job and reports progress as [`BuildEvent`]s
/// on the queue it was constructed with.
///
/// `submit` and `stream_logs` are long-running; the build driver spawns them
/// as tasks so the request task is never blocked. `stop` detaches from the
/// job without tearing it down — other subscribers to a sticky build keep
/// receiving events.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Submit the build job and push pod-phase events until it completes.
    async fn submit(&self) -> Result<()>;

    /// Follow the builder's structured log output, pushing one log event per
    /// line. Called once, after the pod reaches `Running`.
    async fn stream_logs(&self) -> Result<()>;

    /// Detach from the job: phase watching and log streaming stop.
    fn stop(&self);
}

/// Creates a build backend per request. The server wires this to the kube
/// pod builder, or to the scripted fake when `fake_build` is set.
pub trait BuildFactory: Send + Sync {
    fn create(&self, events: UnboundedSender<BuildEvent>, spec: BuildSpec)
        -> Arc<dyn BuildBackend>;
}
