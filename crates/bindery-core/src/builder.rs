use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, warn};

use crate::build::BuildBackend;
use crate::events::{ClientEvent, Emitter};
use crate::metrics::{metrics, InprogressGuard};
use crate::types::{BuildEvent, PodPhase, RepoLabels};

/// Terminal state of one driven build.
pub struct BuildOutcome {
    /// A failure marker was observed in the builder's log stream. The launch
    /// step is skipped when set.
    pub failed: bool,
}

/// Drives one build job: submits it, consumes the backend's event queue, and
/// translates pod phases and log lines into client events.
pub struct BuildDriver {
    pub image_name: String,
    pub labels: RepoLabels,
}

impl BuildDriver {
    /// Run the build to completion.
    ///
    /// Pod deletion is the completion signal: the builder pod exiting means
    /// the image was pushed, unless a failure log event arrived first. A
    /// failure that skips the log stream would be misclassified here; a
    /// stricter builder would emit an explicit success marker instead.
    pub async fn drive(
        &self,
        build: Arc<dyn BuildBackend>,
        mut events: UnboundedReceiver<BuildEvent>,
        emitter: &Emitter,
    ) -> Result<BuildOutcome> {
        let _inprogress = InprogressGuard::builds();
        let start = Instant::now();

        // Submission runs off the request task; progress arrives on the queue.
        let submit = Arc::clone(&build);
        tokio::spawn(async move {
            if let Err(e) = submit.submit().await {
                error!("build submit failed: {e}");
            }
        });

        emitter.emit(
            &ClientEvent::phase("waiting").with_message("Waiting for build to start...\n"),
        )?;

        let mut log_streaming = false;
        let mut failed = false;

        loop {
            let Some(event) = events.recv().await else {
                if failed {
                    // The builder hung up after reporting failure; nothing
                    // more will arrive and no terminal frame is owed.
                    break;
                }
                bail!("builder event queue closed before completion");
            };

            match event {
                BuildEvent::PhaseChange(PodPhase::Pending) => {}
                BuildEvent::PhaseChange(PodPhase::Running) => {
                    // Start capturing logs once the pod is running. Repeated
                    // Running transitions must not spawn a second stream.
                    if !log_streaming {
                        log_streaming = true;
                        let logs = Arc::clone(&build);
                        tokio::spawn(async move {
                            if let Err(e) = logs.stream_logs().await {
                                warn!("build log streaming ended: {e}");
                            }
                        });
                    }
                }
                BuildEvent::PhaseChange(PodPhase::Succeeded) => {}
                BuildEvent::PhaseChange(PodPhase::Deleted) => {
                    emitter.emit(&ClientEvent::built(
                        &self.image_name,
                        "Built image, launching...\n",
                    ))?;
                    break;
                }
                BuildEvent::PhaseChange(PodPhase::Other(phase)) => {
                    emitter.emit(&ClientEvent::phase(phase))?;
                }
                BuildEvent::Log(line) => {
                    // Logs are already structured JSON; inspect the phase
                    // marker lazily and pass the line through untouched.
                    if !failed {
                        if let Ok(payload) = serde_json::from_str::<serde_json::Value>(&line) {
                            let phase = payload.get("phase").and_then(|p| p.as_str());
                            if matches!(phase, Some("failure") | Some("failed")) {
                                failed = true;
                                metrics().record_build(
                                    "failure",
                                    &self.labels,
                                    start.elapsed().as_secs_f64(),
                                );
                            }
                        }
                    }
                    emitter.emit_raw(line)?;
                }
            }
        }

        if !failed {
            metrics().record_build("success", &self.labels, start.elapsed().as_secs_f64());
        }

        Ok(BuildOutcome { failed })
    }
}
