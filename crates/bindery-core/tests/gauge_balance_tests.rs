mod common;

use std::time::Duration;

use bindery_core::builder::BuildDriver;
use bindery_core::events::Emitter;
use bindery_core::launch::{LaunchContext, LaunchDriver};
use bindery_core::metrics::metrics;
use bindery_core::types::{BuildEvent, PodPhase, RepoLabels};
use common::{FakeLauncher, InertBuild, StaticScanner};
use serde_json::json;
use tokio::sync::mpsc;

fn build_driver(repo: &str) -> BuildDriver {
    BuildDriver {
        image_name: "builds/g:abc".into(),
        labels: RepoLabels {
            provider: "GitHub".into(),
            repo: repo.into(),
        },
    }
}

fn launch_driver(repo: &str, quota: Option<u32>) -> LaunchDriver {
    LaunchDriver {
        image_name: "builds/g:abc".into(),
        repo_url: repo.into(),
        namespace: "binder".into(),
        labels: RepoLabels {
            provider: "GitHub".into(),
            repo: repo.into(),
        },
        quota,
        auth_enabled: false,
    }
}

/// Every exit path must return the in-progress gauges to their prior value.
/// The paths run sequentially in one test so concurrent increments cannot
/// skew the readings.
#[tokio::test]
async fn test_inprogress_gauges_balance_on_every_exit_path() {
    let repo = "https://github.com/owner/gauges";
    let builds_before = metrics().builds_inprogress.get();
    let launches_before = metrics().launches_inprogress.get();

    // Successful build.
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (emitter, _frames) = Emitter::channel();
        tx.send(BuildEvent::PhaseChange(PodPhase::Deleted)).unwrap();
        build_driver(repo)
            .drive(InertBuild::new(), rx, &emitter)
            .await
            .unwrap();
    }
    assert_eq!(metrics().builds_inprogress.get(), builds_before);

    // Failed build (failure log, then the builder hangs up).
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (emitter, _frames) = Emitter::channel();
        tx.send(BuildEvent::Log(
            json!({"phase": "failure", "message": "nope"}).to_string(),
        ))
        .unwrap();
        drop(tx);
        let outcome = build_driver(repo)
            .drive(InertBuild::new(), rx, &emitter)
            .await
            .unwrap();
        assert!(outcome.failed);
    }
    assert_eq!(metrics().builds_inprogress.get(), builds_before);

    // Client disconnect mid-build: the first emit fails and the driver
    // unwinds with an error.
    {
        let (_tx, rx) = mpsc::unbounded_channel::<BuildEvent>();
        let (emitter, frames) = Emitter::channel();
        drop(frames);
        let result = build_driver(repo)
            .drive(InertBuild::new(), rx, &emitter)
            .await;
        assert!(result.is_err());
    }
    assert_eq!(metrics().builds_inprogress.get(), builds_before);

    // Successful launch.
    {
        let launcher = FakeLauncher::new(1, Duration::from_millis(5), 0);
        let scanner = StaticScanner { matching: 0, total: 0 };
        let (emitter, _frames) = Emitter::channel();
        launch_driver(repo, None)
            .launch(&scanner, &launcher, &emitter, &LaunchContext::default())
            .await
            .unwrap();
    }
    assert_eq!(metrics().launches_inprogress.get(), launches_before);

    // Quota rejection.
    {
        let launcher = FakeLauncher::new(1, Duration::from_millis(5), 0);
        let scanner = StaticScanner { matching: 9, total: 9 };
        let (emitter, _frames) = Emitter::channel();
        let launched = launch_driver(repo, Some(1))
            .launch(&scanner, &launcher, &emitter, &LaunchContext::default())
            .await
            .unwrap();
        assert!(!launched);
    }
    assert_eq!(metrics().launches_inprogress.get(), launches_before);

    // Terminal launch failure.
    {
        let launcher = FakeLauncher::new(2, Duration::from_millis(5), 99);
        let scanner = StaticScanner { matching: 0, total: 0 };
        let (emitter, _frames) = Emitter::channel();
        let result = launch_driver(repo, None)
            .launch(&scanner, &launcher, &emitter, &LaunchContext::default())
            .await;
        assert!(result.is_err());
    }
    assert_eq!(metrics().launches_inprogress.get(), launches_before);

    // Client disconnect mid-launch.
    {
        let launcher = FakeLauncher::new(1, Duration::from_millis(5), 0);
        let scanner = StaticScanner { matching: 0, total: 0 };
        let (emitter, frames) = Emitter::channel();
        drop(frames);
        let result = launch_driver(repo, None)
            .launch(&scanner, &launcher, &emitter, &LaunchContext::default())
            .await;
        assert!(result.is_err());
    }
    assert_eq!(metrics().launches_inprogress.get(), launches_before);
}
