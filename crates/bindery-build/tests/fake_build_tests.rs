use bindery_build::fake::{FakeBuild, FakeBuildFactory};
use bindery_core::build::{BuildBackend, BuildFactory};
use bindery_core::types::{BuildEvent, BuildSpec, PodPhase};
use tokio::sync::mpsc;

fn spec() -> BuildSpec {
    BuildSpec {
        name: "build-owner-2drepo-abcdef-main".into(),
        namespace: "binder".into(),
        repo_url: "https://github.com/owner/repo".into(),
        git_ref: "abc123".into(),
        image_name: "builds/owner-2drepo-abcdef:abc123".into(),
        build_image: "builder:latest".into(),
        ..BuildSpec::default()
    }
}

#[tokio::test]
async fn test_fake_build_walks_the_phase_sequence() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let build = FakeBuild::new(tx, spec());

    build.submit().await.unwrap();

    let mut phases = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let BuildEvent::PhaseChange(phase) = event {
            phases.push(phase);
        }
    }
    assert_eq!(
        phases,
        vec![PodPhase::Pending, PodPhase::Running, PodPhase::Deleted]
    );
}

#[tokio::test]
async fn test_fake_build_logs_are_json() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let build = FakeBuild::new(tx, spec());

    build.stream_logs().await.unwrap();

    let mut saw_log = false;
    while let Ok(event) = rx.try_recv() {
        if let BuildEvent::Log(line) = event {
            saw_log = true;
            let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(parsed["phase"], "building");
        }
    }
    assert!(saw_log);
}

#[tokio::test]
async fn test_fake_build_stop_cuts_the_sequence_short() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let build = FakeBuildFactory.create(tx, spec());

    build.stop();
    build.submit().await.unwrap();

    let mut phases = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let BuildEvent::PhaseChange(phase) = event {
            phases.push(phase);
        }
    }
    assert!(
        !phases.contains(&PodPhase::Deleted),
        "stopped build must not reach Deleted, got {phases:?}"
    );
}
