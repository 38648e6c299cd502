use bindery_core::tokenstore::TokenStore;
use bindery_core::types::{BuildEvent, PodPhase, RepoSpec};
use serde_json::json;

#[test]
fn test_build_event_wire_shape() {
    let phase = serde_json::to_value(BuildEvent::PhaseChange(PodPhase::Running)).unwrap();
    assert_eq!(phase, json!({"kind": "pod.phasechange", "payload": "Running"}));

    let log = serde_json::to_value(BuildEvent::Log("{\"phase\":\"building\"}".into())).unwrap();
    assert_eq!(log, json!({"kind": "log", "payload": "{\"phase\":\"building\"}"}));
}

#[test]
fn test_build_event_roundtrip() {
    let raw = r#"{"kind":"pod.phasechange","payload":"Deleted"}"#;
    let event: BuildEvent = serde_json::from_str(raw).unwrap();
    assert_eq!(event, BuildEvent::PhaseChange(PodPhase::Deleted));
}

#[test]
fn test_unknown_pod_phase_token_is_preserved() {
    let event: BuildEvent =
        serde_json::from_str(r#"{"kind":"pod.phasechange","payload":"Unschedulable"}"#).unwrap();
    let BuildEvent::PhaseChange(phase) = event else {
        panic!("wrong variant");
    };
    assert_eq!(phase, PodPhase::Other("Unschedulable".into()));
    assert_eq!(phase.as_str(), "Unschedulable");
}

#[test]
fn test_repo_spec_strips_trailing_slash() {
    let spec = RepoSpec::new("gh", "owner/repo/main/");
    assert_eq!(spec.raw_spec, "owner/repo/main");
    assert_eq!(spec.key(), "gh:owner/repo/main");
}

#[test]
fn test_tokenstore_roundtrip() {
    let store = TokenStore::new();
    assert!(store.get_access_token_for("alice", "github").is_none());

    let state = store.new_session("alice", "github");
    store.register_token("alice", &state, "tok-1");
    assert_eq!(
        store.get_access_token_for("alice", "github").as_deref(),
        Some("tok-1")
    );

    // Other users and providers stay isolated.
    assert!(store.get_access_token_for("bob", "github").is_none());
    assert!(store.get_access_token_for("alice", "gitlab").is_none());
}

#[test]
fn test_tokenstore_rejects_mismatched_user() {
    let store = TokenStore::new();
    let state = store.new_session("alice", "github");
    store.register_token("mallory", &state, "tok-stolen");
    assert!(store.get_access_token_for("alice", "github").is_none());
    assert!(store.get_access_token_for("mallory", "github").is_none());
}

#[test]
fn test_tokenstore_states_are_unique() {
    let store = TokenStore::new();
    let a = store.new_session("alice", "github");
    let b = store.new_session("alice", "github");
    assert_ne!(a, b);
}
