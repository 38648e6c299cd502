use bindery_core::events::{ClientEvent, Emitter};
use serde_json::{json, Map, Value};

#[test]
fn test_minimal_event_serializes_phase_only() {
    let frame = serde_json::to_value(ClientEvent::phase("waiting")).unwrap();
    assert_eq!(frame, json!({"phase": "waiting"}));
}

#[test]
fn test_built_event_uses_camel_case_image_name() {
    let frame =
        serde_json::to_value(ClientEvent::built("builds/x:abc", "Built image, launching...\n"))
            .unwrap();
    assert_eq!(frame["phase"], "built");
    assert_eq!(frame["imageName"], "builds/x:abc");
    assert_eq!(frame["message"], "Built image, launching...\n");
    assert!(frame.get("image_name").is_none());
}

#[test]
fn test_auth_event_carries_authorization_url() {
    let frame = serde_json::to_value(ClientEvent::auth("https://example.org/auth")).unwrap();
    assert_eq!(frame["phase"], "auth");
    assert_eq!(frame["authorization_url"], "https://example.org/auth");
}

#[test]
fn test_ready_event_merges_server_info() {
    let mut info = Map::new();
    info.insert("url".into(), json!("http://hub/user/a/"));
    info.insert("token".into(), json!("secret"));
    let frame =
        serde_json::to_value(ClientEvent::ready("http://hub/user/a/", info)).unwrap();
    assert_eq!(frame["phase"], "ready");
    assert_eq!(frame["url"], "http://hub/user/a/");
    assert_eq!(frame["token"], "secret");
    assert_eq!(frame["message"], "server running at http://hub/user/a/\n");
}

#[test]
fn test_failed_with_status_code() {
    let mut ev = ClientEvent::failed("boom\n");
    ev.status_code = Some(500);
    let frame = serde_json::to_value(ev).unwrap();
    assert_eq!(frame["phase"], "failed");
    assert_eq!(frame["status_code"], 500);
}

#[tokio::test]
async fn test_emitter_passes_frames_in_order() {
    let (emitter, mut rx) = Emitter::channel();
    emitter.emit(&ClientEvent::phase("waiting")).unwrap();
    emitter.emit_raw(r#"{"phase":"building","message":"step 1\n"}"#).unwrap();
    emitter.fail("nope").unwrap();

    let a: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    let b: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    let c: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(a["phase"], "waiting");
    assert_eq!(b["phase"], "building");
    assert_eq!(c["phase"], "failed");
    assert_eq!(c["message"], "nope\n");
}

#[tokio::test]
async fn test_emitter_errors_after_client_disconnect() {
    let (emitter, rx) = Emitter::channel();
    drop(rx);
    assert!(emitter.is_closed());
    assert!(emitter.emit(&ClientEvent::phase("waiting")).is_err());
}
