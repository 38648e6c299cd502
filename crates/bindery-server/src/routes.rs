use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{AppendHeaders, IntoResponse, Json};
use bindery_core::coordinator::BuildRequest;
use bindery_core::events::Emitter;
use bindery_core::metrics::metrics;
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::AppState;

/// Keepalive period; proxies tend to cut idle streams well above this.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

// ── Helpers ──────────────────────────────────────────────────────────────

/// Decode a raw query string into ordered (key, value) pairs, preserving
/// repeated keys (needed for multi-valued `useropt.` arguments).
fn parse_query(raw: &str) -> Vec<(String, String)> {
    let mut args = Vec::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key).map(|k| k.into_owned());
        let value = urlencoding::decode(&value.replace('+', " ")).map(|v| v.into_owned());
        if let (Ok(key), Ok(value)) = (key, value) {
            args.push((key, value));
        }
    }
    args
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

// ── Handlers ─────────────────────────────────────────────────────────────

pub(crate) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn metrics_text() -> impl IntoResponse {
    let encoder = prometheus::TextEncoder::new();
    match encoder.encode_to_string(&metrics().registry().gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("metrics encoding failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `GET /build/{provider_prefix}/{spec...}` — the build-and-launch stream.
///
/// The whole request runs in a spawned task writing frames into a channel;
/// this handler only owns the SSE plumbing. When the client disconnects the
/// receiver drops, the next emit in the task fails, and the coordinator
/// unwinds through its cancellation path.
pub(crate) async fn build_stream(
    State(state): State<Arc<AppState>>,
    Path((provider_prefix, spec)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> impl IntoResponse {
    let query_args = parse_query(query.as_deref().unwrap_or(""));
    let arg = |name: &str| {
        query_args
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };
    let userctx = arg("userctx");
    let repo_token = arg("repo_token");

    let host = header_str(&headers, "host").unwrap_or("localhost").to_string();
    let proto = header_str(&headers, "x-forwarded-proto").unwrap_or("http");
    let launch_host = format!("{proto}://{host}{}", state.coordinator.config.base_url);
    let user = header_str(&headers, "x-remote-user").map(str::to_string);

    let req = BuildRequest {
        provider_prefix,
        spec,
        userctx,
        repo_token,
        query_args,
        user,
        origin_host: host,
        launch_host,
    };

    let (emitter, rx) = Emitter::channel();
    let coordinator = Arc::clone(&state.coordinator);
    tokio::spawn(async move {
        let key = format!("{}:{}", req.provider_prefix, req.spec);
        if let Err(e) = coordinator.run(req, emitter).await {
            warn!("build stream for {key} ended: {e}");
        }
    });

    let stream = UnboundedReceiverStream::new(rx)
        .map(|frame| Ok::<_, Infallible>(Event::default().data(frame)));
    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    );

    // Streams must not be cached or buffered by intermediaries.
    (AppendHeaders([(header::CACHE_CONTROL, "no-cache")]), sse)
}

#[cfg(test)]
mod tests {
    use super::parse_query;

    #[test]
    fn test_parse_query_preserves_repeated_keys() {
        let args = parse_query("useropt.mounts=%2Fdata&useropt.mounts=%2Fscratch&userctx=ci");
        assert_eq!(
            args,
            vec![
                ("useropt.mounts".to_string(), "/data".to_string()),
                ("useropt.mounts".to_string(), "/scratch".to_string()),
                ("userctx".to_string(), "ci".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_query_decodes_plus_and_empty_values() {
        let args = parse_query("repo_token=&useropt.note=hello+world");
        assert_eq!(args[0], ("repo_token".to_string(), String::new()));
        assert_eq!(args[1], ("useropt.note".to_string(), "hello world".to_string()));
    }

    #[test]
    fn test_parse_query_empty() {
        assert!(parse_query("").is_empty());
    }
}
