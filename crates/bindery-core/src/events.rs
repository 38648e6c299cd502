use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

// ── Client-facing events ─────────────────────────────────────────────────

/// One progress event on the request's event stream.
///
/// Serialized once and written as a single frame, so a partially-built event
/// can never reach the client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientEvent {
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "imageName", skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Extra launcher-provided fields merged into the `ready` event.
    /// An empty map flattens to nothing.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClientEvent {
    pub fn phase(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            message: None,
            image_name: None,
            authorization_url: None,
            url: None,
            status_code: None,
            extra: Map::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::phase("failed").with_message(message)
    }

    pub fn built(image_name: impl Into<String>, message: impl Into<String>) -> Self {
        let mut ev = Self::phase("built").with_message(message);
        ev.image_name = Some(image_name.into());
        ev
    }

    pub fn auth(authorization_url: impl Into<String>) -> Self {
        let mut ev = Self::phase("auth").with_message("Authorization required...\n");
        ev.authorization_url = Some(authorization_url.into());
        ev
    }

    pub fn ready(url: impl Into<String>, server_info: Map<String, Value>) -> Self {
        let url = url.into();
        let mut ev = Self::phase("ready").with_message(format!("server running at {url}\n"));
        let mut extra = server_info;
        // `url` has its own field; don't duplicate it in the flattened map.
        extra.remove("url");
        ev.url = Some(url);
        ev.extra = extra;
        ev
    }
}

// ── Emitter ──────────────────────────────────────────────────────────────

/// Sending half of a request's event stream.
///
/// Frames are JSON-serialized here and handed to the transport whole. A send
/// failure means the client hung up; callers treat that as cancellation.
#[derive(Clone)]
pub struct Emitter {
    tx: mpsc::UnboundedSender<String>,
}

impl Emitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: &ClientEvent) -> Result<()> {
        self.emit_raw(serde_json::to_string(event)?)
    }

    /// Forward an already-serialized frame (builder log lines arrive as
    /// structured JSON and are passed through untouched).
    pub fn emit_raw(&self, frame: impl Into<String>) -> Result<()> {
        self.tx
            .send(frame.into())
            .map_err(|_| anyhow!("event stream closed by client"))
    }

    /// Emit a terminal failure frame. The stream cannot change its HTTP
    /// status after the first byte, so all post-start failures go this way.
    pub fn fail(&self, message: &str) -> Result<()> {
        self.emit(&ClientEvent::failed(format!("{message}\n")))
    }

    pub fn fail_with_status(&self, status_code: u16, message: &str) -> Result<()> {
        let mut ev = ClientEvent::failed(format!("{message}\n"));
        ev.status_code = Some(status_code);
        self.emit(&ev)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
