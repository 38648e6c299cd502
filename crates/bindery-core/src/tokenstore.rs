use std::collections::HashMap;
use std::sync::Mutex;

use rand::RngCore;

#[derive(Debug, Clone)]
struct Session {
    user: String,
    auth_provider_id: String,
}

/// Process-wide store of repo access tokens and pending auth sessions.
///
/// Tokens are keyed by `(user, auth_provider_id)`; sessions map an opaque
/// `state` handed to the authorization flow back to that key so the token
/// can be registered when the client returns.
#[derive(Default)]
pub struct TokenStore {
    sessions: Mutex<HashMap<String, Session>>,
    tokens: Mutex<HashMap<(String, String), String>>,
}

fn random_state() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin an authorization session; the returned state is threaded
    /// through the provider's authorization URL.
    pub fn new_session(&self, user: &str, auth_provider_id: &str) -> String {
        let state = random_state();
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                state.clone(),
                Session {
                    user: user.to_string(),
                    auth_provider_id: auth_provider_id.to_string(),
                },
            );
        state
    }

    /// Register a token for the session identified by `state`. Unknown or
    /// mismatched sessions are ignored.
    pub fn register_token(&self, user: &str, state: &str, token: &str) {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(state);
        let Some(session) = session else {
            return;
        };
        if session.user != user {
            return;
        }
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((session.user, session.auth_provider_id), token.to_string());
    }

    pub fn get_access_token_for(&self, user: &str, auth_provider_id: &str) -> Option<String> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(user.to_string(), auth_provider_id.to_string()))
            .cloned()
    }
}
