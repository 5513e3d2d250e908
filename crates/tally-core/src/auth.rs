//! Credential handling for outgoing requests.
//!
//! The bearer token is issued by an external identity provider and handed to
//! a [`CredentialStore`]. [`AuthSession`] turns the stored state into exactly
//! one identity header per request and broadcasts [`AuthEvent`]s so the UI
//! can react to sign-out and credential invalidation.

use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;

/// Storage for the current bearer credential.
pub trait CredentialStore: Send + Sync {
    fn token(&self) -> Option<String>;
    fn set_token(&self, token: String);
    fn clear(&self);
}

/// Process-local credential store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    token: RwLock<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_token(&self, token: String) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = Some(token);
    }

    fn clear(&self) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Session transitions observable by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    /// The server rejected the credential (HTTP 401); it has been cleared.
    Invalidated,
}

/// The identity attached to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthHeader {
    Bearer(String),
    DevUser(String),
    Anonymous,
}

impl AuthHeader {
    /// Header name and value, if any.
    pub fn to_header(&self) -> Option<(String, String)> {
        match self {
            AuthHeader::Bearer(token) => {
                Some(("Authorization".to_string(), format!("Bearer {}", token)))
            }
            AuthHeader::DevUser(id) => {
                Some((NetworkConfig::DEV_USER_HEADER.to_string(), id.clone()))
            }
            AuthHeader::Anonymous => None,
        }
    }
}

/// Resolves request credentials and owns credential invalidation.
pub struct AuthSession {
    store: Arc<dyn CredentialStore>,
    dev_user_id: Option<String>,
    events: broadcast::Sender<AuthEvent>,
}

impl AuthSession {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            store,
            dev_user_id: None,
            events,
        }
    }

    /// Session with an empty in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCredentialStore::new()))
    }

    /// Opt in to the development identity header for unauthenticated requests.
    pub fn with_dev_user_id(mut self, id: Option<String>) -> Self {
        self.dev_user_id = id.filter(|id| !id.is_empty());
        self
    }

    pub fn token(&self) -> Option<String> {
        self.store.token()
    }

    pub fn is_signed_in(&self) -> bool {
        self.store.token().is_some()
    }

    /// Store a credential from the identity provider.
    pub fn login(&self, token: impl Into<String>) {
        self.store.set_token(token.into());
        info!("Credential stored");
        let _ = self.events.send(AuthEvent::SignedIn);
    }

    /// Explicit sign-out.
    pub fn logout(&self) {
        self.store.clear();
        info!("Signed out");
        let _ = self.events.send(AuthEvent::SignedOut);
    }

    /// Clear the credential after the server rejected it.
    pub fn invalidate(&self) {
        self.store.clear();
        warn!("Credential rejected by server; cleared stored token");
        let _ = self.events.send(AuthEvent::Invalidated);
    }

    /// Invalidate only if `sent` is still the stored credential.
    ///
    /// A rejection of a token that was replaced mid-flight leaves the new
    /// token alone. Returns whether the credential was cleared.
    pub fn invalidate_if_current(&self, sent: Option<&str>) -> bool {
        if self.store.token().as_deref() != sent {
            debug!("Ignoring rejection of a credential that was already replaced");
            return false;
        }
        self.invalidate();
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    /// Identity for one request.
    ///
    /// A stored bearer token always wins. Without one, the caller supplied
    /// development id is used, then the session's configured one.
    pub fn resolve(&self, caller_dev_user: Option<&str>) -> AuthHeader {
        if let Some(token) = self.store.token() {
            return AuthHeader::Bearer(token);
        }

        caller_dev_user
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| self.dev_user_id.clone())
            .map(AuthHeader::DevUser)
            .unwrap_or(AuthHeader::Anonymous)
    }
}
