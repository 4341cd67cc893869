//! Session identity and bearer credentials.
//!
//! Credential storage lives outside this crate; the connection only asks a
//! [`TokenProvider`] for the current token each time it opens a session or
//! sends a frame.

use std::sync::{Arc, RwLock};

use parley_shared::{SenderInfo, UserId};

/// Source of the bearer token attached to every frame.
pub trait TokenProvider: Send + Sync {
    fn auth_token(&self) -> Option<String>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn auth_token(&self) -> Option<String> {
        self()
    }
}

/// A token that can be replaced at runtime (e.g. after a refresh) or cleared
/// on logout.
#[derive(Clone, Default)]
pub struct SharedToken {
    inner: Arc<RwLock<Option<String>>>,
}

impl SharedToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(token.into()))),
        }
    }

    pub fn set(&self, token: Option<String>) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = token;
        }
    }
}

impl TokenProvider for SharedToken {
    fn auth_token(&self) -> Option<String> {
        self.inner.read().ok().and_then(|guard| guard.clone())
    }
}

/// The authenticated user a connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: UserId,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl CurrentUser {
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            display_name: None,
            avatar_url: None,
        }
    }

    /// Sender fields stamped on optimistic messages.
    pub fn as_sender(&self) -> SenderInfo {
        SenderInfo {
            id: self.id,
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}
