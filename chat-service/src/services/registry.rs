//! Session registry: at most one running relay session per chat.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A response is already being generated for this chat.")]
    AlreadyRunning,

    #[error("No response is being generated for this chat.")]
    NotFound,
}

#[derive(Debug)]
struct SessionEntry {
    session_id: String,
    cancel: CancellationToken,
}

/// Shared map from chat id to its running session.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `chat_id` for `session_id`.
    ///
    /// The returned guard deregisters the session when dropped, so every exit
    /// path of the owning task releases the chat.
    pub fn register(
        &self,
        chat_id: &str,
        session_id: &str,
        cancel: CancellationToken,
    ) -> Result<SessionGuard, RegistryError> {
        match self.sessions.entry(chat_id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRunning),
            Entry::Vacant(slot) => {
                slot.insert(SessionEntry {
                    session_id: session_id.to_string(),
                    cancel: cancel.clone(),
                });
                tracing::debug!(chat_id, session_id, "Session registered");
                Ok(SessionGuard {
                    registry: self.clone(),
                    chat_id: chat_id.to_string(),
                    session_id: session_id.to_string(),
                    cancel,
                })
            }
        }
    }

    /// Signal the running session of `chat_id` to stop. The session stays
    /// registered until its own task finishes.
    pub fn cancel(&self, chat_id: &str) -> Result<(), RegistryError> {
        let entry = self.sessions.get(chat_id).ok_or(RegistryError::NotFound)?;
        entry.cancel.cancel();
        tracing::info!(chat_id, session_id = %entry.session_id, "Session cancellation requested");
        Ok(())
    }

    /// Remove `session_id` if it still owns `chat_id`.
    pub fn deregister(&self, chat_id: &str, session_id: &str) -> bool {
        let removed = self
            .sessions
            .remove_if(chat_id, |_, entry| entry.session_id == session_id)
            .is_some();
        if removed {
            tracing::debug!(chat_id, session_id, "Session deregistered");
        }
        removed
    }

    pub fn is_running(&self, chat_id: &str) -> bool {
        self.sessions.contains_key(chat_id)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Ownership of a registered session.
pub struct SessionGuard {
    registry: SessionRegistry,
    chat_id: String,
    session_id: String,
    cancel: CancellationToken,
}

impl SessionGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.deregister(&self.chat_id, &self.session_id);
    }
}
