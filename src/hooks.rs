//! Host callbacks around a session's lifetime

use crate::data::Session;

/// Implemented by the host embedding the orchestrator; passed once at construction.
pub trait SessionHooks: Send + Sync {
    /// The session record was created and persisted.
    fn on_session_start(&self, _session: &Session) {}

    /// The session reached a terminal status.
    fn on_session_end(&self, _session: &Session) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SessionHooks for NoopHooks {}
