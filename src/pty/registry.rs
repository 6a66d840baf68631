//! Process-wide registry of live sessions.
//!
//! The registry is the single owner of every spawned process: entries are
//! inserted once a spawn succeeds and removed synchronously with whichever
//! teardown path wins (natural exit, explicit kill, replacement, disconnect).
//! Connections hold session IDs, never sessions.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::session::{ExitInfo, PtySession};

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<PtySession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn insert(&self, session: Arc<PtySession>) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<PtySession>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Removes an entry without touching the process. The caller decides
    /// whether the removal entitles it to report termination.
    pub fn remove(&self, id: &str) -> Option<Arc<PtySession>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Removes the session and blocks (on the blocking pool) until its
    /// process has been reaped. Returns `None` when the entry was already
    /// gone, which callers treat as "someone else owns the termination".
    pub async fn terminate(&self, id: &str) -> Option<ExitInfo> {
        let session = self.remove(id)?;
        let info = tokio::task::spawn_blocking(move || session.kill_and_wait())
            .await
            .unwrap_or_default();
        debug!(session_id = %id, exit_code = ?info.exit_code, "session terminated");
        Some(info)
    }

    /// Shutdown sweep: terminates every live session before the server exits.
    pub async fn terminate_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if self.terminate(&id).await.is_some() {
                info!(session_id = %id, "terminated session during shutdown");
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::session::{DEFAULT_COLS, DEFAULT_ROWS};
    use uuid::Uuid;

    fn spawn_registered(registry: &SessionRegistry, command: &str, args: &[&str]) -> Arc<PtySession> {
        let id = Uuid::new_v4().to_string();
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let (session, _reader) =
            PtySession::spawn(id, command, &args, DEFAULT_COLS, DEFAULT_ROWS).unwrap();
        let session = Arc::new(session);
        registry.insert(session.clone());
        session
    }

    #[tokio::test]
    async fn insert_get_remove_roundtrip() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());

        let session = spawn_registered(&registry, "/bin/sh", &[]);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&session.id));
        assert!(registry.get(&session.id).is_some());

        let removed = registry.remove(&session.id).unwrap();
        assert_eq!(removed.id, session.id);
        assert!(registry.is_empty());

        session.kill_and_wait();
    }

    #[tokio::test]
    async fn terminate_kills_the_process_and_drops_the_entry() {
        let registry = SessionRegistry::new();
        let session = spawn_registered(&registry, "/bin/sh", &[]);

        let info = registry.terminate(&session.id).await;
        assert!(info.is_some());
        assert!(!session.is_alive());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn terminate_missing_session_is_none() {
        let registry = SessionRegistry::new();
        assert!(registry.terminate("no-such-session").await.is_none());
    }

    #[tokio::test]
    async fn terminate_all_empties_the_registry() {
        let registry = SessionRegistry::new();
        let a = spawn_registered(&registry, "/bin/sh", &[]);
        let b = spawn_registered(&registry, "/bin/sh", &[]);
        assert_eq!(registry.len(), 2);

        registry.terminate_all().await;
        assert!(registry.is_empty());
        assert!(!a.is_alive());
        assert!(!b.is_alive());
    }
}
