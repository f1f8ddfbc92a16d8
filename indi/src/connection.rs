//! Session-keyed connections
//!
//! Callers own a [`ConnectionManager`] and get `Arc<IndiClient>` handles out
//! of it. A client lives from `connect` until `disconnect` or `shutdown`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::transport::Transport;
use crate::{IndiClient, IndiClientConfig, IndiError, IndiResult};

/// Identifier of one connection (an interface index, a UI tab, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<usize> for SessionId {
    fn from(index: usize) -> Self {
        Self(index.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owner of all live clients
#[derive(Default)]
pub struct ConnectionManager {
    clients: Mutex<HashMap<SessionId, Arc<IndiClient>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client for `session` and connect it
    pub async fn connect(
        &self,
        session: SessionId,
        transport: Arc<dyn Transport>,
        config: IndiClientConfig,
    ) -> IndiResult<Arc<IndiClient>> {
        if self.clients.lock().contains_key(&session) {
            tracing::warn!("Session '{}' is already connected", session);
            return Err(IndiError::DuplicateConnection(session.to_string()));
        }

        let client = Arc::new(IndiClient::new(transport, config));
        client.connect().await?;

        let inserted = {
            let mut clients = self.clients.lock();
            if clients.contains_key(&session) {
                false
            } else {
                clients.insert(session.clone(), client.clone());
                true
            }
        };
        if !inserted {
            // lost a race with another connect for the same session
            let _ = client.disconnect().await;
            return Err(IndiError::DuplicateConnection(session.to_string()));
        }
        tracing::info!("Session '{}' connected", session);
        Ok(client)
    }

    pub fn client(&self, session: &SessionId) -> Option<Arc<IndiClient>> {
        self.clients.lock().get(session).cloned()
    }

    pub fn client_or_error(&self, session: &SessionId) -> IndiResult<Arc<IndiClient>> {
        self.client(session)
            .ok_or_else(|| IndiError::UnknownSession(session.to_string()))
    }

    /// Disconnect and drop the session's client
    pub async fn disconnect(&self, session: &SessionId) -> IndiResult<()> {
        let client = self
            .clients
            .lock()
            .remove(session)
            .ok_or_else(|| IndiError::UnknownSession(session.to_string()))?;
        tracing::info!("Session '{}' disconnected", session);
        client.disconnect().await
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self.clients.lock().keys().cloned().collect();
        sessions.sort();
        sessions
    }

    /// Disconnect every session
    pub async fn shutdown(&self) {
        let clients: Vec<(SessionId, Arc<IndiClient>)> = self.clients.lock().drain().collect();
        for (session, client) in clients {
            if let Err(e) = client.disconnect().await {
                tracing::warn!("Disconnecting session '{}' failed: {}", session, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    #[tokio::test]
    async fn test_connect_lookup_and_disconnect() {
        let manager = ConnectionManager::new();
        let session = SessionId::from(0usize);
        let client = manager
            .connect(session.clone(), Arc::new(MockTransport::new()), IndiClientConfig::default())
            .await
            .unwrap();
        assert!(client.is_server_connected());
        assert!(manager.client(&session).is_some());
        assert_eq!(manager.sessions(), vec![session.clone()]);

        manager.disconnect(&session).await.unwrap();
        assert!(manager.client(&session).is_none());
        assert!(!client.is_server_connected());
        assert!(matches!(
            manager.client_or_error(&session),
            Err(IndiError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_session_is_rejected() {
        let manager = ConnectionManager::new();
        manager
            .connect("main".into(), Arc::new(MockTransport::new()), IndiClientConfig::default())
            .await
            .unwrap();
        let err = manager
            .connect("main".into(), Arc::new(MockTransport::new()), IndiClientConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err, IndiError::DuplicateConnection("main".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_everything() {
        let manager = ConnectionManager::new();
        let first = Arc::new(MockTransport::new());
        let second = Arc::new(MockTransport::new());
        manager
            .connect("a".into(), first.clone(), IndiClientConfig::default())
            .await
            .unwrap();
        manager
            .connect("b".into(), second.clone(), IndiClientConfig::default())
            .await
            .unwrap();

        manager.shutdown().await;
        assert!(manager.sessions().is_empty());
        assert!(!first.is_connected());
        assert!(!second.is_connected());
    }
}
