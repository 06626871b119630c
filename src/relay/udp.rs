//! Client-side UDP session table
//!
//! A client UDP listener shares one local socket between many sources.
//! Each source address gets its own tunnel, looked up here for every
//! datagram it sends.

use crate::session::SWEEP_INTERVAL;
use crate::tunnel::{MessageWriter, TunnelState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::AbortHandle;
use tracing::debug;

/// Writing side of one source's tunnel
pub struct UdpSession<W> {
    pub writer: Arc<AsyncMutex<MessageWriter<W>>>,
    pub state: Arc<TunnelState>,
}

impl<W> Clone for UdpSession<W> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            state: Arc::clone(&self.state),
        }
    }
}

impl<W> UdpSession<W> {
    pub fn new(writer: MessageWriter<W>, state: Arc<TunnelState>) -> Self {
        Self {
            writer: Arc::new(AsyncMutex::new(writer)),
            state,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }
}

/// Source address → live tunnel
pub struct UdpSessionTable<W> {
    sessions: Mutex<HashMap<SocketAddr, UdpSession<W>>>,
    sweeper: Mutex<Option<AbortHandle>>,
}

impl<W: Send + 'static> UdpSessionTable<W> {
    /// Create a table and start its background sweep of dead sessions
    pub fn new() -> Arc<Self> {
        let table = Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        });

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&table);
            let task = runtime.spawn(async move {
                let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let Some(table) = weak.upgrade() else {
                        break;
                    };
                    let purged = table.purge_dead();
                    if purged > 0 {
                        debug!("Removed {} dead UDP session(s)", purged);
                    }
                }
            });
            *table.sweeper.lock() = Some(task.abort_handle());
        }

        table
    }
}

impl<W> UdpSessionTable<W> {
    /// Live session for `source`
    pub fn get(&self, source: &SocketAddr) -> Option<UdpSession<W>> {
        self.sessions
            .lock()
            .get(source)
            .filter(|session| session.is_live())
            .cloned()
    }

    /// Store `session` for `source`, replacing any earlier one
    pub fn insert(&self, source: SocketAddr, session: UdpSession<W>) {
        self.sessions.lock().insert(source, session);
    }

    pub fn remove(&self, source: &SocketAddr) -> Option<UdpSession<W>> {
        self.sessions.lock().remove(source)
    }

    /// Drop every session whose tunnel is no longer readable and writable
    pub fn purge_dead(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| session.is_live());
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<W> Drop for UdpSessionTable<W> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream, WriteHalf};

    fn session() -> UdpSession<WriteHalf<DuplexStream>> {
        let (a, _) = duplex(64);
        let (_, write) = tokio::io::split(a);
        let state = Arc::new(TunnelState::new());
        UdpSession::new(MessageWriter::new(write, Arc::clone(&state)), state)
    }

    #[tokio::test]
    async fn test_get_skips_dead_sessions() {
        let table = UdpSessionTable::new();
        let source: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let first = session();
        table.insert(source, first.clone());
        assert!(table.get(&source).is_some());

        first.state.mark_unwritable();
        assert!(table.get(&source).is_none());
        assert_eq!(table.len(), 1);

        // A fresh tunnel for the same source replaces the dead one
        let second = session();
        table.insert(source, second.clone());
        assert!(Arc::ptr_eq(&table.get(&source).unwrap().state, &second.state));
    }

    #[tokio::test]
    async fn test_purge_dead() {
        let table = UdpSessionTable::new();
        let live = session();
        let dead = session();
        dead.state.close();

        table.insert("127.0.0.1:1".parse().unwrap(), live);
        table.insert("127.0.0.1:2".parse().unwrap(), dead);

        assert_eq!(table.purge_dead(), 1);
        assert_eq!(table.len(), 1);
        assert!(table.remove(&"127.0.0.1:1".parse().unwrap()).is_some());
        assert!(table.is_empty());
    }
}
