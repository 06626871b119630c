//! Liveness flags and traffic counters shared by a tunnel's two halves

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// Shared state of one tunnel
///
/// Once either flag goes false it never becomes true again.
#[derive(Debug)]
pub struct TunnelState {
    readable: AtomicBool,
    writable: AtomicBool,
    closed: AtomicBool,
    close_notify: Notify,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    raw_bytes_in: AtomicU64,
    raw_bytes_out: AtomicU64,
}

/// Snapshot of a tunnel's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub messages_in: u64,
    pub messages_out: u64,
    /// Payload bytes after decompression
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Bytes as carried on the wire, headers excluded
    pub raw_bytes_in: u64,
    pub raw_bytes_out: u64,
}

impl Default for TunnelState {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelState {
    pub fn new() -> Self {
        Self {
            readable: AtomicBool::new(true),
            writable: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            raw_bytes_in: AtomicU64::new(0),
            raw_bytes_out: AtomicU64::new(0),
        }
    }

    pub fn is_readable(&self) -> bool {
        self.readable.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.is_readable() && self.is_writable()
    }

    pub fn mark_unreadable(&self) {
        self.readable.store(false, Ordering::Release);
    }

    pub fn mark_unwritable(&self) {
        self.writable.store(false, Ordering::Release);
    }

    /// Mark both directions dead and wake every task waiting in [`closed`](Self::closed)
    pub fn close(&self) {
        self.mark_unreadable();
        self.mark_unwritable();
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    pub(crate) fn record_in(&self, raw: usize, payload: usize) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        self.raw_bytes_in.fetch_add(raw as u64, Ordering::Relaxed);
        self.bytes_in.fetch_add(payload as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_out(&self, raw: usize, payload: usize) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
        self.raw_bytes_out.fetch_add(raw as u64, Ordering::Relaxed);
        self.bytes_out.fetch_add(payload as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TunnelStats {
        TunnelStats {
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            raw_bytes_in: self.raw_bytes_in.load(Ordering::Relaxed),
            raw_bytes_out: self.raw_bytes_out.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_flags_only_go_down() {
        let state = TunnelState::new();
        assert!(state.is_live());

        state.mark_unwritable();
        assert!(state.is_readable());
        assert!(!state.is_live());
        assert!(!state.is_closed());
    }

    #[tokio::test]
    async fn test_closed_wakes_waiters() {
        let state = Arc::new(TunnelState::new());
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.closed().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        state.close();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();

        // Already closed: returns immediately
        state.closed().await;
    }
}
