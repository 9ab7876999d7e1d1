use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live transport counters, shared between the sender and its listener tasks
#[derive(Debug, Default)]
pub struct TransportStats {
    pub messages_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub messages_received: AtomicU64,
    pub receive_errors: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`]
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct FrozenTransportStats {
    pub messages_sent: u64,
    pub send_errors: u64,
    pub messages_received: u64,
    pub receive_errors: u64,
}

impl TransportStats {
    pub fn record_send<T, E>(&self, result: &std::result::Result<T, E>) {
        match result {
            Ok(_) => self.messages_sent.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.send_errors.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn freeze(&self) -> FrozenTransportStats {
        FrozenTransportStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}
