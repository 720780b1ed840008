//! Transport that keeps what it is asked to send.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::envelope::Envelope;
use crate::error::{BusError, Result};
use crate::transport::Transport;

/// A mock transport that stores payloads in memory.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    /// Create a new recording transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Raw payloads sent so far.
    #[must_use]
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Payloads sent so far, decoded.
    #[must_use]
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.sent
            .lock()
            .iter()
            .filter_map(|payload| Envelope::decode(payload).ok())
            .collect()
    }

    /// Envelopes that carry `key`.
    #[must_use]
    pub fn envelopes_with(&self, key: &str) -> Vec<Envelope> {
        self.envelopes()
            .into_iter()
            .filter(|envelope| envelope.contains(key))
            .collect()
    }

    /// Forget what was sent.
    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, payload: Vec<u8>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BusError::Publish("mock transport failing".into()));
        }
        self.sent.lock().push(payload);
        Ok(())
    }
}
