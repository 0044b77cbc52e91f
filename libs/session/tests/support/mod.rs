#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hdc_core::{Disconnected, InMemoryTransport, RetryPolicy, SessionError, TransportError};
use hdc_session::{DeviceSession, DeviceSessionBuilder};

/// Retries everything after a fixed delay.
pub struct FixedDelay(pub Duration);

impl RetryPolicy for FixedDelay {
    fn should_retry(&self, _error: &TransportError) -> bool {
        true
    }

    fn next_retry_timeout(&self, _retry_count: u32, _throttled: bool) -> Duration {
        self.0
    }
}

pub fn fixed_delay_ms(ms: u64) -> Arc<dyn RetryPolicy> {
    Arc::new(FixedDelay(Duration::from_millis(ms)))
}

pub fn builder(transport: &InMemoryTransport) -> DeviceSessionBuilder {
    DeviceSession::builder(Arc::new(transport.clone()))
}

/// Lets the session task and its spawned calls run without moving the clock.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

pub async fn advance(duration: Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}

pub struct Recorded<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Default for Recorded<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T> Clone for Recorded<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T: Clone> Recorded<T> {
    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    pub fn all(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

/// Error listener that keeps rendered errors.
pub fn record_errors(session: &DeviceSession) -> Recorded<String> {
    let recorded = Recorded::default();
    let sink = recorded.clone();
    session
        .on_error(move |err: &SessionError| sink.push(err.to_string()))
        .unwrap();
    recorded
}

pub fn record_disconnects(session: &DeviceSession) -> Recorded<Disconnected> {
    let recorded = Recorded::default();
    let sink = recorded.clone();
    session
        .on_disconnect(move |disconnected: &Disconnected| sink.push(disconnected.clone()))
        .unwrap();
    recorded
}
