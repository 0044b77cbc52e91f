//! In-memory transport and uploader used by tests, the simulator, and local development.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

use crate::auth::Credential;
use crate::errors::TransportError;
use crate::message::Message;
use crate::transport::{Transport, TransportEvent, TransportOptions};
use crate::upload::{BlobUploader, UploadRequest};

const DEFAULT_EVENT_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type OpResult = Result<(), TransportError>;

#[derive(Default)]
struct Script {
    queued: VecDeque<OpResult>,
    fallback: Option<TransportError>,
}

impl Script {
    fn next(&mut self) -> OpResult {
        match self.queued.pop_front() {
            Some(result) => result,
            None => match &self.fallback {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            },
        }
    }
}

struct Inner {
    events: broadcast::Sender<TransportEvent>,
    enable_calls: AtomicUsize,
    disable_calls: AtomicUsize,
    options_calls: AtomicUsize,
    c2d_enabled: AtomicBool,
    enable_script: Mutex<Script>,
    disable_script: Mutex<Script>,
    options_script: Mutex<Script>,
    credential_script: Mutex<Script>,
    latency: Mutex<Duration>,
    credentials: Mutex<Vec<Credential>>,
    options: Mutex<Vec<TransportOptions>>,
}

/// Scriptable transport: every operation succeeds unless told otherwise.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                events,
                enable_calls: AtomicUsize::new(0),
                disable_calls: AtomicUsize::new(0),
                options_calls: AtomicUsize::new(0),
                c2d_enabled: AtomicBool::new(false),
                enable_script: Mutex::new(Script::default()),
                disable_script: Mutex::new(Script::default()),
                options_script: Mutex::new(Script::default()),
                credential_script: Mutex::new(Script::default()),
                latency: Mutex::new(Duration::ZERO),
                credentials: Mutex::new(Vec::new()),
                options: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Queues one-shot outcomes for upcoming `enable_c2d` calls.
    pub fn script_enable(&self, results: impl IntoIterator<Item = OpResult>) {
        lock(&self.inner.enable_script).queued.extend(results);
    }

    /// Makes every unscripted `enable_c2d` call fail with `err` (or succeed with `None`).
    pub fn fail_enable(&self, err: Option<TransportError>) {
        lock(&self.inner.enable_script).fallback = err;
    }

    pub fn fail_disable(&self, err: Option<TransportError>) {
        lock(&self.inner.disable_script).fallback = err;
    }

    pub fn fail_set_options(&self, err: Option<TransportError>) {
        lock(&self.inner.options_script).fallback = err;
    }

    pub fn fail_update_credential(&self, err: Option<TransportError>) {
        lock(&self.inner.credential_script).fallback = err;
    }

    /// Delay applied to enable/disable calls, useful to hold a call in flight.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.inner.latency) = latency;
    }

    pub fn emit_message(&self, message: Message) {
        let _ = self.inner.events.send(TransportEvent::Message(message));
    }

    /// Simulates the connection dropping: delivery stops and listeners are notified.
    pub fn emit_disconnect(&self, err: TransportError) {
        debug!(error = %err, "in-memory transport dropping link");
        self.inner.c2d_enabled.store(false, Ordering::SeqCst);
        let _ = self.inner.events.send(TransportEvent::Disconnect(err));
    }

    pub fn enable_calls(&self) -> usize {
        self.inner.enable_calls.load(Ordering::SeqCst)
    }

    pub fn disable_calls(&self) -> usize {
        self.inner.disable_calls.load(Ordering::SeqCst)
    }

    pub fn options_calls(&self) -> usize {
        self.inner.options_calls.load(Ordering::SeqCst)
    }

    pub fn is_c2d_enabled(&self) -> bool {
        self.inner.c2d_enabled.load(Ordering::SeqCst)
    }

    pub fn credential_updates(&self) -> Vec<Credential> {
        lock(&self.inner.credentials).clone()
    }

    pub fn applied_options(&self) -> Vec<TransportOptions> {
        lock(&self.inner.options).clone()
    }

    async fn simulate_latency(&self) {
        let latency = *lock(&self.inner.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn enable_c2d(&self) -> Result<(), TransportError> {
        self.inner.enable_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let result = lock(&self.inner.enable_script).next();
        if result.is_ok() {
            self.inner.c2d_enabled.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn disable_c2d(&self) -> Result<(), TransportError> {
        self.inner.disable_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let result = lock(&self.inner.disable_script).next();
        if result.is_ok() {
            self.inner.c2d_enabled.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn update_credential(&self, credential: Credential) -> Result<(), TransportError> {
        let result = lock(&self.inner.credential_script).next();
        if result.is_ok() {
            lock(&self.inner.credentials).push(credential);
        }
        result
    }

    async fn set_options(&self, options: TransportOptions) -> Result<(), TransportError> {
        self.inner.options_calls.fetch_add(1, Ordering::SeqCst);
        let result = lock(&self.inner.options_script).next();
        if result.is_ok() {
            lock(&self.inner.options).push(options);
        }
        result
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpload {
    pub blob_name: String,
    pub length: u64,
    pub data: Bytes,
}

/// Uploader that keeps uploaded blobs in memory, or fails with a fixed message.
#[derive(Clone, Default)]
pub struct InMemoryBlobUploader {
    uploads: Arc<Mutex<Vec<RecordedUpload>>>,
    calls: Arc<AtomicUsize>,
    failure: Option<String>,
}

impl InMemoryBlobUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        lock(&self.uploads).clone()
    }
}

#[async_trait]
impl BlobUploader for InMemoryBlobUploader {
    async fn upload_to_blob(&self, request: UploadRequest) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            anyhow::bail!("{message}");
        }
        let data = request.source.into_bytes(request.length).await?;
        lock(&self.uploads).push(RecordedUpload {
            blob_name: request.blob_name,
            length: request.length,
            data,
        });
        Ok(())
    }
}
