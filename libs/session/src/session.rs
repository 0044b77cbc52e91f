use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hdc_core::{
    AuthProvider, BlobSource, Disconnected, ExponentialBackoffWithJitter, Message, RetryPolicy,
    SasToken, SessionError, SharedBlobUploader, SharedTransport, TransportOptions, UploadRequest,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, info_span};
use uuid::Uuid;

use crate::activation::ActivationState;
use crate::actor::{Reply, SessionActor, SessionCommand, SessionParts, SessionSnapshot};
use crate::config::SessionConfig;
use crate::listeners::{Listener, ListenerId};
use crate::supervisor::SupervisorState;

/// Handle to a running device session. Clones share the same session.
#[derive(Clone)]
pub struct DeviceSession {
    id: Uuid,
    commands: mpsc::UnboundedSender<SessionCommand>,
    next_listener: Arc<AtomicU64>,
}

impl DeviceSession {
    pub fn builder(transport: SharedTransport) -> DeviceSessionBuilder {
        DeviceSessionBuilder::new(transport)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    fn add_listener(&self, listener: Listener) -> Result<ListenerId, SessionError> {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.send(SessionCommand::AddListener { id, listener })?;
        Ok(id)
    }

    /// Registers a cloud-to-device message listener. The first one turns
    /// delivery on.
    pub fn on_message<F>(&self, handler: F) -> Result<ListenerId, SessionError>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.add_listener(Listener::Message(Arc::new(handler)))
    }

    pub fn on_error<F>(&self, handler: F) -> Result<ListenerId, SessionError>
    where
        F: Fn(&SessionError) + Send + Sync + 'static,
    {
        self.add_listener(Listener::Error(Arc::new(handler)))
    }

    /// Registers a listener for the terminal disconnect raised when recovery gives up.
    pub fn on_disconnect<F>(&self, handler: F) -> Result<ListenerId, SessionError>
    where
        F: Fn(&Disconnected) + Send + Sync + 'static,
    {
        self.add_listener(Listener::Disconnect(Arc::new(handler)))
    }

    /// Removing the last message listener turns delivery off. Unknown ids are ignored.
    pub fn remove_listener(&self, id: ListenerId) -> Result<(), SessionError> {
        self.send(SessionCommand::RemoveListener(id))
    }

    pub fn remove_all_message_listeners(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::RemoveAllMessageListeners)
    }

    pub fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>) -> Result<(), SessionError> {
        self.send(SessionCommand::SetRetryPolicy(policy))
    }

    pub async fn set_options(&self, options: Option<TransportOptions>) -> Result<(), SessionError> {
        let options = options.ok_or(SessionError::InvalidArgument("options must be provided"))?;
        self.request(|reply| SessionCommand::SetOptions { options, reply })
            .await
    }

    pub async fn upload_to_blob(
        &self,
        blob_name: impl Into<String>,
        source: Option<BlobSource>,
        length: u64,
    ) -> Result<(), SessionError> {
        let request = UploadRequest::new(blob_name, source, length)?;
        self.request(|reply| SessionCommand::Upload { request, reply })
            .await
    }

    /// Pushes a caller-supplied token to the transport.
    pub async fn update_shared_access_signature(&self, token: SasToken) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::UpdateSas { token, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn activation_state(&self) -> Result<ActivationState, SessionError> {
        Ok(self.snapshot().await?.activation)
    }

    pub async fn supervisor_state(&self) -> Result<SupervisorState, SessionError> {
        Ok(self.snapshot().await?.supervisor)
    }

    /// Stops the session, turning delivery off if it is on.
    pub async fn close(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Close(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

pub struct DeviceSessionBuilder {
    transport: SharedTransport,
    auth: Option<Arc<dyn AuthProvider>>,
    uploader: Option<SharedBlobUploader>,
    retry_policy: Arc<dyn RetryPolicy>,
    config: SessionConfig,
}

impl DeviceSessionBuilder {
    pub fn new(transport: SharedTransport) -> Self {
        Self {
            transport,
            auth: None,
            uploader: None,
            retry_policy: Arc::new(ExponentialBackoffWithJitter::default()),
            config: SessionConfig::default(),
        }
    }

    pub fn auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    pub fn blob_uploader(mut self, uploader: SharedBlobUploader) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawns the session task. Must run inside a tokio runtime.
    pub fn build(self) -> DeviceSession {
        let id = Uuid::new_v4();
        let (commands, rx) = mpsc::unbounded_channel();
        let events = self.transport.events();
        let actor = SessionActor::new(
            SessionParts {
                session_id: id,
                transport: self.transport,
                auth: self.auth,
                uploader: self.uploader,
                retry_policy: self.retry_policy,
                config: self.config,
                events,
            },
            rx,
        );
        tokio::spawn(
            actor
                .run()
                .instrument(info_span!("device_session", session_id = %id)),
        );
        DeviceSession {
            id,
            commands,
            next_listener: Arc::new(AtomicU64::new(1)),
        }
    }
}
