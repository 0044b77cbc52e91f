//! The session actor: sole owner of session state.
//!
//! Public calls, transport events, completions of spawned collaborator calls
//! and both timers are handled one at a time from a single select loop, so the
//! state machines never see concurrent mutation.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use hdc_core::{
    AuthError, AuthProvider, Credential, RetryPolicy, SasToken, SessionError, SharedBlobUploader,
    SharedTransport, TransportError, TransportEvent, TransportOptions, UploadRequest,
};
use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::activation::{
    ActivationCall, ActivationState, FeatureActivationManager, Reactivation, SubscriberId,
};
use crate::config::SessionConfig;
use crate::listeners::{Listener, ListenerId, ListenerKind, ListenerRegistry};
use crate::renewal::RenewalScheduler;
use crate::supervisor::{ReconnectSupervisor, SupervisorAction, SupervisorState};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum SessionCommand {
    AddListener { id: ListenerId, listener: Listener },
    RemoveListener(ListenerId),
    RemoveAllMessageListeners,
    SetRetryPolicy(Arc<dyn RetryPolicy>),
    SetOptions {
        options: TransportOptions,
        reply: Reply<()>,
    },
    Upload {
        request: UploadRequest,
        reply: Reply<()>,
    },
    UpdateSas {
        token: SasToken,
        reply: Reply<()>,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Close(oneshot::Sender<()>),
}

enum Completion {
    Enable(Result<(), TransportError>),
    Disable(Result<(), TransportError>),
    InitialCredential(Result<Credential, AuthError>),
    Renewed(Result<Credential, SessionError>),
    CredentialPushed {
        credential: Credential,
        result: Result<(), TransportError>,
        reply: Reply<()>,
    },
}

/// Point-in-time view of a session, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub activation: ActivationState,
    pub supervisor: SupervisorState,
    pub message_listeners: usize,
    pub retry_attempts: Option<u32>,
    pub renewal_armed: bool,
}

pub(crate) struct SessionParts {
    pub session_id: Uuid,
    pub transport: SharedTransport,
    pub auth: Option<Arc<dyn AuthProvider>>,
    pub uploader: Option<SharedBlobUploader>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub config: SessionConfig,
    pub events: broadcast::Receiver<TransportEvent>,
}

pub(crate) struct SessionActor {
    session_id: Uuid,
    subscriber: SubscriberId,
    transport: SharedTransport,
    auth: Option<Arc<dyn AuthProvider>>,
    uploader: Option<SharedBlobUploader>,
    activation: FeatureActivationManager,
    supervisor: ReconnectSupervisor,
    renewal: RenewalScheduler,
    listeners: ListenerRegistry,
    retry_deadline: Option<Instant>,
    close_timeout: Duration,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: broadcast::Receiver<TransportEvent>,
    events_open: bool,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    pub(crate) fn new(parts: SessionParts, commands: mpsc::UnboundedReceiver<SessionCommand>) -> Self {
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let kind = parts.auth.as_ref().map(|auth| auth.credential_kind());
        Self {
            session_id: parts.session_id,
            subscriber: SubscriberId::new(),
            transport: parts.transport,
            auth: parts.auth,
            uploader: parts.uploader,
            activation: FeatureActivationManager::new(),
            supervisor: ReconnectSupervisor::new(
                parts.retry_policy,
                parts.config.max_operation_timeout,
            ),
            renewal: RenewalScheduler::new(
                kind,
                parts.config.token_renewal_margin,
                parts.config.renewal_retry_interval,
            ),
            listeners: ListenerRegistry::default(),
            retry_deadline: None,
            close_timeout: parts.config.max_operation_timeout,
            commands,
            events: parts.events,
            events_open: true,
            completions_tx,
            completions,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("session started");
        self.load_initial_credential();
        loop {
            tokio::select! {
                biased;
                Some(completion) = self.completions.recv() => self.on_completion(completion),
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown().await;
                        break;
                    };
                    if self.on_command(command).await.is_break() {
                        break;
                    }
                }
                event = self.events.recv(), if self.events_open => match event {
                    Ok(event) => self.on_transport_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "transport events lagged");
                    }
                    Err(RecvError::Closed) => {
                        warn!("transport event stream closed");
                        self.events_open = false;
                    }
                },
                _ = sleep_until_opt(self.retry_deadline), if self.retry_deadline.is_some() => {
                    self.on_retry_timer();
                }
                _ = sleep_until_opt(self.renewal.deadline()), if self.renewal.deadline().is_some() => {
                    self.on_renewal_timer();
                }
            }
        }
    }

    async fn on_command(&mut self, command: SessionCommand) -> ControlFlow<()> {
        match command {
            SessionCommand::AddListener { id, listener } => {
                let kind = listener.kind();
                self.listeners.add(id, listener);
                debug!(listener = %id, ?kind, "listener added");
                if kind == ListenerKind::Message && self.listeners.count(ListenerKind::Message) == 1 {
                    let call = self.activation.subscribe(self.subscriber);
                    self.issue(call);
                }
            }
            SessionCommand::RemoveListener(id) => {
                if self.listeners.remove(id) == Some(ListenerKind::Message) {
                    self.on_message_listener_removed();
                }
            }
            SessionCommand::RemoveAllMessageListeners => {
                if self.listeners.remove_kind(ListenerKind::Message) > 0 {
                    self.on_message_listener_removed();
                }
            }
            SessionCommand::SetRetryPolicy(policy) => {
                debug!("retry policy replaced");
                self.supervisor.set_policy(policy);
            }
            SessionCommand::SetOptions { options, reply } => {
                let transport = self.transport.clone();
                tokio::spawn(
                    async move {
                        let result = transport
                            .set_options(options)
                            .await
                            .map_err(SessionError::from);
                        if let Err(err) = &result {
                            warn!(error = %err, "set options failed");
                        }
                        let _ = reply.send(result);
                    }
                    .instrument(info_span!("session.set_options")),
                );
            }
            SessionCommand::Upload { request, reply } => {
                let Some(uploader) = self.uploader.clone() else {
                    let _ = reply.send(Err(SessionError::InvalidOperation(
                        "no blob uploader configured",
                    )));
                    return ControlFlow::Continue(());
                };
                let span = info_span!(
                    "session.upload_to_blob",
                    blob = %request.blob_name,
                    length = request.length
                );
                tokio::spawn(
                    async move {
                        let result = uploader
                            .upload_to_blob(request)
                            .await
                            .map_err(SessionError::Upload);
                        match &result {
                            Ok(()) => info!("blob uploaded"),
                            Err(err) => warn!(error = %err, "blob upload failed"),
                        }
                        let _ = reply.send(result);
                    }
                    .instrument(span),
                );
            }
            SessionCommand::UpdateSas { token, reply } => {
                let transport = self.transport.clone();
                let tx = self.completions_tx.clone();
                let credential = Credential::SharedAccessSignature(token);
                tokio::spawn(
                    async move {
                        let result = transport.update_credential(credential.clone()).await;
                        let _ = tx.send(Completion::CredentialPushed {
                            credential,
                            result,
                            reply,
                        });
                    }
                    .instrument(info_span!("session.update_credential")),
                );
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Close(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn on_message_listener_removed(&mut self) {
        if self.listeners.count(ListenerKind::Message) == 0 {
            let call = self.activation.unsubscribe(self.subscriber);
            self.issue(call);
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => {
                if self.listeners.dispatch_message(&message) == 0 {
                    debug!("message arrived with no listener");
                }
            }
            TransportEvent::Disconnect(err) => {
                let expected = self.activation.on_disconnect();
                let action = self.supervisor.on_disconnect(err, expected, Instant::now());
                self.apply(action);
            }
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Enable(result) => {
                let outcome = self.activation.on_enable_complete(result);
                self.issue(outcome.next);
                match &outcome.result {
                    Ok(()) => debug!("c2d enabled"),
                    Err(err) => {
                        warn!(error = %err, "enable c2d failed");
                        if outcome.for_subscribers {
                            self.emit_error(SessionError::Transport(err.clone()));
                        }
                    }
                }
                if outcome.for_recovery {
                    let action = self
                        .supervisor
                        .on_attempt_result(outcome.result, Instant::now());
                    self.apply(action);
                }
            }
            Completion::Disable(result) => {
                let outcome = self.activation.on_disable_complete(result);
                self.issue(outcome.next);
                match outcome.result {
                    Ok(()) => debug!("c2d disabled"),
                    Err(err) => {
                        warn!(error = %err, "disable c2d failed");
                        self.emit_error(SessionError::Transport(err));
                    }
                }
            }
            Completion::InitialCredential(result) => match result {
                Ok(credential) => {
                    self.renewal
                        .arm_for(&credential, OffsetDateTime::now_utc(), Instant::now());
                }
                Err(err) => {
                    warn!(error = %err, "could not read initial credential");
                    self.emit_error(SessionError::Auth(err));
                    self.renewal.arm_retry(Instant::now());
                }
            },
            Completion::Renewed(result) => match result {
                Ok(credential) => {
                    info!("credential renewed");
                    counter!("credential_renewals_total", "outcome" => "success").increment(1);
                    self.renewal
                        .arm_for(&credential, OffsetDateTime::now_utc(), Instant::now());
                }
                Err(err) => {
                    warn!(error = %err, "credential renewal failed");
                    counter!("credential_renewals_total", "outcome" => "failure").increment(1);
                    self.emit_error(err);
                    self.renewal.arm_retry(Instant::now());
                }
            },
            Completion::CredentialPushed {
                credential,
                result,
                reply,
            } => {
                if result.is_ok() {
                    info!("shared access signature updated");
                    self.renewal
                        .arm_for(&credential, OffsetDateTime::now_utc(), Instant::now());
                }
                let _ = reply.send(result.map_err(SessionError::from));
            }
        }
    }

    fn on_retry_timer(&mut self) {
        self.retry_deadline = None;
        let reactivation = self.activation.request_reactivation();
        if reactivation != Reactivation::NotWanted {
            counter!("c2d_reconnect_attempts_total").increment(1);
        }
        match reactivation {
            Reactivation::Started => self.issue(Some(ActivationCall::Enable)),
            Reactivation::Joined | Reactivation::Deferred => {
                debug!(?reactivation, "re-activation rides the in-flight call");
            }
            Reactivation::AlreadyActive => {
                let action = self.supervisor.on_attempt_result(Ok(()), Instant::now());
                self.apply(action);
            }
            Reactivation::NotWanted => self.supervisor.abandon("no subscribers left"),
        }
    }

    fn on_renewal_timer(&mut self) {
        if !self.renewal.fire() {
            return;
        }
        let Some(auth) = self.auth.clone() else {
            return;
        };
        let transport = self.transport.clone();
        let tx = self.completions_tx.clone();
        tokio::spawn(
            async move {
                let result = async {
                    let credential = auth.renew().await?;
                    transport.update_credential(credential.clone()).await?;
                    Ok::<_, SessionError>(credential)
                }
                .await;
                let _ = tx.send(Completion::Renewed(result));
            }
            .instrument(info_span!("session.renew_credential")),
        );
    }

    fn load_initial_credential(&self) {
        if !self.renewal.is_renewable() {
            return;
        }
        let Some(auth) = self.auth.clone() else {
            return;
        };
        let tx = self.completions_tx.clone();
        tokio::spawn(
            async move {
                let _ = tx.send(Completion::InitialCredential(auth.current_credential().await));
            }
            .instrument(info_span!("session.current_credential")),
        );
    }

    fn apply(&mut self, action: SupervisorAction) {
        match action {
            SupervisorAction::ScheduleAttempt(delay) => {
                self.retry_deadline = Some(Instant::now() + delay);
            }
            SupervisorAction::Escalate(disconnected) => {
                self.retry_deadline = None;
                if !self.listeners.emit_disconnect(&disconnected) {
                    error!(
                        error = %disconnected,
                        cause = %disconnected.transport_error,
                        "terminal disconnect with no disconnect listener"
                    );
                }
            }
            SupervisorAction::Recovered | SupervisorAction::Nothing => {}
        }
    }

    fn issue(&self, call: Option<ActivationCall>) {
        let Some(call) = call else {
            return;
        };
        counter!("c2d_activation_calls_total", "op" => call.as_str()).increment(1);
        let transport = self.transport.clone();
        let tx = self.completions_tx.clone();
        let span = match call {
            ActivationCall::Enable => info_span!("session.enable_c2d"),
            ActivationCall::Disable => info_span!("session.disable_c2d"),
        };
        tokio::spawn(
            async move {
                let completion = match call {
                    ActivationCall::Enable => Completion::Enable(transport.enable_c2d().await),
                    ActivationCall::Disable => Completion::Disable(transport.disable_c2d().await),
                };
                let _ = tx.send(completion);
            }
            .instrument(span),
        );
    }

    fn emit_error(&self, err: SessionError) {
        if !self.listeners.emit_error(&err) {
            error!(error = %err, "session error with no error listener");
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            activation: self.activation.state(),
            supervisor: self.supervisor.state(),
            message_listeners: self.listeners.count(ListenerKind::Message),
            retry_attempts: self.supervisor.context().map(|ctx| ctx.attempts),
            renewal_armed: self.renewal.deadline().is_some(),
        }
    }

    /// Waits out an in-flight enable or disable, including any follow-up call
    /// its completion issues.
    async fn drain_activation(&mut self) {
        while matches!(
            self.activation.state(),
            ActivationState::Activating | ActivationState::Deactivating
        ) {
            let Some(completion) = self.completions.recv().await else {
                break;
            };
            self.on_completion(completion);
        }
    }

    async fn shutdown(&mut self) {
        self.supervisor.abandon("session closing");
        let limit = self.close_timeout;
        if tokio::time::timeout(limit, self.drain_activation()).await.is_err() {
            warn!(
                timeout_ms = limit.as_millis() as u64,
                state = ?self.activation.state(),
                "c2d call still in flight at close"
            );
        }
        self.retry_deadline = None;
        self.renewal.cancel();
        if matches!(
            self.activation.state(),
            ActivationState::Active | ActivationState::Failed
        ) {
            counter!("c2d_activation_calls_total", "op" => "disable").increment(1);
            if let Err(err) = self
                .transport
                .disable_c2d()
                .instrument(info_span!("session.disable_c2d"))
                .await
            {
                warn!(error = %err, "disable c2d on close failed");
            }
        }
        info!("session closed");
    }
}
