use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::Parser;
use hdc_core::{
    ExponentialBackoffWithJitter, InMemoryTransport, Message, NoRetry, RetryPolicy, TransportError,
};
use hdc_session::{DeviceSession, SessionConfig, SessionSnapshot, SupervisorState};
use hdc_telemetry::TelemetryLabels;
use serde::Serialize;
use tracing::{Instrument, debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive a device session against an in-memory transport", long_about = None)]
struct Opts {
    /// Device id used in log labels
    #[arg(long, default_value = "sim-device")]
    device_id: String,

    /// Number of message listeners to register
    #[arg(long, default_value_t = 2)]
    listeners: usize,

    /// Messages pushed after delivery is on
    #[arg(long, default_value_t = 3)]
    messages: usize,

    /// Disconnects to inject, one after another
    #[arg(long, default_value_t = 1)]
    disconnects: usize,

    /// Re-activation attempts that fail after each disconnect
    #[arg(long, default_value_t = 0)]
    failing_attempts: usize,

    /// Escalate every disconnect instead of retrying
    #[arg(long)]
    no_retry: bool,

    /// Overrides HDC_MAX_OPERATION_TIMEOUT_MS
    #[arg(long)]
    max_operation_timeout_ms: Option<u64>,

    /// Buffered transport events before the session starts lagging
    #[arg(long, default_value_t = 64)]
    event_capacity: usize,

    /// Upper bound for each simulated phase
    #[arg(long, default_value_t = 30)]
    phase_timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct Summary {
    snapshot: SessionSnapshot,
    enable_calls: usize,
    disable_calls: usize,
    messages_received: usize,
    terminal_disconnects: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    hdc_telemetry::install("hdc-session-sim")?;
    let opts = Opts::parse();
    let span = TelemetryLabels::new(opts.device_id.clone()).span();
    let summary = run(opts).instrument(span).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run(opts: Opts) -> Result<Summary> {
    let mut config = SessionConfig::from_env();
    if let Some(ms) = opts.max_operation_timeout_ms {
        config.max_operation_timeout = Duration::from_millis(ms);
    }
    let phase_timeout = Duration::from_secs(opts.phase_timeout_secs.max(1));
    let transport = InMemoryTransport::with_capacity(opts.event_capacity.max(1));
    let policy: Arc<dyn RetryPolicy> = if opts.no_retry {
        Arc::new(NoRetry)
    } else {
        Arc::new(ExponentialBackoffWithJitter::default())
    };
    let session = DeviceSession::builder(Arc::new(transport.clone()))
        .retry_policy(policy)
        .config(config)
        .build();
    info!(session_id = %session.id(), listeners = opts.listeners, "session built");

    let received = Arc::new(AtomicUsize::new(0));
    for _ in 0..opts.listeners {
        let received = received.clone();
        session.on_message(move |msg: &Message| {
            received.fetch_add(1, Ordering::SeqCst);
            debug!(message_id = ?msg.message_id, "message received");
        })?;
    }
    session.on_error(|err| warn!(error = %err, "session error"))?;
    let terminal = Arc::new(AtomicUsize::new(0));
    {
        let terminal = terminal.clone();
        session.on_disconnect(move |disconnected| {
            terminal.fetch_add(1, Ordering::SeqCst);
            warn!(
                reason = %disconnected.reason,
                cause = %disconnected.transport_error,
                "terminal disconnect"
            );
        })?;
    }

    if opts.listeners > 0 {
        wait_until(phase_timeout, || transport.is_c2d_enabled()).await?;
    }
    for n in 0..opts.messages {
        transport.emit_message(
            Message::new(format!("sim message {n}")).with_message_id(format!("msg-{n}")),
        );
    }

    for round in 0..opts.disconnects {
        let expected_calls = transport.enable_calls() + opts.failing_attempts + 1;
        let escalations = terminal.load(Ordering::SeqCst);
        transport.script_enable(
            (0..opts.failing_attempts).map(|_| Err(TransportError::timeout("hub unreachable"))),
        );
        info!(round, "injecting disconnect");
        transport.emit_disconnect(TransportError::not_connected("simulated link loss"));
        wait_until(phase_timeout, || {
            transport.enable_calls() >= expected_calls
                || terminal.load(Ordering::SeqCst) > escalations
                || opts.listeners == 0
        })
        .await?;
        let snapshot = settle(&session, phase_timeout).await?;
        info!(round, supervisor = ?snapshot.supervisor, "disconnect round finished");
    }

    let snapshot = settle(&session, phase_timeout).await?;
    session.close().await?;
    Ok(Summary {
        snapshot,
        enable_calls: transport.enable_calls(),
        disable_calls: transport.disable_calls(),
        messages_received: received.load(Ordering::SeqCst),
        terminal_disconnects: terminal.load(Ordering::SeqCst),
    })
}

async fn wait_until(limit: Duration, ready: impl Fn() -> bool) -> Result<()> {
    tokio::time::timeout(limit, async {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("timed out after {limit:?}"))
}

/// Waits for any recovery episode to finish and returns the final snapshot.
async fn settle(session: &DeviceSession, limit: Duration) -> Result<SessionSnapshot> {
    tokio::time::timeout(limit, poll_settled(session))
        .await
        .map_err(|_| anyhow!("session still recovering after {limit:?}"))?
}

async fn poll_settled(session: &DeviceSession) -> Result<SessionSnapshot> {
    loop {
        let snapshot = session.snapshot().await?;
        if snapshot.supervisor != SupervisorState::Retrying {
            return Ok(snapshot);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
