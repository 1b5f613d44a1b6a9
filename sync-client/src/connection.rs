//! Connection driver.
//!
//! One task per client interprets the transport actions produced by the
//! connection state machine:
//!
//! ```text
//! OpenTransport ──> connect ──> writer task + session loop
//!                                   │ recv / heartbeat / writer exit
//!                                   v
//! StartReconnectTimer <── ConnectionLost | HeartbeatTimedOut
//! ```
//!
//! The driver owns no protocol state. Every decision is made by the reactor
//! under its lock; the driver only performs the I/O it is told to.

use std::collections::VecDeque;
use std::sync::Arc;
use tessel_sync_core::{Action, Event, HeartbeatAction, HeartbeatMonitor};
use tessel_sync_types::Frame;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::client::Shared;
use crate::reactor::now_millis;
use crate::transport::Transport;

/// Run until the client shuts down.
pub(crate) async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut pending: VecDeque<Action> = shared.update(|r| r.on_conn_event(Event::Start)).into();

    loop {
        let Some(action) = pending.pop_front() else {
            if shared.is_closed() {
                break;
            }
            // Errored without retry: wait for an explicit restart.
            let event = tokio::select! {
                _ = wait_shutdown(&mut shutdown) => Event::Shutdown,
                _ = shared.restart.notified() => Event::Start,
            };
            pending.extend(shared.update(|r| r.on_conn_event(event)));
            continue;
        };

        match action {
            Action::OpenTransport => {
                let connected = tokio::select! {
                    _ = wait_shutdown(&mut shutdown) => None,
                    result = shared.transport.connect(&shared.config.websocket_uri) => Some(result),
                };
                let event = match connected {
                    None => Event::Shutdown,
                    Some(Err(e)) => {
                        debug!(error = %e, "transport connect failed");
                        Event::TransportFailed {
                            error: e.to_string(),
                        }
                    }
                    Some(Ok(())) => {
                        pending.extend(open_session(&shared, &mut shutdown).await);
                        continue;
                    }
                };
                pending.extend(shared.update(|r| r.on_conn_event(event)));
            }
            Action::StartReconnectTimer { attempt } => {
                let delay = shared.config.reconnect.delay_for_attempt(attempt);
                info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                let event = tokio::select! {
                    _ = wait_shutdown(&mut shutdown) => Event::Shutdown,
                    _ = sleep(delay) => Event::ReconnectTimer,
                };
                pending.extend(shared.update(|r| r.on_conn_event(event)));
            }
            Action::CloseTransport => {
                if let Err(e) = shared.transport.close().await {
                    debug!(error = %e, "transport close failed");
                }
            }
            // Timers are awaited inline; there is nothing to cancel.
            Action::CancelReconnect => {}
            other => debug!(action = ?other, "ignoring protocol action in driver"),
        }
    }
    debug!(app_id = %shared.config.app_id, "connection driver stopped");
}

/// Start the writer, run the handshake and read until the session ends.
async fn open_session(shared: &Shared, shutdown: &mut watch::Receiver<bool>) -> Vec<Action> {
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(shared.transport.clone(), rx));

    let io = shared.update(|r| {
        r.install_outbox(tx);
        r.on_conn_event(Event::TransportConnected)
    });
    if !io.is_empty() || !shared.session_alive() {
        writer.abort();
        return io;
    }
    session(shared, writer, shutdown).await
}

async fn session(
    shared: &Shared,
    mut writer: JoinHandle<()>,
    shutdown: &mut watch::Receiver<bool>,
) -> Vec<Action> {
    let config = &shared.config;
    let mut heartbeat = HeartbeatMonitor::new(
        config.heartbeat_interval,
        config.heartbeat_timeout,
        Instant::now().into_std(),
    );

    let event = loop {
        let deadline = Instant::from_std(heartbeat.next_deadline());
        tokio::select! {
            biased;
            _ = wait_shutdown(shutdown) => break Event::Shutdown,
            _ = &mut writer => break Event::ConnectionLost {
                error: "writer stopped".into(),
            },
            received = shared.transport.recv() => {
                let bytes = match received {
                    Ok(bytes) => bytes,
                    Err(e) => break Event::ConnectionLost { error: e.to_string() },
                };
                heartbeat.on_frame(Instant::now().into_std());
                let frame = match Frame::from_bytes(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, len = bytes.len(), "dropping undecodable frame");
                        continue;
                    }
                };
                let io = shared.update(|r| r.on_frame(frame));
                if !io.is_empty() || !shared.session_alive() {
                    writer.abort();
                    return io;
                }
            }
            _ = sleep_until(deadline) => {
                match heartbeat.poll(Instant::now().into_std()) {
                    HeartbeatAction::Idle => {}
                    HeartbeatAction::SendPing => shared.update(|r| r.send_ping(now_millis())),
                    HeartbeatAction::TimedOut => {
                        warn!(
                            timeout_ms = config.heartbeat_timeout.as_millis() as u64,
                            "no frame within heartbeat timeout"
                        );
                        break Event::HeartbeatTimedOut;
                    }
                }
            }
        }
    };

    writer.abort();
    shared.update(|r| r.on_conn_event(event))
}

/// Drain the outbox onto the transport. Ends when the outbox is dropped or
/// a send fails.
async fn write_loop(transport: Arc<dyn Transport>, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let bytes = match frame.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(op = frame.op(), error = %e, "failed to encode frame");
                continue;
            }
        };
        if let Err(e) = transport.send(&bytes).await {
            warn!(op = frame.op(), error = %e, "send failed");
            return;
        }
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    // A dropped sender also means shutdown.
    let _ = rx.wait_for(|closed| *closed).await;
}
