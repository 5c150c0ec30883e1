//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: obsidion-bridge — End-to-end encrypted peer bridge over an untrusted relay.
//

//! The connection controller: owns the transport, runs the read loop and
//! keepalive timer, reconnects with exponential backoff, and requests
//! replay of missed frames after a reconnect.
//!
//! One controller task is the session executor: every frame is handled
//! under the session lock inside this task, so state transitions are
//! strictly serialized in arrival order.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::events::{BridgeEvent, Disconnection, EventListeners};
use crate::session::SessionContext;
use crate::transport::{Transport, TransportEvent, CLOSE_ABNORMAL};
use crate::uri;
use crate::wire::Envelope;

/// Close code and reason for a user-initiated shutdown.
pub const CLOSE_BY_USER: (u16, &str) = (1000, "Connection closed by user");

/// Tunables for one bridge connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub bridge_url: String,
    pub reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
    pub chunk_ttl: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            bridge_url: uri::DEFAULT_BRIDGE_URL.to_string(),
            reconnect: true,
            max_reconnect_attempts: 10,
            ping_interval: Duration::from_secs(30),
            chunk_ttl: Duration::from_secs(60),
        }
    }
}

/// Facade-to-controller commands.
#[derive(Debug)]
pub(crate) enum Command {
    /// Send one already-serialized frame.
    Frame(String),
    /// Close the transport and stop the controller.
    Close { code: u16, reason: String },
}

/// Flags shared between the facade and the controller task.
#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    pub connected: AtomicBool,
    pub intentional_close: AtomicBool,
}

struct CloseInfo {
    code: u16,
    reason: String,
}

/// Drive one bridge connection until it is closed for good.
pub(crate) async fn run(
    mut transport: Box<dyn Transport>,
    session: Arc<Mutex<SessionContext>>,
    events: Arc<EventListeners>,
    state: Arc<ConnectionState>,
    mut commands: mpsc::Receiver<Command>,
    config: ConnectionConfig,
) {
    let mut attempt: u32 = 0;
    let mut ever_connected = false;

    loop {
        if state.intentional_close.load(Ordering::SeqCst) {
            break;
        }

        let target = {
            let mut ctx = session.lock().await;
            build_moc(&mut ctx).and_then(|moc| {
                uri::build_ws_url(&config.bridge_url, &ctx.bridge_id, moc.as_deref())
                    .map(|url| (url, ctx.role.origin_header().to_string()))
                    .map_err(|e| e.to_string())
            })
        };
        let (url, origin) = match target {
            Ok(target) => target,
            Err(message) => {
                events.emit(&BridgeEvent::Error { message });
                break;
            }
        };

        match transport.open(&url, &origin).await {
            Err(e) => {
                if !ever_connected {
                    events.emit(&BridgeEvent::FailedToConnect {
                        code: CLOSE_ABNORMAL,
                        reason: e.to_string(),
                    });
                    break;
                }
                warn!(error = %e, attempt, "reconnect attempt failed");
            }
            Ok(()) => {
                let reconnection = ever_connected;
                ever_connected = true;
                attempt = 0;
                state.connected.store(true, Ordering::SeqCst);
                info!(reconnection, "bridge connected");

                if reconnection {
                    request_replay(&mut *transport, &session).await;
                }
                events.emit(&BridgeEvent::Connected { reconnection });

                // Resumed sessions (and reconnecting established ones that
                // never got to announce) surface establishment here.
                let announce = {
                    let mut ctx = session.lock().await;
                    ctx.take_establishment_event()
                };
                if announce {
                    events.emit(&BridgeEvent::SecureChannelEstablished);
                }

                let close = io_loop(
                    &mut *transport,
                    &session,
                    &events,
                    &state,
                    &mut commands,
                    &config,
                )
                .await;

                state.connected.store(false, Ordering::SeqCst);
                let intentional = state.intentional_close.load(Ordering::SeqCst);
                let will_reconnect =
                    !intentional && config.reconnect && attempt < config.max_reconnect_attempts;
                events.emit(&BridgeEvent::Disconnected(Disconnection {
                    code: close.code,
                    reason: close.reason,
                    was_connected: true,
                    was_intentional_close: intentional,
                    will_reconnect,
                }));
                if intentional || !config.reconnect {
                    break;
                }
            }
        }

        attempt += 1;
        if attempt > config.max_reconnect_attempts {
            warn!(
                attempts = config.max_reconnect_attempts,
                "giving up on reconnection"
            );
            break;
        }
        // k=1 retries immediately; k>=2 backs off 1s, 2s, 4s, ...
        if attempt >= 2 {
            let exponent = (attempt - 2).min(16);
            let delay = Duration::from_millis(1000u64 << exponent);
            debug!(attempt, ?delay, "scheduling reconnect");
            if wait_backoff(delay, &mut commands, &state).await {
                break;
            }
        }
    }
}

/// The Joiner's handshake payload for the `moc` URL parameter, absent for
/// Creators and already-established (resumed or reconnecting) Joiners.
fn build_moc(ctx: &mut SessionContext) -> Result<Option<String>, String> {
    if ctx.role.is_creator() || ctx.secure_channel_established {
        return Ok(None);
    }
    let envelope = ctx
        .build_handshake_envelope()
        .map_err(|e| format!("failed to build handshake: {}", e))?;
    let json = envelope
        .to_json()
        .map_err(|e| format!("failed to encode handshake: {}", e))?;
    Ok(Some(BASE64.encode(json)))
}

/// Ask the relay to resend everything near and after the last frame we saw.
async fn request_replay(transport: &mut dyn Transport, session: &Arc<Mutex<SessionContext>>) {
    let envelope = {
        let mut ctx = session.lock().await;
        if ctx.last_message_timestamp == 0 {
            return;
        }
        // One second of overlap; duplicates are filtered by id anyway.
        let envelope = Envelope::replay(ctx.last_message_timestamp.saturating_sub(1000));
        ctx.register_outbound(&envelope);
        envelope
    };
    if let Ok(json) = envelope.to_json() {
        if let Err(e) = transport.send_frame(&json).await {
            warn!(error = %e, "replay request failed");
        }
    }
}

/// Pump frames, commands, and keepalives until the transport closes.
async fn io_loop(
    transport: &mut dyn Transport,
    session: &Arc<Mutex<SessionContext>>,
    events: &Arc<EventListeners>,
    state: &Arc<ConnectionState>,
    commands: &mut mpsc::Receiver<Command>,
    config: &ConnectionConfig,
) -> CloseInfo {
    let mut keepalive = interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = transport.next_event() => match event {
                Ok(TransportEvent::Frame(frame)) => {
                    let outcome = {
                        let mut ctx = session.lock().await;
                        ctx.handle_frame(&frame)
                    };
                    for event in &outcome.events {
                        events.emit(event);
                    }
                    for reply in &outcome.replies {
                        let json = match reply.to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize reply");
                                continue;
                            }
                        };
                        if let Err(e) = transport.send_frame(&json).await {
                            return CloseInfo {
                                code: CLOSE_ABNORMAL,
                                reason: e.to_string(),
                            };
                        }
                    }
                }
                Ok(TransportEvent::Closed { code, reason, was_clean }) => {
                    debug!(code, reason = %reason, was_clean, "transport closed");
                    return CloseInfo { code, reason };
                }
                Err(e) => {
                    return CloseInfo {
                        code: CLOSE_ABNORMAL,
                        reason: e.to_string(),
                    };
                }
            },
            command = commands.recv() => match command {
                Some(Command::Frame(json)) => {
                    if let Err(e) = transport.send_frame(&json).await {
                        return CloseInfo {
                            code: CLOSE_ABNORMAL,
                            reason: e.to_string(),
                        };
                    }
                }
                Some(Command::Close { code, reason }) => {
                    state.intentional_close.store(true, Ordering::SeqCst);
                    let _ = transport.close(code, &reason).await;
                    return CloseInfo { code, reason };
                }
                // The facade was dropped without close(); shut down cleanly.
                None => {
                    state.intentional_close.store(true, Ordering::SeqCst);
                    let (code, reason) = CLOSE_BY_USER;
                    let _ = transport.close(code, reason).await;
                    return CloseInfo { code, reason: reason.to_string() };
                }
            },
            _ = keepalive.tick() => {
                {
                    let mut ctx = session.lock().await;
                    ctx.evict_stale_chunks(config.chunk_ttl);
                }
                if let Ok(json) = Envelope::ping().to_json() {
                    if let Err(e) = transport.send_frame(&json).await {
                        return CloseInfo {
                            code: CLOSE_ABNORMAL,
                            reason: e.to_string(),
                        };
                    }
                }
            }
        }
    }
}

/// Sleep out a backoff delay, but stay responsive to close commands.
/// Returns true when the controller should stop instead of reconnecting.
async fn wait_backoff(
    delay: Duration,
    commands: &mut mpsc::Receiver<Command>,
    state: &Arc<ConnectionState>,
) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => return false,
            command = commands.recv() => match command {
                // Frames cannot be sent while disconnected; drop them. The
                // facade already reported false to the caller.
                Some(Command::Frame(_)) => continue,
                Some(Command::Close { .. }) | None => {
                    state.intentional_close.store(true, Ordering::SeqCst);
                    return true;
                }
            },
        }
    }
}
