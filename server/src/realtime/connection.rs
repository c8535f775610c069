//! The two I/O loops of a live WebSocket connection.
//!
//! The read loop turns inbound text frames into events on the manager's
//! inbound channel. The write loop drains the connection's outbound channel
//! and keeps the peer alive with periodic pings; closure of the outbound
//! channel is the manager's single disconnect signal.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::Event;

/// Time allowed to write a frame to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between inbound frames; any frame (including pong) resets it.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping cadence. Must be less than `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Maximum inbound frame size in bytes, enforced at the upgrade; a peer
/// exceeding it is terminated by the protocol layer.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Reads frames until the peer goes away, the deadline lapses, or the
/// manager shuts the inbound channel. Each decoded frame is stamped with the
/// owning connection's username before dispatch; a producer blocked on a
/// full inbound channel waits rather than dropping.
pub(super) async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    inbound: mpsc::Sender<Event>,
    username: &str,
    id: u64,
) {
    debug!(connection = %format_args!("{username}:{id}"), "read loop started");

    loop {
        let frame = match timeout(PONG_WAIT, stream.next()).await {
            Err(_) => {
                debug!(connection = %format_args!("{username}:{id}"), "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(connection = %format_args!("{username}:{id}"), "read error: {err}");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                let mut event: Event = match serde_json::from_str(&text) {
                    Ok(event) => event,
                    Err(err) => {
                        error!(connection = %format_args!("{username}:{id}"), "decode frame: {err}");
                        continue;
                    }
                };
                event.dispatcher = Some(username.to_string());
                if inbound.send(event).await.is_err() {
                    // Manager is gone; nothing left to dispatch to.
                    break;
                }
            }
            Message::Binary(_) => {
                warn!(connection = %format_args!("{username}:{id}"), "unexpected binary frame");
            }
            // Liveness only; the deadline resets on the next iteration.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                debug!(connection = %format_args!("{username}:{id}"), "peer closed");
                break;
            }
        }
    }

    debug!(connection = %format_args!("{username}:{id}"), "read loop stopped");
}

/// Writes outbound events as JSON text frames, pinging on a fixed period.
/// Exits on outbound-channel closure (sending a normal close frame), on any
/// write failure, or on process shutdown. Always closes the transport on the
/// way out so the read side unblocks.
pub(super) async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Arc<Event>>,
    cancel: CancellationToken,
    username: String,
    id: u64,
) {
    debug!(connection = %format_args!("{username}:{id}"), "write loop started");

    let mut ping = interval(PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it so pings start one
    // period from now.
    ping.tick().await;

    loop {
        tokio::select! {
            maybe = outbound.recv() => match maybe {
                Some(event) => {
                    let text = match serde_json::to_string(&*event) {
                        Ok(text) => text,
                        Err(err) => {
                            error!(connection = %format_args!("{username}:{id}"), "encode event: {err}");
                            continue;
                        }
                    };
                    match timeout(WRITE_WAIT, sink.send(Message::Text(text))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            debug!(connection = %format_args!("{username}:{id}"), "write error: {err}");
                            break;
                        }
                        Err(_) => {
                            debug!(connection = %format_args!("{username}:{id}"), "write deadline expired");
                            break;
                        }
                    }
                }
                None => {
                    debug!(connection = %format_args!("{username}:{id}"), "sending close frame");
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
            },
            _ = ping.tick() => {
                match timeout(WRITE_WAIT, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    let _ = sink.close().await;
    debug!(connection = %format_args!("{username}:{id}"), "write loop stopped");
}
