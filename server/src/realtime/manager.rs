//! The connection manager: owns the `username → connections` registry,
//! admits and evicts connections, fans events out to named users, and fires
//! presence lifecycle callbacks on zero-crossing transitions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use axum::extract::ws::WebSocket;
use futures_util::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::{connection, Event};

/// Buffered capacity of the shared inbound channel.
pub const READ_STREAM_SIZE: usize = 100;

/// Buffered capacity of each connection's outbound channel.
pub const WRITE_STREAM_SIZE: usize = 100;

type UserHook = Arc<dyn Fn(&str) + Send + Sync>;
type ConnHook = Arc<dyn Fn(&str, u64) + Send + Sync>;

#[derive(Default)]
struct LifecycleHooks {
    user_connected: Option<UserHook>,
    connection_opened: Option<ConnHook>,
    connection_closed: Option<ConnHook>,
    user_disconnected: Option<UserHook>,
}

struct ConnHandle {
    id: u64,
    outbound: mpsc::Sender<Arc<Event>>,
}

/// Registry of live connections. Mutations hold the write lock; fan-out
/// holds the read lock and never blocks on a peer: a full outbound channel
/// marks the connection slow and it is evicted after the lock is released.
///
/// Lifecycle callbacks always fire with the lock released, so a callback may
/// call back into the manager.
pub struct ConnManager {
    conns: RwLock<HashMap<String, Vec<ConnHandle>>>,
    inbound_tx: mpsc::Sender<Event>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<Event>>>,
    hooks: StdRwLock<LifecycleHooks>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ConnManager {
    pub fn new(cancel: CancellationToken) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(READ_STREAM_SIZE);
        Self {
            conns: RwLock::new(HashMap::new()),
            inbound_tx,
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            hooks: StdRwLock::new(LifecycleHooks::default()),
            cancel,
            tasks: TaskTracker::new(),
        }
    }

    // ── Lifecycle callbacks ──

    pub fn on_user_connected(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.hooks.write().unwrap().user_connected = Some(Arc::new(hook));
    }

    pub fn on_connection_opened(&self, hook: impl Fn(&str, u64) + Send + Sync + 'static) {
        self.hooks.write().unwrap().connection_opened = Some(Arc::new(hook));
    }

    pub fn on_connection_closed(&self, hook: impl Fn(&str, u64) + Send + Sync + 'static) {
        self.hooks.write().unwrap().connection_closed = Some(Arc::new(hook));
    }

    pub fn on_user_disconnected(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.hooks.write().unwrap().user_disconnected = Some(Arc::new(hook));
    }

    /// Hands out the single-consumer end of the inbound event stream. The
    /// event router takes it exactly once.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<Event>> {
        self.inbound_rx.lock().unwrap().take()
    }

    // ── Admission / eviction ──

    /// Admits an upgraded socket for `username` and spawns its I/O loops.
    /// Connection ids are per-user sequential, assigned under the write
    /// lock. The first connection for a user fires `user_connected` before
    /// `connection_opened`.
    pub async fn connect(self: Arc<Self>, username: &str, socket: WebSocket) {
        let (sink, stream) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(WRITE_STREAM_SIZE);

        let (id, first) = {
            let mut conns = self.conns.write().await;
            let list = conns.entry(username.to_string()).or_default();
            let id = list.len() as u64 + 1;
            list.push(ConnHandle {
                id,
                outbound: outbound_tx,
            });
            (id, list.len() == 1)
        };

        let manager = Arc::clone(&self);
        let reader_name = username.to_string();
        let inbound = self.inbound_tx.clone();
        self.tasks.spawn(async move {
            connection::read_loop(stream, inbound, &reader_name, id).await;
            // Either loop's exit removes the connection; eviction closes the
            // outbound channel, which in turn stops the write loop.
            manager.disconnect(&reader_name, &[id]).await;
        });

        self.tasks.spawn(connection::write_loop(
            sink,
            outbound_rx,
            self.cancel.clone(),
            username.to_string(),
            id,
        ));

        debug!(connection = %format_args!("{username}:{id}"), "connection admitted");

        let hooks = self.hooks.read().unwrap().clone_for_fire();
        if first {
            if let Some(hook) = &hooks.user_connected {
                hook(username);
            }
        }
        if let Some(hook) = &hooks.connection_opened {
            hook(username, id);
        }
    }

    /// Evicts the named connections (all of them when `ids` is empty),
    /// closing each outbound channel. Deletes the user's key when the list
    /// empties, firing `user_disconnected` after `connection_closed`.
    pub async fn disconnect(&self, username: &str, ids: &[u64]) {
        let (removed, emptied) = {
            let mut conns = self.conns.write().await;
            let Some(list) = conns.get_mut(username) else {
                return;
            };

            let mut removed = Vec::new();
            if ids.is_empty() {
                removed.extend(list.drain(..).map(|c| c.id));
            } else {
                // Walk from the tail so removal keeps earlier indices stable.
                for i in (0..list.len()).rev() {
                    if ids.contains(&list[i].id) {
                        removed.push(list.remove(i).id);
                    }
                }
            }

            let emptied = if list.is_empty() {
                conns.remove(username);
                true
            } else {
                false
            };
            (removed, emptied)
        };

        if removed.is_empty() {
            return;
        }

        let hooks = self.hooks.read().unwrap().clone_for_fire();
        for id in &removed {
            debug!(connection = %format_args!("{username}:{id}"), "connection closed");
            if let Some(hook) = &hooks.connection_closed {
                hook(username, *id);
            }
        }
        if emptied {
            if let Some(hook) = &hooks.user_disconnected {
                hook(username);
            }
        }
    }

    pub async fn is_user_connected(&self, username: &str) -> bool {
        self.conns.read().await.contains_key(username)
    }

    // ── Fan-out ──

    /// Best-effort delivery to every connection of every user.
    pub async fn send(&self, event: Arc<Event>) {
        let slow = {
            let conns = self.conns.read().await;
            let mut slow = Vec::new();
            for (username, list) in conns.iter() {
                enqueue(username, list, &event, &mut slow);
            }
            slow
        };
        self.evict_slow(slow).await;
    }

    /// Best-effort delivery to every connection of each named user.
    pub async fn send_to_users(&self, event: Arc<Event>, usernames: &[String]) {
        let slow = {
            let conns = self.conns.read().await;
            let mut slow = Vec::new();
            for username in usernames {
                if let Some(list) = conns.get(username) {
                    enqueue(username, list, &event, &mut slow);
                }
            }
            slow
        };
        self.evict_slow(slow).await;
    }

    async fn evict_slow(&self, slow: Vec<(String, u64)>) {
        for (username, id) in slow {
            warn!(
                connection = %format_args!("{username}:{id}"),
                "outbound channel full, disconnecting slow connection"
            );
            self.disconnect(&username, &[id]).await;
        }
    }

    // ── Shutdown ──

    /// Disconnects every connection and waits for all I/O loops to unwind,
    /// bounded by `deadline`. Returns false when the deadline elapsed.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        let usernames: Vec<String> = self.conns.read().await.keys().cloned().collect();
        for username in usernames {
            self.disconnect(&username, &[]).await;
        }

        self.tasks.close();
        tokio::time::timeout(deadline, self.tasks.wait()).await.is_ok()
    }
}

impl LifecycleHooks {
    fn clone_for_fire(&self) -> LifecycleHooks {
        LifecycleHooks {
            user_connected: self.user_connected.clone(),
            connection_opened: self.connection_opened.clone(),
            connection_closed: self.connection_closed.clone(),
            user_disconnected: self.user_disconnected.clone(),
        }
    }
}

/// Non-blocking enqueue onto each connection of one user; full channels are
/// recorded for eviction instead of stalling the fan-out.
fn enqueue(username: &str, list: &[ConnHandle], event: &Arc<Event>, slow: &mut Vec<(String, u64)>) {
    for conn in list {
        match conn.outbound.try_send(Arc::clone(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                slow.push((username.to_string(), conn.id));
            }
            // Closed: the connection is already on its way out.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
