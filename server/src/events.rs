//! Domain event types, payload schemas, and the handlers the router
//! dispatches them to. Each handler decodes its payload, performs a chat
//! store operation, and re-emits to the affected users.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::db::Database;
use crate::error::Result;
use crate::models::MessageCreateInput;
use crate::realtime::{ConnManager, Emitter, Event, EventRouter};

pub const MESSAGE_EVENT: &str = "message";
pub const READ_MESSAGE_EVENT: &str = "read_message";
pub const TYPING_EVENT: &str = "typing";
pub const ONLINE_EVENT: &str = "online";
pub const OFFLINE_EVENT: &str = "offline";
pub const IS_ONLINE_EVENT: &str = "is_online";

/// `message` payload. Clients send `id = 0` and no `sent_at`; the echo
/// carries the server-assigned id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEventPayload {
    #[serde(default)]
    pub id: i64,
    pub room_id: String,
    #[serde(rename = "type")]
    pub kind: i64,
    pub data: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
}

/// `read_message` payload. The server fills `read_by`, `read_at`, and
/// `last_read_message` from the store's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadMessageEventPayload {
    pub room_id: String,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_by: String,
    #[serde(default)]
    pub last_read_message: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingEventPayload {
    pub typing: bool,
    pub username: String,
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineEventPayload {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineEventPayload {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsOnlineEventPayload {
    pub username: String,
}

/// Registers one handler per inbound event type.
pub fn register_event_handlers(router: &mut EventRouter, db: &Database, manager: &Arc<ConnManager>) {
    let emitter = router.emitter();

    {
        let db = db.clone();
        let emitter = emitter.clone();
        router.on(MESSAGE_EVENT, move |event| {
            let db = db.clone();
            let emitter = emitter.clone();
            Box::pin(async move { handle_message(db, emitter, event).await })
        });
    }

    {
        let db = db.clone();
        let emitter = emitter.clone();
        router.on(READ_MESSAGE_EVENT, move |event| {
            let db = db.clone();
            let emitter = emitter.clone();
            Box::pin(async move { handle_read_message(db, emitter, event).await })
        });
    }

    {
        let db = db.clone();
        let emitter = emitter.clone();
        router.on(TYPING_EVENT, move |event| {
            let db = db.clone();
            let emitter = emitter.clone();
            Box::pin(async move { handle_typing(db, emitter, event).await })
        });
    }

    {
        let manager = Arc::clone(manager);
        let emitter = emitter.clone();
        router.on(IS_ONLINE_EVENT, move |event| {
            let manager = Arc::clone(&manager);
            let emitter = emitter.clone();
            Box::pin(async move { handle_is_online(manager, emitter, event).await })
        });
    }
}

/// Persists the message, then echoes it with the server-assigned id and
/// timestamp to every room member. The sender receives it too: that frame
/// is their authoritative acknowledgement.
async fn handle_message(db: Database, emitter: Emitter, event: Event) -> Result<()> {
    let mut payload: MessageEventPayload = serde_json::from_value(event.payload)?;
    let sender = event.dispatcher.unwrap_or_default();

    let message = db
        .send_message_to_room(MessageCreateInput {
            kind: payload.kind,
            data: payload.data.clone(),
            room_id: payload.room_id.clone(),
            sender,
        })
        .await?;

    payload.id = message.id;
    payload.sender = message.sender.clone();
    payload.sent_at = Some(message.sent_at);

    let usernames = member_usernames(&db, &payload.room_id).await?;
    emitter.emit_to(MESSAGE_EVENT, &payload, &usernames).await
}

/// Advances the reader's cursor and reports the receipt to the room. A
/// reader with nothing new to mark produces no fan-out.
async fn handle_read_message(db: Database, emitter: Emitter, event: Event) -> Result<()> {
    let mut payload: ReadMessageEventPayload = serde_json::from_value(event.payload)?;
    let reader = event.dispatcher.unwrap_or_default();

    let (last_read, read_at) = db.read_room_messages(&payload.room_id, &reader).await?;
    if last_read == 0 {
        return Ok(());
    }

    payload.read_by = reader;
    payload.read_at = Some(read_at);
    payload.last_read_message = last_read;

    let usernames = member_usernames(&db, &payload.room_id).await?;
    emitter
        .emit_to(READ_MESSAGE_EVENT, &payload, &usernames)
        .await
}

/// Relays the typing indicator verbatim to the room. Nothing is persisted.
async fn handle_typing(db: Database, emitter: Emitter, event: Event) -> Result<()> {
    let payload: TypingEventPayload = serde_json::from_value(event.payload)?;

    let usernames = member_usernames(&db, &payload.room_id).await?;
    emitter.emit_to(TYPING_EVENT, &payload, &usernames).await
}

/// Answers a presence probe, addressed only to the asker.
async fn handle_is_online(manager: Arc<ConnManager>, emitter: Emitter, event: Event) -> Result<()> {
    let payload: IsOnlineEventPayload = serde_json::from_value(event.payload)?;
    let Some(asker) = event.dispatcher else {
        return Ok(());
    };

    let target = [asker];
    if manager.is_user_connected(&payload.username).await {
        emitter
            .emit_to(
                ONLINE_EVENT,
                &OnlineEventPayload {
                    username: payload.username,
                },
                &target,
            )
            .await
    } else {
        emitter
            .emit_to(
                OFFLINE_EVENT,
                &OfflineEventPayload {
                    username: payload.username,
                },
                &target,
            )
            .await
    }
}

async fn member_usernames(db: &Database, room_id: &str) -> Result<Vec<String>> {
    let members = db.get_room_members(room_id).await?;
    Ok(members.into_iter().map(|m| m.username).collect())
}

/// Wires presence fan-out to the manager's lifecycle callbacks.
///
/// First connection announces the user to their friends; each new connection
/// (including the first) replays the online status of already-connected
/// friends back to the newcomer; last disconnection announces the user
/// offline.
pub fn register_presence_hooks(manager: &Arc<ConnManager>, db: &Database, emitter: &Emitter) {
    {
        let db = db.clone();
        let emitter = emitter.clone();
        manager.on_user_connected(move |username: &str| {
            let db = db.clone();
            let emitter = emitter.clone();
            let username = username.to_string();
            tokio::spawn(async move {
                let friends = match db.get_friends(&username).await {
                    Ok(friends) => friends,
                    Err(err) => {
                        error!("fetching friends of {username}: {err}");
                        return;
                    }
                };
                if let Err(err) = emitter
                    .emit_to(ONLINE_EVENT, &OnlineEventPayload { username }, &friends)
                    .await
                {
                    error!("emit online: {err}");
                }
            });
        });
    }

    {
        let db = db.clone();
        let emitter = emitter.clone();
        // The hook lives inside the manager; hold it weakly so the manager
        // does not own itself through the closure.
        let weak = Arc::downgrade(manager);
        manager.on_connection_opened(move |username: &str, _id| {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            let db = db.clone();
            let emitter = emitter.clone();
            let username = username.to_string();
            tokio::spawn(async move {
                let friends = match db.get_friends(&username).await {
                    Ok(friends) => friends,
                    Err(err) => {
                        error!("fetching friends of {username}: {err}");
                        return;
                    }
                };
                // Cold-start sync: tell the newcomer which friends were
                // already online before it arrived.
                let target = [username];
                for friend in friends {
                    if manager.is_user_connected(&friend).await {
                        if let Err(err) = emitter
                            .emit_to(ONLINE_EVENT, &OnlineEventPayload { username: friend }, &target)
                            .await
                        {
                            error!("emit online: {err}");
                        }
                    }
                }
            });
        });
    }

    {
        let db = db.clone();
        let emitter = emitter.clone();
        manager.on_user_disconnected(move |username: &str| {
            let db = db.clone();
            let emitter = emitter.clone();
            let username = username.to_string();
            tokio::spawn(async move {
                let friends = match db.get_friends(&username).await {
                    Ok(friends) => friends,
                    Err(err) => {
                        error!("fetching friends of {username}: {err}");
                        return;
                    }
                };
                if let Err(err) = emitter
                    .emit_to(OFFLINE_EVENT, &OfflineEventPayload { username }, &friends)
                    .await
                {
                    error!("emit offline: {err}");
                }
            });
        });
    }
}
