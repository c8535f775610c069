//! SQLite persistence for users, rooms, members, messages, read cursors,
//! and the token blacklist.
//!
//! Every mutating operation is a single transaction. Readers observe a
//! consistent snapshot under SQLite's default isolation; the message-send
//! transaction keeps the room tip and the sender's read cursor in lockstep
//! with the inserted message.

use std::collections::HashMap;
use std::str::FromStr;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::models::{
    MemberRole, Message, MessageCreateInput, NewUser, Room, RoomMember, UserInfo, TEXT_MESSAGE,
};

/// Database connection pool and operations.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `path` and run migrations.
    pub async fn new(path: &str) -> Result<Self> {
        let pool = if path == ":memory:" {
            // A pooled in-memory database must stay on a single connection:
            // every pooled connection would otherwise see its own database.
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await?
        } else {
            let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .foreign_keys(true);
            SqlitePoolOptions::new().connect_with(options).await?
        };

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                password TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rooms (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                last_message_sent INTEGER NOT NULL DEFAULT 0,
                last_message_sent_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS room_members (
                room_id TEXT NOT NULL,
                username TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'member',
                last_message_read INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (room_id, username),
                FOREIGN KEY (room_id) REFERENCES rooms (id) ON DELETE CASCADE,
                FOREIGN KEY (username) REFERENCES users (username) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                kind INTEGER NOT NULL,
                data TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                FOREIGN KEY (room_id) REFERENCES rooms (id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS token_blacklist (
                token TEXT PRIMARY KEY NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_room_members_username ON room_members (username)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_room ON messages (room_id, id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ── User operations ──

    pub async fn create_user(&self, user: NewUser) -> Result<()> {
        if self.get_user_by_username(&user.username).await?.is_some() {
            return Err(ChatError::ConflictedUser);
        }

        let salt = SaltString::generate(&mut OsRng);
        let hashed = Argon2::default()
            .hash_password(user.password.as_bytes(), &salt)
            .map_err(|e| ChatError::PasswordHash(e.to_string()))?
            .to_string();

        sqlx::query("INSERT INTO users (username, name, password, created_at) VALUES (?, ?, ?, ?)")
            .bind(&user.username)
            .bind(&user.name)
            .bind(&hashed)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<UserInfo>> {
        let row = sqlx::query("SELECT name, username FROM users WHERE username = ? LIMIT 1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| UserInfo {
            name: r.get("name"),
            username: r.get("username"),
        }))
    }

    /// Verifies a password against the stored hash. Unknown users report
    /// `BadCredentials` rather than absence.
    pub async fn compare_password(&self, username: &str, password: &str) -> Result<bool> {
        let row = sqlx::query("SELECT password FROM users WHERE username = ? LIMIT 1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        let stored: String = match row {
            Some(r) => r.get("password"),
            None => return Err(ChatError::BadCredentials),
        };

        let Ok(parsed) = PasswordHash::new(&stored) else {
            return Ok(false);
        };
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    // ── Room operations ──

    /// Creates a room and its single Owner membership in one transaction.
    pub async fn create_room(&self, name: &str, owner: &str) -> Result<String> {
        if self.get_user_by_username(owner).await?.is_none() {
            return Err(ChatError::InvalidUser);
        }

        let id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO rooms (id, name, last_message_sent) VALUES (?, ?, 0)")
            .bind(&id)
            .bind(name)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO room_members (room_id, username, role, last_message_read) VALUES (?, ?, ?, 0)",
        )
        .bind(&id)
        .bind(owner)
        .bind(MemberRole::Owner.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    /// Adds a member. Idempotent: a second add of the same `(room, user)` is
    /// a no-op. Owner cannot be added through this path.
    pub async fn add_room_member(&self, room_id: &str, username: &str, role: MemberRole) -> Result<()> {
        if self.get_user_by_username(username).await?.is_none() {
            return Err(ChatError::InvalidUser);
        }
        if self.get_room_by_id(room_id).await?.is_none() {
            return Err(ChatError::InvalidRoom);
        }
        if role == MemberRole::Owner {
            return Err(ChatError::DisallowedOperation);
        }

        sqlx::query(
            "INSERT INTO room_members (room_id, username, role, last_message_read) \
             VALUES (?, ?, ?, 0) ON CONFLICT DO NOTHING",
        )
        .bind(room_id)
        .bind(username)
        .bind(role.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Removes a member. The Owner can never be removed.
    pub async fn remove_room_member(&self, room_id: &str, username: &str) -> Result<()> {
        if self.get_room_by_id(room_id).await?.is_none() {
            return Err(ChatError::InvalidRoom);
        }
        let role = match self.is_room_member(room_id, username).await? {
            Some(role) => role,
            None => return Err(ChatError::InvalidMember),
        };
        if role == MemberRole::Owner {
            return Err(ChatError::DisallowedOperation);
        }

        sqlx::query("DELETE FROM room_members WHERE room_id = ? AND username = ?")
            .bind(room_id)
            .bind(username)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn is_room_member(&self, room_id: &str, username: &str) -> Result<Option<MemberRole>> {
        let row = sqlx::query("SELECT role FROM room_members WHERE room_id = ? AND username = ?")
            .bind(room_id)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|r| MemberRole::parse(r.get("role"))))
    }

    pub async fn get_room_by_id(&self, room_id: &str) -> Result<Option<Room>> {
        let rows = sqlx::query(
            "SELECT r.id, r.name, r.last_message_sent, r.last_message_sent_at, \
                    rm.room_id, rm.username, rm.role, rm.last_message_read \
             FROM rooms AS r \
             INNER JOIN room_members AS rm ON r.id = rm.room_id \
             WHERE r.id = ? \
             ORDER BY rm.username ASC",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;

        let Some(first) = rows.first() else {
            return Ok(None);
        };

        let mut room = Room {
            id: first.get("id"),
            name: first.get("name"),
            last_message_sent: first.get("last_message_sent"),
            last_message_sent_at: first.get("last_message_sent_at"),
            members: Vec::with_capacity(rows.len()),
        };
        for row in &rows {
            room.members.push(parse_member(row));
        }

        Ok(Some(room))
    }

    /// Rooms the user belongs to, most recently active first, then by name.
    /// Limit 0 takes the default of 20; negative offsets clamp to 0.
    pub async fn get_user_rooms(&self, username: &str, offset: i64, limit: i64) -> Result<Vec<Room>> {
        let limit = if limit == 0 { 20 } else { limit };
        let offset = offset.max(0);

        let rows = sqlx::query(
            "WITH my_rooms AS ( \
                 SELECT r.id, r.name, r.last_message_sent, r.last_message_sent_at \
                 FROM room_members AS rm \
                 INNER JOIN rooms AS r ON rm.room_id = r.id \
                 WHERE rm.username = ? \
                 ORDER BY r.last_message_sent_at DESC, r.name ASC \
                 LIMIT ? OFFSET ? \
             ) \
             SELECT my_rooms.id, my_rooms.name, my_rooms.last_message_sent, \
                    my_rooms.last_message_sent_at, \
                    rm.room_id, rm.username, rm.role, rm.last_message_read \
             FROM my_rooms \
             INNER JOIN room_members AS rm ON my_rooms.id = rm.room_id \
             ORDER BY my_rooms.last_message_sent_at DESC, my_rooms.name ASC, rm.username ASC",
        )
        .bind(username)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let mut rooms: Vec<Room> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for row in &rows {
            let id: String = row.get("id");
            let at = *index.entry(id.clone()).or_insert_with(|| {
                rooms.push(Room {
                    id,
                    name: row.get("name"),
                    last_message_sent: row.get("last_message_sent"),
                    last_message_sent_at: row.get("last_message_sent_at"),
                    members: Vec::new(),
                });
                rooms.len() - 1
            });
            rooms[at].members.push(parse_member(row));
        }

        Ok(rooms)
    }

    /// Messages in a room, newest first. Limit 0 takes the default of 100;
    /// negative offsets clamp to 0.
    pub async fn get_room_messages(&self, room_id: &str, offset: i64, limit: i64) -> Result<Vec<Message>> {
        let limit = if limit == 0 { 100 } else { limit };
        let offset = offset.max(0);

        let rows = sqlx::query(
            "SELECT id, kind, data, room_id, sender, sent_at \
             FROM messages WHERE room_id = ? \
             ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(room_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(parse_message).collect())
    }

    /// Persists a message and, in the same transaction, advances the
    /// sender's read cursor to it and the room tip to its `(id, sent_at)`.
    pub async fn send_message_to_room(&self, input: MessageCreateInput) -> Result<Message> {
        if input.data.is_empty() || input.room_id.is_empty() || input.sender.is_empty() {
            return Err(ChatError::InvalidMessage);
        }
        if self.is_room_member(&input.room_id, &input.sender).await?.is_none() {
            return Err(ChatError::InvalidRoom);
        }
        if input.kind != TEXT_MESSAGE {
            return Err(ChatError::InvalidMessageType);
        }

        let sent_at = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "INSERT INTO messages (room_id, sender, kind, data, sent_at) \
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&input.room_id)
        .bind(&input.sender)
        .bind(input.kind)
        .bind(&input.data)
        .bind(sent_at)
        .fetch_one(&mut *tx)
        .await?;
        let id: i64 = row.get("id");

        // Sending implies reading: the cursor only ever moves forward.
        sqlx::query(
            "UPDATE room_members SET last_message_read = ? \
             WHERE room_id = ? AND username = ? AND last_message_read < ?",
        )
        .bind(id)
        .bind(&input.room_id)
        .bind(&input.sender)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE rooms SET last_message_sent = ?, last_message_sent_at = ? WHERE id = ?")
            .bind(id)
            .bind(sent_at)
            .bind(&input.room_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Message {
            id,
            kind: input.kind,
            data: input.data,
            room_id: input.room_id,
            sender: input.sender,
            sent_at,
        })
    }

    /// Marks the member's cursor at the newest message sent at or before
    /// now. Returns `(0, read_at)` without touching the cursor when the room
    /// has no such message.
    pub async fn read_room_messages(&self, room_id: &str, username: &str) -> Result<(i64, DateTime<Utc>)> {
        if self.is_room_member(room_id, username).await?.is_none() {
            return Err(ChatError::InvalidRoom);
        }

        let read_at = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id FROM messages WHERE room_id = ? AND sent_at <= ? ORDER BY id DESC LIMIT 1",
        )
        .bind(room_id)
        .bind(read_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok((0, read_at));
        };
        let last_read: i64 = row.get("id");

        sqlx::query(
            "UPDATE room_members SET last_message_read = ? \
             WHERE room_id = ? AND username = ? AND last_message_read < ?",
        )
        .bind(last_read)
        .bind(room_id)
        .bind(username)
        .bind(last_read)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((last_read, read_at))
    }

    pub async fn get_room_members(&self, room_id: &str) -> Result<Vec<RoomMember>> {
        let rows = sqlx::query(
            "SELECT room_id, username, role, last_message_read \
             FROM room_members WHERE room_id = ? ORDER BY username ASC",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(parse_member).collect())
    }

    /// Distinct other users sharing at least one room with `username`,
    /// in lexicographic order.
    pub async fn get_friends(&self, username: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "WITH user_rooms AS ( \
                 SELECT room_id FROM room_members WHERE username = ? \
             ) \
             SELECT DISTINCT rm.username AS friend \
             FROM room_members AS rm \
             INNER JOIN user_rooms AS ur ON rm.room_id = ur.room_id \
             WHERE rm.username != ? \
             ORDER BY friend",
        )
        .bind(username)
        .bind(username)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("friend")).collect())
    }

    // ── Token blacklist ──

    /// Revokes a token until its own expiry. Rows whose expiry has elapsed
    /// are pruned on the same transaction.
    pub async fn blacklist_token(&self, token: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM token_blacklist WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO token_blacklist (token, expires_at) VALUES (?, ?) ON CONFLICT DO NOTHING")
            .bind(token)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn is_token_blacklisted(&self, token: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM token_blacklist WHERE token = ?")
            .bind(token)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") > 0)
    }
}

fn parse_member(row: &sqlx::sqlite::SqliteRow) -> RoomMember {
    let role: String = row.get("role");
    RoomMember {
        room_id: row.get("room_id"),
        username: row.get("username"),
        role: MemberRole::parse(&role).unwrap_or(MemberRole::Member),
        last_message_read: row.get("last_message_read"),
    }
}

fn parse_message(row: &sqlx::sqlite::SqliteRow) -> Message {
    Message {
        id: row.get("id"),
        kind: row.get("kind"),
        data: row.get("data"),
        room_id: row.get("room_id"),
        sender: row.get("sender"),
        sent_at: row.get("sent_at"),
    }
}
