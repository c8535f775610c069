//! Data models for the palaver chat server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message kind for text payloads. The wire field is numeric to leave room
/// for future kinds; only text is defined.
pub const TEXT_MESSAGE: i64 = 1;

/// A registered user as stored, minus secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub username: String,
}

/// Input for registering a user. The password is argon2-hashed before it
/// touches storage and never leaves the store as plaintext afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub username: String,
    pub password: String,
}

/// Role of a room member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<MemberRole> {
        match s {
            "owner" => Some(MemberRole::Owner),
            "admin" => Some(MemberRole::Admin),
            "member" => Some(MemberRole::Member),
            _ => None,
        }
    }
}

/// A user's membership in a room, carrying their read cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMember {
    pub room_id: String,
    pub username: String,
    pub role: MemberRole,
    pub last_message_read: i64,
}

/// A chat room. `last_message_sent` is 0 and `last_message_sent_at` is None
/// until the first message lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub members: Vec<RoomMember>,
    pub last_message_sent: i64,
    pub last_message_sent_at: Option<DateTime<Utc>>,
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: i64,
    pub data: String,
    pub room_id: String,
    pub sender: String,
    pub sent_at: DateTime<Utc>,
}

/// Input for sending a message to a room.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageCreateInput {
    #[serde(rename = "type")]
    pub kind: i64,
    pub data: String,
    pub room_id: String,
    pub sender: String,
}

/// An authenticated binding of a token to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub username: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

// ── Request / response DTOs ──

#[derive(Debug, Deserialize)]
pub struct SigninRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRoomResponse {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub username: String,
    pub role: MemberRole,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub limit: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
