//! Error taxonomy shared by the chat store, the auth layer, and the
//! realtime engine. Store errors surface to callers verbatim; the event
//! router logs and swallows handler errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("invalid user")]
    InvalidUser,

    #[error("user already exists")]
    ConflictedUser,

    #[error("chat already exists")]
    ConflictedRoom,

    #[error("invalid room")]
    InvalidRoom,

    #[error("invalid member")]
    InvalidMember,

    #[error("invalid message")]
    InvalidMessage,

    #[error("invalid message type")]
    InvalidMessageType,

    #[error("disallowed operation")]
    DisallowedOperation,

    #[error("invalid credentials")]
    BadCredentials,

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("unauthorized")]
    Unauthorized,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("password hash error: {0}")]
    PasswordHash(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;
