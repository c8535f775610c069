//! HTTP and WebSocket handlers for the palaver chat server

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::Json;
use tracing::{error, info};

use crate::auth::AUTH_COOKIE;
use crate::error::ChatError;
use crate::models::{
    AddMemberRequest, CreateRoomRequest, CreateRoomResponse, ErrorResponse, HealthResponse,
    MemberRole, Message, NewUser, PageQuery, Room, Session, SigninRequest, UserInfo,
};
use crate::realtime::connection::MAX_MESSAGE_SIZE;
use crate::state::SharedState;
use crate::validation::{validate_name, validate_password, validate_room_name, validate_username};

/// Translates the store's error taxonomy into HTTP status codes. Sensitive
/// errors never leak their cause to the client.
pub struct ApiError(ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChatError::InvalidUser | ChatError::InvalidRoom | ChatError::InvalidMember => {
                StatusCode::NOT_FOUND
            }
            ChatError::ConflictedUser | ChatError::ConflictedRoom => StatusCode::CONFLICT,
            ChatError::InvalidMessage | ChatError::InvalidMessageType => StatusCode::BAD_REQUEST,
            ChatError::DisallowedOperation | ChatError::Unauthorized => StatusCode::FORBIDDEN,
            ChatError::BadCredentials | ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::Database(_)
            | ChatError::Serialization(_)
            | ChatError::Token(_)
            | ChatError::PasswordHash(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal error: {}", self.0);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                code: status.as_u16(),
            }),
        )
            .into_response()
    }
}

fn bad_request(message: String) -> ApiErrorResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message,
            code: 400,
        }),
    )
}

type ApiErrorResponse = (StatusCode, Json<ErrorResponse>);

/// Health check endpoint
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ── Users ──

/// User registration endpoint
pub async fn register_handler(
    State(state): State<SharedState>,
    Json(request): Json<NewUser>,
) -> Result<Json<UserInfo>, Response> {
    for check in [
        validate_username(&request.username),
        validate_name(&request.name),
        validate_password(&request.password),
    ] {
        if let Err(message) = check {
            return Err(bad_request(message).into_response());
        }
    }

    let info = UserInfo {
        name: request.name.clone(),
        username: request.username.clone(),
    };
    state
        .db
        .create_user(request)
        .await
        .map_err(|err| ApiError(err).into_response())?;

    info!("registered user {}", info.username);
    Ok(Json(info))
}

pub async fn me_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
) -> Result<Json<UserInfo>, ApiError> {
    let user = state
        .db
        .get_user_by_username(&session.username)
        .await?
        .ok_or(ChatError::InvalidUser)?;
    Ok(Json(user))
}

pub async fn get_user_handler(
    State(state): State<SharedState>,
    Path(username): Path<String>,
) -> Result<Json<UserInfo>, ApiError> {
    let user = state
        .db
        .get_user_by_username(&username)
        .await?
        .ok_or(ChatError::InvalidUser)?;
    Ok(Json(user))
}

// ── Auth ──

/// Signs in and sets the `auth_token` cookie alongside the session body.
pub async fn signin_handler(
    State(state): State<SharedState>,
    Json(request): Json<SigninRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .auth
        .new_session(&request.username, &request.password)
        .await?;

    let max_age = (session.expires_at - chrono::Utc::now()).num_seconds().max(0);
    let cookie = format!(
        "{AUTH_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}",
        session.token
    );

    info!("user signed in: {}", session.username);
    Ok((
        AppendHeaders([(header::SET_COOKIE, cookie)]),
        Json(session),
    ))
}

/// Signs out: blacklists the presented token and clears the cookie.
pub async fn signout_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
) -> Result<impl IntoResponse, ApiError> {
    state.auth.destroy_session(&session).await?;

    let cookie = format!("{AUTH_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    info!("user signed out: {}", session.username);
    Ok((AppendHeaders([(header::SET_COOKIE, cookie)]), StatusCode::NO_CONTENT))
}

// ── Rooms ──

pub async fn create_room_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Json(request): Json<CreateRoomRequest>,
) -> Result<Json<CreateRoomResponse>, Response> {
    if let Err(message) = validate_room_name(&request.name) {
        return Err(bad_request(message).into_response());
    }

    let id = state
        .db
        .create_room(request.name.trim(), &session.username)
        .await
        .map_err(|err| ApiError(err).into_response())?;

    info!("room created: {id} by {}", session.username);
    Ok(Json(CreateRoomResponse { id }))
}

pub async fn my_rooms_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Room>>, ApiError> {
    let rooms = state
        .db
        .get_user_rooms(&session.username, page.offset, page.limit)
        .await?;
    Ok(Json(rooms))
}

pub async fn get_room_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path(room_id): Path<String>,
) -> Result<Json<Room>, ApiError> {
    let room = state
        .db
        .get_room_by_id(&room_id)
        .await?
        .ok_or(ChatError::InvalidRoom)?;

    if !room.members.iter().any(|m| m.username == session.username) {
        return Err(ChatError::Unauthorized.into());
    }
    Ok(Json(room))
}

pub async fn get_room_messages_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path(room_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    if state
        .db
        .is_room_member(&room_id, &session.username)
        .await?
        .is_none()
    {
        return Err(ChatError::InvalidRoom.into());
    }

    let messages = state
        .db
        .get_room_messages(&room_id, page.offset, page.limit)
        .await?;
    Ok(Json(messages))
}

pub async fn add_member_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path(room_id): Path<String>,
    Json(request): Json<AddMemberRequest>,
) -> Result<StatusCode, ApiError> {
    require_manager(&state, &room_id, &session.username).await?;

    state
        .db
        .add_room_member(&room_id, &request.username, request.role)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_member_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    Path((room_id, username)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    require_manager(&state, &room_id, &session.username).await?;

    state.db.remove_room_member(&room_id, &username).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Membership management requires Owner or Admin.
async fn require_manager(
    state: &SharedState,
    room_id: &str,
    username: &str,
) -> Result<(), ChatError> {
    match state.db.is_room_member(room_id, username).await? {
        Some(MemberRole::Owner) | Some(MemberRole::Admin) => Ok(()),
        Some(MemberRole::Member) => Err(ChatError::Unauthorized),
        None => Err(ChatError::InvalidRoom),
    }
}

// ── WebSocket ──

/// WebSocket upgrade endpoint. The auth middleware has already validated
/// the token; a revoked or expired one never reaches this point.
pub async fn ws_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<Session>,
    ws: WebSocketUpgrade,
) -> Response {
    info!("websocket connection established for {}", session.username);
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            let manager = std::sync::Arc::clone(&state.manager);
            manager.connect(&session.username, socket).await;
        })
}
