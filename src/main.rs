//! Friendbook Server - Collaborative Friendship Book Editor
//!
//! A page-oriented collaborative editor backend using:
//! - A reconciliation engine holding pending page edits per session
//! - An atomic replace-all save protocol with dense renumbering
//! - Sled embedded database for books, permissions and page persistence
//! - Axum with WebSocket for best-effort canvas update fan-out

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod auth;
mod editor;
mod relay;
mod storage;

use auth::{generate_token, hash_password, verify_password, AuthUser, PermissionGate};
use editor::{EditorError, PageContent, SessionManager};
use relay::{CanvasUpdate, CollaborationRelay};
use storage::{
    BookId, BookStore, Orientation, PageSize, Role, StorageConfig, StorageError, UserId,
    UserRecord,
};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Persistent store for users, books, permissions and pages
    store: BookStore,
    /// Open editing sessions, one reconciliation engine each
    sessions: Arc<SessionManager>,
    /// Best-effort canvas update fan-out per book
    relay: Arc<CollaborationRelay>,
    /// Role check in front of every book-scoped operation
    gate: PermissionGate,
    /// Secret for signing bearer tokens
    jwt_secret: String,
    /// Server start time
    started_at: std::time::Instant,
}

impl AppState {
    pub fn new(store: BookStore, jwt_secret: String) -> Self {
        let gate = PermissionGate::new(store.clone());
        Self {
            store,
            sessions: Arc::new(SessionManager::new(Duration::from_secs(30 * 60))),
            relay: Arc::new(CollaborationRelay::new()),
            gate,
            jwt_secret,
            started_at: std::time::Instant::now(),
        }
    }
}

// ============================================================================
// API TYPES
// ============================================================================

type ApiError = (StatusCode, Json<serde_json::Value>);

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    open_sessions: usize,
    active_rooms: usize,
    users: usize,
    books: usize,
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct UserResponse {
    id: UserId,
    username: String,
    email: String,
}

impl From<UserRecord> for UserResponse {
    fn from(user: UserRecord) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
        }
    }
}

#[derive(Debug, Serialize)]
struct AuthResponse {
    token: String,
    user: UserResponse,
}

#[derive(Debug, Deserialize)]
struct UpdateUsernameRequest {
    username: String,
}

#[derive(Debug, Deserialize)]
struct UpdatePasswordRequest {
    current_password: String,
    new_password: String,
}

#[derive(Debug, Deserialize)]
struct ListBooksQuery {
    #[serde(default)]
    archived: bool,
}

#[derive(Debug, Deserialize)]
struct CreateBookRequest {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    page_size: PageSize,
    #[serde(default)]
    orientation: Orientation,
}

#[derive(Debug, Deserialize)]
struct UpdateBookRequest {
    archived: bool,
}

#[derive(Debug, Deserialize)]
struct UpdateSettingsRequest {
    title: String,
    #[serde(default)]
    description: String,
    page_size: PageSize,
    orientation: Orientation,
}

#[derive(Debug, Deserialize)]
struct GrantPermissionRequest {
    role: Role,
}

#[derive(Debug, Serialize)]
struct BookResponse {
    id: BookId,
    title: String,
    description: String,
    owner_id: UserId,
    page_size: PageSize,
    orientation: Orientation,
    archived: bool,
    created_at: i64,
    last_saved_at: Option<i64>,
    role: Role,
}

impl BookResponse {
    fn new(book: storage::BookRecord, role: Role) -> Self {
        Self {
            id: book.id,
            title: book.title,
            description: book.description,
            owner_id: book.owner_id,
            page_size: book.page_size,
            orientation: book.orientation,
            archived: book.archived,
            created_at: book.created_at,
            last_saved_at: book.last_saved_at,
            role,
        }
    }
}

#[derive(Debug, Serialize)]
struct PageResponse {
    page_number: u32,
    content: serde_json::Value,
    updated_at: i64,
}

#[derive(Debug, Serialize)]
struct OpenSessionResponse {
    session_id: Uuid,
    current_page: u32,
    pages: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct SessionPagesResponse {
    current_page: u32,
    pages: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct SessionPageContentResponse {
    page_number: u32,
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RecordPageRequest {
    content: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct AddPageResponse {
    page_number: u32,
}

#[derive(Debug, Deserialize)]
struct SaveRequest {
    current_page: u32,
    content: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct SaveResponse {
    current_page: u32,
    page_count: usize,
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

fn editor_error(err: EditorError) -> ApiError {
    let status = match &err {
        EditorError::Forbidden(_) => StatusCode::FORBIDDEN,
        EditorError::InvariantViolation(_) => StatusCode::CONFLICT,
        EditorError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        EditorError::NotReady => StatusCode::CONFLICT,
    };
    error_body(status, err.to_string())
}

fn storage_error(err: StorageError) -> ApiError {
    let status = match &err {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::AlreadyExists(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_body(status, err.to_string())
}

// ============================================================================
// AUTH HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.store.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        open_sessions: state.sessions.count(),
        active_rooms: state.relay.room_count(),
        users: stats.user_count,
        books: stats.book_count,
    })
}

/// Register a new user and hand out a token
async fn register(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    if payload.username.trim().is_empty() || payload.email.trim().is_empty() {
        return Err(error_body(
            StatusCode::BAD_REQUEST,
            "username and email must not be empty",
        ));
    }
    if payload.password.len() < 6 {
        return Err(error_body(
            StatusCode::BAD_REQUEST,
            "password must be at least 6 characters",
        ));
    }

    let hash = hash_password(&payload.password);
    let user = state
        .store
        .create_user(payload.username.trim(), payload.email.trim(), &hash)
        .map_err(storage_error)?;

    info!(user_id = user.id, "user registered");

    let token = generate_token(user.id, &state.jwt_secret)
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(AuthResponse {
        token,
        user: user.into(),
    }))
}

/// Log in with email and password
async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let invalid =
        || error_body(StatusCode::UNAUTHORIZED, auth::AuthError::InvalidCredentials.to_string());

    let user = state
        .store
        .get_user_by_email(payload.email.trim())
        .map_err(storage_error)?
        .ok_or_else(invalid)?;

    if !verify_password(&payload.password, &user.password_hash) {
        return Err(invalid());
    }

    let token = generate_token(user.id, &state.jwt_secret)
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(AuthResponse {
        token,
        user: user.into(),
    }))
}

/// The authenticated user's own profile
async fn me(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<UserResponse>, ApiError> {
    let user = state
        .store
        .get_user(user_id)
        .map_err(storage_error)?
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, "user no longer exists"))?;
    Ok(Json(user.into()))
}

/// Check whether a username is still free
async fn check_username(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let available = state
        .store
        .username_available(&username)
        .map_err(storage_error)?;
    Ok(Json(serde_json::json!({ "available": available })))
}

async fn update_username(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<UpdateUsernameRequest>,
) -> Result<StatusCode, ApiError> {
    let username = payload.username.trim();
    if username.is_empty() {
        return Err(error_body(
            StatusCode::BAD_REQUEST,
            "username must not be empty",
        ));
    }
    if !state.store.username_available(username).map_err(storage_error)? {
        return Err(error_body(StatusCode::BAD_REQUEST, "username is taken"));
    }

    state
        .store
        .update_username(user_id, username)
        .map_err(storage_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_password(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<UpdatePasswordRequest>,
) -> Result<StatusCode, ApiError> {
    if payload.new_password.len() < 6 {
        return Err(error_body(
            StatusCode::BAD_REQUEST,
            "password must be at least 6 characters",
        ));
    }

    let user = state
        .store
        .get_user(user_id)
        .map_err(storage_error)?
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, "user no longer exists"))?;

    if !verify_password(&payload.current_password, &user.password_hash) {
        return Err(error_body(
            StatusCode::UNAUTHORIZED,
            "current password is wrong",
        ));
    }

    state
        .store
        .update_password(user_id, &hash_password(&payload.new_password))
        .map_err(storage_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// BOOK HANDLERS
// ============================================================================

/// List books the caller holds any role on
async fn list_books(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<ListBooksQuery>,
) -> Result<Json<Vec<BookResponse>>, ApiError> {
    let books = state
        .store
        .list_books_for(user_id, query.archived)
        .map_err(storage_error)?;
    Ok(Json(
        books
            .into_iter()
            .map(|(book, role)| BookResponse::new(book, role))
            .collect(),
    ))
}

/// Create a book; the creator becomes its admin in the same transaction
async fn create_book(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<CreateBookRequest>,
) -> Result<Json<BookResponse>, ApiError> {
    let title = payload.title.trim();
    if title.is_empty() {
        return Err(error_body(StatusCode::BAD_REQUEST, "title must not be empty"));
    }

    let book = state
        .store
        .create_book(
            user_id,
            title,
            payload.description.trim(),
            payload.page_size,
            payload.orientation,
        )
        .map_err(storage_error)?;

    info!(book_id = book.id, owner = user_id, "book created");
    Ok(Json(BookResponse::new(book, Role::Admin)))
}

async fn get_book(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(book_id): Path<BookId>,
) -> Result<Json<BookResponse>, ApiError> {
    let role = state
        .gate
        .authorize(book_id, user_id, Role::Viewer)
        .map_err(editor_error)?;
    let book = state
        .store
        .get_book(book_id)
        .map_err(storage_error)?
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, format!("book {}", book_id)))?;
    Ok(Json(BookResponse::new(book, role)))
}

/// Archive or unarchive a book
async fn update_book(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(book_id): Path<BookId>,
    Json(payload): Json<UpdateBookRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .gate
        .authorize(book_id, user_id, Role::Admin)
        .map_err(editor_error)?;
    state
        .store
        .set_archived(book_id, payload.archived)
        .map_err(storage_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_book_settings(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(book_id): Path<BookId>,
    Json(payload): Json<UpdateSettingsRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .gate
        .authorize(book_id, user_id, Role::Admin)
        .map_err(editor_error)?;

    let title = payload.title.trim();
    if title.is_empty() {
        return Err(error_body(StatusCode::BAD_REQUEST, "title must not be empty"));
    }

    state
        .store
        .update_settings(
            book_id,
            title,
            payload.description.trim(),
            payload.page_size,
            payload.orientation,
        )
        .map_err(storage_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_book(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(book_id): Path<BookId>,
) -> Result<StatusCode, ApiError> {
    state
        .gate
        .authorize(book_id, user_id, Role::Admin)
        .map_err(editor_error)?;
    state.store.delete_book(book_id).map_err(storage_error)?;

    info!(book_id, "book deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Grant or change a user's role on a book. Upserts: at most one role per
/// (book, user) pair exists afterwards.
async fn grant_permission(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path((book_id, target_id)): Path<(BookId, UserId)>,
    Json(payload): Json<GrantPermissionRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .gate
        .authorize(book_id, user_id, Role::Admin)
        .map_err(editor_error)?;

    if state.store.get_user(target_id).map_err(storage_error)?.is_none() {
        return Err(error_body(
            StatusCode::NOT_FOUND,
            format!("user {}", target_id),
        ));
    }

    state
        .store
        .grant_role(book_id, target_id, payload.role)
        .map_err(storage_error)?;

    info!(book_id, target_id, role = ?payload.role, "permission granted");
    Ok(StatusCode::NO_CONTENT)
}

/// Persisted pages of a book, as last saved
async fn list_pages(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(book_id): Path<BookId>,
) -> Result<Json<Vec<PageResponse>>, ApiError> {
    state
        .gate
        .authorize(book_id, user_id, Role::Viewer)
        .map_err(editor_error)?;

    let pages = state.store.load_pages(book_id).map_err(storage_error)?;
    Ok(Json(
        pages
            .into_iter()
            .map(|record| PageResponse {
                page_number: record.page_number,
                content: record
                    .content
                    .as_deref()
                    .and_then(PageContent::from_blob)
                    .map(PageContent::into_value)
                    .unwrap_or(serde_json::Value::Null),
                updated_at: record.updated_at,
            })
            .collect(),
    ))
}

// ============================================================================
// SESSION HANDLERS
// ============================================================================

/// Open an editing session over the book's current persisted pages
async fn open_session(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(book_id): Path<BookId>,
) -> Result<Json<OpenSessionResponse>, ApiError> {
    state
        .gate
        .authorize(book_id, user_id, Role::Editor)
        .map_err(editor_error)?;

    if state.store.get_book(book_id).map_err(storage_error)?.is_none() {
        return Err(error_body(StatusCode::NOT_FOUND, format!("book {}", book_id)));
    }

    let snapshot: Vec<(u32, Option<PageContent>)> = state
        .store
        .load_pages(book_id)
        .map_err(storage_error)?
        .into_iter()
        .map(|record| {
            let content = record.content.as_deref().and_then(PageContent::from_blob);
            (record.page_number, content)
        })
        .collect();

    let session_id = state.sessions.open(book_id, user_id, snapshot);
    let session = state
        .sessions
        .get(session_id, user_id)
        .map_err(editor_error)?;
    let session = session.lock();

    Ok(Json(OpenSessionResponse {
        session_id,
        current_page: session.current_page,
        pages: session.page_list(),
    }))
}

/// Visible working numbers of a session
async fn session_pages(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionPagesResponse>, ApiError> {
    let session = state
        .sessions
        .get(session_id, user_id)
        .map_err(editor_error)?;
    let session = session.lock();
    Ok(Json(SessionPagesResponse {
        current_page: session.current_page,
        pages: session.page_list(),
    }))
}

/// Content a working number currently shows, pending edits included
async fn session_page_content(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path((session_id, number)): Path<(Uuid, u32)>,
) -> Result<Json<SessionPageContentResponse>, ApiError> {
    let session = state
        .sessions
        .get(session_id, user_id)
        .map_err(editor_error)?;
    let session = session.lock();
    Ok(Json(SessionPageContentResponse {
        page_number: number,
        content: session
            .resolve(number)
            .map(PageContent::into_value)
            .unwrap_or(serde_json::Value::Null),
    }))
}

/// Record the canvas state of a page in the session overlay
async fn session_record_page(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path((session_id, number)): Path<(Uuid, u32)>,
    Json(payload): Json<RecordPageRequest>,
) -> Result<StatusCode, ApiError> {
    let session = state
        .sessions
        .get(session_id, user_id)
        .map_err(editor_error)?;
    let mut session = session.lock();
    state
        .gate
        .authorize(session.book_id, user_id, Role::Editor)
        .map_err(editor_error)?;

    session
        .record(number, PageContent::from_value(payload.content))
        .map_err(editor_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Append a blank page after the highest working number
async fn session_add_page(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(session_id): Path<Uuid>,
) -> Result<Json<AddPageResponse>, ApiError> {
    let session = state
        .sessions
        .get(session_id, user_id)
        .map_err(editor_error)?;
    let mut session = session.lock();
    state
        .gate
        .authorize(session.book_id, user_id, Role::Editor)
        .map_err(editor_error)?;

    let page_number = session.add_page().map_err(editor_error)?;
    Ok(Json(AddPageResponse { page_number }))
}

/// Remove a page from the session's view of the book
async fn session_delete_page(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path((session_id, number)): Path<(Uuid, u32)>,
) -> Result<StatusCode, ApiError> {
    let session = state
        .sessions
        .get(session_id, user_id)
        .map_err(editor_error)?;
    let mut session = session.lock();
    state
        .gate
        .authorize(session.book_id, user_id, Role::Editor)
        .map_err(editor_error)?;

    session.delete_page(number).map_err(editor_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run the save protocol with the caller's live canvas content. Other
/// subscribers of the book's room are notified afterwards; the notification
/// is advisory and its loss is harmless.
async fn session_save(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<SaveRequest>,
) -> Result<Json<SaveResponse>, ApiError> {
    let session = state
        .sessions
        .get(session_id, user_id)
        .map_err(editor_error)?;
    let mut session = session.lock();
    state
        .gate
        .authorize(session.book_id, user_id, Role::Editor)
        .map_err(editor_error)?;

    let live_content = PageContent::from_value(payload.content.clone());
    let outcome = session
        .save(&state.store, payload.current_page, live_content)
        .map_err(editor_error)?;

    state.relay.broadcast(
        session_id,
        CanvasUpdate {
            book_id: session.book_id,
            page_number: outcome.current_page,
            content: payload.content,
        },
    );

    Ok(Json(SaveResponse {
        current_page: outcome.current_page,
        page_count: outcome.page_count,
    }))
}

/// Close a session, discarding pending edits
async fn close_session(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    // Ownership check before removal
    state
        .sessions
        .get(session_id, user_id)
        .map_err(editor_error)?;
    state.sessions.close(session_id);
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

#[derive(Debug, Deserialize)]
struct WsParams {
    token: String,
}

/// Messages clients send over the book's room socket
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ClientEvent {
    CanvasChange {
        page_number: u32,
        content: serde_json::Value,
    },
}

/// Messages the server fans out to room subscribers
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ServerEvent {
    CanvasUpdate {
        book_id: BookId,
        page_number: u32,
        content: serde_json::Value,
    },
}

/// WebSocket upgrade handler. Browsers cannot set headers on the upgrade
/// request, so the token travels as a query parameter.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(book_id): Path<BookId>,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = auth::verify_token(&params.token, &state.jwt_secret)
        .map_err(|_| error_body(StatusCode::UNAUTHORIZED, "Invalid token"))?;
    state
        .gate
        .authorize(book_id, user_id, Role::Viewer)
        .map_err(editor_error)?;

    info!(book_id, user_id, "WebSocket upgrade for book room");
    Ok(ws.on_upgrade(move |socket| handle_websocket(socket, book_id, user_id, state)))
}

/// Handle one room subscriber's connection
async fn handle_websocket(socket: WebSocket, book_id: BookId, user_id: UserId, state: Arc<AppState>) {
    let client_id = Uuid::new_v4();
    let mut updates = state.relay.subscribe(book_id, client_id);
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task to forward room broadcasts to this client
    let send_task = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            let event = ServerEvent::CanvasUpdate {
                book_id: update.book_id,
                page_number: update.page_number,
                content: update.content,
            };
            match serde_json::to_string(&event) {
                Ok(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode canvas update: {}", e);
                }
            }
        }
        debug!(%client_id, "send task ended");
    });

    // Task to relay this client's canvas changes into the room
    let recv_state = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(ClientEvent::CanvasChange {
                        page_number,
                        content,
                    }) => {
                        // Viewers may listen but not broadcast
                        if recv_state
                            .gate
                            .authorize(book_id, user_id, Role::Editor)
                            .is_err()
                        {
                            debug!(book_id, user_id, "dropping canvas change from viewer");
                            continue;
                        }
                        recv_state.relay.broadcast(
                            client_id,
                            CanvasUpdate {
                                book_id,
                                page_number,
                                content,
                            },
                        );
                    }
                    Err(e) => {
                        debug!("Ignoring unparseable room message: {}", e);
                    }
                },
                Message::Close(_) => {
                    info!(%client_id, "WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
        debug!(%client_id, "receive task ended");
    });

    // Wait for either task to complete
    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.relay.unsubscribe(book_id, client_id);
    info!(book_id, %client_id, "client disconnected from book room");
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "friendbook_server=info,tower_http=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
        warn!("JWT_SECRET not set - using a development secret");
        "development-secret-change-me".to_string()
    });

    // Initialize storage
    let storage_path =
        std::env::var("STORAGE_PATH").unwrap_or_else(|_| "./data/friendbook.sled".to_string());

    info!("Initializing storage at: {}", storage_path);

    let store =
        BookStore::open(StorageConfig::new(&storage_path)).context("Failed to open storage")?;

    info!("Storage initialized successfully");

    // Create application state
    let state = Arc::new(AppState::new(store, jwt_secret));

    // Start background tasks
    let _cleanup_handle = state
        .sessions
        .clone()
        .start_cleanup_task(Duration::from_secs(60));

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health_check))
        // Accounts
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/api/me", get(me))
        .route("/api/users/check-username/:username", get(check_username))
        .route("/api/me/username", put(update_username))
        .route("/api/me/password", put(update_password))
        // Books
        .route("/api/books", get(list_books).post(create_book))
        .route(
            "/api/books/:book_id",
            get(get_book).put(update_book).delete(delete_book),
        )
        .route("/api/books/:book_id/settings", put(update_book_settings))
        .route(
            "/api/books/:book_id/permissions/:user_id",
            put(grant_permission),
        )
        .route("/api/books/:book_id/pages", get(list_pages))
        // Editing sessions
        .route("/api/books/:book_id/edit", post(open_session))
        .route("/api/sessions/:session_id", delete(close_session))
        .route(
            "/api/sessions/:session_id/pages",
            get(session_pages).post(session_add_page),
        )
        .route(
            "/api/sessions/:session_id/pages/:number",
            get(session_page_content)
                .put(session_record_page)
                .delete(session_delete_page),
        )
        .route("/api/sessions/:session_id/save", post(session_save))
        // WebSocket endpoint
        .route("/ws/:book_id", get(ws_handler))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("Friendbook server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws/:book_id", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
