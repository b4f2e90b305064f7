// SPDX-FileCopyrightText: 2025 notesync contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP and websocket shell around the room actors.
//!
//! Two endpoints per note: `GET /api/note/{id}` for the initial state
//! (creating the room on first reference) and a websocket upgrade at
//! `/ws/note/{id}` for the sync protocol. Everything else is a 404, except
//! that OPTIONS preflights get a permissive CORS answer so a browser editor
//! served from anywhere can reach us.

use crate::config::Config;
use crate::protocol::{ClientMessage, NoteInfo, ServerMessage};
use crate::room::{ConnectionId, RoomHandle};
use crate::types::NoteId;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

type RoomRegistry = Arc<Mutex<HashMap<NoteId, RoomHandle>>>;

#[derive(Clone)]
pub struct AppState {
    rooms: RoomRegistry,
    note_filename: String,
    next_connection_id: Arc<AtomicU64>,
}

impl AppState {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            rooms: Arc::default(),
            note_filename: config.note_filename.clone(),
            next_connection_id: Arc::default(),
        }
    }

    /// Looks up the room for `note_id`, spawning it (with its initial empty
    /// commit) on first reference.
    fn room_for(&self, note_id: &NoteId) -> RoomHandle {
        let mut rooms = self.rooms.lock().expect("room registry lock poisoned");
        if let Some(handle) = rooms.get(note_id) {
            return handle.clone();
        }
        debug!("Creating room for note {note_id}");
        let registry = Arc::clone(&self.rooms);
        let id_for_cleanup = note_id.clone();
        let handle = RoomHandle::spawn(note_id.clone(), &self.note_filename, move |closing| {
            let mut rooms = registry.lock().expect("room registry lock poisoned");
            // Only evict if the entry still points at the closing room; a
            // replacement may have been spawned in the meantime.
            if rooms
                .get(&id_for_cleanup)
                .is_some_and(|current| current.same_channel(&closing))
            {
                rooms.remove(&id_for_cleanup);
            }
        });
        rooms.insert(note_id.clone(), handle.clone());
        handle
    }

    fn evict_if_same(&self, note_id: &NoteId, stale: &RoomHandle) {
        let mut rooms = self.rooms.lock().expect("room registry lock poisoned");
        if rooms
            .get(note_id)
            .is_some_and(|current| current.same_channel(stale))
        {
            rooms.remove(note_id);
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/note/{id}", get(note_info).options(preflight))
        .route("/ws/note/{id}", get(note_ws))
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: Config) -> Result<()> {
    let state = AppState::new(&config);
    let app = router(state);

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server failed")
}

async fn shutdown_signal() {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Should have been able to create terminate signal stream");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            debug!("Got SIGINT (Ctrl+C), shutting down");
        }
        _ = terminate.recv() => {
            debug!("Got SIGTERM, shutting down");
        }
    }
}

async fn note_info(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let note_id = NoteId(id);
    loop {
        let room = state.room_for(&note_id);
        match room.snapshot().await {
            Ok((hash, content)) => {
                let body = NoteInfo {
                    status: "success".to_string(),
                    latest_hash: Some(hash),
                    latest_content: Some(content),
                };
                let mut response = Json(body).into_response();
                response.headers_mut().insert(
                    header::ACCESS_CONTROL_ALLOW_ORIGIN,
                    HeaderValue::from_static("*"),
                );
                return response;
            }
            Err(()) => {
                // The room wound down between lookup and request.
                state.evict_if_same(&note_id, &room);
            }
        }
    }
}

async fn note_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, NoteId(id), socket))
}

async fn handle_socket(state: AppState, note_id: NoteId, socket: WebSocket) {
    let connection_id: ConnectionId = state.next_connection_id.fetch_add(1, Ordering::Relaxed);

    // The room talks to this connection through a buffered channel into a
    // dedicated writer task, so one slow socket never stalls the room loop.
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<ServerMessage>(256);
    let room = loop {
        let room = state.room_for(&note_id);
        if room.join(connection_id, outbox_tx.clone()).await.is_ok() {
            break room;
        }
        state.evict_if_same(&note_id, &room);
    };
    info!("Client {connection_id} connected to note {note_id}");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            let payload =
                serde_json::to_string(&message).expect("Server messages always serialize");
            if ws_tx.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = ws_rx.next().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Sync {
                base_hash,
                operations,
            }) => {
                room.sync(connection_id, base_hash, operations).await;
            }
            Err(e) => {
                // Anything that isn't a well-formed sync is dropped without
                // a reply.
                warn!("Client {connection_id} sent an unusable frame: {e}");
            }
        }
    }

    info!("Client {connection_id} disconnected from note {note_id}");
    room.leave(connection_id).await;
    writer.abort();
}

async fn preflight() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, GET, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

async fn fallback(method: Method) -> Response {
    if method == Method::OPTIONS {
        preflight().await
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}
