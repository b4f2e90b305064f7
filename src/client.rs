// SPDX-FileCopyrightText: 2025 notesync contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client-side reconciliation: the three-buffer state machine, and a
//! websocket driver that runs it against a live server.
//!
//! The state machine tracks three views of the document:
//!
//! - `synchronized_content` -- the last state confirmed by the server,
//!   always equal to the server's content at `latest_hash`,
//! - `in_flight_ops` -- the operation list the server is currently
//!   processing, if any,
//! - `pending_ops` -- edits made while waiting for that ack, authored
//!   against the predicted in-flight result.
//!
//! Local edits are diffed against the prediction, never against raw server
//! state, so typing is never clobbered while a sync is on the wire.

use crate::config;
use crate::diff::diff;
use crate::ot::{apply, transform, OtError};
use crate::protocol::{ClientMessage, NoteInfo, ServerMessage};
use crate::types::{coalesce, ops_from_diff, Operation};
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct ClientState {
    latest_hash: String,
    synchronized_content: String,
    in_flight_ops: Option<Vec<Operation>>,
    pending_ops: Option<Vec<Operation>>,
}

impl ClientState {
    #[must_use]
    pub fn new(latest_hash: String, synchronized_content: String) -> Self {
        Self {
            latest_hash,
            synchronized_content,
            in_flight_ops: None,
            pending_ops: None,
        }
    }

    pub fn latest_hash(&self) -> &str {
        &self.latest_hash
    }

    pub fn synchronized_content(&self) -> &str {
        &self.synchronized_content
    }

    pub fn is_settled(&self) -> bool {
        self.in_flight_ops.is_none() && self.pending_ops.is_none()
    }

    /// The text the editor should display: synchronized state with both
    /// local buffers replayed on top.
    pub fn rendered(&self) -> Result<String, OtError> {
        let mut text = self.synchronized_content.clone();
        if let Some(ops) = &self.in_flight_ops {
            text = apply(&text, ops)?;
        }
        if let Some(ops) = &self.pending_ops {
            text = apply(&text, ops)?;
        }
        Ok(text)
    }

    /// Records the editor's current text after a quiet period. Returns the
    /// sync to send, or `None` if nothing changed or a sync is already in
    /// flight (the edit is queued as pending).
    pub fn local_edit(&mut self, editor_text: &str) -> Result<Option<ClientMessage>, OtError> {
        let predicted = self.rendered()?;
        let ops = coalesce(ops_from_diff(&diff(&predicted, editor_text)));
        if ops.is_empty() {
            return Ok(None);
        }
        if self.in_flight_ops.is_none() {
            self.in_flight_ops = Some(ops.clone());
            Ok(Some(ClientMessage::Sync {
                base_hash: self.latest_hash.clone(),
                operations: ops,
            }))
        } else {
            self.pending_ops.get_or_insert_with(Vec::new).extend(ops);
            Ok(None)
        }
    }

    /// The server accepted the in-flight sync. Promotes the in-flight ops
    /// into the synchronized state; if edits queued up meanwhile, they
    /// become the next in-flight sync, which is returned for sending.
    pub fn handle_ack(&mut self, new_hash: &str) -> Result<Option<ClientMessage>, OtError> {
        if let Some(ops) = self.in_flight_ops.take() {
            self.synchronized_content = apply(&self.synchronized_content, &ops)?;
        }
        self.latest_hash = new_hash.to_string();

        match self.pending_ops.take() {
            Some(pending) if !pending.is_empty() => {
                self.in_flight_ops = Some(pending.clone());
                Ok(Some(ClientMessage::Sync {
                    base_hash: self.latest_hash.clone(),
                    operations: pending,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Another client's commit reached us. The server's operations advance
    /// the synchronized state; both local buffers are rebased over them so
    /// unconfirmed typing survives.
    pub fn handle_update(
        &mut self,
        latest_hash: &str,
        operations: &[Operation],
    ) -> Result<(), OtError> {
        self.synchronized_content = apply(&self.synchronized_content, operations)?;
        if let Some(in_flight) = &self.in_flight_ops {
            self.in_flight_ops = Some(transform(in_flight, operations)?);
        }
        if let Some(pending) = &self.pending_ops {
            self.pending_ops = Some(transform(pending, operations)?);
        }
        self.latest_hash = latest_hash.to_string();
        Ok(())
    }
}

/// Best-effort cursor carry-over: a raw character offset, shifted by the
/// operations just applied to the text around it.
#[must_use]
pub fn transform_cursor(cursor: usize, ops: &[Operation]) -> usize {
    let mut cursor = cursor as i64;
    for op in ops {
        match op {
            Operation::Retain { .. } => {}
            Operation::Insert { position, text } => {
                if (*position as i64) <= cursor {
                    cursor += text.chars().count() as i64;
                }
            }
            Operation::Delete { position, length } => {
                if (*position as i64) < cursor {
                    cursor -= (*length).min((cursor - *position as i64) as usize) as i64;
                }
            }
        }
    }
    cursor.max(0) as usize
}

/// Follows a note on a running server, printing the document every time it
/// changes. Reconnects with a fixed backoff and refetches the initial state
/// after any disruption, like the editor client does.
pub async fn watch(base_url: &str, note_id: &str) -> Result<()> {
    let (_edits_tx, edits_rx) = mpsc::channel(1);
    let (renders_tx, mut renders_rx) = mpsc::channel(64);

    tokio::spawn(async move {
        while let Some(text) = renders_rx.recv().await {
            println!("{}", "-".repeat(60));
            println!("{text}");
        }
    });

    run_session(base_url, note_id, edits_rx, renders_tx).await
}

/// Drives a [`ClientState`] against a server. `edits` feeds editor
/// snapshots in (debounced here), `renders` receives the text to display
/// after every change.
pub async fn run_session(
    base_url: &str,
    note_id: &str,
    mut edits: mpsc::Receiver<String>,
    renders: mpsc::Sender<String>,
) -> Result<()> {
    loop {
        let info = fetch_note_info(base_url, note_id).await?;
        let latest_hash = info
            .latest_hash
            .context("Server returned a note without history")?;
        let mut state = ClientState::new(latest_hash, info.latest_content.unwrap_or_default());
        let _ = renders.send(state.rendered()?).await;

        let url = websocket_url(base_url, note_id);
        info!("Connecting to {url}");
        let (mut socket, _) = match connect_async(&url).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Connection failed: {e}; retrying");
                sleep(config::RECONNECT_BACKOFF).await;
                continue;
            }
        };

        // Debounce bookkeeping: the newest unsent editor text and when the
        // quiet period expires.
        let mut unsent_text: Option<String> = None;
        let mut deadline: Option<Instant> = None;

        // `true` means the transport dropped and the fixed backoff applies;
        // a conflict-style reset reloads immediately instead.
        let backoff = loop {
            tokio::select! {
                frame = socket.next() => {
                    let Some(Ok(frame)) = frame else {
                        warn!("Connection closed; reconnecting");
                        break true;
                    };
                    let Message::Text(text) = frame else {
                        continue;
                    };
                    let Ok(message) = serde_json::from_str::<ServerMessage>(&text) else {
                        debug!("Ignoring unparseable frame: {text}");
                        continue;
                    };
                    match handle_server_message(&mut state, message, &mut socket, &renders).await {
                        Ok(true) => {}
                        Ok(false) => break false,
                        Err(_) => break true,
                    }
                }
                edit = edits.recv() => {
                    let Some(text) = edit else {
                        // Editor side hung up; keep following the note.
                        continue;
                    };
                    unsent_text = Some(text);
                    deadline = Some(Instant::now() + config::DEBOUNCE);
                }
                () = async { sleep_until(deadline.unwrap_or_else(Instant::now)).await },
                        if deadline.is_some() => {
                    deadline = None;
                    if let Some(text) = unsent_text.take() {
                        match state.local_edit(&text) {
                            Ok(Some(message)) => {
                                if send_message(&mut socket, &message).await.is_err() {
                                    warn!("Failed to send sync; reconnecting");
                                    break true;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!("Local edit failed to apply: {e}; reloading");
                                break false;
                            }
                        }
                    }
                }
            }
        };

        if backoff {
            sleep(config::RECONNECT_BACKOFF).await;
        }
    }
}

/// Returns `Ok(false)` when the session has to be reset (conflict or
/// server-reported error).
async fn handle_server_message<S>(
    state: &mut ClientState,
    message: ServerMessage,
    socket: &mut S,
    renders: &mpsc::Sender<String>,
) -> Result<bool>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    match message {
        ServerMessage::Ack { new_hash } => {
            debug!("Acknowledged as {new_hash}");
            if let Some(follow_up) = state.handle_ack(&new_hash)? {
                send_message(socket, &follow_up).await?;
            }
        }
        ServerMessage::Update {
            latest_hash,
            operations,
        } => {
            state.handle_update(&latest_hash, &operations)?;
            let _ = renders.send(state.rendered()?).await;
        }
        ServerMessage::Conflict { message } => {
            warn!("Server reported a conflict: {message}; discarding local state");
            return Ok(false);
        }
        ServerMessage::Error { message } => {
            warn!("Server reported an error: {message}; reloading");
            return Ok(false);
        }
        ServerMessage::UserCountUpdate { count } => {
            info!("{count} users connected");
        }
    }
    Ok(true)
}

async fn send_message<S>(socket: &mut S, message: &ClientMessage) -> Result<()>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let payload = serde_json::to_string(message).context("Failed to serialize sync message")?;
    socket
        .send(Message::Text(payload))
        .await
        .context("Failed to send sync message")
}

async fn fetch_note_info(base_url: &str, note_id: &str) -> Result<NoteInfo> {
    let url = format!("{base_url}/api/note/{note_id}");
    reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to fetch {url}"))?
        .json()
        .await
        .context("Failed to parse note info")
}

fn websocket_url(base_url: &str, note_id: &str) -> String {
    let ws_base = base_url.replacen("http", "ws", 1);
    format!("{ws_base}/ws/note/{note_id}")
}
