// SPDX-FileCopyrightText: 2025 notesync contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::types::Operation;
use serde::{Deserialize, Serialize};

/// Messages a client sends over the websocket. Everything else arriving on
/// the socket is dropped without a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Sync {
        base_hash: String,
        operations: Vec<Operation>,
    },
}

/// Messages the server sends to clients. All frames are JSON with the shape
/// `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Ack {
        new_hash: String,
    },
    Update {
        latest_hash: String,
        operations: Vec<Operation>,
    },
    Conflict {
        message: String,
    },
    Error {
        message: String,
    },
    UserCountUpdate {
        count: usize,
    },
}

/// Response body of `GET /api/note/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteInfo {
    pub status: String,
    pub latest_hash: Option<String>,
    pub latest_content: Option<String>,
}
