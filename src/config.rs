// SPDX-FileCopyrightText: 2025 notesync contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Runtime knobs for the server and the client driver.

use std::time::Duration;

/// Filename used for the single entry in every tree object. Part of the
/// hashing contract: changing it changes every tree hash.
pub const NOTE_FILENAME: &str = "note.txt";

/// Quiet time before a client turns accumulated typing into a sync.
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// Fixed delay before a disconnected client dials again.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP/websocket listener binds to.
    pub bind: String,
    pub note_filename: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            note_filename: NOTE_FILENAME.to_string(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_bind(bind: Option<String>) -> Self {
        Self {
            bind: bind.unwrap_or_else(|| DEFAULT_BIND.to_string()),
            ..Self::default()
        }
    }
}
