// SPDX-FileCopyrightText: 2025 notesync contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::diff::DiffEntry;
use derive_more::{AsRef, Deref, Display};
use serde::{Deserialize, Serialize};

/// Key naming one shared note; doubles as the room id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Deref, AsRef, Serialize, Deserialize)]
pub struct NoteId(pub String);

/// A single edit step, anchored at a position in the document state it was
/// authored against (its base). An operation list as a whole is a plan for
/// turning that base into a target text.
///
/// Wire encoding is `{"type": "retain"|"insert"|"delete", "position": n,
/// "length"?: n, "text"?: s}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    /// Keep `length` characters starting at `position`.
    Retain { position: usize, length: usize },
    /// Insert `text` at `position`, consuming no base characters.
    Insert { position: usize, text: String },
    /// Drop `length` characters starting at `position`.
    Delete { position: usize, length: usize },
}

impl Operation {
    pub fn position(&self) -> usize {
        match self {
            Self::Retain { position, .. }
            | Self::Insert { position, .. }
            | Self::Delete { position, .. } => *position,
        }
    }

    /// The length change this operation causes, `|new| - |old|`.
    pub fn len_delta(&self) -> i64 {
        match self {
            Self::Retain { .. } => 0,
            Self::Insert { text, .. } => text.chars().count() as i64,
            Self::Delete { length, .. } => -(*length as i64),
        }
    }

    /// The same operation re-anchored `offset` characters to the right.
    pub(crate) fn shifted(&self, offset: i64) -> Self {
        let mut op = self.clone();
        let position = match &mut op {
            Self::Retain { position, .. }
            | Self::Insert { position, .. }
            | Self::Delete { position, .. } => position,
        };
        *position = (*position as i64 + offset) as usize;
        op
    }
}

/// Lowers a character diff into operations against the diff's left input.
///
/// The cursor tracks positions in the source: unchanged and removed
/// characters consume one source position each, insertions do not.
pub fn ops_from_diff(entries: &[DiffEntry]) -> Vec<Operation> {
    let mut ops = vec![];
    let mut position = 0;
    for entry in entries {
        match entry {
            DiffEntry::Unchanged(_) => {
                ops.push(Operation::Retain {
                    position,
                    length: 1,
                });
                position += 1;
            }
            DiffEntry::Removed(_) => {
                ops.push(Operation::Delete {
                    position,
                    length: 1,
                });
                position += 1;
            }
            DiffEntry::Added(c) => {
                ops.push(Operation::Insert {
                    position,
                    text: c.to_string(),
                });
            }
        }
    }
    ops
}

/// Merges runs of same-kind operations for transport.
///
/// Equivalent under apply to the single-character form it was built from.
/// The merge path never sees coalesced operations (it rediffs), so this is
/// purely a framing concern.
pub fn coalesce(ops: Vec<Operation>) -> Vec<Operation> {
    let mut result: Vec<Operation> = vec![];
    for op in ops {
        if let Some(last) = result.last_mut() {
            match (last, &op) {
                (
                    Operation::Retain { position, length },
                    Operation::Retain {
                        position: next,
                        length: next_length,
                    },
                ) if *position + *length == *next => {
                    *length += *next_length;
                    continue;
                }
                (
                    Operation::Delete { position, length },
                    Operation::Delete {
                        position: next,
                        length: next_length,
                    },
                ) if *position + *length == *next => {
                    *length += *next_length;
                    continue;
                }
                (
                    Operation::Insert { position, text },
                    Operation::Insert {
                        position: next,
                        text: next_text,
                    },
                ) if *position == *next => {
                    text.push_str(next_text);
                    continue;
                }
                _ => {}
            }
        }
        result.push(op);
    }
    result
}

pub mod factories {
    use super::Operation;

    pub fn retain(position: usize, length: usize) -> Operation {
        Operation::Retain { position, length }
    }

    pub fn insert(position: usize, text: &str) -> Operation {
        Operation::Insert {
            position,
            text: text.to_string(),
        }
    }

    pub fn delete(position: usize, length: usize) -> Operation {
        Operation::Delete { position, length }
    }
}
