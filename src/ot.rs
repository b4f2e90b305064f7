// SPDX-FileCopyrightText: 2025 notesync contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Applying operation lists to text, and rebasing one list over another.
//!
//! `transform` here is an intentionally simplified OT. It is only correct
//! for the operation shape the diff lowering produces: single-character
//! ops, or coalesced runs that never overlap at equal positions. The merge
//! protocol guarantees that shape by rediffing before it transforms, and
//! treats any error from this module as a conflict rather than trying to
//! recover.

use crate::types::Operation;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OtError {
    #[error("insert position {position} is out of bounds for content of length {len}")]
    InsertOutOfBounds { position: usize, len: usize },
    #[error("delete of {length} at position {position} is out of bounds for content of length {len}")]
    DeleteOutOfBounds {
        position: usize,
        length: usize,
        len: usize,
    },
    #[error("transform shifted position {position} below zero (offset {offset})")]
    NegativePosition { position: usize, offset: i64 },
}

/// Executes `ops` against `content`.
///
/// Operations are applied in position order, with a running offset for the
/// length changes earlier operations have already caused. Retains are
/// documentary and have no effect; in particular a retain crossing the end
/// of the content is accepted.
pub fn apply(content: &str, ops: &[Operation]) -> Result<String, OtError> {
    let mut chars: Vec<char> = content.chars().collect();

    let mut sorted: Vec<&Operation> = ops.iter().collect();
    sorted.sort_by_key(|op| op.position());

    let mut offset: i64 = 0;
    for op in sorted {
        match op {
            Operation::Retain { .. } => {}
            Operation::Insert { position, text } => {
                let at = *position as i64 + offset;
                if at < 0 || at as usize > chars.len() {
                    return Err(OtError::InsertOutOfBounds {
                        position: *position,
                        len: chars.len(),
                    });
                }
                let at = at as usize;
                chars.splice(at..at, text.chars());
                offset += text.chars().count() as i64;
            }
            Operation::Delete { position, length } => {
                let start = *position as i64 + offset;
                if start < 0 || start as usize + length > chars.len() {
                    return Err(OtError::DeleteOutOfBounds {
                        position: *position,
                        length: *length,
                        len: chars.len(),
                    });
                }
                let start = start as usize;
                chars.drain(start..start + length);
                offset -= *length as i64;
            }
        }
    }

    Ok(chars.into_iter().collect())
}

/// Rebases `client_ops` over `server_ops`.
///
/// The result is meant to be applied to `apply(base, server_ops)`, so that
/// the combined effect carries the client's intent with conflicts resolved
/// server-wins:
///
/// - inserts at the same position anchor the server's text first,
/// - identical deletes at the same position collapse into the server's.
///
/// Both lists must be ordered by base position, which is what the diff
/// lowering emits. Retains carry no effect and would pair up with effective
/// operations at equal positions, so both lists are reduced to their
/// effective operations before the walk; the rebased list consequently
/// contains no retains.
pub fn transform(
    client_ops: &[Operation],
    server_ops: &[Operation],
) -> Result<Vec<Operation>, OtError> {
    let client_ops: Vec<&Operation> = effective(client_ops).collect();
    let server_ops: Vec<&Operation> = effective(server_ops).collect();

    let mut rebased = vec![];
    let mut si = 0;
    let mut offset: i64 = 0;

    for client_op in client_ops {
        loop {
            let Some(server_op) = server_ops.get(si) else {
                rebased.push(shift(client_op, offset)?);
                break;
            };
            if client_op.position() < server_op.position() {
                rebased.push(shift(client_op, offset)?);
                break;
            }
            if client_op.position() > server_op.position() {
                // Everything the server did strictly to the left only moves
                // the remaining client positions.
                offset += server_op.len_delta();
                si += 1;
                continue;
            }
            // Equal positions: the server op is consumed here, so its length
            // effect folds into the offset for everything further right.
            match (client_op, server_op) {
                (Operation::Insert { .. }, Operation::Insert { .. }) => {
                    // Server wins the anchor; the client text lands after it.
                    offset += server_op.len_delta();
                    rebased.push(shift(client_op, offset)?);
                }
                (Operation::Delete { .. }, Operation::Delete { .. }) => {
                    // The server already removed this range; dropping the
                    // client op avoids deleting a neighbor twice.
                    offset += server_op.len_delta();
                }
                _ => {
                    rebased.push(shift(client_op, offset)?);
                    offset += server_op.len_delta();
                }
            }
            si += 1;
            break;
        }
    }

    Ok(rebased)
}

fn effective(ops: &[Operation]) -> impl Iterator<Item = &Operation> {
    ops.iter()
        .filter(|op| !matches!(op, Operation::Retain { .. }))
}

fn shift(op: &Operation, offset: i64) -> Result<Operation, OtError> {
    if op.position() as i64 + offset < 0 {
        return Err(OtError::NegativePosition {
            position: op.position(),
            offset,
        });
    }
    Ok(op.shifted(offset))
}
