// SPDX-FileCopyrightText: 2025 notesync contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-note actor owning the version history and the connected clients.
//!
//! All sync requests, joins and leaves for one note flow through a single
//! mpsc inbox and are handled one at a time, so merges never race on HEAD.
//! Rooms for different notes are independent tasks and proceed in parallel.

use crate::diff::diff;
use crate::history::VersionStore;
use crate::ot::{apply, transform, OtError};
use crate::protocol::ServerMessage;
use crate::types::{ops_from_diff, NoteId, Operation};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

const INITIAL_COMMIT_MESSAGE: &str = "Initial empty commit";

pub enum RoomMessage {
    Join {
        id: ConnectionId,
        sender: mpsc::Sender<ServerMessage>,
    },
    Leave {
        id: ConnectionId,
    },
    Sync {
        id: ConnectionId,
        base_hash: String,
        operations: Vec<Operation>,
    },
    Snapshot {
        response_tx: oneshot::Sender<(String, String)>,
    },
}

struct RoomActor {
    note_id: NoteId,
    inbox: mpsc::Receiver<RoomMessage>,
    history: VersionStore,
    connections: HashMap<ConnectionId, mpsc::Sender<ServerMessage>>,
}

impl RoomActor {
    fn new(note_id: NoteId, note_filename: &str, inbox: mpsc::Receiver<RoomMessage>) -> Self {
        let mut history = VersionStore::new(note_filename);
        history.commit("", INITIAL_COMMIT_MESSAGE);
        Self {
            note_id,
            inbox,
            history,
            connections: HashMap::new(),
        }
    }

    /// Runs until the last connection leaves (after at least one joined) or
    /// every handle to the room is gone.
    async fn run(&mut self) {
        let mut ever_joined = false;
        while let Some(message) = self.inbox.recv().await {
            match message {
                RoomMessage::Join { id, sender } => {
                    ever_joined = true;
                    self.connections.insert(id, sender);
                    info!(
                        "{}: client {id} joined ({} connected)",
                        self.note_id,
                        self.connections.len()
                    );
                    self.broadcast_user_count().await;
                }
                RoomMessage::Leave { id } => {
                    self.connections.remove(&id);
                    info!(
                        "{}: client {id} left ({} connected)",
                        self.note_id,
                        self.connections.len()
                    );
                    if ever_joined && self.connections.is_empty() {
                        break;
                    }
                    self.broadcast_user_count().await;
                }
                RoomMessage::Sync {
                    id,
                    base_hash,
                    operations,
                } => {
                    self.handle_sync(id, &base_hash, &operations).await;
                }
                RoomMessage::Snapshot { response_tx } => {
                    let head = self.head();
                    let content = self
                        .history
                        .content_at(&head)
                        .expect("HEAD must be resolvable");
                    // The requester may have hung up in the meantime.
                    let _ = response_tx.send((head, content));
                }
            }
        }
        info!("{}: room closed", self.note_id);
    }

    async fn handle_sync(&mut self, id: ConnectionId, base_hash: &str, operations: &[Operation]) {
        let Some(base_content) = self.history.content_at(base_hash) else {
            warn!("{}: client {id} sent unknown base hash {base_hash}", self.note_id);
            self.send_to(
                id,
                ServerMessage::Error {
                    message: "Base hash not found. Please reload.".to_string(),
                },
            )
            .await;
            return;
        };

        if base_hash == self.head() {
            self.fast_forward(id, &base_content, operations).await;
        } else {
            self.merge(id, &base_content, operations).await;
        }
    }

    /// The client's base is HEAD: its operations can be committed verbatim
    /// and rebroadcast unchanged, since every other client's synchronized
    /// state was the previous HEAD too.
    async fn fast_forward(&mut self, id: ConnectionId, base_content: &str, operations: &[Operation]) {
        let client_content = match apply(base_content, operations) {
            Ok(content) => content,
            Err(e) => {
                self.reply_conflict(id, &e).await;
                return;
            }
        };
        let new_hash = self.history.commit(&client_content, "Update from client");
        debug!("{}: fast-forward to {new_hash}", self.note_id);

        self.send_to(
            id,
            ServerMessage::Ack {
                new_hash: new_hash.clone(),
            },
        )
        .await;
        self.broadcast_except(
            id,
            &ServerMessage::Update {
                latest_hash: new_hash,
                operations: operations.to_vec(),
            },
        )
        .await;
    }

    /// Three-way merge: rebase the client's edit over what the server has
    /// accepted since the client's base, commit the result, and broadcast
    /// the delta from the previous server state (which is what the other
    /// clients are tracking, not the client's base).
    async fn merge(&mut self, id: ConnectionId, base_content: &str, operations: &[Operation]) {
        let server_content = self
            .history
            .content_at(self.head().as_str())
            .expect("HEAD must be resolvable");

        let (merged_content, broadcast_ops) =
            match merge_against(base_content, &server_content, operations) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.reply_conflict(id, &e).await;
                    return;
                }
            };

        let new_hash = self.history.commit(&merged_content, "Merged update from client");
        debug!("{}: merged to {new_hash}", self.note_id);

        self.send_to(
            id,
            ServerMessage::Ack {
                new_hash: new_hash.clone(),
            },
        )
        .await;
        if !broadcast_ops.is_empty() {
            self.broadcast_except(
                id,
                &ServerMessage::Update {
                    latest_hash: new_hash,
                    operations: broadcast_ops,
                },
            )
            .await;
        }
    }

    async fn reply_conflict(&mut self, id: ConnectionId, error: &OtError) {
        warn!("{}: merge for client {id} failed: {error}", self.note_id);
        self.send_to(
            id,
            ServerMessage::Conflict {
                message: error.to_string(),
            },
        )
        .await;
    }

    fn head(&self) -> String {
        self.history
            .head()
            .expect("room history always starts with an initial commit")
            .to_string()
    }

    async fn send_to(&mut self, id: ConnectionId, message: ServerMessage) {
        if let Some(sender) = self.connections.get(&id) {
            if sender.send(message).await.is_err() {
                // Writer task is gone; the Leave message will clean up.
                self.connections.remove(&id);
            }
        }
    }

    async fn broadcast_except(&mut self, excluded: ConnectionId, message: &ServerMessage) {
        let ids: Vec<ConnectionId> = self
            .connections
            .keys()
            .copied()
            .filter(|id| *id != excluded)
            .collect();
        for id in ids {
            self.send_to(id, message.clone()).await;
        }
    }

    async fn broadcast_user_count(&mut self) {
        let message = ServerMessage::UserCountUpdate {
            count: self.connections.len(),
        };
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.send_to(id, message.clone()).await;
        }
    }
}

/// The merge computation, separated from the actor for direct testing.
///
/// Both sides are re-derived as character diffs against the common base, so
/// coalesced client operations never reach `transform` in multi-character
/// form.
fn merge_against(
    base_content: &str,
    server_content: &str,
    operations: &[Operation],
) -> Result<(String, Vec<Operation>), OtError> {
    let client_content = apply(base_content, operations)?;
    let server_ops = ops_from_diff(&diff(base_content, server_content));
    let client_ops = ops_from_diff(&diff(base_content, &client_content));
    let rebased = transform(&client_ops, &server_ops)?;
    let merged_content = apply(server_content, &rebased)?;
    let broadcast_ops = ops_from_diff(&diff(server_content, &merged_content));
    Ok((merged_content, broadcast_ops))
}

/// Cloneable address of a room task.
#[derive(Clone)]
pub struct RoomHandle {
    tx: mpsc::Sender<RoomMessage>,
}

impl RoomHandle {
    /// Spawns the actor for a fresh room. `on_close` runs when the room
    /// winds down and receives this handle back, so the owner can drop its
    /// registry entry only if it still points at this very room.
    pub fn spawn(
        note_id: NoteId,
        note_filename: &str,
        on_close: impl FnOnce(Self) + Send + 'static,
    ) -> Self {
        let (tx, inbox) = mpsc::channel(64);
        let mut actor = RoomActor::new(note_id, note_filename, inbox);
        let handle = Self { tx };
        let closing = handle.clone();
        tokio::spawn(async move {
            actor.run().await;
            on_close(closing);
        });
        handle
    }

    /// Whether two handles address the same room task.
    pub fn same_channel(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// `Err` means the room already shut down; the caller should recreate it.
    pub async fn join(
        &self,
        id: ConnectionId,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Result<(), ()> {
        self.tx
            .send(RoomMessage::Join { id, sender })
            .await
            .map_err(|_| ())
    }

    pub async fn leave(&self, id: ConnectionId) {
        let _ = self.tx.send(RoomMessage::Leave { id }).await;
    }

    pub async fn sync(&self, id: ConnectionId, base_hash: String, operations: Vec<Operation>) {
        let _ = self
            .tx
            .send(RoomMessage::Sync {
                id,
                base_hash,
                operations,
            })
            .await;
    }

    /// Current `(HEAD, content)` of the room.
    pub async fn snapshot(&self) -> Result<(String, String), ()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(RoomMessage::Snapshot { response_tx })
            .await
            .map_err(|_| ())?;
        response_rx.await.map_err(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::factories::*;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    fn spawn_room() -> RoomHandle {
        RoomHandle::spawn(NoteId("test-note".to_string()), "note.txt", |_| {})
    }

    async fn join(room: &RoomHandle, id: ConnectionId) -> mpsc::Receiver<ServerMessage> {
        let (tx, mut rx) = mpsc::channel(64);
        room.join(id, tx).await.unwrap();
        // Every join fans out a user count; swallow it to keep the
        // interesting messages at the front.
        match rx.recv().await.unwrap() {
            ServerMessage::UserCountUpdate { .. } => {}
            other => panic!("expected user count after join, got {other:?}"),
        }
        rx
    }

    /// Drains user count frames, returning the first other message.
    async fn next_non_presence(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        loop {
            match rx.recv().await.expect("channel closed") {
                ServerMessage::UserCountUpdate { .. } => {}
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn fast_forward_acks_sender_and_updates_others() {
        let room = spawn_room();
        let mut a = join(&room, 1).await;
        let mut b = join(&room, 2).await;

        let (h0, content) = room.snapshot().await.unwrap();
        assert_eq!(content, "");

        room.sync(1, h0.clone(), vec![insert(0, "hello")]).await;

        let ack = next_non_presence(&mut a).await;
        let ServerMessage::Ack { new_hash } = ack else {
            panic!("expected ack, got {ack:?}");
        };
        assert_ne!(new_hash, h0);

        let update = next_non_presence(&mut b).await;
        assert_eq!(
            update,
            ServerMessage::Update {
                latest_hash: new_hash.clone(),
                operations: vec![insert(0, "hello")],
            }
        );

        let (head, content) = room.snapshot().await.unwrap();
        assert_eq!(head, new_hash);
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn concurrent_inserts_merge_server_first() {
        let room = spawn_room();
        let mut a = join(&room, 1).await;
        let mut b = join(&room, 2).await;

        let (h0, _) = room.snapshot().await.unwrap();
        room.sync(1, h0.clone(), vec![insert(0, "ab")]).await;
        let ServerMessage::Ack { new_hash: h1 } = next_non_presence(&mut a).await else {
            panic!("expected ack");
        };
        let _ = next_non_presence(&mut b).await; // B's update to "ab"

        // A commits "aXb"; B concurrently sends its insert against h1.
        room.sync(1, h1.clone(), vec![insert(1, "X")]).await;
        let ServerMessage::Ack { new_hash: h2 } = next_non_presence(&mut a).await else {
            panic!("expected ack");
        };
        room.sync(2, h1.clone(), vec![insert(1, "Y")]).await;

        // B hears about A's commit before its own ack, in commit order.
        let ServerMessage::Update { operations, .. } = next_non_presence(&mut b).await else {
            panic!("expected update");
        };
        assert_eq!(operations, vec![insert(1, "X")]);
        let ServerMessage::Ack { new_hash: h3 } = next_non_presence(&mut b).await else {
            panic!("expected ack");
        };
        assert_ne!(h2, h3);

        let (head, content) = room.snapshot().await.unwrap();
        assert_eq!(head, h3);
        assert_eq!(content, "aXYb");

        // A receives the merged delta against its own state "aXb".
        let ServerMessage::Update {
            latest_hash,
            operations,
        } = next_non_presence(&mut a).await
        else {
            panic!("expected update");
        };
        assert_eq!(latest_hash, h3);
        assert_eq!(
            operations,
            vec![retain(0, 1), retain(1, 1), insert(2, "Y"), retain(2, 1)]
        );
    }

    #[tokio::test]
    async fn duplicate_delete_acks_without_broadcast() {
        let room = spawn_room();
        let mut a = join(&room, 1).await;
        let mut b = join(&room, 2).await;

        let (h0, _) = room.snapshot().await.unwrap();
        room.sync(1, h0.clone(), vec![insert(0, "ab")]).await;
        let ServerMessage::Ack { new_hash: h1 } = next_non_presence(&mut a).await else {
            panic!("expected ack");
        };
        let _ = next_non_presence(&mut b).await;

        room.sync(1, h1.clone(), vec![delete(0, 1)]).await;
        let ServerMessage::Ack { .. } = next_non_presence(&mut a).await else {
            panic!("expected ack");
        };
        room.sync(2, h1.clone(), vec![delete(0, 1)]).await;

        // B hears A's delete, then its own ack; the no-op merge itself is
        // not broadcast to anyone.
        let ServerMessage::Update { operations, .. } = next_non_presence(&mut b).await else {
            panic!("expected update");
        };
        assert_eq!(operations, vec![delete(0, 1)]);
        let ServerMessage::Ack { new_hash: h3 } = next_non_presence(&mut b).await else {
            panic!("expected ack");
        };

        let (head, content) = room.snapshot().await.unwrap();
        assert_eq!(head, h3);
        assert_eq!(content, "b");

        room.sync(1, h3.clone(), vec![insert(1, "!")]).await;
        let ServerMessage::Ack { .. } = next_non_presence(&mut a).await else {
            panic!("expected ack");
        };
        // The next thing B hears is that later insert, not an empty update
        // for the collapsed delete.
        let ServerMessage::Update { operations, .. } = next_non_presence(&mut b).await else {
            panic!("expected update");
        };
        assert_eq!(operations, vec![insert(1, "!")]);
    }

    #[traced_test]
    #[tokio::test]
    async fn unknown_base_hash_is_an_error_without_commit() {
        let room = spawn_room();
        let mut a = join(&room, 1).await;

        let (h0, _) = room.snapshot().await.unwrap();
        room.sync(1, "deadbeef".to_string(), vec![insert(0, "x")])
            .await;

        assert_eq!(
            next_non_presence(&mut a).await,
            ServerMessage::Error {
                message: "Base hash not found. Please reload.".to_string(),
            }
        );
        let (head, content) = room.snapshot().await.unwrap();
        assert_eq!(head, h0);
        assert_eq!(content, "");
    }

    #[tokio::test]
    async fn user_counts_follow_joins_and_leaves() {
        let room = spawn_room();
        let (tx_a, mut a) = mpsc::channel(8);
        room.join(1, tx_a).await.unwrap();
        assert_eq!(
            a.recv().await.unwrap(),
            ServerMessage::UserCountUpdate { count: 1 }
        );

        let (tx_b, mut b) = mpsc::channel(8);
        room.join(2, tx_b).await.unwrap();
        assert_eq!(
            a.recv().await.unwrap(),
            ServerMessage::UserCountUpdate { count: 2 }
        );
        assert_eq!(
            b.recv().await.unwrap(),
            ServerMessage::UserCountUpdate { count: 2 }
        );

        room.leave(2).await;
        assert_eq!(
            a.recv().await.unwrap(),
            ServerMessage::UserCountUpdate { count: 1 }
        );
    }

    #[tokio::test]
    async fn room_closes_after_last_leave() {
        let (closed_tx, closed_rx) = oneshot::channel();
        let room = RoomHandle::spawn(NoteId("bye".to_string()), "note.txt", move |_| {
            let _ = closed_tx.send(());
        });
        let (tx, _rx) = mpsc::channel(8);
        room.join(1, tx).await.unwrap();
        room.leave(1).await;
        closed_rx.await.expect("room should signal close");
    }

    mod merging {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn concurrent_delete_and_append() {
            // Server already dropped the first character; the client's
            // append shifts left by one.
            let (merged, broadcast) =
                merge_against("hello", "ello", &[insert(5, "!")]).unwrap();
            assert_eq!(merged, "ello!");
            assert_eq!(
                broadcast,
                vec![
                    retain(0, 1),
                    retain(1, 1),
                    retain(2, 1),
                    retain(3, 1),
                    insert(4, "!")
                ]
            );
        }

        #[test]
        fn identical_deletes_produce_empty_broadcast() {
            let (merged, broadcast) = merge_against("ab", "b", &[delete(0, 1)]).unwrap();
            assert_eq!(merged, "b");
            assert_eq!(broadcast, vec![]);
        }

        #[test]
        fn coalesced_client_ops_are_reexpanded() {
            // A multi-character insert against a concurrent server edit at
            // the same anchor: the rediff reduces it to single characters
            // before transforming.
            let (merged, _) = merge_against("ab", "aXb", &[insert(1, "YZ")]).unwrap();
            assert_eq!(merged, "aXYZb");
        }

        #[test]
        fn malformed_operations_error() {
            assert!(merge_against("ab", "abc", &[insert(9, "x")]).is_err());
        }
    }
}
