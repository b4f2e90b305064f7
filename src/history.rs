// SPDX-FileCopyrightText: 2025 notesync contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Content-addressed version history for a single note.
//!
//! The object model is a miniature git: blobs hold raw text, a tree maps the
//! note's filename to a blob, a commit points at a tree and its parent.
//! Object keys are SHA-1 over a canonical serialization -- raw UTF-8 bytes
//! for blobs, JSON with keys in declaration order for trees and commits.
//! Peers that store hashes must reproduce these bytes exactly.
//!
//! The store never garbage-collects. The merge protocol resolves arbitrary
//! historical base contents, so every version ever committed stays
//! reachable.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;

/// Snapshot-with-parent. Field order is the canonical key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub tree: String,
    pub parent: Option<String>,
    pub message: String,
    pub timestamp: i64,
}

/// One-entry mapping from the note's filename to a blob hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub filename: String,
    pub blob: String,
}

impl Tree {
    fn canonical_json(&self) -> String {
        let mut map = serde_json::Map::new();
        map.insert(
            self.filename.clone(),
            serde_json::Value::String(self.blob.clone()),
        );
        serde_json::Value::Object(map).to_string()
    }
}

impl Commit {
    fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("Commit serialization cannot fail")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Object {
    Blob(String),
    Tree(Tree),
    Commit(Commit),
}

/// In-memory store of immutable objects plus the current `HEAD`.
///
/// `HEAD` is either `None` (no commit yet) or a commit key present in the
/// store whose parent chain terminates at a parentless commit. Objects are
/// immutable once inserted; inserting at an existing key is a no-op, which
/// is what deduplicates blobs and trees across commits.
#[derive(Debug, Default)]
pub struct VersionStore {
    objects: HashMap<String, Object>,
    head: Option<String>,
    filename: String,
}

impl VersionStore {
    #[must_use]
    pub fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            ..Self::default()
        }
    }

    pub fn head(&self) -> Option<&str> {
        self.head.as_deref()
    }

    /// Records `content` as a new commit on top of `HEAD` and returns the
    /// new commit hash.
    pub fn commit(&mut self, content: &str, message: &str) -> String {
        let timestamp = time::OffsetDateTime::now_utc().unix_timestamp();
        self.commit_with_timestamp(content, message, timestamp)
    }

    fn commit_with_timestamp(&mut self, content: &str, message: &str, timestamp: i64) -> String {
        let blob_hash = sha1_hex(content.as_bytes());
        self.put(blob_hash.clone(), Object::Blob(content.to_string()));

        let tree = Tree {
            filename: self.filename.clone(),
            blob: blob_hash,
        };
        let tree_hash = sha1_hex(tree.canonical_json().as_bytes());
        self.put(tree_hash.clone(), Object::Tree(tree));

        let commit = Commit {
            tree: tree_hash,
            parent: self.head.clone(),
            message: message.to_string(),
            timestamp,
        };
        let commit_hash = sha1_hex(commit.canonical_json().as_bytes());
        self.put(commit_hash.clone(), Object::Commit(commit));

        self.head = Some(commit_hash.clone());
        commit_hash
    }

    /// Resolves a commit hash to the note content it snapshots. `None` if
    /// the hash is unknown or any link in commit -> tree -> blob is missing.
    pub fn content_at(&self, hash: &str) -> Option<String> {
        let Some(Object::Commit(commit)) = self.objects.get(hash) else {
            return None;
        };
        let Some(Object::Tree(tree)) = self.objects.get(&commit.tree) else {
            return None;
        };
        match self.objects.get(&tree.blob) {
            Some(Object::Blob(content)) => Some(content.clone()),
            _ => None,
        }
    }

    fn put(&mut self, hash: String, object: Object) {
        self.objects.entry(hash).or_insert(object);
    }

    #[cfg(test)]
    fn parent_of(&self, hash: &str) -> Option<String> {
        match self.objects.get(hash) {
            Some(Object::Commit(commit)) => commit.parent.clone(),
            _ => None,
        }
    }
}

fn sha1_hex(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_store_has_no_head() {
        let store = VersionStore::new("note.txt");
        assert_eq!(store.head(), None);
        assert_eq!(store.content_at("deadbeef"), None);
    }

    #[test]
    fn commit_advances_head_and_resolves() {
        let mut store = VersionStore::new("note.txt");
        let h0 = store.commit("", "Initial empty commit");
        assert_eq!(store.head(), Some(h0.as_str()));
        assert_eq!(store.content_at(&h0), Some(String::new()));

        let h1 = store.commit("hello", "Update from client");
        assert_eq!(store.head(), Some(h1.as_str()));
        assert_eq!(store.content_at(&h1), Some("hello".to_string()));
        // Historical versions stay resolvable.
        assert_eq!(store.content_at(&h0), Some(String::new()));
    }

    #[test]
    fn chain_terminates_at_parentless_commit() {
        let mut store = VersionStore::new("note.txt");
        let h0 = store.commit("", "Initial empty commit");
        let h1 = store.commit("a", "m");
        let h2 = store.commit("ab", "m");

        assert_eq!(store.parent_of(&h2), Some(h1.clone()));
        assert_eq!(store.parent_of(&h1), Some(h0.clone()));
        assert_eq!(store.parent_of(&h0), None);
    }

    #[test]
    fn hashing_is_content_addressed() {
        let mut a = VersionStore::new("note.txt");
        let mut b = VersionStore::new("note.txt");
        let ha = a.commit_with_timestamp("hello", "m", 1_700_000_000);
        let hb = b.commit_with_timestamp("hello", "m", 1_700_000_000);
        assert_eq!(ha, hb);

        // A differing parent changes the commit hash even for identical
        // content.
        let ha2 = a.commit_with_timestamp("hello", "m", 1_700_000_000);
        assert_ne!(ha, ha2);
    }

    #[test]
    fn blobs_and_trees_are_deduplicated() {
        let mut store = VersionStore::new("note.txt");
        store.commit_with_timestamp("same", "first", 1);
        let before = store.objects.len();
        store.commit_with_timestamp("same", "second", 2);
        // Only the new commit object is added; blob and tree are shared.
        assert_eq!(store.objects.len(), before + 1);
    }

    #[test]
    fn commit_canonical_json_is_byte_stable() {
        let commit = Commit {
            tree: "t".to_string(),
            parent: None,
            message: "Initial empty commit".to_string(),
            timestamp: 0,
        };
        assert_eq!(
            commit.canonical_json(),
            r#"{"tree":"t","parent":null,"message":"Initial empty commit","timestamp":0}"#
        );

        let tree = Tree {
            filename: "note.txt".to_string(),
            blob: "b".to_string(),
        };
        assert_eq!(tree.canonical_json(), r#"{"note.txt":"b"}"#);
    }

    #[test]
    fn blob_hash_matches_raw_sha1() {
        // sha1("hello"), the well-known vector.
        assert_eq!(
            sha1_hex(b"hello"),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
    }
}
