/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Relation tracker. Admirations (likes and announces) live as index
//! logs of actor fingerprints next to the object they annotate;
//! follow/follower/pending state lives as one file per actor under the
//! user's directory. Every operation is idempotent and counts are
//! always derived from set size, never cached.

use crate::error::{StoreError, StoreResult};
use crate::index::IndexFile;
use crate::object_store::{fingerprint, ObjectStore};
use crate::user::User;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmireKind {
    Like,
    Announce,
}

impl AdmireKind {
    fn suffix(self) -> &'static str {
        match self {
            AdmireKind::Like => "l",
            AdmireKind::Announce => "a",
        }
    }
}

fn admire_index(store: &ObjectStore, object_id: &str, kind: AdmireKind) -> IndexFile {
    IndexFile::new(store.relation_path(&fingerprint(object_id), kind.suffix()))
}

/// Registers an admiration. Returns false when the actor already
/// admired the object this way.
pub fn admire(
    store: &ObjectStore,
    object_id: &str,
    actor: &str,
    kind: AdmireKind,
) -> StoreResult<bool> {
    let idx = admire_index(store, object_id, kind);
    let actor_fp = fingerprint(actor);
    if idx.contains(&actor_fp)? {
        return Ok(false);
    }
    idx.append(&actor_fp)?;
    Ok(true)
}

/// Removes an admiration. Removing one that does not exist is a no-op
/// returning false.
pub fn unadmire(
    store: &ObjectStore,
    object_id: &str,
    actor: &str,
    kind: AdmireKind,
) -> StoreResult<bool> {
    admire_index(store, object_id, kind).mark_seen(&fingerprint(actor))
}

/// Actor fingerprints that liked the object.
pub fn likes_of(store: &ObjectStore, object_id: &str) -> StoreResult<Vec<String>> {
    admire_index(store, object_id, AdmireKind::Like).list(0)
}

/// Actor fingerprints that announced (boosted) the object.
pub fn announces_of(store: &ObjectStore, object_id: &str) -> StoreResult<Vec<String>> {
    admire_index(store, object_id, AdmireKind::Announce).list(0)
}

/// Records a poll vote by the actor. Returns false when the actor
/// already voted on this question.
pub fn record_vote(store: &ObjectStore, question_id: &str, actor: &str) -> StoreResult<bool> {
    let idx = IndexFile::new(store.relation_path(&fingerprint(question_id), "v"));
    let actor_fp = fingerprint(actor);
    if idx.contains(&actor_fp)? {
        return Ok(false);
    }
    idx.append(&actor_fp)?;
    Ok(true)
}

pub fn has_voted(store: &ObjectStore, question_id: &str, actor: &str) -> StoreResult<bool> {
    IndexFile::new(store.relation_path(&fingerprint(question_id), "v"))
        .contains(&fingerprint(actor))
}

fn set_file(dir: &Path, key: &str) -> std::path::PathBuf {
    dir.join(fingerprint(key))
}

fn set_add(dir: &Path, key: &str, content: &str) -> StoreResult<bool> {
    fs::create_dir_all(dir)?;
    let path = set_file(dir, key);
    if path.exists() {
        return Ok(false);
    }
    fs::write(path, content)?;
    Ok(true)
}

fn set_del(dir: &Path, key: &str) -> StoreResult<bool> {
    match fs::remove_file(set_file(dir, key)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn set_contains(dir: &Path, key: &str) -> bool {
    set_file(dir, key).exists()
}

fn set_list(dir: &Path) -> StoreResult<Vec<String>> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            out.push(fs::read_to_string(entry.path())?);
        }
    }
    out.sort();
    Ok(out)
}

pub fn follower_add(user: &User, actor: &str) -> StoreResult<bool> {
    set_add(&user.followers_dir(), actor, actor)
}

pub fn follower_del(user: &User, actor: &str) -> StoreResult<bool> {
    set_del(&user.followers_dir(), actor)
}

pub fn follower_check(user: &User, actor: &str) -> bool {
    set_contains(&user.followers_dir(), actor)
}

/// Actor URLs following this user.
pub fn follower_list(user: &User) -> StoreResult<Vec<String>> {
    set_list(&user.followers_dir())
}

/// Starts following an actor, remembering the Follow activity so it
/// can be undone and matched against the eventual Accept.
pub fn following_add(user: &User, actor: &str, follow_msg: &Value) -> StoreResult<bool> {
    let dir = user.following_dir();
    fs::create_dir_all(&dir)?;
    let path = set_file(&dir, actor);
    if path.exists() {
        return Ok(false);
    }
    let record = json!({
        "actor": actor,
        "accepted": false,
        "follow": follow_msg,
    });
    fs::write(path, serde_json::to_vec(&record).expect("json value serializes"))?;
    Ok(true)
}

pub fn following_del(user: &User, actor: &str) -> StoreResult<bool> {
    set_del(&user.following_dir(), actor)
}

pub fn is_following(user: &User, actor: &str) -> bool {
    set_contains(&user.following_dir(), actor)
}

pub fn following_get(user: &User, actor: &str) -> StoreResult<Value> {
    let path = set_file(&user.following_dir(), actor);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StoreError::NotFound),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes).map_err(|_| StoreError::Corrupt { path })
}

/// Marks a pending follow as accepted by the remote side.
pub fn following_set_accepted(user: &User, actor: &str) -> StoreResult<bool> {
    let mut record = match following_get(user, actor) {
        Ok(v) => v,
        Err(StoreError::NotFound) => return Ok(false),
        Err(e) => return Err(e),
    };
    record["accepted"] = Value::Bool(true);
    let path = set_file(&user.following_dir(), actor);
    fs::write(path, serde_json::to_vec(&record).expect("json value serializes"))?;
    Ok(true)
}

/// Actor URLs this user follows.
pub fn following_list(user: &User) -> StoreResult<Vec<String>> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(user.following_dir()) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Ok(record) = serde_json::from_slice::<Value>(&fs::read(entry.path())?) else {
            continue;
        };
        if let Some(actor) = record.get("actor").and_then(|v| v.as_str()) {
            out.push(actor.to_string());
        }
    }
    out.sort();
    Ok(out)
}

/// Queues an inbound Follow for manual approval.
pub fn pending_add(user: &User, actor: &str, msg: &Value) -> StoreResult<bool> {
    set_add(
        &user.pending_dir(),
        actor,
        &serde_json::to_string(msg).expect("json value serializes"),
    )
}

pub fn pending_check(user: &User, actor: &str) -> bool {
    set_contains(&user.pending_dir(), actor)
}

pub fn pending_get(user: &User, actor: &str) -> StoreResult<Value> {
    let path = set_file(&user.pending_dir(), actor);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StoreError::NotFound),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes).map_err(|_| StoreError::Corrupt { path })
}

pub fn pending_del(user: &User, actor: &str) -> StoreResult<bool> {
    set_del(&user.pending_dir(), actor)
}

/// Pending Follow activities awaiting approval.
pub fn pending_list(user: &User) -> StoreResult<Vec<Value>> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(user.pending_dir()) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Ok(v) = serde_json::from_slice(&fs::read(entry.path())?) {
            out.push(v);
        }
    }
    Ok(out)
}

pub fn mute(user: &User, actor: &str) -> StoreResult<bool> {
    set_add(&user.muted_dir(), actor, actor)
}

pub fn unmute(user: &User, actor: &str) -> StoreResult<bool> {
    set_del(&user.muted_dir(), actor)
}

pub fn is_muted(user: &User, actor: &str) -> bool {
    set_contains(&user.muted_dir(), actor)
}

pub fn hide(user: &User, object_id: &str) -> StoreResult<bool> {
    set_add(&user.hidden_dir(), object_id, object_id)
}

pub fn unhide(user: &User, object_id: &str) -> StoreResult<bool> {
    set_del(&user.hidden_dir(), object_id)
}

pub fn is_hidden(user: &User, object_id: &str) -> bool {
    set_contains(&user.hidden_dir(), object_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Server;
    use tempfile::tempdir;

    fn fixture() -> (tempfile::TempDir, Server, User, ObjectStore) {
        let dir = tempdir().unwrap();
        let server = Server::init(dir.path().join("data"), "social.example").unwrap();
        let user = User::create(&server, "alice").unwrap();
        let store = server.store();
        (dir, server, user, store)
    }

    #[test]
    fn admire_is_idempotent() {
        let (_dir, _server, _user, store) = fixture();
        let id = "https://remote.example/notes/1";
        store.put(id, &json!({"id": id})).unwrap();
        let actor = "https://remote.example/users/bob";

        assert!(admire(&store, id, actor, AdmireKind::Like).unwrap());
        assert!(!admire(&store, id, actor, AdmireKind::Like).unwrap());
        assert_eq!(likes_of(&store, id).unwrap(), vec![fingerprint(actor)]);
        assert!(announces_of(&store, id).unwrap().is_empty());

        assert!(unadmire(&store, id, actor, AdmireKind::Like).unwrap());
        assert!(!unadmire(&store, id, actor, AdmireKind::Like).unwrap());
        assert!(likes_of(&store, id).unwrap().is_empty());
    }

    #[test]
    fn likes_and_announces_are_separate_sets() {
        let (_dir, _server, _user, store) = fixture();
        let id = "https://remote.example/notes/2";
        let actor = "https://remote.example/users/bob";
        assert!(admire(&store, id, actor, AdmireKind::Like).unwrap());
        assert!(admire(&store, id, actor, AdmireKind::Announce).unwrap());
        assert_eq!(likes_of(&store, id).unwrap().len(), 1);
        assert_eq!(announces_of(&store, id).unwrap().len(), 1);
    }

    #[test]
    fn follower_set_semantics() {
        let (_dir, _server, user, _store) = fixture();
        let bob = "https://remote.example/users/bob";
        assert!(follower_add(&user, bob).unwrap());
        assert!(!follower_add(&user, bob).unwrap());
        assert!(follower_check(&user, bob));
        assert_eq!(follower_list(&user).unwrap(), vec![bob.to_string()]);
        assert!(follower_del(&user, bob).unwrap());
        assert!(!follower_del(&user, bob).unwrap());
        assert!(!follower_check(&user, bob));
    }

    #[test]
    fn following_keeps_the_follow_activity() {
        let (_dir, _server, user, _store) = fixture();
        let bob = "https://remote.example/users/bob";
        let follow = json!({"id": "https://social.example/users/alice/p/1", "type": "Follow"});
        assert!(following_add(&user, bob, &follow).unwrap());
        assert!(is_following(&user, bob));

        let record = following_get(&user, bob).unwrap();
        assert_eq!(record["accepted"], false);
        assert_eq!(record["follow"]["type"], "Follow");

        assert!(following_set_accepted(&user, bob).unwrap());
        assert_eq!(following_get(&user, bob).unwrap()["accepted"], true);

        assert_eq!(following_list(&user).unwrap(), vec![bob.to_string()]);
        assert!(following_del(&user, bob).unwrap());
        assert!(!is_following(&user, bob));
    }

    #[test]
    fn pending_follow_requests() {
        let (_dir, _server, user, _store) = fixture();
        let bob = "https://remote.example/users/bob";
        let follow = json!({"id": "https://remote.example/act/1", "type": "Follow", "actor": bob});
        assert!(pending_add(&user, bob, &follow).unwrap());
        assert!(pending_check(&user, bob));
        assert_eq!(pending_list(&user).unwrap().len(), 1);
        assert_eq!(pending_get(&user, bob).unwrap()["actor"], bob.to_string());
        assert!(pending_del(&user, bob).unwrap());
        assert!(pending_list(&user).unwrap().is_empty());
    }

    #[test]
    fn mute_and_hide_sets() {
        let (_dir, _server, user, _store) = fixture();
        let bob = "https://remote.example/users/bob";
        let note = "https://remote.example/notes/9";
        assert!(mute(&user, bob).unwrap());
        assert!(is_muted(&user, bob));
        assert!(unmute(&user, bob).unwrap());
        assert!(!is_muted(&user, bob));

        assert!(hide(&user, note).unwrap());
        assert!(is_hidden(&user, note));
        assert!(unhide(&user, note).unwrap());
        assert!(!is_hidden(&user, note));
    }

    #[test]
    fn vote_recording_is_once_per_actor() {
        let (_dir, _server, _user, store) = fixture();
        let q = "https://social.example/users/alice/p/77";
        let bob = "https://remote.example/users/bob";
        assert!(!has_voted(&store, q, bob).unwrap());
        assert!(record_vote(&store, q, bob).unwrap());
        assert!(!record_vote(&store, q, bob).unwrap());
        assert!(has_voted(&store, q, bob).unwrap());
    }
}
