/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Local actor context. A `User` is opened at the start of a request
//! or worker task and dropped at the end; concurrent work on the same
//! user is serialized by the queue's per-user lease, never by sharing
//! a mutable `User`.

use crate::config::Server;
use crate::index::IndexFile;
use crate::keys::{load_or_generate_identity, Identity};
use crate::object_store::fingerprint;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub uid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub published_ms: Option<i64>,
    /// When set, inbound Follow requests wait in `pending/` for manual
    /// approval instead of being auto-accepted.
    #[serde(default)]
    pub approve_followers: bool,
}

#[derive(Clone)]
pub struct User {
    pub uid: String,
    pub basedir: PathBuf,
    pub config: UserConfig,
    pub identity: Identity,
    /// Canonical actor URL of this user.
    pub actor: String,
    /// Fingerprint of the actor URL.
    pub fingerprint: String,
}

pub fn validate_uid(uid: &str) -> bool {
    !uid.is_empty() && uid.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

impl User {
    pub fn create(server: &Server, uid: &str) -> Result<User> {
        if !validate_uid(uid) {
            bail!("invalid uid: {uid}");
        }
        let basedir = server.user_dir(uid);
        if basedir.join("user.json").exists() {
            bail!("user already exists: {uid}");
        }
        for dir in [
            "private", "public", "followers", "following", "pending", "muted", "hidden",
        ] {
            fs::create_dir_all(basedir.join(dir))
                .with_context(|| format!("create user dir {dir}"))?;
        }

        let config = UserConfig {
            uid: uid.to_string(),
            name: None,
            summary: None,
            published_ms: Some(now_ms()),
            approve_followers: false,
        };
        fs::write(
            basedir.join("user.json"),
            serde_json::to_string_pretty(&config)?,
        )?;

        let identity = load_or_generate_identity(&basedir)?;
        let actor = format!("{}/users/{uid}", server.baseurl);
        info!("created user {uid} ({actor})");
        Ok(User {
            uid: uid.to_string(),
            fingerprint: fingerprint(&actor),
            basedir,
            config,
            identity,
            actor,
        })
    }

    pub fn open(server: &Server, uid: &str) -> Result<User> {
        if !validate_uid(uid) {
            bail!("invalid uid: {uid}");
        }
        let basedir = server.user_dir(uid);
        let text = fs::read_to_string(basedir.join("user.json"))
            .with_context(|| format!("no such user: {uid}"))?;
        let config: UserConfig =
            serde_json::from_str(&text).with_context(|| format!("parse user.json for {uid}"))?;
        let identity = load_or_generate_identity(&basedir)?;
        let actor = format!("{}/users/{uid}", server.baseurl);
        Ok(User {
            uid: uid.to_string(),
            fingerprint: fingerprint(&actor),
            basedir,
            config,
            identity,
            actor,
        })
    }

    pub fn persist(&self) -> Result<()> {
        fs::write(
            self.basedir.join("user.json"),
            serde_json::to_string_pretty(&self.config)?,
        )?;
        Ok(())
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.actor)
    }

    /// Named index log under this user's directory.
    pub fn index(&self, name: &str) -> IndexFile {
        IndexFile::new(self.basedir.join(format!("{name}.idx")))
    }

    /// The user's full timeline (own posts plus everything received).
    pub fn private_index(&self) -> IndexFile {
        self.index("private")
    }

    /// The user's public posts only.
    pub fn public_index(&self) -> IndexFile {
        self.index("public")
    }

    pub fn cache_dir(&self, cache: &str) -> PathBuf {
        self.basedir.join(cache)
    }

    pub fn followers_dir(&self) -> PathBuf {
        self.basedir.join("followers")
    }

    pub fn following_dir(&self) -> PathBuf {
        self.basedir.join("following")
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.basedir.join("pending")
    }

    pub fn muted_dir(&self) -> PathBuf {
        self.basedir.join("muted")
    }

    pub fn hidden_dir(&self) -> PathBuf {
        self.basedir.join("hidden")
    }
}

/// All uids with a user.json under `user/`.
pub fn user_list(server: &Server) -> Result<Vec<String>> {
    let users_dir = server.basedir.join("user");
    let mut out = Vec::new();
    let entries = match fs::read_dir(&users_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if !entry.path().join("user.json").exists() {
            continue;
        }
        if let Some(uid) = entry.file_name().to_str() {
            out.push(uid.to_string());
        }
    }
    out.sort();
    Ok(out)
}

/// Finds the local user owning the given actor URL.
pub fn user_by_actor(server: &Server, actor: &str) -> Result<Option<User>> {
    let prefix = format!("{}/users/", server.baseurl);
    let Some(uid) = actor.strip_prefix(&prefix) else {
        return Ok(None);
    };
    let uid = uid.split('/').next().unwrap_or_default();
    if !validate_uid(uid) {
        return Ok(None);
    }
    if !server.user_dir(uid).join("user.json").exists() {
        return Ok(None);
    }
    Ok(Some(User::open(server, uid)?))
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Server;
    use tempfile::tempdir;

    #[test]
    fn uid_validation() {
        assert!(validate_uid("alice"));
        assert!(validate_uid("bob_2"));
        assert!(!validate_uid(""));
        assert!(!validate_uid("a b"));
        assert!(!validate_uid("a/../b"));
    }

    #[test]
    fn create_open_list() {
        let dir = tempdir().unwrap();
        let server = Server::init(dir.path().join("data"), "social.example").unwrap();

        let user = User::create(&server, "alice").unwrap();
        assert_eq!(user.actor, "https://social.example/users/alice");
        assert!(user.basedir.join("key.pem").is_file());
        assert!(user.basedir.join("followers").is_dir());

        // Creating again is a conflict.
        assert!(User::create(&server, "alice").is_err());

        let reopened = User::open(&server, "alice").unwrap();
        assert_eq!(reopened.identity.public_key_pem, user.identity.public_key_pem);
        assert_eq!(user_list(&server).unwrap(), vec!["alice".to_string()]);

        let found = user_by_actor(&server, "https://social.example/users/alice")
            .unwrap()
            .unwrap();
        assert_eq!(found.uid, "alice");
        assert!(user_by_actor(&server, "https://other.example/users/alice")
            .unwrap()
            .is_none());
    }

    #[test]
    fn persisted_config_survives_reopen() {
        let dir = tempdir().unwrap();
        let server = Server::init(dir.path().join("data"), "social.example").unwrap();
        let mut user = User::create(&server, "alice").unwrap();

        user.config.name = Some("Alice".to_string());
        user.config.approve_followers = true;
        user.persist().unwrap();

        let reopened = User::open(&server, "alice").unwrap();
        assert_eq!(reopened.config.name.as_deref(), Some("Alice"));
        assert!(reopened.config.approve_followers);
    }
}
