/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Housekeeping: expiry of old timeline entries, index compaction,
//! deletion of unreferenced objects and trimming of the dead-letter
//! archive. Runs periodically on its own interval task.

use crate::config::Server;
use crate::index::IndexFile;
use crate::object_store::ObjectStore;
use crate::runtime::Core;
use crate::timeline;
use crate::user::{self, User};
use anyhow::Result;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{info, warn};

const GC_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Default)]
pub struct PurgeStats {
    pub expired_posts: usize,
    pub compacted_entries: usize,
    pub dropped_archives: usize,
}

pub fn start_gc_worker(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(GC_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup is not
        // a purge.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            let server = core.server.clone();
            let store = core.store.clone();
            let res = tokio::task::spawn_blocking(move || purge(&server, &store)).await;
            match res {
                Ok(Ok(stats)) => info!(
                    "gc: {} expired, {} compacted, {} archives dropped",
                    stats.expired_posts, stats.compacted_entries, stats.dropped_archives
                ),
                Ok(Err(e)) => warn!("gc error: {e:#}"),
                Err(e) => warn!("gc task panicked: {e}"),
            }
        }
    });
}

/// One full housekeeping pass over every user and the instance-wide
/// indices.
pub fn purge(server: &Server, store: &ObjectStore) -> Result<PurgeStats> {
    let mut stats = PurgeStats::default();
    let cutoff = SystemTime::now()
        - Duration::from_secs(u64::from(server.config.purge_days) * 24 * 3600);

    for uid in user::user_list(server)? {
        let user = match User::open(server, &uid) {
            Ok(u) => u,
            Err(e) => {
                warn!("gc: skipping user {uid}: {e:#}");
                continue;
            }
        };
        stats.expired_posts += purge_user(store, &user, cutoff)?;
        stats.compacted_entries += user.private_index().gc(store).unwrap_or(0);
        stats.compacted_entries += user.public_index().gc(store).unwrap_or(0);
    }

    stats.compacted_entries += IndexFile::new(server.instance_index_path())
        .gc(store)
        .unwrap_or(0);
    stats.compacted_entries += gc_tag_tree(server, store)?;
    stats.dropped_archives += trim_error_archive(server, cutoff)?;
    Ok(stats)
}

/// Expires received posts older than the cutoff. The user's own posts
/// are kept.
fn purge_user(store: &ObjectStore, user: &User, cutoff: SystemTime) -> Result<usize> {
    let mut expired = 0usize;
    for fp in user.private_index().list(0)? {
        let msg = match store.get_by_fingerprint(&fp) {
            Ok(m) => m,
            // Dangling entries are handled by index gc.
            Err(_) => continue,
        };
        let Some(id) = msg.get("id").and_then(|i| i.as_str()) else {
            continue;
        };
        if id.starts_with(&user.actor) {
            continue;
        }
        let old = match store.modified_at(&fp) {
            Ok(mtime) => mtime < cutoff,
            Err(_) => false,
        };
        if old {
            let id = id.to_string();
            timeline::timeline_del(store, user, &id)?;
            expired += 1;
        }
    }
    Ok(expired)
}

fn gc_tag_tree(server: &Server, store: &ObjectStore) -> Result<usize> {
    let mut removed = 0usize;
    let tag_dir = server.basedir.join("tag");
    let buckets = match fs::read_dir(&tag_dir) {
        Ok(b) => b,
        Err(_) => return Ok(0),
    };
    for bucket in buckets.flatten() {
        if !bucket.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        for entry in fs::read_dir(bucket.path())?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("idx") {
                continue;
            }
            let idx = IndexFile::new(&path);
            removed += idx.gc(store).unwrap_or(0);
            if idx.len() == 0 {
                let _ = fs::remove_file(&path);
            }
        }
    }
    Ok(removed)
}

/// Dead-letter archives are kept for inspection, not forever.
fn trim_error_archive(server: &Server, cutoff: SystemTime) -> Result<usize> {
    let mut dropped = 0usize;
    let entries = match fs::read_dir(server.error_dir()) {
        Ok(e) => e,
        Err(_) => return Ok(0),
    };
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(mtime) = meta.modified() else { continue };
        if mtime < cutoff {
            if fs::remove_file(entry.path()).is_ok() {
                dropped += 1;
            }
        }
    }
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn purge_expires_old_foreign_posts_and_keeps_own() {
        let dir = tempdir().unwrap();
        let server = Server::init(dir.path().join("data"), "social.example").unwrap();
        let user = User::create(&server, "alice").unwrap();
        let store = server.store();

        let own = format!("{}/p/1", user.actor);
        let foreign = "https://remote.example/notes/old";
        for (id, from) in [(own.as_str(), user.actor.as_str()),
                           (foreign, "https://remote.example/users/bob")] {
            timeline::timeline_add(
                &store,
                &user,
                id,
                &json!({"id": id, "type": "Note", "attributedTo": from,
                        "to": ["https://www.w3.org/ns/activitystreams#Public"]}),
            )
            .unwrap();
        }

        // Everything is fresh: nothing expires.
        let stats = purge(&server, &store).unwrap();
        assert_eq!(stats.expired_posts, 0);

        // With a future cutoff the foreign post expires, ours stays.
        let cutoff = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(purge_user(&store, &user, cutoff).unwrap(), 1);
        assert!(store.exists(&own));
        assert!(!store.exists(foreign));
    }

    #[test]
    fn empty_server_purges_cleanly() {
        let dir = tempdir().unwrap();
        let server = Server::init(dir.path().join("data"), "social.example").unwrap();
        let store = server.store();
        let stats = purge(&server, &store).unwrap();
        assert_eq!(stats.expired_posts, 0);
        assert_eq!(stats.compacted_entries, 0);
    }
}
