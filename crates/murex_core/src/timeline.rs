/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Timeline maintenance and assembly. Writing composes the object
//! store, the user cache links and the index logs; reading walks an
//! index from a cursor and applies the policy filter without ever
//! reordering entries.

use crate::config::Server;
use crate::delivery::is_public_activity;
use crate::error::{StoreError, StoreResult};
use crate::index::IndexFile;
use crate::object_store::{fingerprint, ObjectStore};
use crate::relations;
use crate::user::User;
use murex_protocol::{NAMED_POSTLIKE_TYPES, POSTLIKE_TYPES};
use serde_json::Value;
use tracing::debug;

/// Pagination cursors, all expressed as index fingerprints.
/// `max_id` is an exclusive upper bound walking newest-first;
/// `since_id` an exclusive lower bound; `min_id` an inclusive lower
/// bound that switches iteration to oldest-first.
#[derive(Debug, Default, Clone)]
pub struct Paging {
    pub max_id: Option<String>,
    pub since_id: Option<String>,
    pub min_id: Option<String>,
    pub limit: usize,
}

pub const DEFAULT_PAGE: usize = 20;

/// Adds a received or authored post to the user's timeline: stores the
/// object, links it into the private cache and appends the private
/// index. Returns false when the post was already there.
pub fn timeline_add(store: &ObjectStore, user: &User, id: &str, msg: &Value) -> StoreResult<bool> {
    let private = user.cache_dir("private");
    if store.cache_contains(id, &private) {
        return Ok(false);
    }
    let fp = store.put(id, msg)?;
    store.cache_link(id, &private)?;
    user.private_index().append(&fp)?;
    debug!("timeline_add {} {}", user.uid, id);
    Ok(true)
}

/// Additionally exposes one of the user's own public posts: public
/// cache link, user public index, instance-wide index.
pub fn timeline_add_public(
    server: &Server,
    store: &ObjectStore,
    user: &User,
    id: &str,
) -> StoreResult<()> {
    let fp = fingerprint(id);
    if store.cache_link(id, &user.cache_dir("public"))? {
        user.public_index().append(&fp)?;
        IndexFile::new(server.instance_index_path()).append(&fp)?;
    }
    Ok(())
}

/// Removes a post from the user's view and drops the object itself if
/// this was its last reference.
pub fn timeline_del(store: &ObjectStore, user: &User, id: &str) -> StoreResult<()> {
    let fp = fingerprint(id);
    store.cache_unlink(id, &user.cache_dir("private"))?;
    store.cache_unlink(id, &user.cache_dir("public"))?;
    user.private_index().mark_seen(&fp)?;
    user.public_index().mark_seen(&fp)?;
    store.delete_if_unreferenced(id)?;
    Ok(())
}

pub fn timeline_contains(store: &ObjectStore, user: &User, id: &str) -> bool {
    store.cache_contains(id, &user.cache_dir("private"))
}

/// Registers an admiration seen by this user's timeline.
pub fn timeline_admire(
    store: &ObjectStore,
    user: &User,
    id: &str,
    admirer: &str,
    kind: relations::AdmireKind,
) -> StoreResult<bool> {
    let added = relations::admire(store, id, admirer, kind)?;
    if added {
        debug!("timeline_admire {} {:?} {} by {}", user.uid, kind, id, admirer);
    }
    Ok(added)
}

/// Indexes the hashtags of a stored post into the instance tag tree.
pub fn tag_index(server: &Server, id: &str, msg: &Value) -> StoreResult<()> {
    let Some(tags) = msg.get("tag").and_then(|t| t.as_array()) else {
        return Ok(());
    };
    let obj_fp = fingerprint(id);
    for tag in tags {
        if tag.get("type").and_then(|t| t.as_str()) != Some("Hashtag") {
            continue;
        }
        let Some(name) = tag.get("name").and_then(|n| n.as_str()) else {
            continue;
        };
        let idx = tag_index_file(server, name);
        if !idx.contains(&obj_fp)? {
            idx.append(&obj_fp)?;
        }
    }
    Ok(())
}

/// Index log for a hashtag, bucketed like objects are.
pub fn tag_index_file(server: &Server, tag: &str) -> IndexFile {
    let normalized = tag.trim_start_matches('#').to_lowercase();
    let fp = fingerprint(&normalized);
    IndexFile::new(
        server
            .basedir
            .join("tag")
            .join(&fp[..2])
            .join(format!("{fp}.idx")),
    )
}

/// Walks `index` from the requested cursor and returns up to
/// `paging.limit` post-like objects that survive the policy filter.
/// Filtering only removes entries; relative index order is preserved
/// (ascending walks are presented newest-first like everything else).
pub fn assemble(
    server: &Server,
    store: &ObjectStore,
    index: &IndexFile,
    viewer: Option<&User>,
    paging: &Paging,
) -> StoreResult<Vec<Value>> {
    let limit = if paging.limit == 0 {
        DEFAULT_PAGE
    } else {
        paging.limit
    };
    let mut out: Vec<Value> = Vec::new();

    let ascending = paging.min_id.is_some();
    let mut cursor = if let Some(min_id) = paging.min_id.as_deref() {
        index.asc(Some(min_id))?
    } else {
        index.desc()?
    };
    let Some(cursor) = cursor.as_mut() else {
        return Ok(out);
    };

    let mut max_id = paging.max_id.clone();
    let mut since_id = paging.since_id.clone();

    while let Some(fp) = cursor.next()? {
        // Only return entries strictly older than max_id.
        if let Some(mid) = max_id.as_deref() {
            if fp == mid {
                max_id = None;
                if ascending {
                    break;
                }
                continue;
            }
            if !ascending {
                continue;
            }
        }
        // Only return entries strictly newer than since_id.
        if let Some(sid) = since_id.as_deref() {
            if fp == sid {
                if !ascending {
                    break;
                }
                since_id = None;
                continue;
            }
            if ascending {
                continue;
            }
        }

        let msg = match store.get_by_fingerprint(&fp) {
            Ok(v) => v,
            Err(StoreError::NotFound) | Err(StoreError::Corrupt { .. }) => continue,
            Err(e) => return Err(e),
        };

        if !accepts(server, store, viewer, &msg) {
            continue;
        }

        if ascending {
            out.insert(0, msg);
        } else {
            out.push(msg);
        }
        if out.len() == limit {
            break;
        }
    }
    Ok(out)
}

/// The timeline policy filter, applied in a fixed order.
fn accepts(server: &Server, store: &ObjectStore, viewer: Option<&User>, msg: &Value) -> bool {
    let ty = msg.get("type").and_then(|t| t.as_str()).unwrap_or("");
    if !POSTLIKE_TYPES.contains(&ty) {
        return false;
    }

    let Some(id) = msg.get("id").and_then(|i| i.as_str()) else {
        return false;
    };
    if server.is_instance_blocked(id) {
        return false;
    }

    // Pages attribute provenance through their audience.
    let from = if ty == "Page" {
        msg.get("audience").and_then(|a| a.as_str())
    } else {
        None
    }
    .or_else(|| get_atto(msg));
    let Some(from) = from else {
        return false;
    };

    match viewer {
        Some(user) => {
            // A post from someone the viewer does not follow stays only
            // when somebody boosted it into this timeline.
            if from != user.actor && !relations::is_following(user, from) {
                match relations::announces_of(store, id) {
                    Ok(announces) if announces.is_empty() => return false,
                    Ok(_) => {}
                    Err(_) => return false,
                }
            }
            if relations::is_muted(user, from) {
                return false;
            }
            if relations::is_hidden(user, id) {
                return false;
            }
        }
        None => {
            if !is_public_activity(msg) {
                return false;
            }
        }
    }

    // A named object of a type that cannot carry a name is a poll
    // vote on the wire; it never belongs in a timeline.
    if msg.get("name").and_then(|n| n.as_str()).is_some()
        && !NAMED_POSTLIKE_TYPES.contains(&ty)
    {
        return false;
    }

    true
}

/// Author of a message: `attributedTo`, falling back to `actor`.
pub fn get_atto(msg: &Value) -> Option<&str> {
    msg.get("attributedTo")
        .and_then(|a| a.as_str())
        .or_else(|| msg.get("actor").and_then(|a| a.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relations::AdmireKind;
    use serde_json::json;
    use tempfile::tempdir;

    fn fixture() -> (tempfile::TempDir, Server, User, ObjectStore) {
        let dir = tempdir().unwrap();
        let server = Server::init(dir.path().join("data"), "social.example").unwrap();
        let user = User::create(&server, "alice").unwrap();
        let store = server.store();
        (dir, server, user, store)
    }

    fn note(id: &str, from: &str, public: bool) -> Value {
        let to = if public {
            json!(["https://www.w3.org/ns/activitystreams#Public"])
        } else {
            json!([format!("{from}/followers")])
        };
        json!({"id": id, "type": "Note", "attributedTo": from, "content": "hi", "to": to})
    }

    fn followed(user: &User, actor: &str) {
        relations::following_add(user, actor, &json!({"type": "Follow"})).unwrap();
    }

    #[test]
    fn add_assemble_preserves_newest_first_order() {
        let (_dir, server, user, store) = fixture();
        let bob = "https://remote.example/users/bob";
        followed(&user, bob);
        for i in 0..5 {
            let id = format!("https://remote.example/notes/{i}");
            assert!(timeline_add(&store, &user, &id, &note(&id, bob, true)).unwrap());
        }

        let page = assemble(
            &server,
            &store,
            &user.private_index(),
            Some(&user),
            &Paging::default(),
        )
        .unwrap();
        let ids: Vec<&str> = page.iter().map(|m| m["id"].as_str().unwrap()).collect();
        assert_eq!(
            ids,
            vec![
                "https://remote.example/notes/4",
                "https://remote.example/notes/3",
                "https://remote.example/notes/2",
                "https://remote.example/notes/1",
                "https://remote.example/notes/0",
            ]
        );
    }

    #[test]
    fn duplicate_add_is_noop() {
        let (_dir, _server, user, store) = fixture();
        let bob = "https://remote.example/users/bob";
        let id = "https://remote.example/notes/1";
        assert!(timeline_add(&store, &user, id, &note(id, bob, true)).unwrap());
        assert!(!timeline_add(&store, &user, id, &note(id, bob, true)).unwrap());
        assert_eq!(user.private_index().len(), 1);
    }

    #[test]
    fn paging_cursors_bound_the_window() {
        let (_dir, server, user, store) = fixture();
        let bob = "https://remote.example/users/bob";
        followed(&user, bob);
        let ids: Vec<String> = (0..5)
            .map(|i| format!("https://remote.example/notes/{i}"))
            .collect();
        for id in &ids {
            timeline_add(&store, &user, id, &note(id, bob, true)).unwrap();
        }
        let fps: Vec<String> = ids.iter().map(|id| fingerprint(id)).collect();

        // max_id is exclusive, newest-first.
        let page = assemble(
            &server,
            &store,
            &user.private_index(),
            Some(&user),
            &Paging {
                max_id: Some(fps[3].clone()),
                ..Default::default()
            },
        )
        .unwrap();
        let got: Vec<&str> = page.iter().map(|m| m["id"].as_str().unwrap()).collect();
        assert_eq!(got, vec![ids[2].as_str(), ids[1].as_str(), ids[0].as_str()]);

        // since_id is an exclusive lower bound.
        let page = assemble(
            &server,
            &store,
            &user.private_index(),
            Some(&user),
            &Paging {
                since_id: Some(fps[2].clone()),
                ..Default::default()
            },
        )
        .unwrap();
        let got: Vec<&str> = page.iter().map(|m| m["id"].as_str().unwrap()).collect();
        assert_eq!(got, vec![ids[4].as_str(), ids[3].as_str()]);

        // min_id is inclusive and walks oldest-first (presented newest-first).
        let page = assemble(
            &server,
            &store,
            &user.private_index(),
            Some(&user),
            &Paging {
                min_id: Some(fps[3].clone()),
                ..Default::default()
            },
        )
        .unwrap();
        let got: Vec<&str> = page.iter().map(|m| m["id"].as_str().unwrap()).collect();
        assert_eq!(got, vec![ids[4].as_str(), ids[3].as_str()]);
    }

    #[test]
    fn filter_drops_muted_hidden_and_non_postlike() {
        let (_dir, server, user, store) = fixture();
        let bob = "https://remote.example/users/bob";
        let carol = "https://remote.example/users/carol";
        followed(&user, bob);
        followed(&user, carol);

        let n1 = "https://remote.example/notes/1";
        let n2 = "https://remote.example/notes/2";
        let n3 = "https://remote.example/notes/3";
        timeline_add(&store, &user, n1, &note(n1, bob, true)).unwrap();
        timeline_add(&store, &user, n2, &note(n2, carol, true)).unwrap();
        timeline_add(
            &store,
            &user,
            n3,
            &json!({"id": n3, "type": "Tombstone", "attributedTo": bob}),
        )
        .unwrap();

        relations::mute(&user, carol).unwrap();
        relations::hide(&user, n1).unwrap();

        let page = assemble(
            &server,
            &store,
            &user.private_index(),
            Some(&user),
            &Paging::default(),
        )
        .unwrap();
        assert!(page.is_empty());
    }

    #[test]
    fn boost_without_follow_requires_announce() {
        let (_dir, server, user, store) = fixture();
        let stranger = "https://remote.example/users/stranger";
        let id = "https://remote.example/notes/boosted";
        timeline_add(&store, &user, id, &note(id, stranger, true)).unwrap();

        // Not followed, not boosted: suppressed.
        let page = assemble(
            &server,
            &store,
            &user.private_index(),
            Some(&user),
            &Paging::default(),
        )
        .unwrap();
        assert!(page.is_empty());

        // Anyone's announce readmits it (the rule as observed).
        timeline_admire(
            &store,
            &user,
            id,
            "https://elsewhere.example/users/dan",
            AdmireKind::Announce,
        )
        .unwrap();
        let page = assemble(
            &server,
            &store,
            &user.private_index(),
            Some(&user),
            &Paging::default(),
        )
        .unwrap();
        assert_eq!(page.len(), 1);
    }

    #[test]
    fn anonymous_viewers_get_public_only() {
        let (_dir, server, user, store) = fixture();
        let bob = "https://remote.example/users/bob";
        let pub_id = "https://remote.example/notes/pub";
        let prv_id = "https://remote.example/notes/prv";
        timeline_add(&store, &user, pub_id, &note(pub_id, bob, true)).unwrap();
        timeline_add(&store, &user, prv_id, &note(prv_id, bob, false)).unwrap();

        let page = assemble(
            &server,
            &store,
            &user.private_index(),
            None,
            &Paging::default(),
        )
        .unwrap();
        let got: Vec<&str> = page.iter().map(|m| m["id"].as_str().unwrap()).collect();
        assert_eq!(got, vec![pub_id]);
    }

    #[test]
    fn named_non_page_objects_are_poll_votes() {
        let (_dir, server, user, store) = fixture();
        let bob = "https://remote.example/users/bob";
        followed(&user, bob);
        let vote = "https://remote.example/votes/1";
        let page_id = "https://remote.example/pages/1";
        timeline_add(
            &store,
            &user,
            vote,
            &json!({"id": vote, "type": "Note", "attributedTo": bob, "name": "Option A",
                    "to": ["https://www.w3.org/ns/activitystreams#Public"]}),
        )
        .unwrap();
        timeline_add(
            &store,
            &user,
            page_id,
            &json!({"id": page_id, "type": "Page", "attributedTo": bob, "audience": bob,
                    "name": "A page", "to": ["https://www.w3.org/ns/activitystreams#Public"]}),
        )
        .unwrap();

        let page = assemble(
            &server,
            &store,
            &user.private_index(),
            Some(&user),
            &Paging::default(),
        )
        .unwrap();
        let got: Vec<&str> = page.iter().map(|m| m["id"].as_str().unwrap()).collect();
        assert_eq!(got, vec![page_id]);
    }

    #[test]
    fn public_post_lands_in_instance_index() {
        let (_dir, server, user, store) = fixture();
        let id = format!("{}/p/1", user.actor);
        let msg = note(&id, &user.actor, true);
        timeline_add(&store, &user, &id, &msg).unwrap();
        timeline_add_public(&server, &store, &user, &id).unwrap();

        let instance = IndexFile::new(server.instance_index_path());
        assert_eq!(instance.len(), 1);
        assert!(instance.contains(&fingerprint(&id)).unwrap());

        // Deleting removes the references and the object.
        timeline_del(&store, &user, &id).unwrap();
        assert!(!store.exists(&id));
    }

    #[test]
    fn hashtags_are_indexed_once() {
        let (_dir, server, user, store) = fixture();
        let id = "https://remote.example/notes/tagged";
        let msg = json!({
            "id": id, "type": "Note",
            "attributedTo": "https://remote.example/users/bob",
            "to": ["https://www.w3.org/ns/activitystreams#Public"],
            "tag": [{"type": "Hashtag", "name": "#Rust"}],
        });
        timeline_add(&store, &user, id, &msg).unwrap();
        tag_index(&server, id, &msg).unwrap();
        tag_index(&server, id, &msg).unwrap();

        let idx = tag_index_file(&server, "rust");
        assert_eq!(idx.len(), 1);
    }
}
