/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Outbound authoring: activity constructors and the publish path
//! that stores a post, indexes it and fans deliveries out to follower
//! inboxes.

use crate::delivery::extract_recipients;
use crate::queue::JobKind;
use crate::relations;
use crate::runtime::Core;
use crate::timeline;
use crate::user::User;
use anyhow::{anyhow, Context, Result};
use murex_protocol::{ActorDoc, AS_CONTEXT, AS_PUBLIC};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Time-based id fragment; lexicographic order equals chronological
/// order, which keeps index insertion order chronological.
pub fn tid() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{:010}.{:06}", now.as_secs(), now.subsec_micros())
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

pub fn new_object_id(user: &User) -> String {
    format!("{}/p/{}", user.actor, tid())
}

/// Hashtag tags extracted from plain-text content.
pub fn extract_hashtags(content: &str) -> Vec<Value> {
    let mut seen = BTreeSet::new();
    for word in content.split_whitespace() {
        let Some(tag) = word.strip_prefix('#') else { continue };
        let tag: String = tag
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if !tag.is_empty() {
            seen.insert(tag.to_lowercase());
        }
    }
    seen.into_iter()
        .map(|t| json!({"type": "Hashtag", "name": format!("#{t}")}))
        .collect()
}

pub fn msg_note(
    user: &User,
    content: &str,
    in_reply_to: Option<&str>,
    public: bool,
) -> Value {
    let id = new_object_id(user);
    let followers = format!("{}/followers", user.actor);
    let (to, cc) = if public {
        (json!([AS_PUBLIC]), json!([followers]))
    } else {
        (json!([followers]), json!([]))
    };
    let mut note = json!({
        "id": id,
        "type": "Note",
        "attributedTo": user.actor,
        "content": content,
        "published": now_rfc3339(),
        "to": to,
        "cc": cc,
    });
    let tags = extract_hashtags(content);
    if !tags.is_empty() {
        note["tag"] = Value::Array(tags);
    }
    if let Some(irt) = in_reply_to {
        note["inReplyTo"] = Value::String(irt.to_string());
    }
    note
}

pub fn msg_question(
    user: &User,
    content: &str,
    options: &[&str],
    end_secs: u64,
) -> Value {
    let mut q = msg_note(user, content, None, true);
    q["type"] = Value::String("Question".to_string());
    q["endTime"] = Value::String(
        time::OffsetDateTime::now_utc()
            .saturating_add(time::Duration::seconds(end_secs as i64))
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default()
            .into(),
    );
    q["oneOf"] = Value::Array(
        options
            .iter()
            .map(|o| {
                json!({"type": "Note", "name": o, "replies": {"type": "Collection", "totalItems": 0}})
            })
            .collect(),
    );
    q
}

/// Wraps an authored object in its Create activity with the same
/// addressing.
pub fn msg_create(user: &User, object: &Value) -> Value {
    let obj_id = object.get("id").and_then(|i| i.as_str()).unwrap_or_default();
    json!({
        "@context": AS_CONTEXT,
        "id": format!("{obj_id}#Create"),
        "type": "Create",
        "actor": user.actor,
        "to": object.get("to").cloned().unwrap_or(Value::Null),
        "cc": object.get("cc").cloned().unwrap_or(Value::Null),
        "object": object,
    })
}

pub fn msg_follow(user: &User, actor: &str) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": new_object_id(user),
        "type": "Follow",
        "actor": user.actor,
        "object": actor,
        "to": [actor],
    })
}

/// A Like or Announce of an object.
pub fn msg_admiration(user: &User, object_id: &str, ty: &str) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": new_object_id(user),
        "type": ty,
        "actor": user.actor,
        "object": object_id,
        "to": [AS_PUBLIC],
        "cc": [format!("{}/followers", user.actor)],
    })
}

pub fn msg_undo(user: &User, object: Value) -> Value {
    let to = object.get("to").cloned().unwrap_or(Value::Null);
    json!({
        "@context": AS_CONTEXT,
        "id": new_object_id(user),
        "type": "Undo",
        "actor": user.actor,
        "object": object,
        "to": to,
    })
}

pub fn msg_delete(user: &User, id: &str) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": format!("{id}#Delete"),
        "type": "Delete",
        "actor": user.actor,
        "object": {"id": id, "type": "Tombstone"},
        "to": [AS_PUBLIC],
        "cc": [format!("{}/followers", user.actor)],
    })
}

pub fn msg_accept(user: &User, object: &Value, to: &str) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": new_object_id(user),
        "type": "Accept",
        "actor": user.actor,
        "object": object,
        "to": [to],
    })
}

pub fn msg_update(user: &User, object: &Value) -> Value {
    let obj_id = object.get("id").and_then(|i| i.as_str()).unwrap_or_default();
    json!({
        "@context": AS_CONTEXT,
        "id": format!("{obj_id}#Update-{}", tid()),
        "type": "Update",
        "actor": user.actor,
        "to": [AS_PUBLIC],
        "cc": [format!("{}/followers", user.actor)],
        "object": object,
    })
}

/// Publishes an authored note: stores it, indexes it (private, public,
/// instance, hashtags) and enqueues one delivery per follower inbox.
/// Returns the note id.
pub async fn publish_note(
    core: &Core,
    user: &User,
    content: &str,
    in_reply_to: Option<&str>,
    public: bool,
) -> Result<String> {
    let note = msg_note(user, content, in_reply_to, public);
    let id = note["id"].as_str().expect("authored note has id").to_string();

    timeline::timeline_add(&core.store, user, &id, &note)
        .map_err(|e| anyhow!("store note: {e}"))?;
    if public {
        timeline::timeline_add_public(&core.server, &core.store, user, &id)
            .map_err(|e| anyhow!("index note: {e}"))?;
        timeline::tag_index(&core.server, &id, &note)
            .map_err(|e| anyhow!("tag note: {e}"))?;
    }

    let create = msg_create(user, &note);
    let n = fan_out(core, user, &create).await?;
    info!("{} published {} ({n} deliveries)", user.uid, id);
    Ok(id)
}

/// Publishes a question and schedules its close.
pub async fn publish_question(
    core: &Core,
    user: &User,
    content: &str,
    options: &[&str],
    end_secs: u64,
) -> Result<String> {
    let q = msg_question(user, content, options, end_secs);
    let id = q["id"].as_str().expect("authored question has id").to_string();

    timeline::timeline_add(&core.store, user, &id, &q)
        .map_err(|e| anyhow!("store question: {e}"))?;
    timeline::timeline_add_public(&core.server, &core.store, user, &id)
        .map_err(|e| anyhow!("index question: {e}"))?;

    let create = msg_create(user, &q);
    fan_out(core, user, &create).await?;

    let task = json!({"task": "close_question", "user": user.uid, "id": id});
    core.queue
        .enqueue_at(
            JobKind::Task,
            Some(user.uid.as_str()),
            None,
            serde_json::to_vec(&task)?,
            None,
            crate::queue::now_ms() + (end_secs as i64) * 1000,
        )
        .await?;
    Ok(id)
}

/// Closes an expired question and announces the final state.
pub async fn close_question(core: &Core, user: &User, id: &str) -> Result<()> {
    let mut q = core
        .store
        .get(id)
        .map_err(|e| anyhow!("question {id}: {e}"))?;
    if q.get("closed").is_some() {
        return Ok(());
    }
    q["closed"] = Value::String(now_rfc3339());
    core.store
        .put_overwrite(id, &q)
        .map_err(|e| anyhow!("close question {id}: {e}"))?;

    let update = msg_update(user, &q);
    fan_out(core, user, &update).await?;
    info!("{} closed question {id}", user.uid);
    Ok(())
}

/// Starts following a remote actor.
pub async fn follow_actor(core: &Core, user: &User, actor: &str) -> Result<()> {
    let follow = msg_follow(user, actor);
    relations::following_add(user, actor, &follow)
        .map_err(|e| anyhow!("record following: {e}"))?;
    core.store
        .put(follow["id"].as_str().expect("follow has id"), &follow)
        .map_err(|e| anyhow!("store follow: {e}"))?;
    enqueue_output(core, user, &follow, actor).await?;
    Ok(())
}

/// Stops following a remote actor, undoing the original Follow.
pub async fn unfollow_actor(core: &Core, user: &User, actor: &str) -> Result<()> {
    let record = relations::following_get(user, actor)
        .map_err(|e| anyhow!("not following {actor}: {e}"))?;
    let follow = record.get("follow").cloned().unwrap_or(Value::Null);
    relations::following_del(user, actor).map_err(|e| anyhow!("drop following: {e}"))?;
    let undo = msg_undo(user, follow);
    enqueue_output(core, user, &undo, actor).await?;
    Ok(())
}

/// Likes or boosts an object, recording the relation locally and
/// notifying the author (and, for boosts, the user's followers).
pub async fn admire(core: &Core, user: &User, object_id: &str, like: bool) -> Result<()> {
    let ty = if like { "Like" } else { "Announce" };
    let kind = if like {
        relations::AdmireKind::Like
    } else {
        relations::AdmireKind::Announce
    };
    let msg = msg_admiration(user, object_id, ty);
    relations::admire(&core.store, object_id, &user.actor, kind)
        .map_err(|e| anyhow!("record admiration: {e}"))?;
    core.store
        .put(msg["id"].as_str().expect("admiration has id"), &msg)
        .map_err(|e| anyhow!("store admiration: {e}"))?;

    let object = core.store.get(object_id).ok();
    let author = object
        .as_ref()
        .and_then(timeline::get_atto)
        .map(str::to_string);
    if let Some(author) = &author {
        enqueue_output(core, user, &msg, author).await?;
    }
    if !like {
        fan_out(core, user, &msg).await?;
    }
    Ok(())
}

/// Accepts an inbound Follow.
pub async fn accept_follow(core: &Core, user: &User, follow: &Value) -> Result<()> {
    let Some(actor) = follow.get("actor").and_then(|a| a.as_str()) else {
        return Err(anyhow!("follow without actor"));
    };
    let accept = msg_accept(user, follow, actor);
    enqueue_output(core, user, &accept, actor).await?;
    Ok(())
}

/// Approves a pending follow request.
pub async fn approve_follow(core: &Core, user: &User, actor: &str) -> Result<()> {
    let follow = relations::pending_get(user, actor)
        .map_err(|e| anyhow!("no pending follow from {actor}: {e}"))?;
    relations::follower_add(user, actor).map_err(|e| anyhow!("add follower: {e}"))?;
    relations::pending_del(user, actor).map_err(|e| anyhow!("drop pending: {e}"))?;
    accept_follow(core, user, &follow).await
}

/// Retracts one of the user's own posts everywhere.
pub async fn delete_post(core: &Core, user: &User, id: &str) -> Result<()> {
    let delete = msg_delete(user, id);
    fan_out(core, user, &delete).await?;
    timeline::timeline_del(&core.store, user, id).map_err(|e| anyhow!("delete post: {e}"))?;
    Ok(())
}

/// Enqueues one delivery of an activity to a single actor.
async fn enqueue_output(core: &Core, user: &User, activity: &Value, actor: &str) -> Result<()> {
    let key_id = user.key_id();
    core.queue
        .enqueue(
            JobKind::Output,
            Some(user.uid.as_str()),
            Some(actor),
            serde_json::to_vec(activity)?,
            Some(key_id.as_str()),
        )
        .await
        .context("enqueue delivery")?;
    Ok(())
}

/// Enqueues one delivery per distinct target for an activity: every
/// follower's inbox (shared inboxes deduplicated through the cached
/// actor documents) plus explicitly addressed recipients.
pub async fn fan_out(core: &Core, user: &User, activity: &Value) -> Result<usize> {
    let followers_collection = format!("{}/followers", user.actor);
    let mut targets: BTreeSet<String> = BTreeSet::new();

    for follower in
        relations::follower_list(user).map_err(|e| anyhow!("list followers: {e}"))?
    {
        targets.insert(delivery_target(core, &follower));
    }
    for rcpt in extract_recipients(activity) {
        if rcpt == followers_collection || rcpt == user.actor {
            continue;
        }
        targets.insert(delivery_target(core, &rcpt));
    }

    let payload = serde_json::to_vec(activity)?;
    let key_id = user.key_id();
    let mut n = 0usize;
    for target in targets {
        core.queue
            .enqueue(
                JobKind::Output,
                Some(user.uid.as_str()),
                Some(target.as_str()),
                payload.clone(),
                Some(key_id.as_str()),
            )
            .await
            .context("enqueue delivery")?;
        n += 1;
    }
    debug!(
        "fan_out {} {}: {n} targets",
        user.uid,
        activity.get("id").and_then(|i| i.as_str()).unwrap_or("?")
    );
    Ok(n)
}

/// Best target for an actor: the inbox from their cached document
/// (shared inbox preferred), or the actor URL itself so the delivery
/// worker resolves it at send time.
fn delivery_target(core: &Core, actor: &str) -> String {
    if let Ok(doc) = core.store.get(actor) {
        if let Ok(doc) = serde_json::from_value::<ActorDoc>(doc) {
            if let Some(inbox) = doc.delivery_inbox() {
                return inbox.to_string();
            }
        }
    }
    actor.to_string()
}
