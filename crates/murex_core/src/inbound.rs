/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Inbound activity processing: the ingestion half of federation.
//! Activities arrive already signature-verified; processing
//! deduplicates against the object store, then dispatches on the
//! activity type to update timelines and relation sets. Redeliveries
//! by retrying peers are recognized and treated as success, never as
//! an error.

use crate::outbox;
use crate::queue::JobKind;
use crate::relations::{self, AdmireKind};
use crate::runtime::Core;
use crate::timeline;
use crate::user::{self, User};
use anyhow::{anyhow, Result};
use murex_protocol::NAMED_POSTLIKE_TYPES;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Processes an activity delivered to the shared inbox: every local
/// user it concerns gets their own pass.
pub async fn process_shared(core: &Core, activity: &Value) -> Result<()> {
    let Some(actor) = activity.get("actor").and_then(|a| a.as_str()) else {
        debug!("shared activity without actor, dropping");
        return Ok(());
    };

    let mut uids: BTreeSet<String> = BTreeSet::new();
    let user_prefix = format!("{}/users/", core.server.baseurl);
    for rcpt in crate::delivery::extract_recipients(activity) {
        if let Some(rest) = rcpt.strip_prefix(&user_prefix) {
            let uid = rest.split('/').next().unwrap_or_default();
            if !uid.is_empty() {
                uids.insert(uid.to_string());
            }
        }
    }
    for uid in user::user_list(&core.server)? {
        if uids.contains(&uid) {
            continue;
        }
        if let Ok(u) = User::open(&core.server, &uid) {
            if relations::is_following(&u, actor) {
                uids.insert(uid);
            }
        }
    }

    for uid in uids {
        let u = User::open(&core.server, &uid)?;
        process_for_user(core, &u, activity).await?;
    }
    Ok(())
}

/// Processes an activity for one local user.
pub async fn process_for_user(core: &Core, user: &User, activity: &Value) -> Result<()> {
    let ty = activity.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let actor = activity
        .get("actor")
        .and_then(|a| a.as_str())
        .unwrap_or_default();

    if actor.is_empty() && ty != "Delete" {
        debug!("activity without actor, dropping");
        return Ok(());
    }
    if core.server.is_instance_blocked(actor) {
        debug!("dropping activity from blocked instance: {actor}");
        return Ok(());
    }

    match ty {
        "Create" => handle_create(core, user, activity, actor).await,
        "Update" => handle_update(core, user, activity, actor),
        "Delete" => handle_delete(core, user, activity, actor),
        "Like" => handle_admiration(core, user, activity, actor, AdmireKind::Like).await,
        "Announce" => {
            handle_admiration(core, user, activity, actor, AdmireKind::Announce).await
        }
        "Follow" => handle_follow(core, user, activity, actor).await,
        "Accept" => handle_accept(user, activity, actor),
        "Reject" => handle_reject(user, actor),
        "Undo" => handle_undo(core, user, activity, actor),
        other => {
            debug!("ignoring activity type {other} from {actor}");
            Ok(())
        }
    }
}

async fn handle_create(core: &Core, user: &User, activity: &Value, actor: &str) -> Result<()> {
    let Some(obj) = activity.get("object").filter(|o| o.is_object()) else {
        debug!("Create without embedded object from {actor}, dropping");
        return Ok(());
    };
    let Some(id) = obj.get("id").and_then(|i| i.as_str()) else {
        debug!("Create without object id from {actor}, dropping");
        return Ok(());
    };
    let obj_ty = obj.get("type").and_then(|t| t.as_str()).unwrap_or("");

    // A named object of a type that may not carry a name is a poll
    // vote: counted against the question, never shown.
    if obj.get("name").and_then(|n| n.as_str()).is_some()
        && !NAMED_POSTLIKE_TYPES.contains(&obj_ty)
    {
        return handle_vote(core, user, obj, actor);
    }

    // A retrying peer delivering the same post again is a no-op, not
    // an error: at most one stored object and one index entry.
    if timeline::timeline_contains(&core.store, user, id) {
        debug!("duplicate delivery of {id}, ignoring");
        return Ok(());
    }

    timeline::timeline_add(&core.store, user, id, obj)
        .map_err(|e| anyhow!("timeline add {id}: {e}"))?;
    timeline::tag_index(&core.server, id, obj).map_err(|e| anyhow!("tag index {id}: {e}"))?;
    info!("{} new post {id} from {actor}", user.uid);

    // Keep the author's profile reasonably fresh without blocking
    // ingestion on a network round trip.
    if core.store.exists(actor) && crate::fetch::actor_stale(&core.store, actor) {
        let task = json!({"task": "actor_refresh", "actor": actor});
        core.queue
            .enqueue(JobKind::Task, None, None, serde_json::to_vec(&task)?, None)
            .await?;
    }
    Ok(())
}

fn handle_update(core: &Core, user: &User, activity: &Value, actor: &str) -> Result<()> {
    let Some(obj) = activity.get("object").filter(|o| o.is_object()) else {
        return Ok(());
    };
    let Some(id) = obj.get("id").and_then(|i| i.as_str()) else {
        return Ok(());
    };
    // Only the author may edit their object.
    match core.store.get(id) {
        Ok(stored) => {
            let owner = timeline::get_atto(&stored).unwrap_or_default();
            if owner != actor {
                warn!("{actor} tried to update {id} owned by {owner}, dropping");
                return Ok(());
            }
        }
        Err(_) => return Ok(()),
    }
    core.store
        .put_overwrite(id, obj)
        .map_err(|e| anyhow!("update {id}: {e}"))?;
    debug!("{} updated {id}", user.uid);
    Ok(())
}

fn handle_delete(core: &Core, user: &User, activity: &Value, actor: &str) -> Result<()> {
    let id = match activity.get("object") {
        Some(Value::String(s)) => s.as_str(),
        Some(obj) => obj.get("id").and_then(|i| i.as_str()).unwrap_or_default(),
        None => "",
    };
    if id.is_empty() {
        return Ok(());
    }
    match core.store.get(id) {
        Ok(stored) => {
            let owner = timeline::get_atto(&stored).unwrap_or(actor);
            if !actor.is_empty() && owner != actor && id != actor {
                warn!("{actor} tried to delete {id} owned by {owner}, dropping");
                return Ok(());
            }
        }
        // Deleting what we never had is a no-op.
        Err(_) => return Ok(()),
    }
    timeline::timeline_del(&core.store, user, id).map_err(|e| anyhow!("delete {id}: {e}"))?;
    debug!("{} deleted {id}", user.uid);
    Ok(())
}

async fn handle_admiration(
    core: &Core,
    user: &User,
    activity: &Value,
    actor: &str,
    kind: AdmireKind,
) -> Result<()> {
    let Some(activity_id) = activity.get("id").and_then(|i| i.as_str()) else {
        return Ok(());
    };
    let Some(object_id) = activity.get("object").and_then(|o| o.as_str()) else {
        return Ok(());
    };
    if core.store.exists(activity_id) {
        debug!("duplicate admiration {activity_id}, ignoring");
        return Ok(());
    }
    // Remember the admiration activity itself so an Undo can find it
    // and a redelivery is recognized.
    core.store
        .put(activity_id, activity)
        .map_err(|e| anyhow!("store admiration: {e}"))?;
    timeline::timeline_admire(&core.store, user, object_id, actor, kind)
        .map_err(|e| anyhow!("admire {object_id}: {e}"))?;

    // A boost of something we have never seen pulls the object in.
    if kind == AdmireKind::Announce && !core.store.exists(object_id) {
        let task = json!({"task": "object_request", "user": user.uid, "id": object_id});
        core.queue
            .enqueue(
                JobKind::Task,
                Some(user.uid.as_str()),
                None,
                serde_json::to_vec(&task)?,
                None,
            )
            .await?;
    }
    Ok(())
}

async fn handle_follow(core: &Core, user: &User, activity: &Value, actor: &str) -> Result<()> {
    let object = activity.get("object").and_then(|o| o.as_str()).unwrap_or("");
    if object != user.actor {
        debug!("Follow for {object} delivered to {}, dropping", user.uid);
        return Ok(());
    }
    if let Some(id) = activity.get("id").and_then(|i| i.as_str()) {
        core.store
            .put(id, activity)
            .map_err(|e| anyhow!("store follow: {e}"))?;
    }

    if user.config.approve_followers && !relations::follower_check(user, actor) {
        relations::pending_add(user, actor, activity)
            .map_err(|e| anyhow!("pending follow: {e}"))?;
        info!("{} has a pending follow request from {actor}", user.uid);
        return Ok(());
    }

    // Re-follows are idempotent; the Accept is re-sent either way
    // because the remote may have missed it.
    relations::follower_add(user, actor).map_err(|e| anyhow!("add follower: {e}"))?;
    outbox::accept_follow(core, user, activity).await?;
    info!("{} is now followed by {actor}", user.uid);
    Ok(())
}

fn handle_accept(user: &User, activity: &Value, actor: &str) -> Result<()> {
    // The Accept's object is our Follow; its actor is the account we
    // asked to follow.
    let accepted = relations::following_set_accepted(user, actor)
        .map_err(|e| anyhow!("confirm following: {e}"))?;
    if accepted {
        info!("{} now follows {actor}", user.uid);
    } else {
        debug!(
            "Accept from {actor} without a matching follow ({})",
            activity.get("id").and_then(|i| i.as_str()).unwrap_or("?")
        );
    }
    Ok(())
}

fn handle_reject(user: &User, actor: &str) -> Result<()> {
    if relations::following_del(user, actor).map_err(|e| anyhow!("drop following: {e}"))? {
        info!("{}'s follow was rejected by {actor}", user.uid);
    }
    Ok(())
}

fn handle_undo(core: &Core, user: &User, activity: &Value, actor: &str) -> Result<()> {
    let Some(inner) = activity.get("object") else {
        return Ok(());
    };
    let inner_ty = inner.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match inner_ty {
        "Like" | "Announce" => {
            let Some(object_id) = inner.get("object").and_then(|o| o.as_str()) else {
                return Ok(());
            };
            let kind = if inner_ty == "Like" {
                AdmireKind::Like
            } else {
                AdmireKind::Announce
            };
            relations::unadmire(&core.store, object_id, actor, kind)
                .map_err(|e| anyhow!("unadmire: {e}"))?;
            if let Some(id) = inner.get("id").and_then(|i| i.as_str()) {
                core.store.delete(id).map_err(|e| anyhow!("drop admiration: {e}"))?;
            }
            debug!("{actor} undid their {inner_ty}");
        }
        "Follow" => {
            if relations::follower_del(user, actor)
                .map_err(|e| anyhow!("drop follower: {e}"))?
            {
                info!("{} lost follower {actor}", user.uid);
            }
        }
        other => debug!("ignoring Undo of {other}"),
    }
    Ok(())
}

/// Counts a poll vote: one per actor, matched against the question's
/// options, only while the question is open and ours.
fn handle_vote(core: &Core, user: &User, obj: &Value, actor: &str) -> Result<()> {
    let Some(question_id) = obj.get("inReplyTo").and_then(|i| i.as_str()) else {
        return Ok(());
    };
    let Ok(mut question) = core.store.get(question_id) else {
        return Ok(());
    };
    if question.get("type").and_then(|t| t.as_str()) != Some("Question") {
        return Ok(());
    }
    if timeline::get_atto(&question) != Some(user.actor.as_str()) {
        return Ok(());
    }
    if question.get("closed").is_some() {
        debug!("vote on closed question {question_id} from {actor}, ignoring");
        return Ok(());
    }
    if !relations::record_vote(&core.store, question_id, actor)
        .map_err(|e| anyhow!("record vote: {e}"))?
    {
        debug!("{actor} already voted on {question_id}");
        return Ok(());
    }

    let choice = obj.get("name").and_then(|n| n.as_str()).unwrap_or("");
    let mut counted = false;
    for key in ["oneOf", "anyOf"] {
        let Some(options) = question.get_mut(key).and_then(|o| o.as_array_mut()) else {
            continue;
        };
        for option in options {
            if option.get("name").and_then(|n| n.as_str()) == Some(choice) {
                let total = option
                    .pointer("/replies/totalItems")
                    .and_then(|t| t.as_u64())
                    .unwrap_or(0);
                option["replies"]["totalItems"] = json!(total + 1);
                counted = true;
            }
        }
    }
    if counted {
        core.store
            .put_overwrite(question_id, &question)
            .map_err(|e| anyhow!("store vote: {e}"))?;
        info!("{} got a vote for {choice:?} on {question_id}", user.uid);
    }
    Ok(())
}

/// Envelope persisted as an Input queue payload.
pub fn input_payload(user: Option<&str>, activity: &Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "user": user,
        "activity": activity,
    }))
    .expect("json value serializes")
}

/// Inverse of `input_payload`.
pub fn parse_input_payload(bytes: &[u8]) -> Result<(Option<String>, Value)> {
    let v: Value = serde_json::from_slice(bytes)?;
    let user = v.get("user").and_then(|u| u.as_str()).map(str::to_string);
    let activity = v
        .get("activity")
        .cloned()
        .ok_or_else(|| anyhow!("input payload without activity"))?;
    Ok((user, activity))
}
