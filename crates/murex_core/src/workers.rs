/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The worker pool. A fixed number of workers drain the queue: claim
//! an item (the queue's per-user lease keeps one worker per user),
//! run the handler for its kind, then ack, retry or dead-letter based
//! on the failure class. No handler error ever escapes a loop
//! iteration; idle workers park on the queue's notifier instead of
//! busy-polling.

use crate::error::{DeliveryError, FailureClass};
use crate::inbound;
use crate::outbox;
use crate::queue::{Job, JobKind};
use crate::runtime::Core;
use crate::timeline;
use crate::user::User;
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const IDLE_TICK: Duration = Duration::from_secs(2);

/// Spawns `n` workers. The pool size is fixed for the process
/// lifetime.
pub fn start_workers(core: Arc<Core>, n: usize, shutdown: watch::Receiver<bool>) {
    let n = n.max(1);
    info!("starting {n} queue workers");
    for i in 0..n {
        let core = core.clone();
        let shutdown = shutdown.clone();
        let name = format!("worker-{i}");
        tokio::spawn(async move {
            run_loop(core, name, shutdown).await;
        });
    }
}

async fn run_loop(core: Arc<Core>, name: String, mut shutdown: watch::Receiver<bool>) {
    let notify = core.queue.notify_handle();
    loop {
        if *shutdown.borrow() {
            break;
        }
        match core.queue.dequeue_next(&name).await {
            Ok(Some(job)) => {
                let outcome = handle_job(&core, &job).await;
                settle(&core, &job, outcome).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(IDLE_TICK) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                warn!("{name}: queue error: {e:#}");
                tokio::time::sleep(IDLE_TICK).await;
            }
        }
    }
    debug!("{name} stopped");
}

/// Translates a handler outcome into the queue transition.
async fn settle(core: &Core, job: &Job, outcome: Result<(), DeliveryError>) {
    match outcome {
        Ok(()) => {
            if let Err(e) = core.queue.ack(job).await {
                warn!("ack {}: {e:#}", job.id);
            }
        }
        Err(failure) => {
            let attempt_no = job.attempt.saturating_add(1);
            let max = core.settings.max_attempts(job.kind);
            let err = format!("{:#}", failure.source);
            let verdict = if failure.class == FailureClass::Permanent {
                core.queue.dead_letter(job, &err).await
            } else if attempt_no >= max {
                core.queue
                    .dead_letter(job, &format!("retries exhausted: {err}"))
                    .await
            } else {
                let delay = core.settings.backoff(attempt_no);
                debug!(
                    "job {} attempt {attempt_no}/{max} failed, retry in {delay:?}: {err}",
                    job.id
                );
                core.queue.retry(job, delay, &err).await
            };
            if let Err(e) = verdict {
                warn!("settle {}: {e:#}", job.id);
            }
        }
    }
}

async fn handle_job(core: &Core, job: &Job) -> Result<(), DeliveryError> {
    match job.kind {
        JobKind::Output => handle_output(core, job).await,
        JobKind::Input => handle_input(core, job).await.map_err(DeliveryError::transient),
        JobKind::Task => handle_task(core, job).await.map_err(DeliveryError::transient),
    }
}

/// Signs and delivers an outbound activity. The signature is rebuilt
/// on every attempt from the key reference the item carries.
async fn handle_output(core: &Core, job: &Job) -> Result<(), DeliveryError> {
    let target = job
        .target
        .as_deref()
        .ok_or_else(|| DeliveryError::permanent(anyhow!("output job without target")))?;
    let uid = job
        .user
        .as_deref()
        .ok_or_else(|| DeliveryError::permanent(anyhow!("output job without user")))?;
    let user = User::open(&core.server, uid)
        .map_err(DeliveryError::permanent)?;
    let key_id = job.key_id.clone().unwrap_or_else(|| user.key_id());

    let inbox = core.delivery.resolve_inbox(&core.store, target).await?;
    core.delivery
        .deliver_json(&user.identity.private_key_pem, &key_id, &inbox, &job.payload)
        .await?;
    debug!("delivered {} to {inbox}", job.id);
    Ok(())
}

/// Processes a verified inbound activity into local state.
async fn handle_input(core: &Core, job: &Job) -> Result<()> {
    let (uid, activity) = inbound::parse_input_payload(&job.payload)?;
    match uid.as_deref().or(job.user.as_deref()) {
        Some(uid) => {
            let user = User::open(&core.server, uid)?;
            inbound::process_for_user(core, &user, &activity).await
        }
        None => inbound::process_shared(core, &activity).await,
    }
}

/// Runs a scheduled housekeeping task. These live on the shared or a
/// user scope and must be safe to retry on another worker.
async fn handle_task(core: &Core, job: &Job) -> Result<()> {
    let payload: Value = serde_json::from_slice(&job.payload).context("parse task payload")?;
    let task = payload.get("task").and_then(|t| t.as_str()).unwrap_or("");
    match task {
        "close_question" => {
            let (user, id) = task_user_and_id(core, &payload)?;
            outbox::close_question(core, &user, &id).await
        }
        "object_request" => {
            let (user, id) = task_user_and_id(core, &payload)?;
            let obj = core
                .fetcher
                .fetch_json_signed(&user.identity.private_key_pem, &user.key_id(), &id)
                .await?;
            let Some(obj_id) = obj.get("id").and_then(|i| i.as_str()) else {
                return Err(anyhow!("fetched object {id} has no id"));
            };
            if obj.get("type").and_then(|t| t.as_str()) == Some("Tombstone") {
                debug!("requested object {id} is a tombstone");
                return Ok(());
            }
            timeline::timeline_add(&core.store, &user, obj_id, &obj)
                .map_err(|e| anyhow!("timeline add {obj_id}: {e}"))?;
            Ok(())
        }
        "actor_refresh" => {
            let actor = payload
                .get("actor")
                .and_then(|a| a.as_str())
                .ok_or_else(|| anyhow!("actor_refresh without actor"))?;
            core.fetcher.actor_refresh(&core.store, actor).await?;
            Ok(())
        }
        other => {
            warn!("unknown task kind {other:?}, dropping");
            Ok(())
        }
    }
}

fn task_user_and_id(core: &Core, payload: &Value) -> Result<(User, String)> {
    let uid = payload
        .get("user")
        .and_then(|u| u.as_str())
        .ok_or_else(|| anyhow!("task without user"))?;
    let id = payload
        .get("id")
        .and_then(|i| i.as_str())
        .ok_or_else(|| anyhow!("task without id"))?;
    let user = User::open(&core.server, uid)?;
    Ok((user, id.to_string()))
}
