/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The federation HTTP surface: webfinger, actor documents, public
//! collections and the inbox endpoints. Inbound activities are
//! verified here (digest, date, signature) and then enqueued; the
//! response is 202 and the worker pool does the rest.

use crate::http_sig::{
    build_signing_string, parse_signature_header, verify_date, verify_digest_if_present,
    verify_signature_rsa_sha256, ResolvedKey,
};
use crate::inbound;
use crate::object_store::is_fingerprint;
use crate::queue::JobKind;
use crate::runtime::Core;
use crate::timeline::{self, Paging};
use crate::user::User;
use crate::webfinger::local_jrd;
use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    response::IntoResponse,
    routing::any,
    Router,
};
use murex_protocol::{
    Actor, ActorEndpoints, OrderedCollection, OrderedCollectionPage, PublicKey, ACTIVITY_CTYPE,
    AS_CONTEXT, SECURITY_CONTEXT,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn router(core: Arc<Core>) -> Router {
    Router::new()
        .fallback(any(move |req| {
            let core = core.clone();
            async move { handle_request(&core, req).await }
        }))
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
}

pub async fn handle_request(core: &Core, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path().trim_end_matches('/').to_string();
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    match (req.method().as_str(), &segments[..]) {
        ("GET", &["healthz"]) => simple(StatusCode::OK, "ok"),
        ("GET", &[".well-known", "webfinger"]) => webfinger_get(core, req),
        ("GET", &["users", uid]) => actor_get(core, uid),
        ("GET", &["users", uid, "outbox"]) => outbox_get(core, uid, req),
        ("GET", &["users", uid, "followers"]) => collection_get(core, uid, "followers"),
        ("GET", &["users", uid, "following"]) => collection_get(core, uid, "following"),
        ("GET", &["users", uid, "p", _]) => object_get(core, uid, &path),
        ("POST", &["inbox"]) => inbox_post(core, None, req).await,
        ("POST", &["users", uid, "inbox"]) => {
            let uid = uid.to_string();
            inbox_post(core, Some(uid), req).await
        }
        ("GET", &["inbox"]) | ("GET", &["users", _, "inbox"]) => {
            simple(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => simple(StatusCode::NOT_FOUND, "not found"),
    }
}

fn simple(status: StatusCode, msg: &str) -> Response<Body> {
    (status, msg.to_string()).into_response()
}

fn json_activity<T: Serialize>(body: &T) -> Response<Body> {
    (
        StatusCode::OK,
        [("Content-Type", ACTIVITY_CTYPE)],
        serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string()),
    )
        .into_response()
}

fn jrd<T: Serialize>(body: &T) -> Response<Body> {
    (
        StatusCode::OK,
        [("Content-Type", "application/jrd+json")],
        serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string()),
    )
        .into_response()
}

fn query_param(req: &Request<Body>, key: &str) -> Option<String> {
    let prefix = format!("{key}=");
    req.uri()
        .query()?
        .split('&')
        .find(|p| p.starts_with(&prefix))
        .and_then(|p| p.split_once('='))
        .map(|(_, v)| urlencoding::decode(v).map(|s| s.into_owned()).unwrap_or_default())
}

fn webfinger_get(core: &Core, req: Request<Body>) -> Response<Body> {
    let Some(resource) = query_param(&req, "resource") else {
        return simple(StatusCode::BAD_REQUEST, "missing resource");
    };
    match local_jrd(&core.server, &resource) {
        Some(body) => jrd(&body),
        None => simple(StatusCode::NOT_FOUND, "not found"),
    }
}

pub fn build_local_actor(core: &Core, user: &User) -> Actor {
    let id = user.actor.clone();
    Actor {
        context: vec![AS_CONTEXT.to_string(), SECURITY_CONTEXT.to_string()],
        ty: "Person".to_string(),
        preferredUsername: user.uid.clone(),
        name: user.config.name.clone().or_else(|| Some(user.uid.clone())),
        summary: user.config.summary.clone(),
        published: user.config.published_ms.and_then(ms_to_rfc3339),
        manually_approves_followers: Some(user.config.approve_followers),
        inbox: format!("{id}/inbox"),
        outbox: format!("{id}/outbox"),
        followers: format!("{id}/followers"),
        following: format!("{id}/following"),
        endpoints: ActorEndpoints {
            shared_inbox: format!("{}/inbox", core.server.baseurl),
        },
        publicKey: PublicKey {
            id: format!("{id}#main-key"),
            owner: id.clone(),
            publicKeyPem: user.identity.public_key_pem.clone(),
        },
        id,
    }
}

fn actor_get(core: &Core, uid: &str) -> Response<Body> {
    let Ok(user) = User::open(&core.server, uid) else {
        return simple(StatusCode::NOT_FOUND, "not found");
    };
    json_activity(&build_local_actor(core, &user))
}

/// Public outbox: an OrderedCollection, paged with the same max_id
/// cursors the index uses internally.
fn outbox_get(core: &Core, uid: &str, req: Request<Body>) -> Response<Body> {
    let Ok(user) = User::open(&core.server, uid) else {
        return simple(StatusCode::NOT_FOUND, "not found");
    };
    let outbox_id = format!("{}/outbox", user.actor);
    let index = user.public_index();

    if query_param(&req, "page").is_none() {
        return json_activity(&OrderedCollection {
            context: AS_CONTEXT.to_string(),
            id: outbox_id.clone(),
            ty: "OrderedCollection".to_string(),
            totalItems: index.len() as u64,
            first: Some(format!("{outbox_id}?page=true")),
        });
    }

    let max_id = query_param(&req, "max_id").filter(|v| is_fingerprint(v));
    let paging = Paging {
        max_id: max_id.clone(),
        ..Default::default()
    };
    let items = match timeline::assemble(&core.server, &core.store, &index, None, &paging) {
        Ok(items) => items,
        Err(e) => {
            debug!("outbox assemble failed for {uid}: {e}");
            return simple(StatusCode::INTERNAL_SERVER_ERROR, "assemble failed");
        }
    };
    let next = items
        .last()
        .and_then(|m| m.get("id").and_then(|i| i.as_str()))
        .map(|last| {
            format!(
                "{outbox_id}?page=true&max_id={}",
                crate::object_store::fingerprint(last)
            )
        });
    let page_id = match &max_id {
        Some(m) => format!("{outbox_id}?page=true&max_id={m}"),
        None => format!("{outbox_id}?page=true"),
    };
    json_activity(&OrderedCollectionPage {
        context: AS_CONTEXT.to_string(),
        id: page_id,
        ty: "OrderedCollectionPage".to_string(),
        partOf: outbox_id,
        orderedItems: items,
        next,
    })
}

/// Follower/following collections expose their size, not their
/// members.
fn collection_get(core: &Core, uid: &str, which: &str) -> Response<Body> {
    let Ok(user) = User::open(&core.server, uid) else {
        return simple(StatusCode::NOT_FOUND, "not found");
    };
    let total = match which {
        "followers" => crate::relations::follower_list(&user).map(|l| l.len()),
        _ => crate::relations::following_list(&user).map(|l| l.len()),
    }
    .unwrap_or(0);
    json_activity(&OrderedCollection {
        context: AS_CONTEXT.to_string(),
        id: format!("{}/{which}", user.actor),
        ty: "OrderedCollection".to_string(),
        totalItems: total as u64,
        first: None,
    })
}

/// Dereference of a local object id; only public posts are served.
fn object_get(core: &Core, uid: &str, path: &str) -> Response<Body> {
    let Ok(_user) = User::open(&core.server, uid) else {
        return simple(StatusCode::NOT_FOUND, "not found");
    };
    let id = format!("{}{}", core.server.baseurl, path);
    let Ok(obj) = core.store.get(&id) else {
        return simple(StatusCode::NOT_FOUND, "not found");
    };
    if !crate::delivery::is_public_activity(&obj) {
        return simple(StatusCode::NOT_FOUND, "not found");
    }
    json_activity(&obj)
}

/// Inbox POST: digest, date and signature checks, then enqueue for
/// processing and answer 202. Verification failures are bounded
/// status codes, never crashes.
async fn inbox_post(core: &Core, uid: Option<String>, req: Request<Body>) -> Response<Body> {
    if let Some(uid) = uid.as_deref() {
        if User::open(&core.server, uid).is_err() {
            return simple(StatusCode::NOT_FOUND, "not found");
        }
    }

    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid body"),
    };

    let key = match verify_inbox_request(core, &parts, &body_bytes).await {
        Ok(k) => k,
        Err(resp) => return resp,
    };

    if core.server.is_instance_blocked(&key.actor_url) {
        debug!("rejecting blocked instance actor {}", key.actor_url);
        return simple(StatusCode::FORBIDDEN, "blocked");
    }

    let activity_id = crate::queue::activity_id_from_bytes(&body_bytes).unwrap_or_default();
    debug!("inbox: {activity_id} from {}", key.actor_url);

    let activity: serde_json::Value = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid json"),
    };

    // The signer must be the activity's actor; anything else is an
    // unauthenticated relay attempt.
    if let Some(actor) = activity.get("actor").and_then(|a| a.as_str()) {
        if actor != key.actor_url {
            debug!("signer {} does not match actor {actor}", key.actor_url);
            return simple(StatusCode::UNAUTHORIZED, "actor mismatch");
        }
    }

    let payload = inbound::input_payload(uid.as_deref(), &activity);
    if let Err(e) = core
        .queue
        .enqueue(JobKind::Input, uid.as_deref(), None, payload, None)
        .await
    {
        info!("inbox enqueue failed: {e:#}");
        return simple(StatusCode::SERVICE_UNAVAILABLE, "queue unavailable");
    }
    simple(StatusCode::ACCEPTED, "accepted")
}

async fn verify_inbox_request(
    core: &Core,
    parts: &http::request::Parts,
    body: &[u8],
) -> Result<ResolvedKey, Response<Body>> {
    if let Err(e) = verify_digest_if_present(&parts.headers, body) {
        return Err(simple(StatusCode::UNAUTHORIZED, &format!("digest invalid: {e}")));
    }
    if let Err(e) = verify_date(&parts.headers, core.max_date_skew()) {
        return Err(simple(StatusCode::UNAUTHORIZED, &format!("date invalid: {e}")));
    }

    let Some(sig_header) = parts
        .headers
        .get("Signature")
        .or_else(|| parts.headers.get("signature"))
        .and_then(|v| v.to_str().ok())
    else {
        return Err(simple(StatusCode::UNAUTHORIZED, "missing Signature header"));
    };

    let sig = match parse_signature_header(sig_header) {
        Ok(v) => v,
        Err(e) => return Err(simple(StatusCode::UNAUTHORIZED, &format!("bad Signature: {e}"))),
    };
    let signing_string =
        match build_signing_string(&parts.method, &parts.uri, &parts.headers, &sig.headers) {
            Ok(s) => s,
            Err(e) => {
                return Err(simple(
                    StatusCode::UNAUTHORIZED,
                    &format!("bad signed headers: {e}"),
                ))
            }
        };
    let key = match core.resolver.resolve_key(&sig.key_id).await {
        Ok(k) => k,
        Err(e) => {
            return Err(simple(
                StatusCode::UNAUTHORIZED,
                &format!("key resolve failed: {e}"),
            ))
        }
    };
    if let Err(e) = verify_signature_rsa_sha256(&key.public_key_pem, &signing_string, &sig.signature)
    {
        return Err(simple(
            StatusCode::UNAUTHORIZED,
            &format!("signature invalid: {e}"),
        ));
    }
    Ok(key)
}

fn ms_to_rfc3339(ms: i64) -> Option<String> {
    let secs = ms.checked_div(1000)?;
    let dt = time::OffsetDateTime::from_unix_timestamp(secs).ok()?;
    dt.format(&time::format_description::well_known::Rfc3339).ok()
}
