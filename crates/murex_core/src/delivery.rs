/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Outbound delivery: resolve the target inbox, sign the request with
//! the sending actor's key and POST the activity. Failures come back
//! classified so the worker can decide between retry and dead-letter.

use crate::error::{classify_status, DeliveryError};
use crate::fetch::Fetcher;
use crate::http_retry::send_with_retry;
use crate::http_sig::{sign_request_rsa_sha256, DEFAULT_SIGNED_HEADERS};
use crate::object_store::ObjectStore;
use anyhow::anyhow;
use http::{HeaderMap, Method, Uri};
use murex_protocol::{ActorDoc, ACTIVITY_CTYPE, AS_PUBLIC};
use serde_json::Value;

#[derive(Clone)]
pub struct Delivery {
    fetcher: Fetcher,
}

impl Delivery {
    pub fn new(fetcher: Fetcher) -> Self {
        Self { fetcher }
    }

    /// Resolves a queue target to a concrete inbox URL. Targets that
    /// already are inboxes pass through; actor URLs resolve through
    /// the cached actor document, preferring the shared inbox.
    pub async fn resolve_inbox(
        &self,
        store: &ObjectStore,
        target: &str,
    ) -> Result<String, DeliveryError> {
        if target.contains("/inbox") {
            return Ok(target.to_string());
        }
        let doc = self
            .fetcher
            .actor_request(store, target)
            .await
            .map_err(|e| {
                let err_str = format!("{e:#}");
                // Gone/blocked peers are permanent; anything else may
                // be a hiccup.
                if err_str.contains("404") || err_str.contains("410") || err_str.contains("403")
                {
                    DeliveryError::permanent(e)
                } else {
                    DeliveryError::transient(e)
                }
            })?;
        let doc: ActorDoc = serde_json::from_value(doc)
            .map_err(|e| DeliveryError::permanent(anyhow!("parse actor {target}: {e}")))?;
        doc.delivery_inbox()
            .map(str::to_string)
            .ok_or_else(|| DeliveryError::permanent(anyhow!("actor {target} missing inbox")))
    }

    /// Signs and POSTs an activity to an inbox. A fresh signature is
    /// produced on every call; signatures are time-bound and must not
    /// be reused across retries.
    pub async fn deliver_json(
        &self,
        private_key_pem: &str,
        key_id: &str,
        inbox_url: &str,
        body: &[u8],
    ) -> Result<(), DeliveryError> {
        let uri: Uri = inbox_url
            .parse()
            .map_err(|e| DeliveryError::permanent(anyhow!("parse inbox url {inbox_url}: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert("Accept", ACTIVITY_CTYPE.parse().expect("static header"));
        headers.insert("Content-Type", ACTIVITY_CTYPE.parse().expect("static header"));

        sign_request_rsa_sha256(
            private_key_pem,
            key_id,
            &Method::POST,
            &uri,
            &mut headers,
            body,
            &DEFAULT_SIGNED_HEADERS,
        )
        .map_err(DeliveryError::permanent)?;

        let client = self.fetcher.client();
        let mut req = client.post(inbox_url);
        for (k, v) in headers.iter() {
            req = req.header(k.as_str(), v.to_str().unwrap_or_default());
        }

        let resp = send_with_retry(
            || req.try_clone().expect("clonable request").body(body.to_vec()),
            3,
        )
        .await
        .map_err(DeliveryError::transient)?;

        let status = resp.status();
        if status.is_success() || status.as_u16() == 202 {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        Err(DeliveryError {
            class: classify_status(status.as_u16()),
            source: anyhow!("delivery failed: {status} {text}"),
        })
    }
}

/// Every addressed recipient of an activity, the public pseudo-actor
/// excluded.
pub fn extract_recipients(activity: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_field(activity, "to", &mut out);
    collect_field(activity, "cc", &mut out);
    out.retain(|v| v != AS_PUBLIC);
    out.sort();
    out.dedup();
    out
}

fn collect_field(activity: &Value, field: &str, out: &mut Vec<String>) {
    let Some(v) = activity.get(field) else { return };
    match v {
        Value::String(s) => out.push(s.clone()),
        Value::Array(arr) => {
            for item in arr {
                if let Value::String(s) = item {
                    out.push(s.clone());
                }
            }
        }
        _ => {}
    }
}

pub fn is_public_activity(activity: &Value) -> bool {
    fn has_public(v: &Value) -> bool {
        match v {
            Value::String(s) => s == AS_PUBLIC,
            Value::Array(arr) => arr.iter().any(has_public),
            _ => false,
        }
    }
    activity.get("to").map(has_public).unwrap_or(false)
        || activity.get("cc").map(has_public).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn recipients_exclude_public_and_dedup() {
        let activity = json!({
            "to": [AS_PUBLIC, "https://remote.example/users/bob"],
            "cc": ["https://remote.example/users/bob",
                   "https://social.example/users/alice/followers"],
        });
        assert_eq!(
            extract_recipients(&activity),
            vec![
                "https://remote.example/users/bob".to_string(),
                "https://social.example/users/alice/followers".to_string(),
            ]
        );
        assert!(is_public_activity(&activity));
        assert!(!is_public_activity(&json!({"to": ["https://x.example/u/a"]})));
    }

    #[tokio::test]
    async fn inbox_targets_pass_through_without_resolution() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let delivery = Delivery::new(Fetcher::new(std::time::Duration::from_millis(200)));
        let inbox = delivery
            .resolve_inbox(&store, "https://remote.example/users/bob/inbox")
            .await
            .unwrap();
        assert_eq!(inbox, "https://remote.example/users/bob/inbox");
    }

    #[tokio::test]
    async fn actor_targets_resolve_via_cached_document() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let actor = "https://remote.example/users/bob";
        store
            .put(
                actor,
                &json!({
                    "id": actor,
                    "inbox": format!("{actor}/inbox"),
                    "endpoints": {"sharedInbox": "https://remote.example/inbox"},
                    "publicKey": {"id": format!("{actor}#main-key"), "publicKeyPem": "pem"},
                }),
            )
            .unwrap();

        let delivery = Delivery::new(Fetcher::new(std::time::Duration::from_millis(200)));
        let inbox = delivery.resolve_inbox(&store, actor).await.unwrap();
        assert_eq!(inbox, "https://remote.example/inbox");
    }
}
