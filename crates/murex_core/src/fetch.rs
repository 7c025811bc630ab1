/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Remote object and actor retrieval. Fetched actor documents are
//! cached in the object store under their own id, so repeated
//! verification and delivery against the same actor is local until
//! the cache goes stale.

use crate::http_retry::send_with_retry;
use crate::http_sig::{sign_request_rsa_sha256, GET_SIGNED_HEADERS};
use crate::object_store::ObjectStore;
use anyhow::{anyhow, Context, Result};
use http::{HeaderMap, Method, Uri};
use murex_protocol::ACTIVITY_ACCEPT;
use serde_json::Value;
use std::time::Duration;

/// Cached actor documents are refreshed after this long (36 hours).
pub const ACTOR_REFRESH_SECS: u64 = 36 * 3600;

pub const USER_AGENT: &str = concat!("murex/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Plain activity GET with bounded in-call retries.
    pub async fn fetch_json(&self, url: &str) -> Result<Value> {
        let resp = send_with_retry(
            || self.client.get(url).header("Accept", ACTIVITY_ACCEPT),
            3,
        )
        .await
        .with_context(|| format!("fetch {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("fetch {url}: status {status}"));
        }
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).with_context(|| format!("parse json from {url}"))
    }

    /// Signed activity GET; some instances require authorized fetch.
    /// Falls back to a plain GET when signing or the signed request
    /// fails.
    pub async fn fetch_json_signed(
        &self,
        private_key_pem: &str,
        key_id: &str,
        url: &str,
    ) -> Result<Value> {
        let Ok(uri) = url.parse::<Uri>() else {
            return self.fetch_json(url).await;
        };
        let mut headers = HeaderMap::new();
        headers.insert("Accept", ACTIVITY_ACCEPT.parse().expect("static header"));
        if sign_request_rsa_sha256(
            private_key_pem,
            key_id,
            &Method::GET,
            &uri,
            &mut headers,
            &[],
            &GET_SIGNED_HEADERS,
        )
        .is_err()
        {
            return self.fetch_json(url).await;
        }

        let mut req = self.client.get(url).header("Accept", ACTIVITY_ACCEPT);
        for (k, v) in headers.iter() {
            req = req.header(k.as_str(), v.to_str().unwrap_or_default());
        }
        let signed = send_with_retry(|| req.try_clone().expect("clonable request"), 3).await;
        match signed {
            Ok(resp) if resp.status().is_success() => {
                let bytes = resp.bytes().await?;
                serde_json::from_slice(&bytes).with_context(|| format!("parse json from {url}"))
            }
            _ => self.fetch_json(url).await,
        }
    }

    /// Resolves an actor document, serving it from the object store
    /// when cached and fresh, fetching and caching it otherwise.
    pub async fn actor_request(&self, store: &ObjectStore, actor_url: &str) -> Result<Value> {
        if let Ok(doc) = store.get(actor_url) {
            if !actor_stale(store, actor_url) {
                return Ok(doc);
            }
            // Stale cache: try the network, keep the old copy on
            // failure (federation partners disappear and come back).
            if let Ok(fresh) = self.actor_refresh(store, actor_url).await {
                return Ok(fresh);
            }
            return Ok(doc);
        }
        self.actor_refresh(store, actor_url).await
    }

    /// Unconditionally refetches and re-caches an actor document.
    pub async fn actor_refresh(&self, store: &ObjectStore, actor_url: &str) -> Result<Value> {
        let doc = self.fetch_json(actor_url).await?;
        if doc.get("publicKey").is_none() && doc.get("inbox").is_none() {
            return Err(anyhow!("{actor_url}: not an actor document"));
        }
        store
            .put_overwrite(actor_url, &doc)
            .map_err(|e| anyhow!("cache actor {actor_url}: {e}"))?;
        Ok(doc)
    }
}

/// True when the cached copy of an actor document is missing or past
/// its refresh window.
pub fn actor_stale(store: &ObjectStore, actor_url: &str) -> bool {
    let fp = crate::object_store::fingerprint(actor_url);
    match store.modified_at(&fp) {
        Ok(mtime) => match mtime.elapsed() {
            Ok(age) => age > Duration::from_secs(ACTOR_REFRESH_SECS),
            Err(_) => false,
        },
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn cached_actor_is_served_without_network() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let actor = "https://remote.example/users/bob";
        let doc = json!({
            "id": actor,
            "inbox": format!("{actor}/inbox"),
            "publicKey": {"id": format!("{actor}#main-key"), "publicKeyPem": "pem"},
        });
        store.put(actor, &doc).unwrap();

        // An unroutable port: any network attempt would fail, so a
        // successful return proves the cache was used.
        let fetcher = Fetcher::new(Duration::from_millis(200));
        let got = fetcher.actor_request(&store, actor).await.unwrap();
        assert_eq!(got, doc);
    }

    #[tokio::test]
    async fn missing_actor_without_network_errors() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let fetcher = Fetcher::new(Duration::from_millis(200));
        assert!(fetcher
            .actor_request(&store, "http://127.0.0.1:9/users/nobody")
            .await
            .is_err());
    }
}
