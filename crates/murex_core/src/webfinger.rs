/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Webfinger discovery: maps `user@host` handles to actor URLs. Remote
//! responses are cached in the object store under a synthetic
//! `webfinger:` id so repeated lookups stay local.

use crate::config::Server;
use crate::fetch::Fetcher;
use crate::object_store::ObjectStore;
use crate::user::{validate_uid, User};
use anyhow::{anyhow, Context, Result};
use murex_protocol::{Webfinger, WebfingerLink, ACTIVITY_CTYPE};
use serde_json::Value;

const LD_CTYPE: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

#[derive(Debug, Clone, Default)]
pub struct WebfingerHit {
    /// Canonical actor URL from the `self` link.
    pub actor: Option<String>,
    /// `user@host` handle from the subject.
    pub handle: Option<String>,
}

/// Resolves a query string (`user@host`, `@user@host` or an actor
/// URL) through webfinger, caching the response document.
pub async fn webfinger_request(
    fetcher: &Fetcher,
    store: &ObjectStore,
    qs: &str,
) -> Result<WebfingerHit> {
    let (host, resource) = if qs.starts_with("https://") || qs.starts_with("http://") {
        let rest = qs.split("//").nth(1).unwrap_or_default();
        let host = rest.split('/').next().unwrap_or_default();
        (host.to_string(), qs.to_string())
    } else {
        let handle = qs.trim_matches(['@', '.']);
        let Some((_user, host)) = handle.split_once('@') else {
            return Err(anyhow!("unresolvable webfinger query: {qs}"));
        };
        (host.to_string(), format!("acct:{handle}"))
    };
    if host.is_empty() {
        return Err(anyhow!("unresolvable webfinger query: {qs}"));
    }

    let cache_id = format!("webfinger:{qs}");
    let doc = match store.get(&cache_id) {
        Ok(doc) => doc,
        Err(_) => {
            let url = format!(
                "https://{host}/.well-known/webfinger?resource={}",
                urlencoding::encode(&resource)
            );
            let doc = fetcher
                .fetch_json(&url)
                .await
                .with_context(|| format!("webfinger {qs}"))?;
            store
                .put(&cache_id, &doc)
                .map_err(|e| anyhow!("cache webfinger {qs}: {e}"))?;
            doc
        }
    };

    Ok(parse_jrd(&doc))
}

fn parse_jrd(doc: &Value) -> WebfingerHit {
    let mut hit = WebfingerHit::default();
    if let Some(subject) = doc.get("subject").and_then(|s| s.as_str()) {
        if let Some(acct) = subject.strip_prefix("acct:") {
            hit.handle = Some(acct.to_string());
        }
    }
    if let Some(links) = doc.get("links").and_then(|l| l.as_array()) {
        for link in links {
            let ty = link.get("type").and_then(|t| t.as_str()).unwrap_or("");
            if ty == ACTIVITY_CTYPE || ty == LD_CTYPE {
                if let Some(href) = link.get("href").and_then(|h| h.as_str()) {
                    hit.actor = Some(href.to_string());
                    break;
                }
            }
        }
    }
    hit
}

/// Serves a webfinger resource for a local user, or None when the
/// resource names nobody here.
pub fn local_jrd(server: &Server, resource: &str) -> Option<Webfinger> {
    let uid = if resource.starts_with("https://") || resource.starts_with("http://") {
        // Actor URL: must be ours.
        let rest = resource.strip_prefix(&format!("{}/users/", server.baseurl))?;
        rest.split('/').next().unwrap_or_default().to_string()
    } else if let Some(acct) = resource.strip_prefix("acct:") {
        let acct = acct.trim_start_matches('@');
        let (user, host) = acct.split_once('@')?;
        if host != server.config.host {
            return None;
        }
        user.to_string()
    } else {
        return None;
    };

    if !validate_uid(&uid) {
        return None;
    }
    let user = User::open(server, &uid).ok()?;

    Some(Webfinger {
        subject: format!("acct:{}@{}", user.uid, server.config.host),
        links: vec![
            WebfingerLink {
                rel: "self".to_string(),
                ty: Some(ACTIVITY_CTYPE.to_string()),
                href: Some(user.actor.clone()),
            },
            WebfingerLink {
                rel: "self".to_string(),
                ty: Some(LD_CTYPE.to_string()),
                href: Some(user.actor.clone()),
            },
            WebfingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                ty: Some("text/html".to_string()),
                href: Some(user.actor),
            },
        ],
    })
}
