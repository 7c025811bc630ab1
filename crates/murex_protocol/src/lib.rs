/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Federation document types shared across the core: webfinger JRD,
//! actor documents, ordered collections. These mirror the wire shapes
//! other instances produce and consume; fields we never read are not
//! modeled.

use serde::{Deserialize, Serialize};

pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";
pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

pub const ACTIVITY_CTYPE: &str = "application/activity+json";
pub const ACTIVITY_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Object types that behave like a post in timelines.
pub const POSTLIKE_TYPES: [&str; 7] = [
    "Note", "Question", "Page", "Article", "Video", "Audio", "Event",
];

/// Post-like types that legitimately carry a `name`; anything else with
/// a `name` is a poll vote on the wire.
pub const NAMED_POSTLIKE_TYPES: [&str; 4] = ["Page", "Video", "Audio", "Event"];

#[derive(Debug, Serialize, Deserialize)]
pub struct Webfinger {
    pub subject: String,
    pub links: Vec<WebfingerLink>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebfingerLink {
    pub rel: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub ty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// A local actor document as published on the wire.
#[derive(Debug, Serialize)]
#[allow(non_snake_case)]
pub struct Actor {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub id: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub preferredUsername: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(
        rename = "manuallyApprovesFollowers",
        skip_serializing_if = "Option::is_none"
    )]
    pub manually_approves_followers: Option<bool>,
    pub inbox: String,
    pub outbox: String,
    pub followers: String,
    pub following: String,
    pub endpoints: ActorEndpoints,
    pub publicKey: PublicKey,
}

#[derive(Debug, Serialize)]
pub struct ActorEndpoints {
    #[serde(rename = "sharedInbox")]
    pub shared_inbox: String,
}

#[derive(Debug, Serialize)]
#[allow(non_snake_case)]
pub struct PublicKey {
    pub id: String,
    pub owner: String,
    pub publicKeyPem: String,
}

/// A remote actor document, reduced to the fields the core reads.
#[derive(Debug, Deserialize)]
pub struct ActorDoc {
    pub id: Option<String>,
    pub inbox: Option<String>,
    pub endpoints: Option<ActorDocEndpoints>,
    #[serde(rename = "publicKey")]
    pub public_key: Option<ActorDocKey>,
    #[serde(rename = "preferredUsername")]
    pub preferred_username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActorDocEndpoints {
    #[serde(rename = "sharedInbox")]
    pub shared_inbox: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActorDocKey {
    pub id: String,
    #[serde(rename = "publicKeyPem")]
    pub public_key_pem: String,
}

impl ActorDoc {
    /// Preferred delivery inbox: the shared inbox when advertised.
    pub fn delivery_inbox(&self) -> Option<&str> {
        if let Some(ep) = &self.endpoints {
            if let Some(shared) = ep.shared_inbox.as_deref() {
                if !shared.is_empty() {
                    return Some(shared);
                }
            }
        }
        self.inbox.as_deref()
    }
}

#[derive(Debug, Serialize)]
#[allow(non_snake_case)]
pub struct OrderedCollection {
    #[serde(rename = "@context")]
    pub context: String,
    pub id: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub totalItems: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,
}

#[derive(Debug, Serialize)]
#[allow(non_snake_case)]
pub struct OrderedCollectionPage<T> {
    #[serde(rename = "@context")]
    pub context: String,
    pub id: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub partOf: String,
    pub orderedItems: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}
