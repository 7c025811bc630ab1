/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! HTTP signature protocol (draft-cavage style): a canonical signing
//! string over method, path, host, date and body digest, signed
//! RSA-SHA256 with the actor's key. Verification resolves the claimed
//! key id through the object store, fetching and caching the actor
//! document over the network on a miss.

use crate::error::SigError;
use crate::fetch::Fetcher;
use crate::object_store::ObjectStore;
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use http::{HeaderMap, Method, Uri};
use httpdate::parse_http_date;
use rsa::{
    pkcs1v15::{SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    signature::{RandomizedSigner, SignatureEncoding, Verifier},
    RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, sync::Arc, time::Duration};

pub const DEFAULT_SIGNED_HEADERS: [&str; 5] =
    ["(request-target)", "host", "date", "digest", "content-type"];
pub const GET_SIGNED_HEADERS: [&str; 3] = ["(request-target)", "host", "date"];

#[derive(Debug)]
pub struct SignatureParams {
    pub key_id: String,
    pub headers: Vec<String>,
    pub signature: Vec<u8>,
}

/// Parses `Signature: keyId="...",headers="(request-target) host
/// date",signature="base64..."`.
pub fn parse_signature_header(value: &str) -> Result<SignatureParams, SigError> {
    let mut map = HashMap::<String, String>::new();
    for part in value.split(',') {
        let part = part.trim();
        let Some((k, v)) = part.split_once('=') else { continue };
        let v = v.trim().trim_matches('"');
        map.insert(k.trim().to_string(), v.to_string());
    }

    let key_id = map
        .get("keyId")
        .cloned()
        .ok_or_else(|| SigError::Malformed("Signature missing keyId".to_string()))?;
    let headers = map
        .get("headers")
        .cloned()
        .unwrap_or_else(|| "date".to_string());
    let signature_b64 = map
        .get("signature")
        .cloned()
        .ok_or_else(|| SigError::Malformed("Signature missing signature".to_string()))?;

    let signature = B64
        .decode(signature_b64.as_bytes())
        .map_err(|e| SigError::Malformed(format!("decode signature: {e}")))?;

    Ok(SignatureParams {
        key_id,
        headers: headers
            .split_whitespace()
            .map(|s| s.to_ascii_lowercase())
            .collect(),
        signature,
    })
}

pub fn build_signing_string(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    signed_headers: &[String],
) -> Result<String, SigError> {
    let mut out = String::new();
    for (i, name) in signed_headers.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if name == "(request-target)" {
            let path = uri.path();
            let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
            out.push_str("(request-target): ");
            out.push_str(&method.as_str().to_ascii_lowercase());
            out.push(' ');
            out.push_str(path);
            out.push_str(&query);
            continue;
        }

        let header_name = http::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| SigError::Malformed(format!("bad signed header name: {name}")))?;
        let value = headers
            .get(&header_name)
            .ok_or_else(|| SigError::Malformed(format!("missing signed header: {name}")))?
            .to_str()
            .map_err(|_| SigError::Malformed(format!("invalid header value for {name}")))?;
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value.trim());
    }
    Ok(out)
}

/// Checks `Digest: SHA-256=base64` against the body when present.
pub fn verify_digest_if_present(headers: &HeaderMap, body: &[u8]) -> Result<(), SigError> {
    let Some(digest) = headers.get("Digest") else {
        return Ok(());
    };
    let digest = digest
        .to_str()
        .map_err(|_| SigError::Malformed("Digest header not utf8".to_string()))?;
    let Some((alg, value)) = digest.split_once('=') else {
        return Err(SigError::Malformed("invalid Digest header".to_string()));
    };
    if alg.trim().eq_ignore_ascii_case("SHA-256") {
        let expected = B64
            .decode(value.trim().as_bytes())
            .map_err(|e| SigError::Malformed(format!("decode digest: {e}")))?;
        let actual = Sha256::digest(body);
        if expected.as_slice() != actual.as_slice() {
            return Err(SigError::InvalidSignature);
        }
        return Ok(());
    }
    Err(SigError::Malformed(format!("unsupported digest alg: {alg}")))
}

/// Rejects requests whose Date header is outside the allowed skew;
/// signatures are time-bound.
pub fn verify_date(headers: &HeaderMap, max_skew: Duration) -> Result<(), SigError> {
    let date = headers
        .get("Date")
        .ok_or_else(|| SigError::Malformed("missing Date header".to_string()))?
        .to_str()
        .map_err(|_| SigError::Malformed("Date header not utf8".to_string()))?;
    let ts =
        parse_http_date(date).map_err(|e| SigError::Malformed(format!("parse Date: {e}")))?;
    let now = std::time::SystemTime::now();
    let diff = if now > ts {
        now.duration_since(ts).unwrap_or_default()
    } else {
        ts.duration_since(now).unwrap_or_default()
    };
    if diff > max_skew {
        return Err(SigError::Malformed(format!(
            "Date skew too large: {}s",
            diff.as_secs()
        )));
    }
    Ok(())
}

pub fn verify_signature_rsa_sha256(
    public_key_pem: &str,
    signing_string: &str,
    signature: &[u8],
) -> Result<(), SigError> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| SigError::UnverifiableActor(format!("parse public key pem: {e}")))?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let sig = rsa::pkcs1v15::Signature::try_from(signature)
        .map_err(|_| SigError::Malformed("invalid rsa signature bytes".to_string()))?;
    verifying_key
        .verify(signing_string.as_bytes(), &sig)
        .map_err(|_| SigError::InvalidSignature)?;
    Ok(())
}

/// Signs an outbound request in place: ensures Date, Digest and Host
/// headers, then attaches the Signature header.
pub fn sign_request_rsa_sha256(
    private_key_pem: &str,
    key_id: &str,
    method: &Method,
    uri: &Uri,
    headers: &mut HeaderMap,
    body: &[u8],
    signed_headers: &[&str],
) -> Result<()> {
    if !headers.contains_key("Date") {
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        headers.insert("Date", date.parse().context("set Date")?);
    }

    let signed_headers_lower: Vec<String> =
        signed_headers.iter().map(|s| s.to_ascii_lowercase()).collect();
    let want_digest = headers.contains_key("Digest")
        || signed_headers_lower.iter().any(|h| h == "digest")
        || !body.is_empty();
    if want_digest && !headers.contains_key("Digest") {
        let digest = Sha256::digest(body);
        let digest_b64 = B64.encode(digest);
        headers.insert(
            "Digest",
            format!("SHA-256={digest_b64}")
                .parse()
                .context("set Digest")?,
        );
    }

    if !headers.contains_key("Host") {
        if let Some(auth) = uri.authority() {
            headers.insert("Host", auth.as_str().parse().context("set Host")?);
        }
    }

    let signing_string = build_signing_string(method, uri, headers, &signed_headers_lower)
        .map_err(|e| anyhow!("{e}"))?;

    let private_key =
        RsaPrivateKey::from_pkcs8_pem(private_key_pem).context("parse private key pem")?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let mut rng = rand::rngs::OsRng;
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let sig_b64 = B64.encode(signature.to_bytes());

    let headers_list = signed_headers_lower.join(" ");
    let sig_header = format!(
        "keyId=\"{key_id}\",algorithm=\"rsa-sha256\",headers=\"{headers_list}\",signature=\"{sig_b64}\""
    );
    headers.insert("Signature", sig_header.parse().context("set Signature")?);
    Ok(())
}

/// Key material resolved for an inbound signature.
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub actor_url: String,
    pub key_id: String,
    pub public_key_pem: String,
}

/// Resolves signature key ids through the object store. Actor
/// documents are cached there like any other object, so verification
/// of a known sender costs one store read and no network.
#[derive(Clone)]
pub struct KeyResolver {
    store: Arc<ObjectStore>,
    fetcher: Fetcher,
}

impl KeyResolver {
    pub fn new(store: Arc<ObjectStore>, fetcher: Fetcher) -> Self {
        Self { store, fetcher }
    }

    pub async fn resolve_key(&self, key_id: &str) -> Result<ResolvedKey, SigError> {
        let actor_url = match key_id.split_once('#') {
            Some((actor, _frag)) => actor.to_string(),
            None => key_id.to_string(),
        };

        let doc = match self.store.get(&actor_url) {
            Ok(doc) => doc,
            Err(_) => self
                .fetcher
                .actor_request(&self.store, &actor_url)
                .await
                .map_err(|e| SigError::UnverifiableActor(format!("{actor_url}: {e:#}")))?,
        };

        let Some(pk) = doc.get("publicKey") else {
            return Err(SigError::UnverifiableActor(format!(
                "{actor_url}: actor missing publicKey"
            )));
        };
        let pem = pk
            .get("publicKeyPem")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                SigError::UnverifiableActor(format!("{actor_url}: missing publicKeyPem"))
            })?;
        let actual_key_id = pk
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or(key_id)
            .to_string();

        Ok(ResolvedKey {
            actor_url,
            key_id: actual_key_id,
            public_key_pem: pem.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::identity_from_pem;
    use rand::rngs::OsRng;
    use rsa::pkcs8::EncodePrivateKey;

    fn test_identity() -> crate::keys::Identity {
        let key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let pem = key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        identity_from_pem(&pem).unwrap()
    }

    #[test]
    fn sign_then_verify_roundtrip() {
        let id = test_identity();
        let body = br#"{"type":"Create"}"#;
        let uri: Uri = "https://remote.example/users/bob/inbox".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "application/activity+json".parse().unwrap());

        sign_request_rsa_sha256(
            &id.private_key_pem,
            "https://social.example/users/alice#main-key",
            &Method::POST,
            &uri,
            &mut headers,
            body,
            &DEFAULT_SIGNED_HEADERS,
        )
        .unwrap();

        assert!(headers.contains_key("Date"));
        assert!(headers.contains_key("Digest"));
        verify_digest_if_present(&headers, body).unwrap();
        verify_date(&headers, Duration::from_secs(300)).unwrap();

        let sig_header = headers.get("Signature").unwrap().to_str().unwrap();
        let params = parse_signature_header(sig_header).unwrap();
        assert_eq!(params.key_id, "https://social.example/users/alice#main-key");

        let signing_string =
            build_signing_string(&Method::POST, &uri, &headers, &params.headers).unwrap();
        verify_signature_rsa_sha256(&id.public_key_pem, &signing_string, &params.signature)
            .unwrap();
    }

    #[test]
    fn tampered_body_fails_digest() {
        let id = test_identity();
        let uri: Uri = "https://remote.example/inbox".parse().unwrap();
        let mut headers = HeaderMap::new();
        sign_request_rsa_sha256(
            &id.private_key_pem,
            "https://social.example/users/alice#main-key",
            &Method::POST,
            &uri,
            &mut headers,
            b"original",
            &DEFAULT_SIGNED_HEADERS[..4],
        )
        .unwrap();
        assert!(matches!(
            verify_digest_if_present(&headers, b"tampered"),
            Err(SigError::InvalidSignature)
        ));
    }

    #[test]
    fn wrong_key_fails_signature() {
        let signer = test_identity();
        let other = test_identity();
        let uri: Uri = "https://remote.example/inbox".parse().unwrap();
        let mut headers = HeaderMap::new();
        sign_request_rsa_sha256(
            &signer.private_key_pem,
            "https://social.example/users/alice#main-key",
            &Method::POST,
            &uri,
            &mut headers,
            b"body",
            &DEFAULT_SIGNED_HEADERS[..4],
        )
        .unwrap();

        let params =
            parse_signature_header(headers.get("Signature").unwrap().to_str().unwrap()).unwrap();
        let signing_string =
            build_signing_string(&Method::POST, &uri, &headers, &params.headers).unwrap();
        assert!(matches!(
            verify_signature_rsa_sha256(&other.public_key_pem, &signing_string, &params.signature),
            Err(SigError::InvalidSignature)
        ));
    }

    #[test]
    fn malformed_header_is_malformed() {
        assert!(matches!(
            parse_signature_header("algorithm=\"rsa-sha256\""),
            Err(SigError::Malformed(_))
        ));
        assert!(matches!(
            parse_signature_header("keyId=\"k\",signature=\"@@@\""),
            Err(SigError::Malformed(_))
        ));
    }

    #[test]
    fn stale_date_is_rejected() {
        let mut headers = HeaderMap::new();
        let old = std::time::SystemTime::now() - Duration::from_secs(3600);
        headers.insert("Date", httpdate::fmt_http_date(old).parse().unwrap());
        assert!(verify_date(&headers, Duration::from_secs(300)).is_err());
        assert!(verify_date(&headers, Duration::from_secs(7200)).is_ok());
    }
}
