/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::path::PathBuf;

/// Errors surfaced by the storage layer (object store, index files,
/// relation tracker). Callers treat `NotFound` as empty, skip over
/// `Corrupt` records, and propagate the rest.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt record: {}", path.display())]
    Corrupt { path: PathBuf },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Signature verification failure modes. All three are non-fatal at
/// the protocol layer: the request is rejected, never a crash.
#[derive(Debug, thiserror::Error)]
pub enum SigError {
    #[error("malformed signature material: {0}")]
    Malformed(String),
    #[error("unverifiable actor: {0}")]
    UnverifiableActor(String),
    #[error("signature mismatch")]
    InvalidSignature,
}

/// How a failed delivery/ingestion attempt should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeout, connect failure, remote 5xx or 429: retry with backoff.
    Transient,
    /// Any other remote 4xx, unresolvable target: dead-letter.
    Permanent,
}

/// A delivery failure carrying its retry classification.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct DeliveryError {
    pub class: FailureClass,
    #[source]
    pub source: anyhow::Error,
}

impl DeliveryError {
    pub fn transient(source: anyhow::Error) -> Self {
        Self {
            class: FailureClass::Transient,
            source,
        }
    }

    pub fn permanent(source: anyhow::Error) -> Self {
        Self {
            class: FailureClass::Permanent,
            source,
        }
    }
}

/// Retry classification for an HTTP status from a federation partner.
pub fn classify_status(status: u16) -> FailureClass {
    if status == 429 || status >= 500 {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(500), FailureClass::Transient);
        assert_eq!(classify_status(503), FailureClass::Transient);
        assert_eq!(classify_status(429), FailureClass::Transient);
        assert_eq!(classify_status(404), FailureClass::Permanent);
        assert_eq!(classify_status(410), FailureClass::Permanent);
        assert_eq!(classify_status(400), FailureClass::Permanent);
    }
}
