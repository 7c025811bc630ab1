/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Content-addressed object store. Every federation document (note,
//! actor, activity, webfinger response) is a JSON file keyed by the
//! fingerprint of its canonical id, under a two-hex-char bucket to
//! bound directory fan-out. The store is the sole writer of these
//! files; indices and relations hold fingerprints, never paths.

use crate::error::{StoreError, StoreResult};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;

/// Width of a fingerprint in hex characters.
pub const FP_LEN: usize = 32;

/// Deterministic fingerprint of a canonical id: the first 32 lowercase
/// hex chars of its SHA-256. Fixed width, so index records are fixed
/// width too.
pub fn fingerprint(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    let mut fp = hex::encode(digest);
    fp.truncate(FP_LEN);
    fp
}

pub fn is_fingerprint(s: &str) -> bool {
    s.len() == FP_LEN && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

#[derive(Clone)]
pub struct ObjectStore {
    basedir: PathBuf,
}

impl ObjectStore {
    pub fn new(basedir: impl AsRef<Path>) -> Self {
        Self {
            basedir: basedir.as_ref().to_path_buf(),
        }
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    /// Bucket directory for a fingerprint: `object/<first 2 hex>/`.
    pub fn bucket_dir(&self, fp: &str) -> PathBuf {
        self.basedir.join("object").join(&fp[..2])
    }

    pub fn object_path(&self, fp: &str) -> PathBuf {
        self.bucket_dir(fp).join(format!("{fp}.json"))
    }

    /// Path of a relation index stored alongside the object
    /// (`_l` likes, `_a` announces, `_v` poll voters).
    pub fn relation_path(&self, fp: &str, suffix: &str) -> PathBuf {
        self.bucket_dir(fp).join(format!("{fp}_{suffix}.idx"))
    }

    /// Stores a document under its id. Idempotent: if an object with
    /// this fingerprint already exists the call succeeds without
    /// touching it. Callers that mean to replace use `put_overwrite`.
    pub fn put(&self, id: &str, doc: &Value) -> StoreResult<String> {
        let fp = fingerprint(id);
        let path = self.object_path(&fp);
        if path.exists() {
            return Ok(fp);
        }
        self.write_doc(&path, doc)?;
        Ok(fp)
    }

    /// Stores a document under its id, replacing any previous content.
    /// The fingerprint does not change across overwrites.
    pub fn put_overwrite(&self, id: &str, doc: &Value) -> StoreResult<String> {
        let fp = fingerprint(id);
        let path = self.object_path(&fp);
        self.write_doc(&path, doc)?;
        Ok(fp)
    }

    fn write_doc(&self, path: &Path, doc: &Value) -> StoreResult<()> {
        let dir = path.parent().expect("object path has a bucket dir");
        fs::create_dir_all(dir)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(doc).expect("json value serializes"))?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> StoreResult<Value> {
        self.get_by_fingerprint(&fingerprint(id))
    }

    pub fn get_by_fingerprint(&self, fp: &str) -> StoreResult<Value> {
        let path = self.object_path(fp);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!("corrupt object {}: {e}", path.display());
                Err(StoreError::Corrupt { path })
            }
        }
    }

    pub fn exists(&self, id: &str) -> bool {
        self.exists_by_fingerprint(&fingerprint(id))
    }

    pub fn exists_by_fingerprint(&self, fp: &str) -> bool {
        self.object_path(fp).exists()
    }

    /// Removes the object and its relation indices. Removing an absent
    /// object is a no-op.
    pub fn delete(&self, id: &str) -> StoreResult<()> {
        self.delete_by_fingerprint(&fingerprint(id))
    }

    pub fn delete_by_fingerprint(&self, fp: &str) -> StoreResult<()> {
        for suffix in ["l", "a", "v"] {
            let p = self.relation_path(fp, suffix);
            if let Err(e) = fs::remove_file(&p) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        match fs::remove_file(self.object_path(fp)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the object only when nothing references it. References
    /// are hard links from per-user cache directories, so the link
    /// count of the store's own file is the reference count plus one.
    pub fn delete_if_unreferenced(&self, id: &str) -> StoreResult<bool> {
        let fp = fingerprint(id);
        let path = self.object_path(&fp);
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if nlink(&meta) > 1 {
            return Ok(false);
        }
        self.delete_by_fingerprint(&fp)?;
        Ok(true)
    }

    pub fn created_at(&self, fp: &str) -> StoreResult<SystemTime> {
        let meta = self.stat(fp)?;
        Ok(meta.created().or_else(|_| meta.modified())?)
    }

    pub fn modified_at(&self, fp: &str) -> StoreResult<SystemTime> {
        Ok(self.stat(fp)?.modified()?)
    }

    /// Bumps the object's modification time without rewriting it.
    pub fn touch(&self, id: &str) -> StoreResult<()> {
        let path = self.object_path(&fingerprint(id));
        let f = match fs::File::options().write(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };
        f.set_modified(SystemTime::now())?;
        Ok(())
    }

    fn stat(&self, fp: &str) -> StoreResult<fs::Metadata> {
        match fs::metadata(self.object_path(fp)) {
            Ok(m) => Ok(m),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Hard-links the stored object into a user cache directory
    /// (`private/` or `public/`), registering a reference.
    pub fn cache_link(&self, id: &str, cache_dir: &Path) -> StoreResult<bool> {
        let fp = fingerprint(id);
        let src = self.object_path(&fp);
        if !src.exists() {
            return Err(StoreError::NotFound);
        }
        fs::create_dir_all(cache_dir)?;
        let dst = cache_dir.join(format!("{fp}.json"));
        if dst.exists() {
            return Ok(false);
        }
        fs::hard_link(&src, &dst)?;
        Ok(true)
    }

    pub fn cache_unlink(&self, id: &str, cache_dir: &Path) -> StoreResult<bool> {
        let fp = fingerprint(id);
        let dst = cache_dir.join(format!("{fp}.json"));
        match fs::remove_file(&dst) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn cache_contains(&self, id: &str, cache_dir: &Path) -> bool {
        cache_dir
            .join(format!("{}.json", fingerprint(id)))
            .exists()
    }
}

#[cfg(unix)]
fn nlink(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.nlink()
}

#[cfg(not(unix))]
fn nlink(_meta: &fs::Metadata) -> u64 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempdir().expect("tempdir");
        let store = ObjectStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let a = fingerprint("https://example.org/users/alice/p/1");
        let b = fingerprint("https://example.org/users/alice/p/2");
        assert_eq!(a.len(), FP_LEN);
        assert_eq!(a, fingerprint("https://example.org/users/alice/p/1"));
        assert_ne!(a, b);
        assert!(is_fingerprint(&a));
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = store();
        let id = "https://remote.example/notes/1";
        let doc = json!({"id": id, "type": "Note", "content": "hi"});
        let fp1 = store.put(id, &doc).unwrap();
        let fp2 = store.put(id, &json!({"id": id, "ignored": true})).unwrap();
        assert_eq!(fp1, fp2);
        // The second put did not replace the content.
        assert_eq!(store.get(id).unwrap(), doc);
    }

    #[test]
    fn put_overwrite_replaces_content_same_fingerprint() {
        let (_dir, store) = store();
        let id = "https://remote.example/notes/2";
        let fp1 = store.put(id, &json!({"id": id, "v": 1})).unwrap();
        let fp2 = store.put_overwrite(id, &json!({"id": id, "v": 2})).unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(store.get(id).unwrap()["v"], 2);
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get("https://nowhere.example/x"),
            Err(StoreError::NotFound)
        ));
        assert!(!store.exists("https://nowhere.example/x"));
    }

    #[test]
    fn corrupt_object_is_reported_not_fatal() {
        let (_dir, store) = store();
        let id = "https://remote.example/notes/3";
        let fp = store.put(id, &json!({"id": id})).unwrap();
        std::fs::write(store.object_path(&fp), b"{not json").unwrap();
        assert!(matches!(store.get(id), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn delete_if_unreferenced_respects_cache_links() {
        let (dir, store) = store();
        let id = "https://remote.example/notes/4";
        store.put(id, &json!({"id": id})).unwrap();

        let cache = dir.path().join("user/alice/private");
        assert!(store.cache_link(id, &cache).unwrap());
        assert!(!store.delete_if_unreferenced(id).unwrap());
        assert!(store.exists(id));

        assert!(store.cache_unlink(id, &cache).unwrap());
        assert!(store.delete_if_unreferenced(id).unwrap());
        assert!(!store.exists(id));
    }

    #[test]
    fn delete_missing_is_noop() {
        let (_dir, store) = store();
        store.delete("https://nowhere.example/x").unwrap();
        assert!(!store.delete_if_unreferenced("https://nowhere.example/x").unwrap());
    }
}
