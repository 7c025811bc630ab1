/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Append-only index logs. Each collection (a user timeline, the
//! instance timeline, a hashtag) is a file of fixed-width records:
//! 32 hex fingerprint chars plus a newline. Insertion order is
//! chronological order, so pagination scans a bounded window from
//! either end instead of sorting. Logical deletion overwrites a record
//! in place with the all-zeros mark; `gc` compacts.
//!
//! Appends to one index are serialized through a process-wide lock
//! registry; readers need no lock because records are written whole.

use crate::error::StoreResult;
use crate::object_store::{ObjectStore, FP_LEN};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::warn;

/// Record width: fingerprint + newline.
pub const REC_LEN: u64 = (FP_LEN + 1) as u64;

/// Mark for a logically deleted entry.
pub const SEEN_MARK: &str = "00000000000000000000000000000000";

static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();

fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    let registry = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().expect("lock registry poisoned");
    map.entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

#[derive(Clone)]
pub struct IndexFile {
    path: PathBuf,
}

impl IndexFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a fingerprint. The write is a single 33-byte record, so
    /// concurrent readers never observe a torn entry.
    pub fn append(&self, fp: &str) -> StoreResult<()> {
        debug_assert_eq!(fp.len(), FP_LEN);
        let lock = lock_for(&self.path);
        let _guard = lock.lock().expect("index lock poisoned");

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        // Drop a torn trailing record left by a crashed writer.
        let size = f.metadata()?.len();
        let aligned = size - size % REC_LEN;
        if aligned != size {
            warn!("index {}: truncating torn tail", self.path.display());
            f.set_len(aligned)?;
        }
        let mut rec = [0u8; REC_LEN as usize];
        rec[..FP_LEN].copy_from_slice(fp.as_bytes());
        rec[FP_LEN] = b'\n';
        f.write_all(&rec)?;
        Ok(())
    }

    /// Number of physical records, seen marks included.
    pub fn len(&self) -> usize {
        match fs::metadata(&self.path) {
            Ok(m) => (m.len() / REC_LEN) as usize,
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest live entry, if any.
    pub fn first(&self) -> StoreResult<Option<String>> {
        let Some(mut cur) = self.asc(None)? else {
            return Ok(None);
        };
        cur.next()
    }

    pub fn contains(&self, fp: &str) -> StoreResult<bool> {
        let Some(mut cur) = self.asc(None)? else {
            return Ok(false);
        };
        while let Some(rec) = cur.next()? {
            if rec == fp {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Logically deletes an entry by overwriting it with the seen
    /// mark. Returns whether a record was marked.
    pub fn mark_seen(&self, fp: &str) -> StoreResult<bool> {
        let lock = lock_for(&self.path);
        let _guard = lock.lock().expect("index lock poisoned");

        let mut f = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let records = f.metadata()?.len() / REC_LEN;
        let mut rec = [0u8; REC_LEN as usize];
        for i in 0..records {
            f.seek(SeekFrom::Start(i * REC_LEN))?;
            f.read_exact(&mut rec)?;
            if &rec[..FP_LEN] == fp.as_bytes() {
                f.seek(SeekFrom::Start(i * REC_LEN))?;
                f.write_all(SEEN_MARK.as_bytes())?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Compacts the log, dropping seen marks and entries whose object
    /// is gone from the store. Returns the number of dropped records.
    pub fn gc(&self, store: &ObjectStore) -> StoreResult<usize> {
        let lock = lock_for(&self.path);
        let _guard = lock.lock().expect("index lock poisoned");

        let Some(mut cur) = cursor_asc_start(&self.path)? else {
            return Ok(0);
        };
        let before = self.len();
        let mut kept = Vec::new();
        while let Some(fp) = cur.next()? {
            if store.exists_by_fingerprint(&fp) {
                kept.push(fp);
            }
        }
        let tmp = self.path.with_extension("idx.tmp");
        {
            let mut out = File::create(&tmp)?;
            for fp in &kept {
                out.write_all(fp.as_bytes())?;
                out.write_all(b"\n")?;
            }
        }
        fs::rename(&tmp, &self.path)?;
        Ok(before - kept.len())
    }

    /// Descending cursor: newest entry first.
    pub fn desc(&self) -> StoreResult<Option<IndexCursor>> {
        let f = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let records = f.metadata()?.len() / REC_LEN;
        Ok(Some(IndexCursor {
            file: f,
            pos: records,
            end: records,
            descending: true,
        }))
    }

    /// Ascending cursor. With a seek fingerprint the cursor starts at
    /// that entry inclusive; when the fingerprint is not in the index
    /// the cursor is empty. Without one it starts at the oldest entry.
    pub fn asc(&self, from: Option<&str>) -> StoreResult<Option<IndexCursor>> {
        let Some(mut cur) = cursor_asc_start(&self.path)? else {
            return Ok(None);
        };
        let Some(seek) = from else {
            return Ok(Some(cur));
        };
        loop {
            let before = cur.pos;
            match cur.next()? {
                Some(fp) if fp == seek => {
                    cur.pos = before;
                    return Ok(Some(cur));
                }
                Some(_) => continue,
                None => return Ok(Some(cur)), // exhausted: yields nothing
            }
        }
    }

    /// Bounded newest-first listing; returns the page and whether more
    /// entries remain past it.
    pub fn list_desc(&self, skip: usize, show: usize) -> StoreResult<(Vec<String>, bool)> {
        let mut out = Vec::new();
        let Some(mut cur) = self.desc()? else {
            return Ok((out, false));
        };
        let mut seen = 0usize;
        while let Some(fp) = cur.next()? {
            if seen < skip {
                seen += 1;
                continue;
            }
            if out.len() == show {
                return Ok((out, true));
            }
            out.push(fp);
        }
        Ok((out, false))
    }

    /// All live entries, oldest first, up to `max` (0 = unbounded).
    pub fn list(&self, max: usize) -> StoreResult<Vec<String>> {
        let mut out = Vec::new();
        let Some(mut cur) = self.asc(None)? else {
            return Ok(out);
        };
        while let Some(fp) = cur.next()? {
            out.push(fp);
            if max > 0 && out.len() == max {
                break;
            }
        }
        Ok(out)
    }
}

fn cursor_asc_start(path: &Path) -> StoreResult<Option<IndexCursor>> {
    let f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let records = f.metadata()?.len() / REC_LEN;
    Ok(Some(IndexCursor {
        file: f,
        pos: 0,
        end: records,
        descending: false,
    }))
}

/// A position in an index log. `next` steps over seen marks and
/// malformed records (logged, skipped, never fatal).
pub struct IndexCursor {
    file: File,
    pos: u64,
    end: u64,
    descending: bool,
}

impl IndexCursor {
    pub fn next(&mut self) -> StoreResult<Option<String>> {
        let mut rec = [0u8; REC_LEN as usize];
        loop {
            let slot = if self.descending {
                if self.pos == 0 {
                    return Ok(None);
                }
                self.pos -= 1;
                self.pos
            } else {
                if self.pos >= self.end {
                    return Ok(None);
                }
                let s = self.pos;
                self.pos += 1;
                s
            };
            self.file.seek(SeekFrom::Start(slot * REC_LEN))?;
            self.file.read_exact(&mut rec)?;
            let fp = &rec[..FP_LEN];
            if fp == SEEN_MARK.as_bytes() {
                continue;
            }
            match std::str::from_utf8(fp) {
                Ok(s) if s.bytes().all(|b| b.is_ascii_hexdigit()) => {
                    return Ok(Some(s.to_string()))
                }
                _ => {
                    warn!("skipping malformed index record at slot {slot}");
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::fingerprint;
    use serde_json::json;
    use tempfile::tempdir;

    fn collect_desc(idx: &IndexFile) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(mut cur) = idx.desc().unwrap() {
            while let Some(fp) = cur.next().unwrap() {
                out.push(fp);
            }
        }
        out
    }

    fn collect_asc(idx: &IndexFile, from: Option<&str>) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(mut cur) = idx.asc(from).unwrap() {
            while let Some(fp) = cur.next().unwrap() {
                out.push(fp);
            }
        }
        out
    }

    #[test]
    fn order_is_preserved_both_ways() {
        let dir = tempdir().unwrap();
        let idx = IndexFile::new(dir.path().join("t.idx"));
        let fps: Vec<String> = (0..5).map(|i| fingerprint(&format!("id-{i}"))).collect();
        for fp in &fps {
            idx.append(fp).unwrap();
        }

        let mut rev = fps.clone();
        rev.reverse();
        assert_eq!(collect_desc(&idx), rev);
        assert_eq!(collect_asc(&idx, Some(fps[0].as_str())), fps);
        assert_eq!(idx.len(), 5);
        assert_eq!(idx.first().unwrap().as_deref(), Some(fps[0].as_str()));
    }

    #[test]
    fn asc_seek_starts_inclusive_mid_log() {
        let dir = tempdir().unwrap();
        let idx = IndexFile::new(dir.path().join("t.idx"));
        let fps: Vec<String> = (0..5).map(|i| fingerprint(&format!("id-{i}"))).collect();
        for fp in &fps {
            idx.append(fp).unwrap();
        }
        assert_eq!(collect_asc(&idx, Some(fps[2].as_str())), fps[2..].to_vec());
        // Unknown seek yields nothing.
        assert!(collect_asc(&idx, Some(fingerprint("missing").as_str())).is_empty());
    }

    #[test]
    fn mark_seen_hides_entry_until_gc() {
        let dir = tempdir().unwrap();
        let idx = IndexFile::new(dir.path().join("t.idx"));
        let fps: Vec<String> = (0..3).map(|i| fingerprint(&format!("id-{i}"))).collect();
        for fp in &fps {
            idx.append(fp).unwrap();
        }
        assert!(idx.mark_seen(&fps[1]).unwrap());
        assert!(!idx.mark_seen(&fps[1]).unwrap());

        assert_eq!(collect_desc(&idx), vec![fps[2].clone(), fps[0].clone()]);
        assert_eq!(idx.len(), 3); // physical records untouched
        assert!(!idx.contains(&fps[1]).unwrap());
    }

    #[test]
    fn gc_drops_seen_and_dangling_entries() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let idx = IndexFile::new(dir.path().join("t.idx"));

        let kept_id = "https://remote.example/kept";
        let gone_id = "https://remote.example/gone";
        let kept = store.put(kept_id, &json!({"id": kept_id})).unwrap();
        let gone = store.put(gone_id, &json!({"id": gone_id})).unwrap();
        idx.append(&kept).unwrap();
        idx.append(&gone).unwrap();

        store.delete(gone_id).unwrap();
        idx.mark_seen(&fingerprint("never-stored")).unwrap();

        let removed = idx.gc(&store).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(idx.len(), 1);
        assert_eq!(collect_desc(&idx), vec![kept]);
    }

    #[test]
    fn torn_tail_is_truncated_on_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.idx");
        let idx = IndexFile::new(&path);
        let a = fingerprint("a");
        idx.append(&a).unwrap();
        // Simulate a crash mid-append.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"deadbeef").unwrap();
        drop(f);

        let b = fingerprint("b");
        idx.append(&b).unwrap();
        assert_eq!(collect_asc(&idx, None), vec![a, b]);
    }

    #[test]
    fn empty_index_is_empty_everywhere() {
        let dir = tempdir().unwrap();
        let idx = IndexFile::new(dir.path().join("missing.idx"));
        assert_eq!(idx.len(), 0);
        assert!(idx.first().unwrap().is_none());
        assert!(collect_desc(&idx).is_empty());
        assert_eq!(idx.list_desc(0, 10).unwrap().0.len(), 0);
    }
}
