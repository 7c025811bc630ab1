/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Ordered, idempotent disk-layout migrations. Each step moves the
//! layout one version forward; a crashed run resumes safely because
//! every step tolerates already-migrated state.

use crate::config::{ServerConfig, LAYOUT_VERSION};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

pub fn upgrade(basedir: &Path, config: &mut ServerConfig) -> Result<()> {
    while config.layout < LAYOUT_VERSION {
        let from = config.layout;
        info!("disk layout upgrade needed ({from} < {LAYOUT_VERSION})");
        match from {
            0 => bail!("unsupported old disk layout {from}"),
            1 => shard_object_dir(basedir)?,
            2 => scaffold_user_caches(basedir)?,
            other => bail!("unknown disk layout {other}"),
        }
        config.layout = from + 1;
        info!("disk layout upgraded to version {}", config.layout);
    }
    Ok(())
}

/// v1 kept all objects flat under `object/`; v2 buckets them by the
/// first two fingerprint characters.
fn shard_object_dir(basedir: &Path) -> Result<()> {
    let object_dir = basedir.join("object");
    if !object_dir.is_dir() {
        fs::create_dir_all(&object_dir)?;
        return Ok(());
    }
    for entry in fs::read_dir(&object_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.len() < 2 {
            continue;
        }
        let bucket = object_dir.join(&name[..2]);
        fs::create_dir_all(&bucket)
            .with_context(|| format!("create bucket {}", bucket.display()))?;
        fs::rename(entry.path(), bucket.join(name))
            .with_context(|| format!("shard {name}"))?;
    }
    Ok(())
}

/// v2 users had no cache directories; v3 adds `private/` and
/// `public/` per user plus the instance `tag/` tree.
fn scaffold_user_caches(basedir: &Path) -> Result<()> {
    fs::create_dir_all(basedir.join("tag"))?;
    let users_dir = basedir.join("user");
    if !users_dir.is_dir() {
        fs::create_dir_all(&users_dir)?;
        return Ok(());
    }
    for entry in fs::read_dir(&users_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        for cache in ["private", "public"] {
            fs::create_dir_all(entry.path().join(cache))?;
        }
    }
    Ok(())
}
