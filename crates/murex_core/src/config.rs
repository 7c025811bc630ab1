/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Server context: base directory, persisted configuration and the
//! disk layout version gate. Every operation receives this context
//! explicitly; there is no ambient global state.

use crate::migrate;
use crate::object_store::ObjectStore;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Current on-disk layout version. `Server::open` refuses anything
/// newer and migrates anything older (see `migrate`).
pub const LAYOUT_VERSION: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub layout: u32,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_purge_days")]
    pub purge_days: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_max_date_skew_secs")]
    pub max_date_skew_secs: u64,
    #[serde(default = "default_output_max_attempts")]
    pub output_max_attempts: u32,
    #[serde(default = "default_input_max_attempts")]
    pub input_max_attempts: u32,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default)]
    pub blocked_instances: Vec<String>,
}

fn default_protocol() -> String {
    "https".to_string()
}
fn default_workers() -> usize {
    4
}
fn default_purge_days() -> u32 {
    45
}
fn default_http_timeout_secs() -> u64 {
    20
}
fn default_max_date_skew_secs() -> u64 {
    300
}
fn default_output_max_attempts() -> u32 {
    10
}
fn default_input_max_attempts() -> u32 {
    3
}
fn default_base_backoff_secs() -> u64 {
    5
}
fn default_max_backoff_secs() -> u64 {
    3600
}

impl ServerConfig {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            protocol: default_protocol(),
            layout: LAYOUT_VERSION,
            workers: default_workers(),
            purge_days: default_purge_days(),
            http_timeout_secs: default_http_timeout_secs(),
            max_date_skew_secs: default_max_date_skew_secs(),
            output_max_attempts: default_output_max_attempts(),
            input_max_attempts: default_input_max_attempts(),
            base_backoff_secs: default_base_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            blocked_instances: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Server {
    pub basedir: PathBuf,
    pub config: ServerConfig,
    pub baseurl: String,
}

impl Server {
    /// Scaffolds a fresh base directory. Fails if one is already
    /// initialized there.
    pub fn init(basedir: impl AsRef<Path>, host: &str) -> Result<Server> {
        let basedir = basedir.as_ref().to_path_buf();
        let cfg_path = basedir.join("server.json");
        if cfg_path.exists() {
            bail!("already initialized: {}", cfg_path.display());
        }
        for dir in ["object", "tag", "user", "error"] {
            fs::create_dir_all(basedir.join(dir))
                .with_context(|| format!("create {dir}/"))?;
        }
        let config = ServerConfig::new(host);
        let server = Server {
            baseurl: format!("{}://{}", config.protocol, config.host),
            basedir,
            config,
        };
        server.persist_config()?;
        info!("initialized instance for {host} at {}", server.basedir.display());
        Ok(server)
    }

    /// Opens an existing base directory, enforcing the layout version
    /// gate: a future version is fatal, an older one is migrated
    /// forward step by step when `auto_upgrade` is set.
    pub fn open(basedir: impl AsRef<Path>, auto_upgrade: bool) -> Result<Server> {
        let basedir = basedir.as_ref().to_path_buf();
        let cfg_path = basedir.join("server.json");
        let text = fs::read_to_string(&cfg_path)
            .with_context(|| format!("read {}", cfg_path.display()))?;
        let mut config: ServerConfig =
            serde_json::from_str(&text).with_context(|| format!("parse {}", cfg_path.display()))?;

        if config.layout > LAYOUT_VERSION {
            bail!(
                "disk layout {} is newer than supported {}; refusing to run",
                config.layout,
                LAYOUT_VERSION
            );
        }
        if config.layout < LAYOUT_VERSION {
            if !auto_upgrade {
                bail!(
                    "disk layout upgrade needed ({} < {}); run with upgrade enabled",
                    config.layout,
                    LAYOUT_VERSION
                );
            }
            migrate::upgrade(&basedir, &mut config)?;
        }

        let server = Server {
            baseurl: format!("{}://{}", config.protocol, config.host),
            basedir,
            config,
        };
        if server.config.layout != layout_of(&text) {
            server.persist_config()?;
        }
        Ok(server)
    }

    pub fn persist_config(&self) -> Result<()> {
        let cfg_path = self.basedir.join("server.json");
        let text = serde_json::to_string_pretty(&self.config)?;
        fs::write(&cfg_path, text).with_context(|| format!("write {}", cfg_path.display()))?;
        Ok(())
    }

    pub fn store(&self) -> ObjectStore {
        ObjectStore::new(&self.basedir)
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.basedir.join("queue.db")
    }

    pub fn error_dir(&self) -> PathBuf {
        self.basedir.join("error")
    }

    pub fn user_dir(&self, uid: &str) -> PathBuf {
        self.basedir.join("user").join(uid)
    }

    /// Instance-wide public timeline index.
    pub fn instance_index_path(&self) -> PathBuf {
        self.basedir.join("public.idx")
    }

    /// An id belongs to a blocked instance when any configured block
    /// string occurs in it (the original's substring rule).
    pub fn is_instance_blocked(&self, id: &str) -> bool {
        self.config
            .blocked_instances
            .iter()
            .any(|b| !b.is_empty() && id.contains(b.as_str()))
    }

    pub fn is_local_id(&self, id: &str) -> bool {
        id.starts_with(&self.baseurl)
    }
}

fn layout_of(text: &str) -> u32 {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("layout").and_then(|l| l.as_u64()))
        .map(|l| l as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_then_open_roundtrip() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("data");
        let server = Server::init(&base, "social.example").unwrap();
        assert_eq!(server.baseurl, "https://social.example");
        assert_eq!(server.config.layout, LAYOUT_VERSION);

        let reopened = Server::open(&base, true).unwrap();
        assert_eq!(reopened.config.host, "social.example");
        assert!(base.join("object").is_dir());
        assert!(base.join("error").is_dir());
    }

    #[test]
    fn init_twice_fails() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("data");
        Server::init(&base, "social.example").unwrap();
        assert!(Server::init(&base, "social.example").is_err());
    }

    #[test]
    fn future_layout_is_fatal() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("data");
        let server = Server::init(&base, "social.example").unwrap();
        let mut cfg = server.config.clone();
        cfg.layout = LAYOUT_VERSION + 1;
        fs::write(
            base.join("server.json"),
            serde_json::to_string(&cfg).unwrap(),
        )
        .unwrap();
        let err = Server::open(&base, true).unwrap_err();
        assert!(err.to_string().contains("newer"));
    }

    #[test]
    fn instance_block_is_substring_match() {
        let dir = tempdir().unwrap();
        let mut server = Server::init(dir.path().join("d"), "social.example").unwrap();
        server.config.blocked_instances = vec!["bad.example".to_string()];
        assert!(server.is_instance_blocked("https://bad.example/users/troll"));
        assert!(!server.is_instance_blocked("https://good.example/users/ok"));
    }
}
