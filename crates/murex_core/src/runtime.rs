/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Process assembly: the shared `Core` context and the service entry
//! point that wires the worker pool, the housekeeping task and the
//! HTTP listener together under one shutdown channel.

use crate::config::Server;
use crate::delivery::Delivery;
use crate::fetch::Fetcher;
use crate::gc::start_gc_worker;
use crate::http_sig::KeyResolver;
use crate::object_store::ObjectStore;
use crate::queue::{JobQueue, QueueSettings};
use crate::workers::start_workers;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Everything an operation needs, passed explicitly. There is no
/// ambient global state; tests build a `Core` over a temp directory
/// and drive it directly.
pub struct Core {
    pub server: Arc<Server>,
    pub store: Arc<ObjectStore>,
    pub queue: JobQueue,
    pub fetcher: Fetcher,
    pub delivery: Delivery,
    pub resolver: KeyResolver,
    pub settings: QueueSettings,
}

impl Core {
    pub fn open(server: Server) -> Result<Arc<Core>> {
        let queue = JobQueue::open(server.queue_db_path(), server.error_dir())?;
        let store = Arc::new(server.store());
        let fetcher = Fetcher::new(Duration::from_secs(server.config.http_timeout_secs));
        let delivery = Delivery::new(fetcher.clone());
        let resolver = KeyResolver::new(store.clone(), fetcher.clone());
        let settings = QueueSettings {
            output_max_attempts: server.config.output_max_attempts,
            input_max_attempts: server.config.input_max_attempts,
            base_backoff_secs: server.config.base_backoff_secs,
            max_backoff_secs: server.config.max_backoff_secs,
        };
        Ok(Arc::new(Core {
            server: Arc::new(server),
            store,
            queue,
            fetcher,
            delivery,
            resolver,
            settings,
        }))
    }

    pub fn max_date_skew(&self) -> Duration {
        Duration::from_secs(self.server.config.max_date_skew_secs)
    }
}

/// Runs the instance: workers, housekeeping and the HTTP listener,
/// until ctrl-c.
pub async fn run(basedir: impl AsRef<Path>, bind: &str) -> Result<()> {
    let server = Server::open(basedir, true)?;
    info!(
        "murex instance {} ({} workers)",
        server.baseurl, server.config.workers
    );
    let core = Core::open(server)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    start_workers(core.clone(), core.server.config.workers, shutdown_rx.clone());
    start_gc_worker(core.clone(), shutdown_rx.clone());

    let router = crate::server::router(core.clone());
    let addr: SocketAddr = bind.parse().context("parse bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("listening on http://{addr}");

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let mut graceful_rx = shutdown_rx;
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = graceful_rx.changed().await;
        })
        .await
        .context("serve")?;
    Ok(())
}
