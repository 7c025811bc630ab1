/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - MUREX Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{bail, Result};
use murex_core::config::Server;
use murex_core::gc;
use murex_core::keys::default_data_dir;
use murex_core::runtime;
use murex_core::user::{user_list, User};
use std::path::PathBuf;
use tracing::info;

const USAGE: &str = "\
usage: murexd <command> [args]

commands:
  init <host> [basedir]      initialize an instance for a hostname
  adduser <uid> [basedir]    create a local user
  users [basedir]            list local users
  serve [basedir] [bind]     run the instance (default bind 127.0.0.1:8001)
  purge [basedir]            run one housekeeping pass

basedir defaults to $MUREX_DATA_DIR or the platform data directory.
";

fn basedir_arg(arg: Option<String>) -> Result<PathBuf> {
    match arg {
        Some(p) => Ok(PathBuf::from(p)),
        None => default_data_dir(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .try_init()
        .ok();

    let mut args = std::env::args().skip(1);
    let Some(cmd) = args.next() else {
        eprint!("{USAGE}");
        bail!("missing command");
    };

    match cmd.as_str() {
        "init" => {
            let Some(host) = args.next() else {
                bail!("init needs a hostname");
            };
            let basedir = basedir_arg(args.next())?;
            Server::init(&basedir, &host)?;
        }
        "adduser" => {
            let Some(uid) = args.next() else {
                bail!("adduser needs a uid");
            };
            let basedir = basedir_arg(args.next())?;
            let server = Server::open(&basedir, true)?;
            let user = User::create(&server, &uid)?;
            info!("actor: {}", user.actor);
        }
        "users" => {
            let basedir = basedir_arg(args.next())?;
            let server = Server::open(&basedir, true)?;
            for uid in user_list(&server)? {
                println!("{uid}");
            }
        }
        "serve" => {
            let basedir = basedir_arg(args.next())?;
            let bind = args.next().unwrap_or_else(|| "127.0.0.1:8001".to_string());
            runtime::run(&basedir, &bind).await?;
        }
        "purge" => {
            let basedir = basedir_arg(args.next())?;
            let server = Server::open(&basedir, true)?;
            let store = server.store();
            let stats = gc::purge(&server, &store)?;
            info!(
                "purged: {} expired, {} compacted, {} archives dropped",
                stats.expired_posts, stats.compacted_entries, stats.dropped_archives
            );
        }
        other => {
            eprint!("{USAGE}");
            bail!("unknown command: {other}");
        }
    }
    Ok(())
}
