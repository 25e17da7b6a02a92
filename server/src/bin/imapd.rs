/*
 * imapd.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portalettere, a multi-tenant email server.
 *
 * Portalettere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portalettere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portalettere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! IMAP4rev1 listener: accept on TCP and/or a UNIX socket, one task per
//! connection. Exit code 0 on clean shutdown, 1 on startup failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use portalettere_core::authclient::AuthClient;
use portalettere_core::config::Config;
use portalettere_core::net::{self, Connection, TlsAcceptor};
use portalettere_core::protocol::imap::{self, ImapContext};
use portalettere_core::store::StorePool;

#[derive(Parser)]
#[command(name = "imapd", about = "portalettere IMAP4rev1 server")]
struct Cli {
    /// Configuration file.
    #[arg(long, default_value = "config.xml")]
    config: PathBuf,
    /// Override the TCP listen address.
    #[arg(long)]
    tcp: Option<String>,
    /// Override the UNIX socket path.
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Override the storage directory.
    #[arg(long)]
    db: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let mut config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("imapd: cannot read {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(tcp) = cli.tcp {
        config.imap.tcp = Some(tcp);
    }
    if let Some(socket) = cli.socket {
        config.imap.socket = Some(socket);
    }
    if let Some(db) = cli.db {
        config.storage_dir = db;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("imapd: cannot start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("imapd: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), String> {
    let pool = StorePool::open(&config.storage_dir)
        .map_err(|e| format!("cannot open storage at {}: {}", config.storage_dir.display(), e))?;
    let acceptor = match (&config.imap.tls_cert, &config.imap.tls_key) {
        (Some(cert), Some(key)) => Some(
            net::build_tls_acceptor(cert, key)
                .map_err(|e| format!("cannot load TLS certificate: {}", e))?,
        ),
        _ => None,
    };
    let ctx = Arc::new(ImapContext {
        auth: AuthClient::new(config.auth_url.clone(), config.auth_insecure),
        pool: Arc::new(pool),
        config: Arc::new(config),
    });

    let tcp_listener = match &ctx.config.imap.tcp {
        Some(addr) => Some(
            tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| format!("cannot bind {}: {}", addr, e))?,
        ),
        None => None,
    };
    let unix_listener = match &ctx.config.imap.socket {
        Some(path) => Some(
            net::bind_unix(path).map_err(|e| format!("cannot bind {}: {}", path.display(), e))?,
        ),
        None => None,
    };
    if tcp_listener.is_none() && unix_listener.is_none() {
        return Err("no listener configured".to_string());
    }
    if let Some(addr) = &ctx.config.imap.tcp {
        log::info!("imapd listening on {}", addr);
    }
    if let Some(path) = &ctx.config.imap.socket {
        log::info!("imapd listening on {}", path.display());
    }

    loop {
        tokio::select! {
            accepted = accept_tcp(&tcp_listener) => {
                if let Some(stream) = accepted {
                    spawn_session(Connection::tcp(stream), acceptor.clone(), ctx.clone());
                }
            }
            accepted = accept_unix(&unix_listener) => {
                if let Some(stream) = accepted {
                    spawn_session(Connection::unix(stream), acceptor.clone(), ctx.clone());
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.map_err(|e| e.to_string())?;
                break;
            }
        }
    }

    log::info!("imapd shutting down");
    drop(tcp_listener);
    if let Some(path) = &ctx.config.imap.socket {
        let _ = std::fs::remove_file(path);
    }
    // Short grace for in-flight commands before handles are dropped.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    ctx.pool.close_all();
    Ok(())
}

fn spawn_session(
    conn: Connection,
    acceptor: Option<TlsAcceptor>,
    ctx: Arc<ImapContext>,
) {
    tokio::spawn(async move {
        if let Err(e) = imap::serve(conn, acceptor, ctx).await {
            log::debug!("imap session ended with error: {}", e);
        }
    });
}

async fn accept_tcp(
    listener: &Option<tokio::net::TcpListener>,
) -> Option<tokio::net::TcpStream> {
    match listener {
        Some(l) => match l.accept().await {
            Ok((stream, peer)) => {
                log::debug!("imap connection from {}", peer);
                Some(stream)
            }
            Err(e) => {
                log::warn!("accept failed: {}", e);
                None
            }
        },
        None => std::future::pending().await,
    }
}

async fn accept_unix(
    listener: &Option<tokio::net::UnixListener>,
) -> Option<tokio::net::UnixStream> {
    match listener {
        Some(l) => match l.accept().await {
            Ok((stream, _)) => Some(stream),
            Err(e) => {
                log::warn!("accept failed: {}", e);
                None
            }
        },
        None => std::future::pending().await,
    }
}
