/*
 * lmtpd.rs
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

//! LMTP listener: accept on TCP and/or a UNIX socket, one task per
//! delivery connection. Pattern follows imapd.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use portalettere_core::config::Config;
use portalettere_core::net;
use portalettere_core::protocol::lmtp::{self, LmtpContext};
use portalettere_core::store::StorePool;

#[derive(Parser)]
#[command(name = "lmtpd", about = "portalettere LMTP delivery server")]
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
            eprintln!("lmtpd: cannot read {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(tcp) = cli.tcp {
        config.lmtp.tcp = Some(tcp);
    }
    if let Some(socket) = cli.socket {
        config.lmtp.socket = Some(socket);
    }
    if let Some(db) = cli.db {
        config.storage_dir = db;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("lmtpd: cannot start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("lmtpd: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), String> {
    let pool = StorePool::open(&config.storage_dir)
        .map_err(|e| format!("cannot open storage at {}: {}", config.storage_dir.display(), e))?;
    let ctx = Arc::new(LmtpContext {
        pool: Arc::new(pool),
        config: Arc::new(config),
    });

    let tcp_listener = match &ctx.config.lmtp.tcp {
        Some(addr) => Some(
            tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| format!("cannot bind {}: {}", addr, e))?,
        ),
        None => None,
    };
    let unix_listener = match &ctx.config.lmtp.socket {
        Some(path) => Some(
            net::bind_unix(path).map_err(|e| format!("cannot bind {}: {}", path.display(), e))?,
        ),
        None => None,
    };
    if tcp_listener.is_none() && unix_listener.is_none() {
        return Err("no listener configured".to_string());
    }
    if let Some(addr) = &ctx.config.lmtp.tcp {
        log::info!("lmtpd listening on {}", addr);
    }
    if let Some(path) = &ctx.config.lmtp.socket {
        log::info!("lmtpd listening on {}", path.display());
    }

    loop {
        tokio::select! {
            accepted = accept_tcp(&tcp_listener) => {
                if let Some(stream) = accepted {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = lmtp::serve(stream, ctx).await {
                            log::debug!("lmtp session ended with error: {}", e);
                        }
                    });
                }
            }
            accepted = accept_unix(&unix_listener) => {
                if let Some(stream) = accepted {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = lmtp::serve(stream, ctx).await {
                            log::debug!("lmtp session ended with error: {}", e);
                        }
                    });
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.map_err(|e| e.to_string())?;
                break;
            }
        }
    }

    log::info!("lmtpd shutting down");
    drop(tcp_listener);
    if let Some(path) = &ctx.config.lmtp.socket {
        let _ = std::fs::remove_file(path);
    }
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    ctx.pool.close_all();
    Ok(())
}

async fn accept_tcp(
    listener: &Option<tokio::net::TcpListener>,
) -> Option<tokio::net::TcpStream> {
    match listener {
        Some(l) => match l.accept().await {
            Ok((stream, peer)) => {
                log::debug!("lmtp connection from {}", peer);
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
