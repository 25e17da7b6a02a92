/*
 * mod.rs
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

//! Test harness: in-memory store pools, a throwaway identity endpoint, and
//! line-oriented IMAP/LMTP clients over duplex pipes.

// Each integration binary uses a subset of this module.
#![allow(dead_code)]

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

use portalettere_core::authclient::AuthClient;
use portalettere_core::config::Config;
use portalettere_core::protocol::imap::{ImapContext, ImapSession};
use portalettere_core::protocol::lmtp::{self, LmtpContext};
use portalettere_core::store::StorePool;

/// Identity endpoint that accepts (or rejects) everything.
pub async fn spawn_auth_endpoint(accept: bool) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                let _ = stream.read(&mut buf).await;
                let response = if accept {
                    "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"
                } else {
                    "HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n"
                };
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    format!("http://127.0.0.1:{}/login", port)
}

pub fn test_config(auth_url: &str) -> Config {
    let mut config = Config::default();
    config.hostname = "mx.test".to_string();
    config.auth_url = auth_url.to_string();
    config
}

pub async fn imap_context() -> Arc<ImapContext> {
    let auth_url = spawn_auth_endpoint(true).await;
    let config = test_config(&auth_url);
    Arc::new(ImapContext {
        auth: AuthClient::new(config.auth_url.clone(), false),
        pool: Arc::new(StorePool::open_in_memory().unwrap()),
        config: Arc::new(config),
    })
}

/// LMTP context sharing the IMAP context's pool, so deliveries show up in
/// IMAP sessions.
pub fn lmtp_context(imap: &Arc<ImapContext>) -> Arc<LmtpContext> {
    Arc::new(LmtpContext {
        config: imap.config.clone(),
        pool: imap.pool.clone(),
    })
}

pub struct ImapClient {
    write: WriteHalf<DuplexStream>,
    read: BufReader<ReadHalf<DuplexStream>>,
    next_tag: u32,
}

impl ImapClient {
    /// Spawn a session over a duplex pipe (secure transport) and consume
    /// the greeting.
    pub async fn connect(ctx: Arc<ImapContext>) -> Self {
        Self::connect_with_security(ctx, true).await
    }

    pub async fn connect_with_security(ctx: Arc<ImapContext>, secure: bool) -> Self {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        tokio::spawn(async move {
            let mut session = ImapSession::new(server, secure, false, ctx);
            let _ = session.run().await;
        });
        let (read, write) = tokio::io::split(client);
        let mut this = Self {
            write,
            read: BufReader::new(read),
            next_tag: 0,
        };
        let greeting = this.line().await;
        assert!(greeting.starts_with("* OK"), "greeting: {}", greeting);
        this
    }

    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        self.read.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    pub async fn send(&mut self, text: &str) {
        self.write.write_all(text.as_bytes()).await.unwrap();
        self.write.write_all(b"\r\n").await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.write.write_all(bytes).await.unwrap();
    }

    /// Send one command and collect every response line up to and including
    /// the tagged completion.
    pub async fn cmd(&mut self, rest: &str) -> Vec<String> {
        self.next_tag += 1;
        let tag = format!("a{}", self.next_tag);
        self.send(&format!("{} {}", tag, rest)).await;
        self.collect(&tag).await
    }

    pub async fn collect(&mut self, tag: &str) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.line().await;
            let done = line.starts_with(&format!("{} ", tag));
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    /// Current tag string (for literal continuation flows).
    pub fn make_tag(&mut self) -> String {
        self.next_tag += 1;
        format!("a{}", self.next_tag)
    }

    pub async fn login(&mut self, email: &str) {
        let lines = self.cmd(&format!("LOGIN {} secret", email)).await;
        assert!(
            lines.last().unwrap().contains("OK"),
            "login failed: {:?}",
            lines
        );
    }

    /// APPEND with a synchronizing literal; returns all response lines.
    pub async fn append(&mut self, mailbox: &str, raw: &[u8]) -> Vec<String> {
        let tag = self.make_tag();
        self.send(&format!("{} APPEND {} {{{}}}", tag, mailbox, raw.len()))
            .await;
        let cont = self.line().await;
        assert!(cont.starts_with('+'), "no continuation: {}", cont);
        self.send_raw(raw).await;
        self.send("").await;
        self.collect(&tag).await
    }
}

pub struct LmtpClient {
    write: WriteHalf<DuplexStream>,
    read: BufReader<ReadHalf<DuplexStream>>,
}

impl LmtpClient {
    pub async fn connect(ctx: Arc<LmtpContext>) -> Self {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        tokio::spawn(async move {
            let _ = lmtp::serve(server, ctx).await;
        });
        let (read, write) = tokio::io::split(client);
        let mut this = Self {
            write,
            read: BufReader::new(read),
        };
        let greeting = this.line().await;
        assert!(greeting.starts_with("220"), "greeting: {}", greeting);
        this
    }

    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        self.read.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    pub async fn send(&mut self, text: &str) {
        self.write.write_all(text.as_bytes()).await.unwrap();
        self.write.write_all(b"\r\n").await.unwrap();
    }

    /// One command, one reply line.
    pub async fn cmd(&mut self, text: &str) -> String {
        self.send(text).await;
        self.line().await
    }

    /// LHLO: multiline 250- block ending with a `250 ` line.
    pub async fn lhlo(&mut self) -> Vec<String> {
        self.send("LHLO mx").await;
        let mut lines = Vec::new();
        loop {
            let line = self.line().await;
            let done = line.starts_with("250 ");
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    pub async fn read_lines(&mut self, n: usize) -> Vec<String> {
        let mut lines = Vec::new();
        for _ in 0..n {
            lines.push(self.line().await);
        }
        lines
    }

    /// Terminate DATA with the lone dot and read the reply block (one line
    /// per accepted recipient).
    pub async fn read_lines_after_dot(&mut self, n: usize) -> Vec<String> {
        self.send(".").await;
        self.read_lines(n).await
    }
}
