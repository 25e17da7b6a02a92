/*
 * session.rs
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

//! IMAP session: greeting, line reader, tagged dispatcher, per-connection
//! state. Handlers parse their own arguments and emit every response
//! including the final tagged one; recoverable errors never terminate the
//! session.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::authclient::AuthClient;
use crate::config::Config;
use crate::net::Connection;
use crate::protocol::imap::authgate;
use crate::protocol::imap::response::{quote_string, ResponseWriter};
use crate::protocol::imap::split_args;
use crate::store::mailbox::{lsub_entries, matches_mailbox};
use crate::store::{StoreError, StorePool, TenantId, TenantStore};

/// Per-command read deadline.
const READ_DEADLINE: Duration = Duration::from_secs(30 * 60);

/// Client-facing prefix of role mailboxes.
pub const ROLE_PREFIX: &str = "Roles/";

/// Shared server context handed to every session.
pub struct ImapContext {
    pub config: Arc<Config>,
    pub pool: Arc<StorePool>,
    pub auth: AuthClient,
}

/// The currently selected mailbox and its cached counters.
pub struct Selected {
    pub store: Arc<TenantStore>,
    pub mailbox_id: i64,
    /// Client-facing name (including any `Roles/` prefix).
    pub name: String,
    pub role_id: Option<i64>,
    pub uid_validity: u32,
    pub uid_next: u32,
    pub exists: u32,
    pub unseen: u32,
    pub read_only: bool,
}

/// A mailbox name resolved to its tenant store.
pub struct ResolvedMailbox {
    pub store: Arc<TenantStore>,
    pub local: String,
    pub role_id: Option<i64>,
}

/// How a session run ended.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Closed,
    /// Client asked for STARTTLS and the OK has been sent; the caller owns
    /// the handshake and restarts dispatch with fresh state.
    StartTls,
}

enum Flow {
    Continue,
    Logout,
    StartTls,
}

pub struct ImapSession<S> {
    pub(crate) stream: S,
    pub(crate) secure: bool,
    pub(crate) starttls_available: bool,
    pub(crate) greet: bool,
    pub(crate) ctx: Arc<ImapContext>,
    pub(crate) authenticated: bool,
    pub(crate) user_id: i64,
    pub(crate) domain_id: i64,
    pub(crate) email: String,
    pub(crate) selected: Option<Selected>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ImapSession<S> {
    pub fn new(stream: S, secure: bool, starttls_available: bool, ctx: Arc<ImapContext>) -> Self {
        Self {
            stream,
            secure,
            starttls_available,
            greet: true,
            ctx,
            authenticated: false,
            user_id: 0,
            domain_id: 0,
            email: String::new(),
            selected: None,
        }
    }

    pub fn into_stream(self) -> S {
        self.stream
    }

    /// Greeting plus dispatch loop, until logout, timeout, disconnect, or a
    /// STARTTLS upgrade request. After a STARTTLS upgrade dispatch resumes
    /// without a second greeting.
    pub async fn run(&mut self) -> io::Result<RunOutcome> {
        if self.greet {
            let greeting = format!(
                "OK [CAPABILITY {}] {} IMAP4rev1 service ready",
                authgate::capabilities(self.secure),
                self.ctx.config.hostname
            );
            self.untagged(&greeting).await?;
        }

        loop {
            let line = match tokio::time::timeout(READ_DEADLINE, self.read_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => return Ok(RunOutcome::Closed),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    let _ = self.untagged("BYE autologout; idle for too long").await;
                    return Ok(RunOutcome::Closed);
                }
            };
            if line.is_empty() {
                continue;
            }
            match self.dispatch(&line).await? {
                Flow::Continue => {}
                Flow::Logout => return Ok(RunOutcome::Closed),
                Flow::StartTls => return Ok(RunOutcome::StartTls),
            }
        }
    }

    async fn dispatch(&mut self, line: &str) -> io::Result<Flow> {
        let mut split = line.splitn(2, ' ');
        let tag = split.next().unwrap_or("").to_string();
        let rest = split.next().unwrap_or("").trim();
        if tag.is_empty() || rest.is_empty() {
            let tag = if tag.is_empty() { "*" } else { tag.as_str() };
            self.tagged_bad(tag, "empty command").await?;
            return Ok(Flow::Continue);
        }
        let mut split = rest.splitn(2, ' ');
        let cmd = split.next().unwrap_or("").to_ascii_uppercase();
        let args = split.next().unwrap_or("").trim().to_string();

        // Commands valid in any state.
        match cmd.as_str() {
            "CAPABILITY" => {
                let caps = authgate::capabilities(self.secure);
                self.untagged(&format!("CAPABILITY {}", caps)).await?;
                self.tagged_ok(&tag, "CAPABILITY completed").await?;
                return Ok(Flow::Continue);
            }
            "NOOP" => {
                self.poll_selected_changes().await?;
                self.tagged_ok(&tag, "NOOP completed").await?;
                return Ok(Flow::Continue);
            }
            "LOGOUT" => {
                self.untagged("BYE logging out").await?;
                self.tagged_ok(&tag, "LOGOUT completed").await?;
                log::debug!("session logout ({})", self.email);
                return Ok(Flow::Logout);
            }
            "STARTTLS" => {
                if self.secure {
                    self.tagged_no(&tag, "connection is already secure").await?;
                } else if !self.starttls_available {
                    self.tagged_no(&tag, "TLS is not configured").await?;
                } else {
                    self.tagged_ok(&tag, "Begin TLS negotiation now").await?;
                    return Ok(Flow::StartTls);
                }
                return Ok(Flow::Continue);
            }
            "LOGIN" => {
                self.cmd_login(&tag, &args).await?;
                return Ok(Flow::Continue);
            }
            "AUTHENTICATE" => {
                self.cmd_authenticate(&tag, &args).await?;
                return Ok(Flow::Continue);
            }
            _ => {}
        }

        if !self.authenticated {
            self.tagged_no(&tag, "Please authenticate first").await?;
            return Ok(Flow::Continue);
        }

        match cmd.as_str() {
            "SELECT" => self.cmd_select(&tag, &args, false).await?,
            "EXAMINE" => self.cmd_select(&tag, &args, true).await?,
            "CREATE" => self.cmd_create(&tag, &args).await?,
            "DELETE" => self.cmd_delete(&tag, &args).await?,
            "RENAME" => self.cmd_rename(&tag, &args).await?,
            "SUBSCRIBE" => self.cmd_subscribe(&tag, &args, true).await?,
            "UNSUBSCRIBE" => self.cmd_subscribe(&tag, &args, false).await?,
            "LIST" => self.cmd_list(&tag, &args).await?,
            "LSUB" => self.cmd_lsub(&tag, &args).await?,
            "STATUS" => self.cmd_status(&tag, &args).await?,
            "NAMESPACE" => {
                self.untagged(&format!(
                    "NAMESPACE ((\"\" \"/\")) NIL ((\"{}\" \"/\"))",
                    ROLE_PREFIX
                ))
                .await?;
                self.tagged_ok(&tag, "NAMESPACE completed").await?;
            }
            "APPEND" => self.cmd_append(&tag, &args).await?,
            "CHECK" => {
                if self.selected.is_none() {
                    self.tagged_no(&tag, "no mailbox selected").await?;
                } else {
                    self.tagged_ok(&tag, "CHECK completed").await?;
                }
            }
            "UNSELECT" => {
                if self.selected.take().is_none() {
                    self.tagged_no(&tag, "no mailbox selected").await?;
                } else {
                    self.tagged_ok(&tag, "UNSELECT completed").await?;
                }
            }
            "CLOSE" => self.cmd_close(&tag).await?,
            "EXPUNGE" => self.cmd_expunge(&tag, false).await?,
            "FETCH" => self.cmd_fetch(&tag, &args, false).await?,
            "STORE" => self.cmd_store(&tag, &args, false).await?,
            "COPY" => self.cmd_copy(&tag, &args, false).await?,
            "SEARCH" => self.cmd_search(&tag, &args, false).await?,
            "IDLE" => self.cmd_idle(&tag).await?,
            "UID" => {
                let mut split = args.splitn(2, ' ');
                let sub = split.next().unwrap_or("").to_ascii_uppercase();
                let sub_args = split.next().unwrap_or("").trim().to_string();
                match sub.as_str() {
                    "FETCH" => self.cmd_fetch(&tag, &sub_args, true).await?,
                    "STORE" => self.cmd_store(&tag, &sub_args, true).await?,
                    "COPY" => self.cmd_copy(&tag, &sub_args, true).await?,
                    "SEARCH" => self.cmd_search(&tag, &sub_args, true).await?,
                    _ => self.tagged_bad(&tag, "unknown UID command").await?,
                }
            }
            _ => self.tagged_bad(&tag, "unknown command").await?,
        }
        Ok(Flow::Continue)
    }

    // ---- mailbox commands -------------------------------------------------

    async fn cmd_create(&mut self, tag: &str, args: &str) -> io::Result<()> {
        let Some(name) = split_args(args).into_iter().next() else {
            return self.tagged_bad(tag, "CREATE needs a mailbox name").await;
        };
        let resolved = match self.resolve_mailbox_name(&name) {
            Ok(r) => r,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        match resolved.store.create_mailbox(&resolved.local) {
            Ok(_) => self.tagged_ok(tag, "CREATE completed").await,
            Err(e) => self.respond_store_err(tag, &e).await,
        }
    }

    async fn cmd_delete(&mut self, tag: &str, args: &str) -> io::Result<()> {
        let Some(name) = split_args(args).into_iter().next() else {
            return self.tagged_bad(tag, "DELETE needs a mailbox name").await;
        };
        let resolved = match self.resolve_mailbox_name(&name) {
            Ok(r) => r,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        match resolved.store.delete_mailbox(&resolved.local) {
            Ok(()) => self.tagged_ok(tag, "DELETE completed").await,
            Err(e) => self.respond_store_err(tag, &e).await,
        }
    }

    async fn cmd_rename(&mut self, tag: &str, args: &str) -> io::Result<()> {
        let names = split_args(args);
        if names.len() != 2 {
            return self.tagged_bad(tag, "RENAME needs two mailbox names").await;
        }
        let resolved = match self.resolve_mailbox_name(&names[0]) {
            Ok(r) => r,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        // Renames stay within one tenant store.
        let new_local = if resolved.role_id.is_some() {
            match self.resolve_mailbox_name(&names[1]) {
                Ok(dest) if dest.role_id == resolved.role_id => dest.local,
                Ok(_) => {
                    return self
                        .tagged_no(tag, "cannot rename across stores")
                        .await
                }
                Err(e) => return self.respond_store_err(tag, &e).await,
            }
        } else {
            names[1].clone()
        };
        match resolved.store.rename_mailbox(&resolved.local, &new_local) {
            Ok(()) => self.tagged_ok(tag, "RENAME completed").await,
            Err(e) => self.respond_store_err(tag, &e).await,
        }
    }

    async fn cmd_subscribe(&mut self, tag: &str, args: &str, on: bool) -> io::Result<()> {
        let Some(name) = split_args(args).into_iter().next() else {
            return self.tagged_bad(tag, "need a mailbox name").await;
        };
        let store = match self.user_store() {
            Ok(s) => s,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        let result = if on {
            store.subscribe(&name)
        } else {
            store.unsubscribe(&name)
        };
        match result {
            Ok(()) => {
                let verb = if on { "SUBSCRIBE" } else { "UNSUBSCRIBE" };
                self.tagged_ok(tag, &format!("{} completed", verb)).await
            }
            Err(e) => self.respond_store_err(tag, &e).await,
        }
    }

    async fn cmd_list(&mut self, tag: &str, args: &str) -> io::Result<()> {
        let parts = split_args(args);
        if parts.len() != 2 {
            return self.tagged_bad(tag, "LIST needs a reference and a pattern").await;
        }
        let pattern = format!("{}{}", parts[0], parts[1]);
        if pattern.is_empty() {
            // Empty pattern asks for the hierarchy delimiter.
            self.untagged("LIST (\\Noselect) \"/\" \"\"").await?;
            return self.tagged_ok(tag, "LIST completed").await;
        }
        let entries = match self.list_all_mailboxes() {
            Ok(e) => e,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        for (name, special_use) in entries {
            if !matches_mailbox(&pattern, &name) {
                continue;
            }
            let attrs = special_use.unwrap_or_default();
            self.untagged(&format!("LIST ({}) \"/\" {}", attrs, quote_string(&name)))
                .await?;
        }
        self.tagged_ok(tag, "LIST completed").await
    }

    async fn cmd_lsub(&mut self, tag: &str, args: &str) -> io::Result<()> {
        let parts = split_args(args);
        if parts.len() != 2 {
            return self.tagged_bad(tag, "LSUB needs a reference and a pattern").await;
        }
        let pattern = format!("{}{}", parts[0], parts[1]);
        let store = match self.user_store() {
            Ok(s) => s,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        let subscriptions = match store.subscriptions() {
            Ok(s) => s,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        for (name, noselect) in lsub_entries(&subscriptions, &pattern) {
            let attrs = if noselect { "\\Noselect" } else { "" };
            self.untagged(&format!("LSUB ({}) \"/\" {}", attrs, quote_string(&name)))
                .await?;
        }
        self.tagged_ok(tag, "LSUB completed").await
    }

    async fn cmd_status(&mut self, tag: &str, args: &str) -> io::Result<()> {
        let parts = split_args(args);
        if parts.len() != 2 {
            return self.tagged_bad(tag, "STATUS needs a mailbox and items").await;
        }
        let items = match parse_status_items(&parts[1]) {
            Some(items) => items,
            None => return self.tagged_bad(tag, "bad STATUS items").await,
        };
        let resolved = match self.resolve_mailbox_name(&parts[0]) {
            Ok(r) => r,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        let Some(info) = (match resolved.store.mailbox_by_name(&resolved.local) {
            Ok(i) => i,
            Err(e) => return self.respond_store_err(tag, &e).await,
        }) else {
            return self.tagged_no(tag, "no such mailbox").await;
        };
        let counts = match resolved.store.counts(info.id) {
            Ok(c) => c,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        let mut rendered = Vec::new();
        for item in items {
            let value = match item.as_str() {
                "MESSAGES" => counts.exists,
                "RECENT" => counts.recent,
                "UNSEEN" => counts.unseen,
                "UIDNEXT" => info.uid_next,
                "UIDVALIDITY" => info.uid_validity,
                _ => return self.tagged_bad(tag, "bad STATUS items").await,
            };
            rendered.push(format!("{} {}", item, value));
        }
        self.untagged(&format!(
            "STATUS {} ({})",
            quote_string(&parts[0]),
            rendered.join(" ")
        ))
        .await?;
        self.tagged_ok(tag, "STATUS completed").await
    }

    // ---- shared plumbing --------------------------------------------------

    /// The authenticated user's own tenant store.
    pub(crate) fn user_store(&self) -> Result<Arc<TenantStore>, StoreError> {
        self.ctx.pool.tenant(TenantId::User(self.user_id))
    }

    /// Resolve a client-facing mailbox name to its tenant store. Names under
    /// `Roles/<email>/` go to the role store after an assignment check.
    pub(crate) fn resolve_mailbox_name(&self, name: &str) -> Result<ResolvedMailbox, StoreError> {
        if let Some(rest) = name.strip_prefix(ROLE_PREFIX) {
            let (email, inner) = match rest.find('/') {
                Some(i) => (&rest[..i], &rest[i + 1..]),
                None => (rest, "INBOX"),
            };
            let role_id = self
                .ctx
                .pool
                .catalog()
                .find_role(email)?
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            if !self.ctx.pool.catalog().role_assigned(role_id, self.user_id)? {
                return Err(StoreError::Denied(name.to_string()));
            }
            return Ok(ResolvedMailbox {
                store: self.ctx.pool.tenant(TenantId::Role(role_id))?,
                local: inner.to_string(),
                role_id: Some(role_id),
            });
        }
        Ok(ResolvedMailbox {
            store: self.user_store()?,
            local: name.to_string(),
            role_id: None,
        })
    }

    /// All client-facing mailbox names: the user's own plus, for each role
    /// assignment, the role store's mailboxes under `Roles/<email>/`.
    fn list_all_mailboxes(&self) -> Result<Vec<(String, Option<String>)>, StoreError> {
        let mut out = Vec::new();
        for info in self.user_store()?.list_mailboxes()? {
            out.push((info.name, info.special_use));
        }
        for (role_id, email) in self.ctx.pool.catalog().roles_for_user(self.user_id)? {
            let store = self.ctx.pool.tenant(TenantId::Role(role_id))?;
            for info in store.list_mailboxes()? {
                out.push((
                    format!("{}{}/{}", ROLE_PREFIX, email, info.name),
                    info.special_use,
                ));
            }
        }
        Ok(out)
    }

    /// Map a recoverable store error onto the single tagged response the
    /// command contract requires.
    pub(crate) async fn respond_store_err(
        &mut self,
        tag: &str,
        e: &StoreError,
    ) -> io::Result<()> {
        let text = match e {
            StoreError::Denied(_) => format!("[AUTHORIZATIONFAILED] {}", e),
            StoreError::Sql(_) | StoreError::Io(_) => {
                log::warn!("store failure: {}", e);
                format!("[SERVERBUG] {}", e)
            }
            _ => e.to_string(),
        };
        self.tagged_no(tag, &text).await
    }

    // ---- line IO ----------------------------------------------------------

    /// Read one line; CRLF expected, bare LF tolerated. None on EOF before
    /// any byte.
    pub(crate) async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = Vec::new();
        loop {
            let mut b = [0u8; 1];
            let n = self.stream.read(&mut b).await?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                break;
            }
            if b[0] == b'\n' {
                break;
            }
            buf.push(b[0]);
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    pub(crate) async fn read_exact_octets(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub(crate) async fn untagged(&mut self, text: &str) -> io::Result<()> {
        ResponseWriter::new(&mut self.stream).untagged(text).await
    }

    pub(crate) async fn continuation(&mut self, text: &str) -> io::Result<()> {
        ResponseWriter::new(&mut self.stream)
            .continuation(text)
            .await
    }

    pub(crate) async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        ResponseWriter::new(&mut self.stream).raw(bytes).await
    }

    pub(crate) async fn tagged_ok(&mut self, tag: &str, text: &str) -> io::Result<()> {
        ResponseWriter::new(&mut self.stream)
            .tagged_ok(tag, text)
            .await
    }

    pub(crate) async fn tagged_no(&mut self, tag: &str, text: &str) -> io::Result<()> {
        ResponseWriter::new(&mut self.stream)
            .tagged_no(tag, text)
            .await
    }

    pub(crate) async fn tagged_bad(&mut self, tag: &str, text: &str) -> io::Result<()> {
        ResponseWriter::new(&mut self.stream)
            .tagged_bad(tag, text)
            .await
    }
}

/// Parse the STATUS item list: a parenthesized list of item atoms.
fn parse_status_items(token: &str) -> Option<Vec<String>> {
    let inner = token.strip_prefix('(')?.strip_suffix(')')?;
    let items: Vec<String> = inner
        .split_whitespace()
        .map(|s| s.to_ascii_uppercase())
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Drive one accepted connection: run the session, performing at most one
/// STARTTLS upgrade (dispatch restarts with fresh connection state on the
/// upgraded stream).
pub async fn serve(
    conn: Connection,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
    ctx: Arc<ImapContext>,
) -> io::Result<()> {
    let secure = conn.is_secure();
    let mut session = ImapSession::new(conn, secure, acceptor.is_some(), ctx.clone());
    match session.run().await? {
        RunOutcome::Closed => Ok(()),
        RunOutcome::StartTls => {
            let Some(acceptor) = acceptor else {
                return Ok(());
            };
            let conn = session.into_stream().upgrade_to_tls(&acceptor).await?;
            let mut session = ImapSession::new(conn, true, false, ctx);
            session.greet = false;
            session.run().await?;
            Ok(())
        }
    }
}
