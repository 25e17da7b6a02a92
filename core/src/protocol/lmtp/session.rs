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

//! LMTP session state machine: LHLO → MAIL → RCPT* → DATA, with RSET/NOOP/
//! VRFY/HELP anywhere and QUIT closing. DATA reads the dot-terminated
//! stream (dot-stuffing reversed) and answers exactly once per accepted
//! recipient, in acceptance order; one recipient's failure never cancels
//! the others.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::Config;
use crate::mime;
use crate::protocol::lmtp::{parse_path, split_address};
use crate::store::{StoreError, StorePool, TenantId};

/// Shared server context handed to every delivery session.
pub struct LmtpContext {
    pub config: Arc<Config>,
    pub pool: Arc<StorePool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitLhlo,
    WaitMail,
    WaitRcpt,
}

enum Flow {
    Continue,
    Quit,
}

pub struct LmtpSession<S> {
    stream: S,
    ctx: Arc<LmtpContext>,
    state: State,
    sender: Option<String>,
    recipients: Vec<String>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> LmtpSession<S> {
    pub fn new(stream: S, ctx: Arc<LmtpContext>) -> Self {
        Self {
            stream,
            ctx,
            state: State::WaitLhlo,
            sender: None,
            recipients: Vec::new(),
        }
    }

    fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub async fn run(&mut self) -> io::Result<()> {
        let greeting = format!("220 {} LMTP Service ready", self.config().hostname);
        self.reply(&greeting).await?;
        let deadline = Duration::from_secs(self.config().lmtp_timeout_secs);
        loop {
            let line = match tokio::time::timeout(deadline, self.read_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    let _ = self.reply("421 4.4.2 idle timeout, closing channel").await;
                    return Ok(());
                }
            };
            let text = String::from_utf8_lossy(&line).to_string();
            match self.dispatch(text.trim()).await? {
                Flow::Continue => {}
                Flow::Quit => return Ok(()),
            }
        }
    }

    async fn dispatch(&mut self, line: &str) -> io::Result<Flow> {
        if line.is_empty() {
            self.reply("500 5.5.2 empty command").await?;
            return Ok(Flow::Continue);
        }
        let (verb, rest) = match line.find(' ') {
            Some(i) => (line[..i].to_ascii_uppercase(), line[i + 1..].trim()),
            None => (line.to_ascii_uppercase(), ""),
        };
        match verb.as_str() {
            "LHLO" => self.cmd_lhlo().await?,
            "MAIL" => self.cmd_mail(rest).await?,
            "RCPT" => self.cmd_rcpt(rest).await?,
            "DATA" => self.cmd_data().await?,
            "RSET" => {
                self.reset_transaction();
                self.reply("250 2.0.0 OK").await?;
            }
            "NOOP" => self.reply("250 2.0.0 OK").await?,
            "VRFY" => self.reply("252 2.5.2 cannot verify, try delivery").await?,
            "HELP" => {
                self.reply("214 2.0.0 commands: LHLO MAIL RCPT DATA RSET NOOP VRFY QUIT")
                    .await?
            }
            "QUIT" => {
                self.reply(&format!("221 2.0.0 {} closing channel", self.config().hostname))
                    .await?;
                return Ok(Flow::Quit);
            }
            _ => self.reply("500 5.5.2 command not recognized").await?,
        }
        Ok(Flow::Continue)
    }

    async fn cmd_lhlo(&mut self) -> io::Result<()> {
        let lines = format!(
            "250-{}\r\n250-PIPELINING\r\n250-ENHANCEDSTATUSCODES\r\n250-SIZE {}\r\n250 8BITMIME\r\n",
            self.config().hostname,
            self.config().max_size
        );
        self.stream.write_all(lines.as_bytes()).await?;
        self.stream.flush().await?;
        self.state = State::WaitMail;
        self.reset_transaction();
        Ok(())
    }

    async fn cmd_mail(&mut self, rest: &str) -> io::Result<()> {
        if self.state == State::WaitLhlo {
            return self.reply("503 5.5.1 send LHLO first").await;
        }
        if self.sender.is_some() {
            return self.reply("503 5.5.1 nested MAIL command").await;
        }
        let Some(args) = strip_keyword(rest, "FROM:") else {
            return self.reply("501 5.5.4 syntax: MAIL FROM:<address>").await;
        };
        let Some(address) = parse_path(args) else {
            return self.reply("501 5.1.7 bad sender address").await;
        };
        self.sender = Some(address);
        self.state = State::WaitRcpt;
        self.reply("250 2.1.0 sender OK").await
    }

    async fn cmd_rcpt(&mut self, rest: &str) -> io::Result<()> {
        if self.sender.is_none() {
            return self.reply("503 5.5.1 send MAIL first").await;
        }
        let Some(args) = strip_keyword(rest, "TO:") else {
            return self.reply("501 5.5.4 syntax: RCPT TO:<address>").await;
        };
        let address = match parse_path(args) {
            Some(a) if !a.is_empty() => a.to_ascii_lowercase(),
            _ => return self.reply("501 5.1.3 bad recipient address").await,
        };
        let Some((local, domain)) = split_address(&address) else {
            return self.reply("501 5.1.3 bad recipient address").await;
        };

        if self.recipients.len() >= self.config().max_recipients as usize {
            return self.reply("452 4.5.3 too many recipients").await;
        }
        let allowed = &self.config().allowed_domains;
        if !allowed.is_empty() && !allowed.iter().any(|d| d == &domain) {
            return self.reply("550 5.7.1 relay not permitted").await;
        }
        if self.config().reject_unknown_user {
            let known = self.recipient_exists(&local, &domain, &address);
            match known {
                Ok(true) => {}
                Ok(false) => return self.reply("550 5.1.1 no such user").await,
                Err(e) => {
                    log::warn!("recipient lookup failed: {}", e);
                    return self.reply("450 4.3.0 temporary lookup failure").await;
                }
            }
        }
        self.recipients.push(address);
        self.reply("250 2.1.5 recipient OK").await
    }

    fn recipient_exists(
        &self,
        local: &str,
        domain: &str,
        address: &str,
    ) -> Result<bool, StoreError> {
        let catalog = self.ctx.pool.catalog();
        if catalog.find_user(local, domain)?.is_some() {
            return Ok(true);
        }
        Ok(catalog.find_role(address)?.is_some())
    }

    async fn cmd_data(&mut self) -> io::Result<()> {
        if self.sender.is_none() || self.recipients.is_empty() {
            return self.reply("503 5.5.1 need MAIL and RCPT first").await;
        }
        self.reply("354 end data with <CRLF>.<CRLF>").await?;

        let max = self.config().max_size as usize;
        let (data, truncated) = self.read_data(max).await?;
        if truncated {
            self.reset_to_wait_mail();
            return self.reply("552 5.3.4 message exceeds maximum size").await;
        }
        let parsed = match mime::parse(&data) {
            Ok(p) => p,
            Err(StoreError::TooLarge(_)) => {
                self.reset_to_wait_mail();
                return self.reply("552 5.3.4 message exceeds maximum size").await;
            }
            Err(e) => {
                log::info!("rejecting unparseable message: {}", e);
                self.reset_to_wait_mail();
                return self.reply("554 5.6.0 message not accepted").await;
            }
        };

        // The defining LMTP feature: one reply per accepted recipient, in
        // acceptance order.
        let sender = self.sender.clone().unwrap_or_default();
        let recipients = std::mem::take(&mut self.recipients);
        let now = chrono::Utc::now().timestamp();
        for recipient in &recipients {
            let reply = match self.deliver_one(recipient, &parsed) {
                Ok(()) => {
                    log::info!("delivered message from <{}> to <{}>", sender, recipient);
                    format!("250 2.0.0 <{}> message delivered", recipient)
                }
                Err(e) => {
                    log::warn!("delivery to <{}> failed: {}", recipient, e);
                    format!("550 5.3.0 <{}> delivery failed", recipient)
                }
            };
            let status = if reply.starts_with("250") { "delivered" } else { "failed" };
            if let Err(e) = self
                .ctx
                .pool
                .catalog()
                .record_delivery(&sender, recipient, now, status)
            {
                log::warn!("delivery record failed: {}", e);
            }
            self.reply(&reply).await?;
        }
        self.reset_to_wait_mail();
        Ok(())
    }

    /// Store the message once per recipient tenant and link it into INBOX.
    fn deliver_one(&self, recipient: &str, parsed: &mime::Parsed) -> Result<(), StoreError> {
        let tenant = self.resolve_recipient(recipient)?;
        let store = self.ctx.pool.tenant(tenant)?;
        let inbox = store
            .mailbox_by_name("INBOX")?
            .ok_or_else(|| StoreError::NotFound("INBOX".to_string()))?;
        let message_id = store.store_message(parsed)?;
        store.add_link(inbox.id, message_id, &[], chrono::Utc::now().timestamp())?;
        Ok(())
    }

    fn resolve_recipient(&self, recipient: &str) -> Result<TenantId, StoreError> {
        let catalog = self.ctx.pool.catalog();
        let (local, domain) = split_address(recipient)
            .ok_or_else(|| StoreError::NotFound(recipient.to_string()))?;
        if let Some((user_id, _)) = catalog.find_user(&local, &domain)? {
            return Ok(TenantId::User(user_id));
        }
        if let Some(role_id) = catalog.find_role(recipient)? {
            return Ok(TenantId::Role(role_id));
        }
        if self.config().reject_unknown_user {
            return Err(StoreError::NotFound(recipient.to_string()));
        }
        // Accept-all setups provision the user on first delivery.
        let (user_id, _, _) = catalog.ensure_user(&local, &domain)?;
        Ok(TenantId::User(user_id))
    }

    /// Read the dot-terminated DATA stream, reversing dot-stuffing. Returns
    /// (data, truncated): when the size cap is hit the rest is drained and
    /// `truncated` is set.
    async fn read_data(&mut self, max: usize) -> io::Result<(Vec<u8>, bool)> {
        let mut data = Vec::new();
        let mut truncated = false;
        loop {
            let Some(line) = self.read_line().await? else {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during DATA",
                ));
            };
            if line == b"." {
                return Ok((data, truncated));
            }
            let line: &[u8] = if line.starts_with(b"..") {
                &line[1..]
            } else {
                &line
            };
            if !truncated {
                data.extend_from_slice(line);
                data.extend_from_slice(b"\r\n");
                if data.len() > max {
                    truncated = true;
                    data.clear();
                }
            }
        }
    }

    fn reset_transaction(&mut self) {
        self.sender = None;
        self.recipients.clear();
        if self.state == State::WaitRcpt {
            self.state = State::WaitMail;
        }
    }

    fn reset_to_wait_mail(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.state = State::WaitMail;
    }

    /// Read one line; CRLF expected, bare LF tolerated, raw bytes returned
    /// (DATA content is not text).
    async fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
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
        Ok(Some(buf))
    }

    async fn reply(&mut self, line: &str) -> io::Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await
    }
}

/// Case-insensitive keyword prefix (e.g. `FROM:` in `MAIL FROM:<x>`).
fn strip_keyword<'a>(input: &'a str, keyword: &str) -> Option<&'a str> {
    if input.len() < keyword.len() {
        return None;
    }
    let (head, tail) = input.split_at(keyword.len());
    if head.eq_ignore_ascii_case(keyword) {
        Some(tail.trim())
    } else {
        None
    }
}

/// Drive one accepted LMTP connection.
pub async fn serve<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    ctx: Arc<LmtpContext>,
) -> io::Result<()> {
    LmtpSession::new(stream, ctx).run().await
}
