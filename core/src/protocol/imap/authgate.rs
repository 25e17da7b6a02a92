/*
 * authgate.rs
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

//! Authentication gate: capability sets by transport security, LOGIN,
//! AUTHENTICATE PLAIN (RFC 4616 NUL-joined payload, base64 with a literal
//! fallback). Credentials are verified by the external identity endpoint;
//! on accept the user and tenant store are provisioned lazily.

use std::io;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::imap::session::ImapSession;
use crate::protocol::imap::split_args;
use crate::store::TenantId;

const CAPS_INSECURE: &str =
    "IMAP4rev1 STARTTLS LOGINDISABLED UIDPLUS IDLE NAMESPACE UNSELECT LITERAL+";
const CAPS_SECURE: &str = "IMAP4rev1 AUTH=PLAIN LOGIN UIDPLUS IDLE NAMESPACE UNSELECT LITERAL+";

/// Capabilities advertised for the current transport.
pub fn capabilities(secure: bool) -> &'static str {
    if secure {
        CAPS_SECURE
    } else {
        CAPS_INSECURE
    }
}

/// Decode an AUTHENTICATE PLAIN payload: base64 of
/// `authzid NUL authcid NUL password`; when base64 decoding fails the
/// payload is treated as the literal NUL-joined form.
pub fn decode_plain(payload: &str) -> Option<(String, String, String)> {
    let raw = match BASE64.decode(payload.trim().as_bytes()) {
        Ok(bytes) => bytes,
        Err(_) => payload.as_bytes().to_vec(),
    };
    let text = String::from_utf8_lossy(&raw);
    let mut fields = text.split('\0');
    let authzid = fields.next()?.to_string();
    let authcid = fields.next()?.to_string();
    let password = fields.next()?.to_string();
    if fields.next().is_some() {
        return None;
    }
    Some((authzid, authcid, password))
}

impl<S: AsyncRead + AsyncWrite + Unpin> ImapSession<S> {
    pub(crate) async fn cmd_login(&mut self, tag: &str, args: &str) -> io::Result<()> {
        if !self.secure {
            return self
                .tagged_no(tag, "[PRIVACYREQUIRED] LOGIN is disabled on insecure connections")
                .await;
        }
        let parts = split_args(args);
        if parts.len() != 2 {
            return self.tagged_bad(tag, "LOGIN needs a name and a password").await;
        }
        self.finish_authentication(tag, &parts[0], &parts[1], "LOGIN")
            .await
    }

    pub(crate) async fn cmd_authenticate(&mut self, tag: &str, args: &str) -> io::Result<()> {
        if !self.secure {
            return self
                .tagged_no(tag, "[PRIVACYREQUIRED] AUTHENTICATE requires a secure connection")
                .await;
        }
        let mechanism = args.trim().to_ascii_uppercase();
        if mechanism != "PLAIN" {
            return self.tagged_no(tag, "unsupported authentication mechanism").await;
        }
        self.continuation("").await?;
        let Some(line) = self.read_line().await? else {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during AUTHENTICATE",
            ));
        };
        if line.trim() == "*" {
            return self.tagged_bad(tag, "AUTHENTICATE cancelled").await;
        }
        let Some((_authzid, authcid, password)) = decode_plain(&line) else {
            return self.tagged_bad(tag, "bad PLAIN response").await;
        };
        self.finish_authentication(tag, &authcid, &password, "AUTHENTICATE")
            .await
    }

    /// Verify credentials with the identity endpoint; on accept, provision
    /// the user lazily and mark the session authenticated.
    async fn finish_authentication(
        &mut self,
        tag: &str,
        username: &str,
        password: &str,
        verb: &str,
    ) -> io::Result<()> {
        let (local, domain) = match username.split_once('@') {
            Some((l, d)) if !l.is_empty() && !d.is_empty() => (l.to_string(), d.to_string()),
            _ => (
                username.to_string(),
                self.ctx.config.hostname.clone(),
            ),
        };
        let email = format!("{}@{}", local, domain);

        let accepted = match self.ctx.auth.verify(&email, password).await {
            Ok(a) => a,
            Err(e) => {
                log::warn!("identity endpoint unreachable: {}", e);
                return self
                    .tagged_no(tag, "[SERVERBUG] identity endpoint unavailable")
                    .await;
            }
        };
        if !accepted {
            log::info!("authentication rejected for {}", email);
            return self
                .tagged_no(tag, "[AUTHENTICATIONFAILED] credentials rejected")
                .await;
        }

        let provision = || -> Result<(i64, i64), crate::store::StoreError> {
            let (user_id, domain_id, _created) =
                self.ctx.pool.catalog().ensure_user(&local, &domain)?;
            // Open the tenant store so default mailboxes exist before the
            // first SELECT.
            self.ctx.pool.tenant(TenantId::User(user_id))?;
            Ok((user_id, domain_id))
        };
        let (user_id, domain_id) = match provision() {
            Ok(ids) => ids,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };

        self.authenticated = true;
        self.user_id = user_id;
        self.domain_id = domain_id;
        self.email = email.clone();
        log::info!("{} authenticated as {}", verb, email);
        self.tagged_ok(
            tag,
            &format!(
                "[CAPABILITY {}] {} completed",
                capabilities(self.secure),
                verb
            ),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_payload_base64() {
        let payload = BASE64.encode(b"\0alice@ex.com\0secret");
        let (authzid, authcid, password) = decode_plain(&payload).unwrap();
        assert_eq!(authzid, "");
        assert_eq!(authcid, "alice@ex.com");
        assert_eq!(password, "secret");
    }

    #[test]
    fn plain_payload_literal_fallback() {
        let (_, authcid, password) = decode_plain("z\0bob\0pw!").unwrap();
        assert_eq!(authcid, "bob");
        assert_eq!(password, "pw!");
    }

    #[test]
    fn plain_payload_wrong_arity() {
        assert!(decode_plain("onlyonefield").is_none());
    }

    #[test]
    fn capability_sets() {
        assert!(capabilities(false).contains("LOGINDISABLED"));
        assert!(capabilities(false).contains("STARTTLS"));
        assert!(capabilities(true).contains("AUTH=PLAIN"));
        assert!(!capabilities(true).contains("LOGINDISABLED"));
    }
}
