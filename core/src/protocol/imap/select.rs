/*
 * select.rs
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

//! SELECT and EXAMINE: both parse identically; they differ in untagged
//! response order (per the RFC examples), the PERMANENTFLAGS set, the
//! read-only marker, and whether \Recent is consumed.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::imap::session::{ImapSession, Selected};
use crate::protocol::imap::split_args;

pub const SYSTEM_FLAGS: &str = "\\Answered \\Flagged \\Deleted \\Seen \\Draft";

impl<S: AsyncRead + AsyncWrite + Unpin> ImapSession<S> {
    pub(crate) async fn cmd_select(
        &mut self,
        tag: &str,
        args: &str,
        examine: bool,
    ) -> io::Result<()> {
        // A failed SELECT leaves no mailbox selected.
        self.selected = None;

        let Some(name) = split_args(args).into_iter().next() else {
            return self.tagged_bad(tag, "need a mailbox name").await;
        };
        let resolved = match self.resolve_mailbox_name(&name) {
            Ok(r) => r,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        let info = match resolved.store.mailbox_by_name(&resolved.local) {
            Ok(Some(info)) => info,
            Ok(None) => return self.tagged_no(tag, "no such mailbox").await,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        let counts = match resolved.store.counts(info.id) {
            Ok(c) => c,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        let first_unseen = match resolved.store.links(info.id) {
            Ok(links) => links
                .iter()
                .position(|l| !l.has_flag("\\Seen"))
                .map(|i| i as u32 + 1),
            Err(e) => return self.respond_store_err(tag, &e).await,
        };

        if !examine {
            self.untagged(&format!("FLAGS ({})", SYSTEM_FLAGS)).await?;
        }
        self.untagged(&format!("{} EXISTS", counts.exists)).await?;
        self.untagged(&format!("{} RECENT", counts.recent)).await?;
        if let Some(seq) = first_unseen {
            self.untagged(&format!("OK [UNSEEN {}] first unseen", seq))
                .await?;
        }
        self.untagged(&format!("OK [UIDVALIDITY {}] UIDs valid", info.uid_validity))
            .await?;
        self.untagged(&format!("OK [UIDNEXT {}] predicted next UID", info.uid_next))
            .await?;
        if examine {
            self.untagged(&format!("FLAGS ({})", SYSTEM_FLAGS)).await?;
            self.untagged("OK [PERMANENTFLAGS ()] no permanent flags")
                .await?;
        } else {
            self.untagged(&format!(
                "OK [PERMANENTFLAGS ({} \\*)] flags accepted",
                SYSTEM_FLAGS
            ))
            .await?;
            // SELECT consumes the recent set; the next session starts fresh.
            if let Err(e) = resolved.store.clear_recent(info.id) {
                return self.respond_store_err(tag, &e).await;
            }
        }

        self.selected = Some(Selected {
            store: resolved.store,
            mailbox_id: info.id,
            name: name.clone(),
            role_id: resolved.role_id,
            uid_validity: info.uid_validity,
            uid_next: info.uid_next,
            exists: counts.exists,
            unseen: counts.unseen,
            read_only: examine,
        });
        if examine {
            self.tagged_ok(tag, "[READ-ONLY] EXAMINE completed").await
        } else {
            self.tagged_ok(tag, "[READ-WRITE] SELECT completed").await
        }
    }
}
