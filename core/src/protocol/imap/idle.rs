/*
 * idle.rs
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

//! IDLE: poll the selected mailbox between short reads until the client
//! sends DONE. The poll interval is an implementation detail; the contract
//! is that EXISTS/EXPUNGE deltas arrive within a bounded window. NOOP uses
//! the same delta poll once.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::imap::session::ImapSession;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

impl<S: AsyncRead + AsyncWrite + Unpin> ImapSession<S> {
    pub(crate) async fn cmd_idle(&mut self, tag: &str) -> io::Result<()> {
        if self.selected.is_none() {
            return self.tagged_no(tag, "no mailbox selected").await;
        }
        self.continuation("idling").await?;
        loop {
            match tokio::time::timeout(POLL_INTERVAL, self.read_line()).await {
                Ok(Ok(Some(line))) => {
                    if line.trim().eq_ignore_ascii_case("DONE") {
                        return self.tagged_ok(tag, "IDLE terminated").await;
                    }
                    // Anything else during IDLE is ignored.
                }
                Ok(Ok(None)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed during IDLE",
                    ))
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => self.poll_selected_changes().await?,
            }
        }
    }

    /// Compare the selected mailbox against the cached counters and emit
    /// EXISTS/RECENT growth, tail EXPUNGEs on shrink, or an UNSEEN note.
    /// Also used by NOOP.
    pub(crate) async fn poll_selected_changes(&mut self) -> io::Result<()> {
        let Some(sel) = self.selected.as_ref() else {
            return Ok(());
        };
        let (store, mailbox_id, old_exists, old_unseen) =
            (sel.store.clone(), sel.mailbox_id, sel.exists, sel.unseen);
        let counts = match store.counts(mailbox_id) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("idle poll failed: {}", e);
                return Ok(());
            }
        };
        if counts.exists > old_exists {
            self.untagged(&format!("{} EXISTS", counts.exists)).await?;
            self.untagged(&format!("{} RECENT", counts.exists - old_exists))
                .await?;
        } else if counts.exists < old_exists {
            for seq in ((counts.exists + 1)..=old_exists).rev() {
                self.untagged(&format!("{} EXPUNGE", seq)).await?;
            }
        } else if counts.unseen != old_unseen {
            self.untagged(&format!("OK [UNSEEN {}] unseen count changed", counts.unseen))
                .await?;
        }
        if let Some(sel) = self.selected.as_mut() {
            sel.exists = counts.exists;
            sel.unseen = counts.unseen;
        }
        Ok(())
    }
}
