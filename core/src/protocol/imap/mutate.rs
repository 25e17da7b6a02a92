/*
 * mutate.rs
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

//! Mutations: STORE flag algebra, transactional COPY, APPEND with literals,
//! EXPUNGE/CLOSE with the renumbering rule. A mailbox opened with EXAMINE
//! answers `NO [READ-ONLY]` to STORE and EXPUNGE.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::mime;
use crate::protocol::imap::fetch::resolve_targets;
use crate::protocol::imap::seqset::SeqSet;
use crate::protocol::imap::session::ImapSession;
use crate::protocol::imap::split_args;
use crate::store::{Link, StoreError};

/// Parse a flag list (`(\Seen \Flagged)` or a bare list). System flags are
/// canonicalized so the store holds one spelling; `\Recent` is
/// server-managed and silently dropped.
pub fn parse_flag_list(text: &str) -> Option<Vec<String>> {
    let text = text.trim();
    let inner = if text.starts_with('(') {
        text.strip_prefix('(')?.strip_suffix(')')?
    } else {
        text
    };
    let mut flags = Vec::new();
    for token in inner.split_whitespace() {
        if token.contains('(') || token.contains(')') {
            return None;
        }
        let canonical = canonicalize_flag(token);
        if canonical.eq_ignore_ascii_case("\\Recent") {
            continue;
        }
        if !flags.iter().any(|f: &String| f.eq_ignore_ascii_case(&canonical)) {
            flags.push(canonical);
        }
    }
    Some(flags)
}

fn canonicalize_flag(token: &str) -> String {
    for known in ["\\Seen", "\\Answered", "\\Flagged", "\\Deleted", "\\Draft", "\\Recent"] {
        if token.eq_ignore_ascii_case(known) {
            return known.to_string();
        }
    }
    token.to_string()
}

/// Compact a UID list into set syntax (`5:7,9`), for COPYUID/APPENDUID.
fn uid_set_string(uids: &[u32]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < uids.len() {
        let start = uids[i];
        let mut end = start;
        while i + 1 < uids.len() && uids[i + 1] == end + 1 {
            i += 1;
            end = uids[i];
        }
        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{}:{}", start, end));
        }
        i += 1;
    }
    out
}

enum StoreOp {
    Replace,
    Add,
    Remove,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ImapSession<S> {
    pub(crate) async fn cmd_store(
        &mut self,
        tag: &str,
        args: &str,
        uid_mode: bool,
    ) -> io::Result<()> {
        let Some(sel) = self.selected.as_ref() else {
            return self.tagged_no(tag, "no mailbox selected").await;
        };
        if sel.read_only {
            return self.tagged_no(tag, "[READ-ONLY] mailbox is read-only").await;
        }
        let mut parts = args.splitn(3, ' ');
        let (Some(set_text), Some(item_text), Some(flag_text)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return self.tagged_bad(tag, "STORE needs a set, an item, and flags").await;
        };
        let set = match SeqSet::parse(set_text) {
            Ok(s) => s,
            Err(e) => return self.tagged_bad(tag, &e).await,
        };
        let item = item_text.to_ascii_uppercase();
        let silent = item.ends_with(".SILENT");
        let base = item.trim_end_matches(".SILENT");
        let op = match base {
            "FLAGS" => StoreOp::Replace,
            "+FLAGS" => StoreOp::Add,
            "-FLAGS" => StoreOp::Remove,
            _ => return self.tagged_bad(tag, "invalid STORE data item").await,
        };
        let Some(given) = parse_flag_list(flag_text) else {
            return self.tagged_bad(tag, "bad flag list").await;
        };

        let (store, mailbox_id) = {
            let sel = self.selected.as_ref().unwrap();
            (sel.store.clone(), sel.mailbox_id)
        };
        let links = match store.links(mailbox_id) {
            Ok(l) => l,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        let targets: Vec<(u32, Link)> = resolve_targets(&links, &set, uid_mode)
            .into_iter()
            .map(|(seq, link)| (seq, link.clone()))
            .collect();

        for (seq, link) in targets {
            let new_flags = match op {
                StoreOp::Replace => given.clone(),
                StoreOp::Add => {
                    let mut f = link.flags.clone();
                    for g in &given {
                        if !f.iter().any(|x| x.eq_ignore_ascii_case(g)) {
                            f.push(g.clone());
                        }
                    }
                    f
                }
                StoreOp::Remove => link
                    .flags
                    .iter()
                    .filter(|x| !given.iter().any(|g| g.eq_ignore_ascii_case(x)))
                    .cloned()
                    .collect(),
            };
            if let Err(e) = store.set_link_flags(link.id, &new_flags) {
                return self.respond_store_err(tag, &e).await;
            }
            if !silent {
                let mut shown = new_flags.clone();
                if link.recent {
                    shown.push("\\Recent".to_string());
                }
                let uid_part = if uid_mode {
                    format!(" UID {}", link.uid)
                } else {
                    String::new()
                };
                self.untagged(&format!(
                    "{} FETCH (FLAGS ({}){})",
                    seq,
                    shown.join(" "),
                    uid_part
                ))
                .await?;
            }
        }
        let verb = if uid_mode { "UID STORE" } else { "STORE" };
        self.tagged_ok(tag, &format!("{} completed", verb)).await
    }

    pub(crate) async fn cmd_copy(
        &mut self,
        tag: &str,
        args: &str,
        uid_mode: bool,
    ) -> io::Result<()> {
        if self.selected.is_none() {
            return self.tagged_no(tag, "no mailbox selected").await;
        }
        let Some((set_text, name_text)) = args.split_once(' ') else {
            return self.tagged_bad(tag, "COPY needs a set and a mailbox").await;
        };
        let set = match SeqSet::parse(set_text) {
            Ok(s) => s,
            Err(e) => return self.tagged_bad(tag, &e).await,
        };
        let Some(dest_name) = split_args(name_text).into_iter().next() else {
            return self.tagged_bad(tag, "COPY needs a mailbox name").await;
        };
        let dest = match self.resolve_mailbox_name(&dest_name) {
            Ok(d) => d,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        let dest_info = match dest.store.mailbox_by_name(&dest.local) {
            Ok(Some(info)) => info,
            Ok(None) => {
                return self
                    .tagged_no(tag, "[TRYCREATE] destination mailbox does not exist")
                    .await
            }
            Err(e) => return self.respond_store_err(tag, &e).await,
        };

        let (store, mailbox_id) = {
            let sel = self.selected.as_ref().unwrap();
            (sel.store.clone(), sel.mailbox_id)
        };
        let links = match store.links(mailbox_id) {
            Ok(l) => l,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        let sources: Vec<Link> = resolve_targets(&links, &set, uid_mode)
            .into_iter()
            .map(|(_, link)| link.clone())
            .collect();

        let copied = if std::sync::Arc::ptr_eq(&store, &dest.store) {
            store.copy_links(&sources, dest_info.id)
        } else {
            copy_across_stores(&store, &dest.store, &sources, dest_info.id)
        };
        let new_uids = match copied {
            Ok(uids) => uids,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };

        let verb = if uid_mode { "UID COPY" } else { "COPY" };
        if new_uids.is_empty() {
            return self.tagged_ok(tag, &format!("{} completed", verb)).await;
        }
        let src_uids: Vec<u32> = sources.iter().map(|l| l.uid).collect();
        self.tagged_ok(
            tag,
            &format!(
                "[COPYUID {} {} {}] {} completed",
                dest_info.uid_validity,
                uid_set_string(&src_uids),
                uid_set_string(&new_uids),
                verb
            ),
        )
        .await
    }

    pub(crate) async fn cmd_append(&mut self, tag: &str, args: &str) -> io::Result<()> {
        // <mailbox> [(flags)] [date-time] {n}; the literal marker is last.
        let tokens = split_args(args);
        if tokens.len() < 2 {
            return self.tagged_bad(tag, "APPEND needs a mailbox and a literal").await;
        }
        let literal_spec = tokens.last().unwrap().clone();
        let Some(inner) = literal_spec
            .strip_prefix('{')
            .and_then(|t| t.strip_suffix('}'))
        else {
            return self.tagged_bad(tag, "APPEND needs a literal").await;
        };
        let non_sync = inner.ends_with('+');
        let Ok(size) = inner.trim_end_matches('+').parse::<usize>() else {
            return self.tagged_bad(tag, "bad literal size").await;
        };

        let mailbox = tokens[0].clone();
        let mut flags = Vec::new();
        let mut internal_date = None;
        for token in &tokens[1..tokens.len() - 1] {
            if token.starts_with('(') {
                match parse_flag_list(token) {
                    Some(f) => flags = f,
                    None => return self.tagged_bad(tag, "bad flag list").await,
                }
            } else if let Some(ts) = parse_date_time(token) {
                internal_date = Some(ts);
            } else {
                return self.tagged_bad(tag, "bad APPEND argument").await;
            }
        }

        let dest = match self.resolve_mailbox_name(&mailbox) {
            Ok(d) => d,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        let dest_info = match dest.store.mailbox_by_name(&dest.local) {
            Ok(Some(info)) => info,
            Ok(None) => {
                return self
                    .tagged_no(tag, "[TRYCREATE] no such mailbox")
                    .await
            }
            Err(e) => return self.respond_store_err(tag, &e).await,
        };

        let max_size = self.ctx.config.max_size as usize;
        if size > max_size {
            if non_sync {
                // LITERAL+ clients send the octets regardless; drain them.
                let mut remaining = size;
                while remaining > 0 {
                    let chunk = std::cmp::min(remaining, 64 * 1024);
                    self.read_exact_octets(chunk).await?;
                    remaining -= chunk;
                }
                let _ = self.read_line().await?;
            }
            return self.tagged_no(tag, "message exceeds maximum size").await;
        }

        if !non_sync {
            self.continuation("Ready for literal data").await?;
        }
        let raw = self.read_exact_octets(size).await?;
        // The command line's terminating CRLF follows the literal.
        let _ = self.read_line().await?;

        let parsed = match mime::parse(&raw) {
            Ok(p) => p,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        let timestamp = internal_date.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let stored = dest
            .store
            .store_message(&parsed)
            .and_then(|message_id| dest.store.add_link(dest_info.id, message_id, &flags, timestamp));
        match stored {
            Ok(uid) => {
                log::debug!("APPEND of {} octets into {}", size, mailbox);
                self.tagged_ok(
                    tag,
                    &format!(
                        "[APPENDUID {} {}] APPEND completed",
                        dest_info.uid_validity, uid
                    ),
                )
                .await
            }
            Err(e) => self.respond_store_err(tag, &e).await,
        }
    }

    pub(crate) async fn cmd_expunge(&mut self, tag: &str, silent: bool) -> io::Result<()> {
        let Some(sel) = self.selected.as_ref() else {
            return self.tagged_no(tag, "no mailbox selected").await;
        };
        if sel.read_only {
            return self.tagged_no(tag, "[READ-ONLY] mailbox is read-only").await;
        }
        let (store, mailbox_id) = (sel.store.clone(), sel.mailbox_id);
        let links = match store.links(mailbox_id) {
            Ok(l) => l,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        // (original sequence number, link id) of every \Deleted link, in
        // UID order.
        let doomed: Vec<(u32, i64)> = links
            .iter()
            .enumerate()
            .filter(|(_, l)| l.has_flag("\\Deleted"))
            .map(|(i, l)| (i as u32 + 1, l.id))
            .collect();
        let ids: Vec<i64> = doomed.iter().map(|(_, id)| *id).collect();
        if let Err(e) = store.delete_links(&ids) {
            return self.respond_store_err(tag, &e).await;
        }
        if !silent {
            // Each deletion renumbers the messages after it.
            for (removed, (seq, _)) in doomed.iter().enumerate() {
                self.untagged(&format!("{} EXPUNGE", seq - removed as u32))
                    .await?;
            }
        }
        if let Some(sel) = self.selected.as_mut() {
            sel.exists = sel.exists.saturating_sub(doomed.len() as u32);
        }
        self.tagged_ok(tag, "EXPUNGE completed").await
    }

    pub(crate) async fn cmd_close(&mut self, tag: &str) -> io::Result<()> {
        let Some(sel) = self.selected.as_ref() else {
            return self.tagged_no(tag, "no mailbox selected").await;
        };
        // CLOSE of an EXAMINE-selected mailbox removes nothing.
        if !sel.read_only {
            let (store, mailbox_id) = (sel.store.clone(), sel.mailbox_id);
            let links = match store.links(mailbox_id) {
                Ok(l) => l,
                Err(e) => return self.respond_store_err(tag, &e).await,
            };
            let ids: Vec<i64> = links
                .iter()
                .filter(|l| l.has_flag("\\Deleted"))
                .map(|l| l.id)
                .collect();
            if let Err(e) = store.delete_links(&ids) {
                return self.respond_store_err(tag, &e).await;
            }
        }
        self.selected = None;
        self.tagged_ok(tag, "CLOSE completed").await
    }
}

/// Copy links into another tenant's store: the message is re-stored there,
/// and partial copies are rolled back by deleting the links created so far.
fn copy_across_stores(
    src: &crate::store::TenantStore,
    dest: &crate::store::TenantStore,
    sources: &[Link],
    dest_mailbox_id: i64,
) -> Result<Vec<u32>, StoreError> {
    let mut created_links = Vec::new();
    let mut uids = Vec::new();
    for link in sources {
        let result = src.load_message(link.message_id).and_then(|parsed| {
            let message_id = dest.store_message(&parsed)?;
            dest.add_link(dest_mailbox_id, message_id, &link.flags, link.internal_date)
        });
        match result {
            Ok(uid) => {
                uids.push(uid);
                if let Ok(links) = dest.links(dest_mailbox_id) {
                    if let Some(l) = links.iter().find(|l| l.uid == uid) {
                        created_links.push(l.id);
                    }
                }
            }
            Err(e) => {
                let _ = dest.delete_links(&created_links);
                return Err(e);
            }
        }
    }
    Ok(uids)
}

/// Parse an IMAP date-time (`1-Jan-2026 12:00:00 +0000`, day possibly
/// space-padded) into a unix timestamp.
fn parse_date_time(token: &str) -> Option<i64> {
    let trimmed = token.trim();
    for format in ["%d-%b-%Y %H:%M:%S %z", "%e-%b-%Y %H:%M:%S %z"] {
        if let Ok(dt) = chrono::DateTime::parse_from_str(trimmed, format) {
            return Some(dt.timestamp());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_list_parsing() {
        assert_eq!(
            parse_flag_list("(\\Seen \\Flagged)").unwrap(),
            vec!["\\Seen", "\\Flagged"]
        );
        assert_eq!(parse_flag_list("()").unwrap(), Vec::<String>::new());
        // Case is canonicalized for system flags, keywords kept verbatim.
        assert_eq!(
            parse_flag_list("(\\seen $Forwarded)").unwrap(),
            vec!["\\Seen", "$Forwarded"]
        );
        // \Recent is server-managed.
        assert_eq!(
            parse_flag_list("(\\Recent \\Deleted)").unwrap(),
            vec!["\\Deleted"]
        );
        assert!(parse_flag_list("(a (b))").is_none());
    }

    #[test]
    fn uid_set_compaction() {
        assert_eq!(uid_set_string(&[10, 11]), "10:11");
        assert_eq!(uid_set_string(&[5]), "5");
        assert_eq!(uid_set_string(&[1, 2, 3, 7, 9, 10]), "1:3,7,9:10");
    }

    #[test]
    fn date_time_parsing() {
        let ts = parse_date_time("01-Jan-2026 12:00:00 +0000").unwrap();
        assert_eq!(
            chrono::DateTime::from_timestamp(ts, 0)
                .unwrap()
                .format("%Y-%m-%d %H:%M")
                .to_string(),
            "2026-01-01 12:00"
        );
        let with_offset = parse_date_time("01-Jan-2026 12:00:00 +0200").unwrap();
        assert_eq!(ts - with_offset, 7200);
        assert!(parse_date_time("nonsense").is_none());
    }
}
