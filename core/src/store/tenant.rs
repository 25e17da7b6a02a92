/*
 * tenant.rs
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

//! Per-tenant store: one database per user or role mailbox, holding that
//! tenant's mailboxes, messages (as header/part rows), message links, and
//! subscriptions. Mailbox CRUD lives in mailbox.rs; this file owns the
//! schema, message persistence, and link operations.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, Transaction};

use crate::mime::{Header, Parsed, Part, PartBody};
use crate::store::StoreError;

/// Schema DDL run on open. Hierarchy is encoded in mailbox names (delimiter
/// `/`); message bodies are stored per MIME part so sections can be served
/// without reparsing.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS mailboxes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    uid_validity INTEGER NOT NULL,
    uid_next INTEGER NOT NULL DEFAULT 1,
    special_use TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    size INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS parts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id INTEGER NOT NULL,
    parent_id INTEGER,
    position INTEGER NOT NULL,
    boundary TEXT,
    body BLOB
);
CREATE INDEX IF NOT EXISTS idx_parts_message ON parts(message_id, position);

CREATE TABLE IF NOT EXISTS part_headers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    part_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_part_headers_part ON part_headers(part_id, position);

CREATE TABLE IF NOT EXISTS message_links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id INTEGER NOT NULL,
    mailbox_id INTEGER NOT NULL,
    uid INTEGER NOT NULL,
    flags TEXT NOT NULL DEFAULT '',
    internal_date INTEGER NOT NULL,
    recent INTEGER NOT NULL DEFAULT 1,
    UNIQUE (mailbox_id, uid)
);
CREATE INDEX IF NOT EXISTS idx_links_mailbox ON message_links(mailbox_id, uid);

CREATE TABLE IF NOT EXISTS subscriptions (
    name TEXT PRIMARY KEY
);
";

/// A mailbox row.
#[derive(Debug, Clone)]
pub struct MailboxInfo {
    pub id: i64,
    pub name: String,
    pub uid_validity: u32,
    pub uid_next: u32,
    pub special_use: Option<String>,
}

/// A message-to-mailbox link: the unit of presence IMAP manipulates.
#[derive(Debug, Clone)]
pub struct Link {
    pub id: i64,
    pub message_id: i64,
    pub mailbox_id: i64,
    pub uid: u32,
    pub flags: Vec<String>,
    pub internal_date: i64,
    pub recent: bool,
}

impl Link {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }
}

/// Aggregate counts of one mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxCounts {
    pub exists: u32,
    pub unseen: u32,
    pub recent: u32,
}

pub fn flags_to_string(flags: &[String]) -> String {
    flags.join(" ")
}

pub fn flags_from_string(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

/// One tenant's database handle. Operations serialize on the connection
/// mutex; multi-statement operations (store, copy, expunge) run in an
/// explicit transaction under one lock acquisition.
pub struct TenantStore {
    pub(crate) conn: Mutex<Connection>,
}

struct PartRow {
    id: i64,
    parent_id: Option<i64>,
    boundary: Option<String>,
    body: Option<Vec<u8>>,
    headers: Vec<Header>,
}

impl TenantStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        log::debug!("tenant store open at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persist a parsed message; returns the message id.
    pub fn store_message(&self, parsed: &Parsed) -> Result<i64, StoreError> {
        let size = parsed.size();
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO messages (size, created_at) VALUES (?1, ?2)",
            params![size as i64, now],
        )?;
        let message_id = tx.last_insert_rowid();
        insert_part(&tx, message_id, None, 0, &parsed.root)?;
        tx.commit()?;
        Ok(message_id)
    }

    /// Rebuild the parsed tree of a stored message.
    pub fn load_message(&self, message_id: i64) -> Result<Parsed, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, parent_id, boundary, body
             FROM parts WHERE message_id = ?1 ORDER BY parent_id, position",
        )?;
        let rows = stmt.query_map(params![message_id], |row| {
            Ok(PartRow {
                id: row.get(0)?,
                parent_id: row.get(1)?,
                boundary: row.get(2)?,
                body: row.get(3)?,
                headers: Vec::new(),
            })
        })?;
        let mut parts = Vec::new();
        for row in rows {
            parts.push(row?);
        }
        drop(stmt);
        if parts.is_empty() {
            return Err(StoreError::NotFound(format!("message {}", message_id)));
        }

        let mut header_stmt = conn.prepare(
            "SELECT name, value FROM part_headers WHERE part_id = ?1 ORDER BY position",
        )?;
        for part in parts.iter_mut() {
            let rows = header_stmt.query_map(params![part.id], |row| {
                Ok(Header {
                    name: row.get(0)?,
                    value: row.get(1)?,
                })
            })?;
            for row in rows {
                part.headers.push(row?);
            }
        }
        drop(header_stmt);

        let root_id = parts
            .iter()
            .find(|p| p.parent_id.is_none())
            .map(|p| p.id)
            .ok_or_else(|| StoreError::new("message has no root part"))?;
        let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
        for part in &parts {
            if let Some(parent) = part.parent_id {
                children.entry(parent).or_default().push(part.id);
            }
        }
        let mut by_id: HashMap<i64, PartRow> = parts.into_iter().map(|p| (p.id, p)).collect();
        let root = assemble_part(root_id, &mut by_id, &children);
        Ok(Parsed { root })
    }

    /// Stored size of a message (octets of the reconstructed stream).
    pub fn message_size(&self, message_id: i64) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let size: i64 = conn.query_row(
            "SELECT size FROM messages WHERE id = ?1",
            params![message_id],
            |row| row.get(0),
        )?;
        Ok(size as u64)
    }

    /// Link a message into a mailbox, allocating the next UID. The new link
    /// is recent. Returns the assigned UID.
    pub fn add_link(
        &self,
        mailbox_id: i64,
        message_id: i64,
        flags: &[String],
        internal_date: i64,
    ) -> Result<u32, StoreError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let uid = allocate_uid_tx(&tx, mailbox_id)?;
        tx.execute(
            "INSERT INTO message_links (message_id, mailbox_id, uid, flags, internal_date, recent)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![
                message_id,
                mailbox_id,
                uid,
                flags_to_string(flags),
                internal_date
            ],
        )?;
        tx.commit()?;
        Ok(uid)
    }

    /// All links of a mailbox, ordered by UID ascending (sequence order).
    pub fn links(&self, mailbox_id: i64) -> Result<Vec<Link>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, message_id, mailbox_id, uid, flags, internal_date, recent
             FROM message_links WHERE mailbox_id = ?1 ORDER BY uid",
        )?;
        let rows = stmt.query_map(params![mailbox_id], |row| {
            let flags: String = row.get(4)?;
            let recent: i64 = row.get(6)?;
            Ok(Link {
                id: row.get(0)?,
                message_id: row.get(1)?,
                mailbox_id: row.get(2)?,
                uid: row.get::<_, i64>(3)? as u32,
                flags: flags_from_string(&flags),
                internal_date: row.get(5)?,
                recent: recent != 0,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Replace the flag set of one link.
    pub fn set_link_flags(&self, link_id: i64, flags: &[String]) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE message_links SET flags = ?1 WHERE id = ?2",
            params![flags_to_string(flags), link_id],
        )?;
        Ok(())
    }

    /// Delete links by id, all-or-nothing.
    pub fn delete_links(&self, link_ids: &[i64]) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        for id in link_ids {
            tx.execute("DELETE FROM message_links WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Copy links into a destination mailbox: one transaction, a contiguous
    /// UID block starting at the destination's uid_next, source flags kept,
    /// recent set, source internal date kept.
    pub fn copy_links(&self, links: &[Link], dest_mailbox_id: i64) -> Result<Vec<u32>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let mut uids = Vec::with_capacity(links.len());
        for link in links {
            let uid = allocate_uid_tx(&tx, dest_mailbox_id)?;
            tx.execute(
                "INSERT INTO message_links (message_id, mailbox_id, uid, flags, internal_date, recent)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                params![
                    link.message_id,
                    dest_mailbox_id,
                    uid,
                    flags_to_string(&link.flags),
                    link.internal_date
                ],
            )?;
            uids.push(uid);
        }
        tx.commit()?;
        Ok(uids)
    }

    /// Aggregate counts used by SELECT/STATUS/IDLE.
    pub fn counts(&self, mailbox_id: i64) -> Result<MailboxCounts, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN instr(flags, ?1) = 0 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(recent), 0)
             FROM message_links WHERE mailbox_id = ?2",
            params!["\\Seen", mailbox_id],
            |row| {
                Ok(MailboxCounts {
                    exists: row.get::<_, i64>(0)? as u32,
                    unseen: row.get::<_, i64>(1)? as u32,
                    recent: row.get::<_, i64>(2)? as u32,
                })
            },
        )
        .map_err(StoreError::from)
    }

    /// Clear the recent marker of every link in a mailbox (after the count
    /// has been reported by SELECT).
    pub fn clear_recent(&self, mailbox_id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE message_links SET recent = 0 WHERE mailbox_id = ?1",
            params![mailbox_id],
        )?;
        Ok(())
    }

    pub fn subscribe(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO subscriptions (name) VALUES (?1)",
            params![name],
        )?;
        Ok(())
    }

    pub fn unsubscribe(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM subscriptions WHERE name = ?1", params![name])?;
        if n == 0 {
            return Err(StoreError::NotSubscribed(name.to_string()));
        }
        Ok(())
    }

    pub fn subscriptions(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT name FROM subscriptions ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Read uid_next and advance it, inside the caller's transaction.
pub(crate) fn allocate_uid_tx(tx: &Transaction<'_>, mailbox_id: i64) -> Result<u32, StoreError> {
    let uid: i64 = tx.query_row(
        "SELECT uid_next FROM mailboxes WHERE id = ?1",
        params![mailbox_id],
        |row| row.get(0),
    )?;
    tx.execute(
        "UPDATE mailboxes SET uid_next = uid_next + 1 WHERE id = ?1",
        params![mailbox_id],
    )?;
    Ok(uid as u32)
}

fn insert_part(
    tx: &Transaction<'_>,
    message_id: i64,
    parent_id: Option<i64>,
    position: i64,
    part: &Part,
) -> Result<(), StoreError> {
    let (boundary, body): (Option<&str>, Option<&[u8]>) = match &part.body {
        PartBody::Leaf(bytes) => (None, Some(bytes.as_slice())),
        PartBody::Multipart { boundary, .. } => (Some(boundary.as_str()), None),
    };
    tx.execute(
        "INSERT INTO parts (message_id, parent_id, position, boundary, body)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![message_id, parent_id, position, boundary, body],
    )?;
    let part_id = tx.last_insert_rowid();
    for (i, header) in part.headers.iter().enumerate() {
        tx.execute(
            "INSERT INTO part_headers (part_id, position, name, value)
             VALUES (?1, ?2, ?3, ?4)",
            params![part_id, i as i64, header.name, header.value],
        )?;
    }
    if let PartBody::Multipart { parts, .. } = &part.body {
        for (i, child) in parts.iter().enumerate() {
            insert_part(tx, message_id, Some(part_id), i as i64, child)?;
        }
    }
    Ok(())
}

fn assemble_part(
    id: i64,
    by_id: &mut HashMap<i64, PartRow>,
    children: &HashMap<i64, Vec<i64>>,
) -> Part {
    let row = by_id.remove(&id).expect("part row present");
    let body = match row.boundary {
        Some(boundary) => {
            let kids = children.get(&id).cloned().unwrap_or_default();
            PartBody::Multipart {
                boundary,
                parts: kids
                    .into_iter()
                    .map(|kid| assemble_part(kid, by_id, children))
                    .collect(),
            }
        }
        None => PartBody::Leaf(row.body.unwrap_or_default()),
    };
    Part {
        headers: row.headers,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime;

    fn store_with_inbox() -> (TenantStore, i64) {
        let store = TenantStore::open_in_memory().unwrap();
        store.ensure_default_mailboxes().unwrap();
        let inbox = store.mailbox_by_name("INBOX").unwrap().unwrap();
        (store, inbox.id)
    }

    fn sample_message(store: &TenantStore) -> i64 {
        let parsed =
            mime::parse(b"From: a@b\r\nSubject: Hi\r\n\r\nBody\r\n").unwrap();
        store.store_message(&parsed).unwrap()
    }

    #[test]
    fn message_roundtrip_through_store() {
        let (store, _) = store_with_inbox();
        let raw = b"From: a@b\r\nSubject: Hi\r\n\r\nBody\r\n";
        let parsed = mime::parse(raw).unwrap();
        let id = store.store_message(&parsed).unwrap();
        let loaded = store.load_message(id).unwrap();
        assert_eq!(loaded.reconstruct(), raw.to_vec());
        assert_eq!(store.message_size(id).unwrap(), raw.len() as u64);
    }

    #[test]
    fn multipart_roundtrip_through_store() {
        let (store, _) = store_with_inbox();
        let raw = b"Content-Type: multipart/mixed; boundary=bb\r\n\r\n\
--bb\r\nContent-Type: text/plain\r\n\r\none\r\n\
--bb\r\nContent-Type: text/plain\r\n\r\ntwo\r\n\
--bb--\r\n";
        let parsed = mime::parse(raw).unwrap();
        let id = store.store_message(&parsed).unwrap();
        let loaded = store.load_message(id).unwrap();
        assert_eq!(loaded.reconstruct(), parsed.reconstruct());
    }

    #[test]
    fn uids_are_strictly_increasing() {
        let (store, inbox) = store_with_inbox();
        let msg = sample_message(&store);
        let u1 = store.add_link(inbox, msg, &[], 1000).unwrap();
        let u2 = store.add_link(inbox, msg, &[], 1001).unwrap();
        assert!(u2 > u1);
        let info = store.mailbox_by_name("INBOX").unwrap().unwrap();
        assert!(info.uid_next > u2);
    }

    #[test]
    fn copy_allocates_contiguous_block() {
        let (store, inbox) = store_with_inbox();
        let archive = store.create_mailbox("Archive").unwrap();
        let msg = sample_message(&store);
        store.add_link(inbox, msg, &["\\Seen".to_string()], 1000).unwrap();
        store.add_link(inbox, msg, &[], 1001).unwrap();
        let links = store.links(inbox).unwrap();
        let before = store.mailbox_by_name("Archive").unwrap().unwrap().uid_next;
        let uids = store.copy_links(&links, archive).unwrap();
        assert_eq!(uids, vec![before, before + 1]);
        let copied = store.links(archive).unwrap();
        assert_eq!(copied.len(), 2);
        assert!(copied[0].has_flag("\\Seen"));
        assert!(copied[0].recent);
        assert_eq!(copied[0].internal_date, 1000);
    }

    #[test]
    fn counts_and_recent_clear() {
        let (store, inbox) = store_with_inbox();
        let msg = sample_message(&store);
        store.add_link(inbox, msg, &["\\Seen".to_string()], 1000).unwrap();
        store.add_link(inbox, msg, &[], 1001).unwrap();
        let counts = store.counts(inbox).unwrap();
        assert_eq!(
            counts,
            MailboxCounts {
                exists: 2,
                unseen: 1,
                recent: 2
            }
        );
        store.clear_recent(inbox).unwrap();
        assert_eq!(store.counts(inbox).unwrap().recent, 0);
    }

    #[test]
    fn unsubscribe_missing_fails() {
        let (store, _) = store_with_inbox();
        store.subscribe("Work").unwrap();
        store.subscribe("Work").unwrap();
        store.unsubscribe("Work").unwrap();
        assert!(matches!(
            store.unsubscribe("Work"),
            Err(StoreError::NotSubscribed(_))
        ));
    }

    #[test]
    fn flags_string_roundtrip() {
        let flags = vec!["\\Seen".to_string(), "\\Flagged".to_string()];
        assert_eq!(flags_from_string(&flags_to_string(&flags)), flags);
    }
}
