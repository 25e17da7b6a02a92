/*
 * mailbox.rs
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

//! Mailbox CRUD and naming rules: hierarchical names with `/`, INBOX
//! case-insensitive and indelible, auto-created ancestors, prefix renames,
//! IMAP LIST wildcards, LSUB \Noselect synthesis.

use rusqlite::{params, OptionalExtension, Transaction};

use crate::store::tenant::{allocate_uid_tx, MailboxInfo, TenantStore};
use crate::store::StoreError;

/// Mailboxes every tenant store starts with; none of them can be deleted.
const DEFAULT_MAILBOXES: [(&str, Option<&str>); 4] = [
    ("INBOX", None),
    ("Sent", Some("\\Sent")),
    ("Drafts", Some("\\Drafts")),
    ("Trash", Some("\\Trash")),
];

fn is_protected(name: &str) -> bool {
    name.eq_ignore_ascii_case("INBOX")
        || DEFAULT_MAILBOXES
            .iter()
            .skip(1)
            .any(|(n, _)| *n == name)
}

fn row_to_info(row: &rusqlite::Row<'_>) -> rusqlite::Result<MailboxInfo> {
    Ok(MailboxInfo {
        id: row.get(0)?,
        name: row.get(1)?,
        uid_validity: row.get::<_, i64>(2)? as u32,
        uid_next: row.get::<_, i64>(3)? as u32,
        special_use: row.get(4)?,
    })
}

const INFO_COLUMNS: &str = "id, name, uid_validity, uid_next, special_use";

impl TenantStore {
    /// Create the default mailboxes if missing. Idempotent; called when a
    /// tenant store is first initialized and again on login.
    pub fn ensure_default_mailboxes(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        for (name, special_use) in DEFAULT_MAILBOXES {
            create_mailbox_tx(&tx, name, special_use)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Create a mailbox. Ancestors named by `/` segments are auto-created;
    /// each creation tolerates pre-existence, but the full name itself must
    /// be new. INBOX (any case) and the empty name are rejected.
    pub fn create_mailbox(&self, name: &str) -> Result<i64, StoreError> {
        if name.is_empty() {
            return Err(StoreError::BadName("empty mailbox name".to_string()));
        }
        if name.eq_ignore_ascii_case("INBOX") {
            return Err(StoreError::BadName("INBOX".to_string()));
        }
        if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
            return Err(StoreError::BadName(name.to_string()));
        }
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM mailboxes WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StoreError::Exists(name.to_string()));
        }
        let mut id = 0;
        let mut prefix = String::new();
        for segment in name.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            id = create_mailbox_tx(&tx, &prefix, None)?;
        }
        tx.commit()?;
        Ok(id)
    }

    /// Delete a mailbox and its links. Default mailboxes and mailboxes with
    /// children cannot be deleted.
    pub fn delete_mailbox(&self, name: &str) -> Result<(), StoreError> {
        let resolved = self
            .mailbox_by_name(name)?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if is_protected(&resolved.name) {
            return Err(StoreError::Protected(resolved.name));
        }
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let children: i64 = tx.query_row(
            "SELECT COUNT(*) FROM mailboxes WHERE name LIKE ?1 || '/%'",
            params![resolved.name],
            |row| row.get(0),
        )?;
        if children > 0 {
            return Err(StoreError::HasChildren(resolved.name));
        }
        tx.execute(
            "DELETE FROM message_links WHERE mailbox_id = ?1",
            params![resolved.id],
        )?;
        tx.execute("DELETE FROM mailboxes WHERE id = ?1", params![resolved.id])?;
        tx.commit()?;
        Ok(())
    }

    /// Rename a mailbox. Renaming INBOX moves its links into a freshly
    /// created destination and leaves INBOX empty but intact; any other
    /// rename rewrites the name prefix of the target and its descendants.
    pub fn rename_mailbox(&self, old: &str, new: &str) -> Result<(), StoreError> {
        if new.is_empty() || new.eq_ignore_ascii_case("INBOX") {
            return Err(StoreError::BadName(new.to_string()));
        }
        let source = self
            .mailbox_by_name(old)?
            .ok_or_else(|| StoreError::NotFound(old.to_string()))?;
        if self.mailbox_by_name(new)?.is_some() {
            return Err(StoreError::Exists(new.to_string()));
        }
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        if source.name.eq_ignore_ascii_case("INBOX") {
            let mut dest_id = 0;
            let mut prefix = String::new();
            for segment in new.split('/') {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(segment);
                dest_id = create_mailbox_tx(&tx, &prefix, None)?;
            }
            tx.execute(
                "UPDATE message_links SET mailbox_id = ?1 WHERE mailbox_id = ?2",
                params![dest_id, source.id],
            )?;
            // Moved links keep their UIDs; carry the allocator with them.
            tx.execute(
                "UPDATE mailboxes SET uid_next = ?1 WHERE id = ?2",
                params![source.uid_next as i64, dest_id],
            )?;
            tx.commit()?;
            return Ok(());
        }
        tx.execute(
            "UPDATE mailboxes SET name = ?1 WHERE id = ?2",
            params![new, source.id],
        )?;
        let descendants: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, name FROM mailboxes WHERE name LIKE ?1 || '/%'",
            )?;
            let rows = stmt.query_map(params![source.name], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };
        for (id, name) in descendants {
            let renamed = format!("{}{}", new, &name[source.name.len()..]);
            tx.execute(
                "UPDATE mailboxes SET name = ?1 WHERE id = ?2",
                params![renamed, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Look up a mailbox by name; INBOX matches case-insensitively.
    pub fn mailbox_by_name(&self, name: &str) -> Result<Option<MailboxInfo>, StoreError> {
        let name = if name.eq_ignore_ascii_case("INBOX") {
            "INBOX"
        } else {
            name
        };
        let conn = self.conn.lock().unwrap();
        let info = conn
            .query_row(
                &format!("SELECT {} FROM mailboxes WHERE name = ?1", INFO_COLUMNS),
                params![name],
                |row| row_to_info(row),
            )
            .optional()?;
        Ok(info)
    }

    /// (uid_validity, uid_next) of one mailbox.
    pub fn mailbox_info(&self, id: i64) -> Result<(u32, u32), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT uid_validity, uid_next FROM mailboxes WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u32,
                    row.get::<_, i64>(1)? as u32,
                ))
            },
        )
        .map_err(StoreError::from)
    }

    /// Atomically return the current uid_next and advance it.
    pub fn allocate_uid(&self, mailbox_id: i64) -> Result<u32, StoreError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let uid = allocate_uid_tx(&tx, mailbox_id)?;
        tx.commit()?;
        Ok(uid)
    }

    /// All mailboxes, ordered by name.
    pub fn list_mailboxes(&self) -> Result<Vec<MailboxInfo>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM mailboxes ORDER BY name",
            INFO_COLUMNS
        ))?;
        let rows = stmt.query_map([], |row| row_to_info(row))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Create one mailbox row if absent; returns the id either way.
fn create_mailbox_tx(
    tx: &Transaction<'_>,
    name: &str,
    special_use: Option<&str>,
) -> Result<i64, StoreError> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM mailboxes WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    let uid_validity = next_uid_validity(tx)?;
    let now = chrono::Utc::now().timestamp();
    tx.execute(
        "INSERT INTO mailboxes (name, uid_validity, uid_next, special_use, created_at)
         VALUES (?1, ?2, 1, ?3, ?4)",
        params![name, uid_validity as i64, special_use, now],
    )?;
    Ok(tx.last_insert_rowid())
}

/// UIDVALIDITY allocator: wall-clock seconds, bumped past the last issued
/// value so a deleted-and-recreated mailbox always gets a strictly larger
/// one.
fn next_uid_validity(tx: &Transaction<'_>) -> Result<u32, StoreError> {
    let last: i64 = tx
        .query_row(
            "SELECT value FROM meta WHERE key = 'uid_validity'",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    let next = std::cmp::max(chrono::Utc::now().timestamp(), last + 1);
    tx.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('uid_validity', ?1)",
        params![next],
    )?;
    Ok(next as u32)
}

/// IMAP LIST wildcard match: `*` matches anything, `%` matches anything
/// except the hierarchy delimiter.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    match_bytes(pattern.as_bytes(), name.as_bytes())
}

fn match_bytes(pattern: &[u8], name: &[u8]) -> bool {
    let Some((&p, rest)) = pattern.split_first() else {
        return name.is_empty();
    };
    match p {
        b'*' => (0..=name.len()).any(|i| match_bytes(rest, &name[i..])),
        b'%' => {
            for i in 0..=name.len() {
                if match_bytes(rest, &name[i..]) {
                    return true;
                }
                if i < name.len() && name[i] == b'/' {
                    break;
                }
            }
            false
        }
        _ => !name.is_empty() && name[0] == p && match_bytes(rest, &name[1..]),
    }
}

/// Match a pattern against a mailbox name; INBOX compares case-insensitively.
pub fn matches_mailbox(pattern: &str, name: &str) -> bool {
    if name.eq_ignore_ascii_case("INBOX") {
        return wildcard_match(&pattern.to_ascii_uppercase(), "INBOX");
    }
    wildcard_match(pattern, name)
}

/// LSUB result rows for a pattern: subscribed names that match, plus
/// `\Noselect` entries synthesized for unsubscribed ancestors of subscribed
/// descendants when the pattern uses `%`. Sorted by name, deduplicated.
pub fn lsub_entries(subscriptions: &[String], pattern: &str) -> Vec<(String, bool)> {
    let mut out: Vec<(String, bool)> = Vec::new();
    for name in subscriptions {
        if matches_mailbox(pattern, name) {
            out.push((name.clone(), false));
        }
    }
    if pattern.contains('%') {
        for name in subscriptions {
            let segments: Vec<&str> = name.split('/').collect();
            let mut ancestor = String::new();
            for segment in &segments[..segments.len().saturating_sub(1)] {
                if !ancestor.is_empty() {
                    ancestor.push('/');
                }
                ancestor.push_str(segment);
                if subscriptions.iter().any(|s| s == &ancestor) {
                    continue;
                }
                if matches_mailbox(pattern, &ancestor) {
                    out.push((ancestor.clone(), true));
                }
            }
        }
    }
    out.sort();
    out.dedup();
    // A name both subscribed and synthesized keeps the subscribed row.
    let mut seen = std::collections::HashSet::new();
    out.retain(|(name, _)| seen.insert(name.clone()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TenantStore {
        let s = TenantStore::open_in_memory().unwrap();
        s.ensure_default_mailboxes().unwrap();
        s
    }

    #[test]
    fn defaults_exist_and_are_idempotent() {
        let s = store();
        s.ensure_default_mailboxes().unwrap();
        let names: Vec<String> = s
            .list_mailboxes()
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["Drafts", "INBOX", "Sent", "Trash"]);
    }

    #[test]
    fn create_auto_creates_ancestors() {
        let s = store();
        s.create_mailbox("a/b/c").unwrap();
        let names: Vec<String> = s
            .list_mailboxes()
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"a/b".to_string()));
        assert!(names.contains(&"a/b/c".to_string()));
    }

    #[test]
    fn create_rejects_inbox_and_duplicates() {
        let s = store();
        assert!(matches!(
            s.create_mailbox("inbox"),
            Err(StoreError::BadName(_))
        ));
        s.create_mailbox("Work").unwrap();
        assert!(matches!(
            s.create_mailbox("Work"),
            Err(StoreError::Exists(_))
        ));
    }

    #[test]
    fn delete_rules() {
        let s = store();
        s.create_mailbox("a/b").unwrap();
        assert!(matches!(
            s.delete_mailbox("a"),
            Err(StoreError::HasChildren(_))
        ));
        assert!(matches!(
            s.delete_mailbox("INBOX"),
            Err(StoreError::Protected(_))
        ));
        assert!(matches!(
            s.delete_mailbox("Trash"),
            Err(StoreError::Protected(_))
        ));
        assert!(matches!(
            s.delete_mailbox("gone"),
            Err(StoreError::NotFound(_))
        ));
        s.delete_mailbox("a/b").unwrap();
        s.delete_mailbox("a").unwrap();
    }

    #[test]
    fn rename_rewrites_descendants() {
        let s = store();
        s.create_mailbox("old/x").unwrap();
        s.rename_mailbox("old", "new").unwrap();
        let names: Vec<String> = s
            .list_mailboxes()
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert!(names.contains(&"new".to_string()));
        assert!(names.contains(&"new/x".to_string()));
        assert!(!names.contains(&"old".to_string()));
    }

    #[test]
    fn rename_inbox_moves_links() {
        let s = store();
        let inbox = s.mailbox_by_name("inbox").unwrap().unwrap();
        let parsed = crate::mime::parse(b"From: a@b\r\n\r\nx\r\n").unwrap();
        let msg = s.store_message(&parsed).unwrap();
        let uid = s.add_link(inbox.id, msg, &[], 0).unwrap();
        s.rename_mailbox("INBOX", "Archive2024").unwrap();
        let inbox_after = s.mailbox_by_name("INBOX").unwrap().unwrap();
        assert_eq!(s.links(inbox_after.id).unwrap().len(), 0);
        let dest = s.mailbox_by_name("Archive2024").unwrap().unwrap();
        let moved = s.links(dest.id).unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].uid, uid);
        assert!(dest.uid_next > uid);
    }

    #[test]
    fn uid_validity_strictly_increases_on_recreate() {
        let s = store();
        s.create_mailbox("tmp").unwrap();
        let v1 = s.mailbox_by_name("tmp").unwrap().unwrap().uid_validity;
        s.delete_mailbox("tmp").unwrap();
        s.create_mailbox("tmp").unwrap();
        let v2 = s.mailbox_by_name("tmp").unwrap().unwrap().uid_validity;
        assert!(v2 > v1);
    }

    #[test]
    fn wildcards() {
        assert!(wildcard_match("*", "a/b/c"));
        assert!(wildcard_match("a/*", "a/b/c"));
        assert!(!wildcard_match("%", "a/b"));
        assert!(wildcard_match("%", "a"));
        assert!(wildcard_match("a/%", "a/b"));
        assert!(!wildcard_match("a/%", "a/b/c"));
        assert!(wildcard_match("a*c", "abc"));
        assert!(wildcard_match("a%c", "abc"));
        assert!(matches_mailbox("inbox", "INBOX"));
        assert!(matches_mailbox("IN*", "InBoX"));
    }

    #[test]
    fn lsub_synthesizes_noselect_ancestor() {
        let subs = vec!["Work/Projects".to_string()];
        let entries = lsub_entries(&subs, "%");
        assert_eq!(entries, vec![("Work".to_string(), true)]);
        let entries = lsub_entries(&subs, "Work/%");
        assert_eq!(entries, vec![("Work/Projects".to_string(), false)]);
    }

    #[test]
    fn lsub_subscribed_wins_over_synthesized() {
        let subs = vec!["a".to_string(), "a/b/c".to_string()];
        let entries = lsub_entries(&subs, "%");
        assert_eq!(entries, vec![("a".to_string(), false)]);
    }
}
