/*
 * catalog.rs
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

//! Shared catalog database: domains, users, role mailboxes, role
//! assignments, delivery records. One per server, shared by all tenants.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::store::StoreError;

/// Schema DDL run on open.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS domains (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    local_part TEXT NOT NULL,
    domain_id INTEGER NOT NULL,
    UNIQUE (local_part, domain_id)
);

CREATE TABLE IF NOT EXISTS role_mailboxes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS role_assignments (
    role_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    PRIMARY KEY (role_id, user_id)
);

CREATE TABLE IF NOT EXISTS deliveries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender TEXT NOT NULL,
    recipient TEXT NOT NULL,
    received_at INTEGER NOT NULL,
    status TEXT NOT NULL
);
";

/// The shared catalog. All operations serialize on the connection mutex;
/// readers are cheap, writers (user creation) are rare.
pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        log::debug!("catalog open at {}", path.display());
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

    /// Domain id, creating the row on first observation.
    pub fn ensure_domain(&self, name: &str) -> Result<i64, StoreError> {
        let name = name.to_ascii_lowercase();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO domains (name) VALUES (?1)",
            params![name],
        )?;
        let id = conn.query_row(
            "SELECT id FROM domains WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn find_domain(&self, name: &str) -> Result<Option<i64>, StoreError> {
        let name = name.to_ascii_lowercase();
        let conn = self.conn.lock().unwrap();
        let id = conn
            .query_row(
                "SELECT id FROM domains WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// User id and domain id, creating both lazily. Returns true when the
    /// user row was created by this call (its tenant store needs init).
    pub fn ensure_user(&self, local_part: &str, domain: &str) -> Result<(i64, i64, bool), StoreError> {
        let domain_id = self.ensure_domain(domain)?;
        let local = local_part.to_ascii_lowercase();
        let conn = self.conn.lock().unwrap();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM users WHERE local_part = ?1 AND domain_id = ?2",
                params![local, domain_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok((id, domain_id, false));
        }
        conn.execute(
            "INSERT INTO users (local_part, domain_id) VALUES (?1, ?2)",
            params![local, domain_id],
        )?;
        let id = conn.last_insert_rowid();
        log::info!("created user {}@{} (id {})", local, domain, id);
        Ok((id, domain_id, true))
    }

    /// Resolve an existing user; None when local part or domain is unknown.
    pub fn find_user(&self, local_part: &str, domain: &str) -> Result<Option<(i64, i64)>, StoreError> {
        let domain_id = match self.find_domain(domain)? {
            Some(id) => id,
            None => return Ok(None),
        };
        let local = local_part.to_ascii_lowercase();
        let conn = self.conn.lock().unwrap();
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM users WHERE local_part = ?1 AND domain_id = ?2",
                params![local, domain_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(|id| (id, domain_id)))
    }

    pub fn create_role(&self, email: &str) -> Result<i64, StoreError> {
        let email = email.to_ascii_lowercase();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO role_mailboxes (email) VALUES (?1)",
            params![email],
        )?;
        let id = conn.query_row(
            "SELECT id FROM role_mailboxes WHERE email = ?1",
            params![email],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn find_role(&self, email: &str) -> Result<Option<i64>, StoreError> {
        let email = email.to_ascii_lowercase();
        let conn = self.conn.lock().unwrap();
        let id = conn
            .query_row(
                "SELECT id FROM role_mailboxes WHERE email = ?1",
                params![email],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn assign_role(&self, role_id: i64, user_id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO role_assignments (role_id, user_id) VALUES (?1, ?2)",
            params![role_id, user_id],
        )?;
        Ok(())
    }

    pub fn role_assigned(&self, role_id: i64, user_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM role_assignments WHERE role_id = ?1 AND user_id = ?2",
            params![role_id, user_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Role mailboxes visible to a user, as (role id, email) ordered by email.
    pub fn roles_for_user(&self, user_id: i64) -> Result<Vec<(i64, String)>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.email FROM role_mailboxes r
             JOIN role_assignments a ON a.role_id = r.id
             WHERE a.user_id = ?1 ORDER BY r.email",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Append one delivery outcome (LMTP bookkeeping).
    pub fn record_delivery(
        &self,
        sender: &str,
        recipient: &str,
        received_at: i64,
        status: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO deliveries (sender, recipient, received_at, status)
             VALUES (?1, ?2, ?3, ?4)",
            params![sender, recipient, received_at, status],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_user_is_lazy_and_idempotent() {
        let catalog = Catalog::open_in_memory().unwrap();
        let (id1, dom1, created1) = catalog.ensure_user("alice", "ex.com").unwrap();
        assert!(created1);
        let (id2, dom2, created2) = catalog.ensure_user("Alice", "EX.COM").unwrap();
        assert!(!created2);
        assert_eq!(id1, id2);
        assert_eq!(dom1, dom2);
    }

    #[test]
    fn find_user_unknown_domain() {
        let catalog = Catalog::open_in_memory().unwrap();
        assert!(catalog.find_user("alice", "nowhere.test").unwrap().is_none());
    }

    #[test]
    fn role_assignment_gate() {
        let catalog = Catalog::open_in_memory().unwrap();
        let (user, _, _) = catalog.ensure_user("bob", "ex.com").unwrap();
        let role = catalog.create_role("support@ex.com").unwrap();
        assert!(!catalog.role_assigned(role, user).unwrap());
        catalog.assign_role(role, user).unwrap();
        assert!(catalog.role_assigned(role, user).unwrap());
        let roles = catalog.roles_for_user(user).unwrap();
        assert_eq!(roles, vec![(role, "support@ex.com".to_string())]);
    }
}
