/*
 * pool.rs
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

//! Tenant store pool: one shared handle per open tenant database, created
//! lazily (first open runs schema + default mailboxes). Database filenames
//! derive from numeric ids so local parts never collide with paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::store::catalog::Catalog;
use crate::store::tenant::TenantStore;
use crate::store::StoreError;

/// Identity of one tenant database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TenantId {
    User(i64),
    Role(i64),
}

impl TenantId {
    fn file_name(&self) -> String {
        match self {
            TenantId::User(id) => format!("user-{}.db", id),
            TenantId::Role(id) => format!("role-{}.db", id),
        }
    }
}

/// The storage substrate shared by all sessions: catalog plus per-tenant
/// handles. Handles are shared (`Arc`) between sessions of the same tenant.
pub struct StorePool {
    dir: PathBuf,
    catalog: Arc<Catalog>,
    tenants: Mutex<HashMap<TenantId, Arc<TenantStore>>>,
}

impl StorePool {
    /// Open the pool at a directory, creating it and the catalog database
    /// when absent.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let catalog = Catalog::open(&dir.join("catalog.db"))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            catalog: Arc::new(catalog),
            tenants: Mutex::new(HashMap::new()),
        })
    }

    /// In-memory pool for tests: the catalog and every tenant live in
    /// process memory only.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            dir: PathBuf::new(),
            catalog: Arc::new(Catalog::open_in_memory()?),
            tenants: Mutex::new(HashMap::new()),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Shared handle for one tenant. Idempotent; the first open creates the
    /// schema and the default mailboxes.
    pub fn tenant(&self, id: TenantId) -> Result<Arc<TenantStore>, StoreError> {
        let mut tenants = self.tenants.lock().unwrap();
        if let Some(handle) = tenants.get(&id) {
            return Ok(handle.clone());
        }
        let store = if self.dir.as_os_str().is_empty() {
            TenantStore::open_in_memory()?
        } else {
            TenantStore::open(&self.dir.join(id.file_name()))?
        };
        store.ensure_default_mailboxes()?;
        let handle = Arc::new(store);
        tenants.insert(id, handle.clone());
        Ok(handle)
    }

    /// Drop every open tenant handle; SQLite flushes on close.
    pub fn close_all(&self) {
        let mut tenants = self.tenants.lock().unwrap();
        let n = tenants.len();
        tenants.clear();
        if n > 0 {
            log::info!("closed {} tenant store(s)", n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_handles_are_shared() {
        let pool = StorePool::open_in_memory().unwrap();
        let a = pool.tenant(TenantId::User(1)).unwrap();
        let b = pool.tenant(TenantId::User(1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = pool.tenant(TenantId::Role(1)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn first_open_initializes_defaults() {
        let pool = StorePool::open_in_memory().unwrap();
        let store = pool.tenant(TenantId::User(7)).unwrap();
        assert!(store.mailbox_by_name("INBOX").unwrap().is_some());
        assert!(store.mailbox_by_name("Trash").unwrap().is_some());
    }

    #[test]
    fn file_names_derive_from_ids() {
        assert_eq!(TenantId::User(3).file_name(), "user-3.db");
        assert_eq!(TenantId::Role(9).file_name(), "role-9.db");
    }
}
