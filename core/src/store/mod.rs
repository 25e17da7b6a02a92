/*
 * mod.rs
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

//! Multi-tenant storage substrate: one shared catalog, one database per
//! user, one per role mailbox.

pub mod catalog;
pub mod error;
pub mod mailbox;
pub mod pool;
pub mod tenant;

pub use catalog::Catalog;
pub use error::StoreError;
pub use pool::{StorePool, TenantId};
pub use tenant::{
    flags_from_string, flags_to_string, Link, MailboxCounts, MailboxInfo, TenantStore,
};
