/*
 * error.rs
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

//! Store and codec errors. Protocol handlers map these onto tagged NO/BAD
//! responses (IMAP) or enhanced status codes (LMTP); none of them terminates
//! a session.

use std::fmt;
use std::io;

/// Errors from the catalog, tenant stores, mailbox operations, or the codec.
#[derive(Debug)]
pub enum StoreError {
    /// Mailbox or message does not exist.
    NotFound(String),
    /// Mailbox already exists (CREATE, RENAME destination).
    Exists(String),
    /// Empty or reserved mailbox name.
    BadName(String),
    /// Mailbox has children and cannot be deleted.
    HasChildren(String),
    /// Default mailbox (INBOX, Sent, Drafts, Trash) cannot be deleted.
    Protected(String),
    /// UNSUBSCRIBE of a name that is not subscribed.
    NotSubscribed(String),
    /// Role mailbox not assigned to the authenticated user.
    Denied(String),
    /// Message exceeds the configured or hard size cap (value is the cap).
    TooLarge(u64),
    /// Raw message could not be parsed (no header/body separator, oversize).
    ParseFailed(String),
    /// Underlying relational engine failure (transient as far as clients go).
    Sql(rusqlite::Error),
    /// Filesystem or socket failure.
    Io(io::Error),
    /// Anything else.
    Message(String),
}

impl StoreError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(m) => write!(f, "not found: {}", m),
            StoreError::Exists(m) => write!(f, "already exists: {}", m),
            StoreError::BadName(m) => write!(f, "bad name: {}", m),
            StoreError::HasChildren(m) => write!(f, "has children: {}", m),
            StoreError::Protected(m) => write!(f, "protected mailbox: {}", m),
            StoreError::NotSubscribed(m) => write!(f, "not subscribed: {}", m),
            StoreError::Denied(m) => write!(f, "permission denied: {}", m),
            StoreError::TooLarge(n) => write!(f, "message exceeds {} octets", n),
            StoreError::ParseFailed(m) => write!(f, "parse failed: {}", m),
            StoreError::Sql(e) => write!(f, "store failure: {}", e),
            StoreError::Io(e) => write!(f, "io failure: {}", e),
            StoreError::Message(m) => write!(f, "{}", m),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sql(e)
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}
