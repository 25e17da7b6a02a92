/*
 * address.rs
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

//! RFC 5322 address-list parsing for ENVELOPE construction. Handles display
//! names (quoted or atoms), angle-addr, bare addr-spec, comments, and
//! flattens groups to their members.

/// One mailbox address: optional display name, local part, domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub name: Option<String>,
    pub local: String,
    pub domain: String,
}

impl Address {
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: None,
            local: local.into(),
            domain: domain.into(),
        }
    }
}

/// Split a header value into addresses. Unparseable fragments are skipped.
pub fn parse_address_list(value: &str) -> Vec<Address> {
    let mut out = Vec::new();
    for item in split_list(value) {
        if let Some(addr) = parse_one(&item) {
            out.push(addr);
        }
    }
    out
}

/// Split on commas that are not inside quotes, comments, or angle brackets.
/// Group syntax (`name: a@b, c@d;`) is unwrapped to its members.
fn split_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut depth_angle = 0i32;
    let mut depth_paren = 0i32;
    let mut in_quote = false;
    let mut escaped = false;

    for c in value.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quote => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quote = !in_quote;
            }
            '(' if !in_quote => depth_paren += 1,
            ')' if !in_quote && depth_paren > 0 => depth_paren -= 1,
            '<' if !in_quote && depth_paren == 0 => {
                current.push(c);
                depth_angle += 1;
            }
            '>' if !in_quote && depth_paren == 0 && depth_angle > 0 => {
                current.push(c);
                depth_angle -= 1;
            }
            ',' | ';' if !in_quote && depth_paren == 0 && depth_angle == 0 => {
                items.push(std::mem::take(&mut current));
            }
            ':' if !in_quote && depth_paren == 0 && depth_angle == 0 => {
                // Group display name ends here; drop it.
                current.clear();
            }
            _ if depth_paren > 0 => {}
            _ => current.push(c),
        }
    }
    items.push(current);
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse one mailbox: `Name <l@d>`, `<l@d>`, or `l@d`.
fn parse_one(item: &str) -> Option<Address> {
    let item = item.trim();
    if let Some(open) = item.rfind('<') {
        let close = item[open..].find('>').map(|i| open + i)?;
        let spec = item[open + 1..close].trim();
        let (local, domain) = split_spec(spec)?;
        let name = clean_display_name(&item[..open]);
        return Some(Address {
            name,
            local,
            domain,
        });
    }
    let (local, domain) = split_spec(item)?;
    Some(Address {
        name: None,
        local,
        domain,
    })
}

fn split_spec(spec: &str) -> Option<(String, String)> {
    let at = spec.rfind('@')?;
    let local = spec[..at].trim();
    let domain = spec[at + 1..].trim();
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some((local.to_string(), domain.to_string()))
}

fn clean_display_name(raw: &str) -> Option<String> {
    let mut name = raw.trim();
    if name.len() >= 2 && name.starts_with('"') && name.ends_with('"') {
        name = &name[1..name.len() - 1];
    }
    let unescaped = name.replace("\\\"", "\"").replace("\\\\", "\\");
    let trimmed = unescaped.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
