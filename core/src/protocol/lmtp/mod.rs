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

//! LMTP delivery endpoint (RFC 2033): the ESMTP dialect where DATA answers
//! once per accepted recipient.

pub mod session;

pub use session::{serve, LmtpContext, LmtpSession};

/// Extract the address from a MAIL FROM / RCPT TO argument: the brackets of
/// `<addr>` are stripped first, then trailing ESMTP parameters (SIZE=,
/// BODY=, ...) are dropped. An empty address is the null reverse-path.
pub fn parse_path(input: &str) -> Option<String> {
    let input = input.trim();
    if let Some(open) = input.find('<') {
        let close = input[open..].find('>').map(|i| open + i)?;
        return Some(input[open + 1..close].trim().to_string());
    }
    Some(
        input
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string(),
    )
}

/// Split an address into (local part, domain), both lowercased.
pub fn split_address(addr: &str) -> Option<(String, String)> {
    let at = addr.rfind('@')?;
    let local = addr[..at].trim();
    let domain = addr[at + 1..].trim();
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some((local.to_ascii_lowercase(), domain.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracketed_path_with_parameters() {
        // Brackets are stripped before parameters are split off, so the
        // trailing '>' never leaks into the address.
        assert_eq!(
            parse_path("<sender@example.com> SIZE=1024 BODY=8BITMIME").unwrap(),
            "sender@example.com"
        );
    }

    #[test]
    fn unbracketed_path() {
        assert_eq!(parse_path("user@example.com SIZE=5").unwrap(), "user@example.com");
    }

    #[test]
    fn null_reverse_path() {
        assert_eq!(parse_path("<>").unwrap(), "");
    }

    #[test]
    fn address_split() {
        assert_eq!(
            split_address("Alice@EX.com").unwrap(),
            ("alice".to_string(), "ex.com".to_string())
        );
        assert!(split_address("nodomain").is_none());
        assert!(split_address("@ex.com").is_none());
    }
}
