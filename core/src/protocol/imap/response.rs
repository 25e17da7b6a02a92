/*
 * response.rs
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

//! Response serialization: tagged, untagged, and continuation lines, all
//! CRLF-terminated, with literal octet counts taken from the actual bytes
//! served. Every response a handler emits goes through here.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Writer over one connection. Command processing is serial within a
/// session, so a writer is created per response burst; it never interleaves
/// with another.
pub struct ResponseWriter<'a, W> {
    out: &'a mut W,
}

impl<'a, W: AsyncWrite + Unpin> ResponseWriter<'a, W> {
    pub fn new(out: &'a mut W) -> Self {
        Self { out }
    }

    /// One line, CRLF appended.
    pub async fn line(&mut self, text: &str) -> io::Result<()> {
        self.out.write_all(text.as_bytes()).await?;
        self.out.write_all(b"\r\n").await?;
        self.out.flush().await
    }

    /// Raw bytes, exactly as given (caller accounts for CRLF and literals).
    pub async fn raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(bytes).await?;
        self.out.flush().await
    }

    pub async fn untagged(&mut self, text: &str) -> io::Result<()> {
        self.line(&format!("* {}", text)).await
    }

    pub async fn continuation(&mut self, text: &str) -> io::Result<()> {
        self.line(&format!("+ {}", text)).await
    }

    pub async fn tagged_ok(&mut self, tag: &str, text: &str) -> io::Result<()> {
        self.line(&format!("{} OK {}", tag, text)).await
    }

    pub async fn tagged_no(&mut self, tag: &str, text: &str) -> io::Result<()> {
        self.line(&format!("{} NO {}", tag, text)).await
    }

    pub async fn tagged_bad(&mut self, tag: &str, text: &str) -> io::Result<()> {
        self.line(&format!("{} BAD {}", tag, text)).await
    }
}

/// Append an IMAP literal (`{n}` CRLF + octets) to a response buffer. The
/// count is the byte length of the payload, never a character count.
pub fn push_literal(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(format!("{{{}}}\r\n", payload.len()).as_bytes());
    buf.extend_from_slice(payload);
}

/// Quote a string for an IMAP parenthesized structure; NIL when absent.
pub fn quoted_or_nil(value: Option<&str>) -> String {
    match value {
        Some(v) => quote_string(v),
        None => "NIL".to_string(),
    }
}

/// IMAP quoted string with `\` and `"` escaped. Line breaks are replaced by
/// spaces; quoted strings cannot carry them.
pub fn quote_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\r' | '\n' => out.push(' '),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_are_crlf_terminated() {
        let mut buf = Vec::new();
        {
            let mut w = ResponseWriter::new(&mut buf);
            w.untagged("1 EXISTS").await.unwrap();
            w.tagged_ok("a1", "done").await.unwrap();
        }
        assert_eq!(buf, b"* 1 EXISTS\r\na1 OK done\r\n");
    }

    #[test]
    fn literal_counts_bytes_not_chars() {
        let mut buf = Vec::new();
        push_literal(&mut buf, "héllo".as_bytes());
        assert!(buf.starts_with(b"{6}\r\n"));
    }

    #[test]
    fn quoting_escapes() {
        assert_eq!(quote_string("a\"b\\c"), "\"a\\\"b\\\\c\"");
        assert_eq!(quoted_or_nil(None), "NIL");
    }
}
