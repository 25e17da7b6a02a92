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

//! Message codec types: header list with folding preserved, MIME part tree,
//! reconstruction to a structurally-equivalent byte stream.

pub mod address;
pub mod parser;

pub use parser::parse;

/// Hard cap on message size (octets of the canonicalized stream).
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// One message header. `value` is everything after the colon, verbatim:
/// leading whitespace and fold line breaks (CRLF + WSP) are kept so the
/// original octets can be re-emitted.
#[derive(Debug, Clone)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Unfolded value: fold CRLFs removed (their trailing WSP stays), outer
    /// whitespace trimmed.
    pub fn unfolded(&self) -> String {
        self.value.replace("\r\n", "").trim().to_string()
    }

    /// The header as it appears on the wire, without the terminating CRLF.
    pub fn raw(&self) -> String {
        format!("{}:{}", self.name, self.value)
    }
}

/// Body of a part: leaf octets, or nested parts delimited by a boundary.
#[derive(Debug, Clone)]
pub enum PartBody {
    Leaf(Vec<u8>),
    Multipart { boundary: String, parts: Vec<Part> },
}

/// One MIME entity: ordered headers plus a leaf or multipart body.
#[derive(Debug, Clone)]
pub struct Part {
    pub headers: Vec<Header>,
    pub body: PartBody,
}

impl Part {
    /// First header with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&Header> {
        self.headers.iter().find(|h| h.is(name))
    }

    /// Unfolded value of the first header with the given name.
    pub fn header_unfolded(&self, name: &str) -> Option<String> {
        self.header(name).map(Header::unfolded)
    }

    /// Content-Type of this part; text/plain with us-ascii charset when the
    /// header is absent or unparseable (RFC 2045 default).
    pub fn content_type(&self) -> ContentType {
        self.header_unfolded("Content-Type")
            .and_then(|v| ContentType::parse(&v))
            .unwrap_or_default()
    }

    /// Content-Transfer-Encoding token, defaulting to 7bit.
    pub fn transfer_encoding(&self) -> String {
        self.header_unfolded("Content-Transfer-Encoding")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "7bit".to_string())
    }

    /// Serialize headers followed by the blank separator line.
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for h in &self.headers {
            out.extend_from_slice(h.raw().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Serialize the body only (leaf octets, or boundary-framed children).
    pub fn body_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_body(&mut out);
        out
    }

    fn write_body(&self, out: &mut Vec<u8>) {
        match &self.body {
            PartBody::Leaf(bytes) => out.extend_from_slice(bytes),
            PartBody::Multipart { boundary, parts } => {
                for part in parts {
                    out.extend_from_slice(b"--");
                    out.extend_from_slice(boundary.as_bytes());
                    out.extend_from_slice(b"\r\n");
                    part.write_to(out);
                    out.extend_from_slice(b"\r\n");
                }
                out.extend_from_slice(b"--");
                out.extend_from_slice(boundary.as_bytes());
                out.extend_from_slice(b"--\r\n");
            }
        }
    }

    /// Serialize headers + separator + body.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.header_bytes());
        self.write_body(out);
    }

    /// Number of CRLF-terminated lines in the serialized body (for text
    /// parts in BODYSTRUCTURE).
    pub fn body_line_count(&self) -> u64 {
        let body = self.body_bytes();
        let mut lines = body.iter().filter(|&&b| b == b'\n').count() as u64;
        if !body.is_empty() && body.last() != Some(&b'\n') {
            lines += 1;
        }
        lines
    }
}

/// A parsed message: the root entity of the tree.
#[derive(Debug, Clone)]
pub struct Parsed {
    pub root: Part,
}

impl Parsed {
    /// Reproduce a byte stream that re-parses to the same tree. Not
    /// guaranteed byte-identical to the ingested stream (line endings are
    /// canonicalized, preamble/epilogue of multiparts are not kept).
    pub fn reconstruct(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.root.write_to(&mut out);
        out
    }

    /// Octet length of the reconstructed stream.
    pub fn size(&self) -> u64 {
        self.reconstruct().len() as u64
    }
}

/// Parsed Content-Type: primary/sub types and parameters in header order.
#[derive(Debug, Clone)]
pub struct ContentType {
    pub primary: String,
    pub sub: String,
    pub params: Vec<(String, String)>,
}

impl Default for ContentType {
    fn default() -> Self {
        Self {
            primary: "text".to_string(),
            sub: "plain".to_string(),
            params: vec![("charset".to_string(), "us-ascii".to_string())],
        }
    }
}

impl ContentType {
    /// Parse a Content-Type value (type/subtype; name=value; name="value").
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (type_part, params_part) = match value.find(';') {
            Some(i) => (value[..i].trim(), value[i + 1..].trim()),
            None => (value, ""),
        };
        let slash = type_part.find('/')?;
        let primary = type_part[..slash].trim();
        let sub = type_part[slash + 1..].trim();
        if primary.is_empty() || sub.is_empty() {
            return None;
        }
        Some(Self {
            primary: primary.to_string(),
            sub: sub.to_string(),
            params: parse_parameters(params_part),
        })
    }

    pub fn is_primary(&self, t: &str) -> bool {
        self.primary.eq_ignore_ascii_case(t)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse a semicolon-separated parameter list, keeping order. Quoted values
/// may contain `;` and backslash escapes.
pub fn parse_parameters(params_part: &str) -> Vec<(String, String)> {
    let bytes = params_part.as_bytes();
    let len = bytes.len();
    let mut params = Vec::new();
    let mut pos = 0;

    while pos < len {
        while pos < len && (bytes[pos] == b';' || bytes[pos].is_ascii_whitespace()) {
            pos += 1;
        }
        if pos >= len {
            break;
        }
        let eq = match bytes[pos..].iter().position(|&b| b == b'=') {
            Some(i) => pos + i,
            None => break,
        };
        let name = String::from_utf8_lossy(&bytes[pos..eq]).trim().to_string();
        pos = eq + 1;
        let value = if pos < len && bytes[pos] == b'"' {
            pos += 1;
            let mut v = String::new();
            while pos < len {
                let c = bytes[pos];
                if c == b'\\' && pos + 1 < len {
                    v.push(bytes[pos + 1] as char);
                    pos += 2;
                } else if c == b'"' {
                    pos += 1;
                    break;
                } else {
                    v.push(c as char);
                    pos += 1;
                }
            }
            v
        } else {
            let end = bytes[pos..]
                .iter()
                .position(|&b| b == b';')
                .map(|i| pos + i)
                .unwrap_or(len);
            let v = String::from_utf8_lossy(&bytes[pos..end]).trim().to_string();
            pos = end;
            v
        };
        if !name.is_empty() {
            params.push((name, value));
        }
    }
    params
}
