/*
 * parser.rs
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

//! Ingest parser: canonicalize to CRLF, split headers from body at the first
//! empty line, recurse into multipart bodies by boundary.

use crate::mime::{Header, Parsed, Part, PartBody, MAX_MESSAGE_SIZE};
use crate::store::StoreError;

/// Nested multiparts deeper than this are kept as leaf bytes.
const MAX_DEPTH: usize = 16;

/// Parse a raw message. The top-level entity must contain a header/body
/// separator (an empty line); sub-parts are parsed leniently.
pub fn parse(raw: &[u8]) -> Result<Parsed, StoreError> {
    if raw.len() > MAX_MESSAGE_SIZE {
        return Err(StoreError::TooLarge(MAX_MESSAGE_SIZE as u64));
    }
    let data = canonicalize_crlf(raw);
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(StoreError::TooLarge(MAX_MESSAGE_SIZE as u64));
    }
    if find_separator(&data).is_none() {
        return Err(StoreError::ParseFailed(
            "no header/body separator".to_string(),
        ));
    }
    Ok(Parsed {
        root: parse_part(&data, 0),
    })
}

/// Rewrite bare LF (and bare CR) line endings to CRLF.
pub fn canonicalize_crlf(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'\r' => {
                out.extend_from_slice(b"\r\n");
                if i + 1 < raw.len() && raw[i + 1] == b'\n' {
                    i += 1;
                }
            }
            b'\n' => out.extend_from_slice(b"\r\n"),
            b => out.push(b),
        }
        i += 1;
    }
    out
}

/// Offset of the first byte after the blank separator line, or None.
fn find_separator(data: &[u8]) -> Option<usize> {
    if data.starts_with(b"\r\n") {
        return Some(2);
    }
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
}

fn parse_part(data: &[u8], depth: usize) -> Part {
    let (headers, body_start) = match find_separator(data) {
        Some(end) => (parse_headers(&data[..end - 2]), end),
        // Lenient for sub-parts: no separator means no headers.
        None => (Vec::new(), 0),
    };
    let body = &data[body_start..];

    let part_stub = Part {
        headers,
        body: PartBody::Leaf(Vec::new()),
    };
    let ct = part_stub.content_type();
    let boundary = ct.param("boundary").map(str::to_string);
    let headers = part_stub.headers;

    if depth < MAX_DEPTH && ct.is_primary("multipart") {
        if let Some(boundary) = boundary {
            if !boundary.is_empty() {
                let children = split_multipart(body, &boundary);
                if !children.is_empty() {
                    return Part {
                        headers,
                        body: PartBody::Multipart {
                            boundary,
                            parts: children
                                .into_iter()
                                .map(|c| parse_part(c, depth + 1))
                                .collect(),
                        },
                    };
                }
            }
        }
    }

    Part {
        headers,
        body: PartBody::Leaf(body.to_vec()),
    }
}

/// Parse a header block (no trailing blank line). Folded continuation lines
/// are appended to the previous header with their CRLF kept; lines without a
/// colon are dropped.
fn parse_headers(block: &[u8]) -> Vec<Header> {
    let mut headers: Vec<Header> = Vec::new();
    for line in split_lines(block) {
        let text = String::from_utf8_lossy(line);
        if line.first().map(|&b| b == b' ' || b == b'\t').unwrap_or(false) {
            if let Some(last) = headers.last_mut() {
                last.value.push_str("\r\n");
                last.value.push_str(&text);
            }
            continue;
        }
        if let Some(colon) = text.find(':') {
            let name = text[..colon].trim_end().to_string();
            if name.is_empty() {
                continue;
            }
            headers.push(Header::new(name, text[colon + 1..].to_string()));
        }
    }
    headers
}

/// Split on CRLF, yielding lines without their terminator.
fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        if data[i] == b'\r' && data[i + 1] == b'\n' {
            lines.push(&data[start..i]);
            i += 2;
            start = i;
        } else {
            i += 1;
        }
    }
    if start < data.len() {
        lines.push(&data[start..]);
    }
    lines
}

/// Slice the body of a multipart into its child entities. Content before the
/// first boundary (preamble) and after the closing boundary (epilogue) is
/// discarded; the CRLF preceding a boundary belongs to the boundary.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let open = format!("--{}", boundary);
    let close = format!("--{}--", boundary);
    let mut parts = Vec::new();
    let mut current_start: Option<usize> = None;

    for line in split_lines(body) {
        let line_start = line.as_ptr() as usize - body.as_ptr() as usize;
        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim_end();
        let is_close = trimmed == close;
        let is_open = trimmed == open;
        if is_open || is_close {
            if let Some(start) = current_start {
                // Strip the CRLF that separates content from this boundary.
                let end = line_start.saturating_sub(2).max(start);
                parts.push(&body[start..end]);
            }
            current_start = if is_close {
                None
            } else {
                Some(line_start + line.len() + 2)
            };
            if is_close {
                break;
            }
        }
    }

    // Unterminated multipart: keep what follows the last open boundary.
    if let Some(start) = current_start {
        if start <= body.len() {
            parts.push(&body[start..]);
        }
    }
    parts
}
