/*
 * fetch.rs
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

//! FETCH engine: item-list tokenizer producing a typed item list, ENVELOPE
//! and BODY/BODYSTRUCTURE builders, body-section extraction with partial
//! ranges. Literal sizes always count the served bytes.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::mime::address::{parse_address_list, Address};
use crate::mime::{Parsed, Part, PartBody};
use crate::protocol::imap::response::{push_literal, quote_string, quoted_or_nil};
use crate::protocol::imap::seqset::SeqSet;
use crate::protocol::imap::session::ImapSession;
use crate::protocol::imap::split_args;
use crate::store::Link;

/// One requested data item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchItem {
    Flags,
    InternalDate,
    Rfc822Size,
    Envelope,
    /// Non-extensible body structure (the `BODY` item without a section).
    Body,
    BodyStructure,
    Uid,
    Section {
        path: SectionPath,
        /// `<start.len>` octet range.
        partial: Option<(u64, u64)>,
        peek: bool,
        /// Item name echoed in the response (partial start appended later).
        label: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionPath {
    Full,
    Header,
    Text,
    HeaderFields(Vec<String>),
    HeaderFieldsNot(Vec<String>),
    Part(Vec<u32>, PartLeaf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartLeaf {
    Content,
    Header,
    Text,
    Mime,
}

/// Parse a FETCH item list: a single item, a macro, or a parenthesized
/// list.
pub fn parse_fetch_items(input: &str) -> Result<Vec<FetchItem>, String> {
    let input = input.trim();
    let inner = if input.starts_with('(') && input.ends_with(')') {
        &input[1..input.len() - 1]
    } else {
        input
    };
    let mut items = Vec::new();
    let tokens = split_args(inner);
    if tokens.is_empty() {
        return Err("no fetch items".to_string());
    }
    for token in tokens {
        items.extend(parse_one_item(&token)?);
    }
    Ok(items)
}

fn parse_one_item(token: &str) -> Result<Vec<FetchItem>, String> {
    let upper = token.to_ascii_uppercase();
    let simple = match upper.as_str() {
        "ALL" => Some(vec![
            FetchItem::Flags,
            FetchItem::InternalDate,
            FetchItem::Rfc822Size,
            FetchItem::Envelope,
        ]),
        "FAST" => Some(vec![
            FetchItem::Flags,
            FetchItem::InternalDate,
            FetchItem::Rfc822Size,
        ]),
        "FULL" => Some(vec![
            FetchItem::Flags,
            FetchItem::InternalDate,
            FetchItem::Rfc822Size,
            FetchItem::Envelope,
            FetchItem::Body,
        ]),
        "FLAGS" => Some(vec![FetchItem::Flags]),
        "INTERNALDATE" => Some(vec![FetchItem::InternalDate]),
        "RFC822.SIZE" => Some(vec![FetchItem::Rfc822Size]),
        "ENVELOPE" => Some(vec![FetchItem::Envelope]),
        "BODY" => Some(vec![FetchItem::Body]),
        "BODYSTRUCTURE" => Some(vec![FetchItem::BodyStructure]),
        "UID" => Some(vec![FetchItem::Uid]),
        "RFC822" => Some(vec![FetchItem::Section {
            path: SectionPath::Full,
            partial: None,
            peek: false,
            label: "RFC822".to_string(),
        }]),
        "RFC822.PEEK" => Some(vec![FetchItem::Section {
            path: SectionPath::Full,
            partial: None,
            peek: true,
            label: "RFC822".to_string(),
        }]),
        "RFC822.HEADER" => Some(vec![FetchItem::Section {
            path: SectionPath::Header,
            partial: None,
            peek: true,
            label: "RFC822.HEADER".to_string(),
        }]),
        "RFC822.TEXT" => Some(vec![FetchItem::Section {
            path: SectionPath::Text,
            partial: None,
            peek: false,
            label: "RFC822.TEXT".to_string(),
        }]),
        _ => None,
    };
    if let Some(items) = simple {
        return Ok(items);
    }

    // BODY[...] / BODY.PEEK[...] with an optional <start.len> partial,
    // parsed from the case-preserved token.
    let (peek, rest) = if upper.starts_with("BODY.PEEK[") {
        (true, &token["BODY.PEEK[".len()..])
    } else if upper.starts_with("BODY[") {
        (false, &token["BODY[".len()..])
    } else {
        return Err(format!("unknown fetch item: {}", token));
    };
    let close = rest
        .rfind(']')
        .ok_or_else(|| format!("unterminated section in {}", token))?;
    let section_text = &rest[..close];
    let partial_text = &rest[close + 1..];
    let partial = parse_partial(partial_text)?;
    let path = parse_section(section_text)?;
    let label = format!("BODY[{}]", canonical_section(&path));
    Ok(vec![FetchItem::Section {
        path,
        partial,
        peek,
        label,
    }])
}

fn parse_partial(text: &str) -> Result<Option<(u64, u64)>, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let inner = text
        .strip_prefix('<')
        .and_then(|t| t.strip_suffix('>'))
        .ok_or_else(|| format!("bad partial range: {}", text))?;
    let (start, len) = inner
        .split_once('.')
        .ok_or_else(|| format!("bad partial range: {}", text))?;
    let start = start
        .parse()
        .map_err(|_| format!("bad partial start: {}", start))?;
    let len = len.parse().map_err(|_| format!("bad partial length: {}", len))?;
    Ok(Some((start, len)))
}

fn parse_section(text: &str) -> Result<SectionPath, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(SectionPath::Full);
    }
    let upper = text.to_ascii_uppercase();
    if upper == "HEADER" {
        return Ok(SectionPath::Header);
    }
    if upper == "TEXT" {
        return Ok(SectionPath::Text);
    }
    if let Some(fields) = parse_header_fields(text, "HEADER.FIELDS.NOT")? {
        return Ok(SectionPath::HeaderFieldsNot(fields));
    }
    if let Some(fields) = parse_header_fields(text, "HEADER.FIELDS")? {
        return Ok(SectionPath::HeaderFields(fields));
    }

    // Numeric part path, optionally followed by .HEADER / .TEXT / .MIME.
    let mut numbers = Vec::new();
    let mut leaf = PartLeaf::Content;
    for (i, segment) in text.split('.').enumerate() {
        if let Ok(n) = segment.parse::<u32>() {
            if n == 0 {
                return Err("part numbers start at 1".to_string());
            }
            numbers.push(n);
            continue;
        }
        // First non-numeric segment: the rest is the leaf selector.
        let tail = text
            .split('.')
            .skip(i)
            .collect::<Vec<_>>()
            .join(".")
            .to_ascii_uppercase();
        leaf = match tail.as_str() {
            "HEADER" => PartLeaf::Header,
            "TEXT" => PartLeaf::Text,
            "MIME" => PartLeaf::Mime,
            _ => return Err(format!("bad section: {}", text)),
        };
        break;
    }
    if numbers.is_empty() {
        return Err(format!("bad section: {}", text));
    }
    Ok(SectionPath::Part(numbers, leaf))
}

fn parse_header_fields(text: &str, keyword: &str) -> Result<Option<Vec<String>>, String> {
    let upper = text.to_ascii_uppercase();
    if !upper.starts_with(keyword) {
        return Ok(None);
    }
    let rest = text[keyword.len()..].trim();
    // HEADER.FIELDS is a prefix of HEADER.FIELDS.NOT; require a list next.
    if !rest.starts_with('(') || !rest.ends_with(')') {
        return Ok(None);
    }
    let names: Vec<String> = rest[1..rest.len() - 1]
        .split_whitespace()
        .map(|s| s.trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if names.is_empty() {
        return Err("empty header field list".to_string());
    }
    Ok(Some(names))
}

fn canonical_section(path: &SectionPath) -> String {
    match path {
        SectionPath::Full => String::new(),
        SectionPath::Header => "HEADER".to_string(),
        SectionPath::Text => "TEXT".to_string(),
        SectionPath::HeaderFields(names) => {
            format!("HEADER.FIELDS ({})", names.join(" "))
        }
        SectionPath::HeaderFieldsNot(names) => {
            format!("HEADER.FIELDS.NOT ({})", names.join(" "))
        }
        SectionPath::Part(numbers, leaf) => {
            let path: Vec<String> = numbers.iter().map(u32::to_string).collect();
            let mut out = path.join(".");
            match leaf {
                PartLeaf::Content => {}
                PartLeaf::Header => out.push_str(".HEADER"),
                PartLeaf::Text => out.push_str(".TEXT"),
                PartLeaf::Mime => out.push_str(".MIME"),
            }
            out
        }
    }
}

/// Octets of one section of a message.
pub fn section_bytes(parsed: &Parsed, path: &SectionPath) -> Vec<u8> {
    match path {
        SectionPath::Full => parsed.reconstruct(),
        SectionPath::Header => parsed.root.header_bytes(),
        SectionPath::Text => parsed.root.body_bytes(),
        SectionPath::HeaderFields(names) => filter_headers(&parsed.root, names, true),
        SectionPath::HeaderFieldsNot(names) => filter_headers(&parsed.root, names, false),
        SectionPath::Part(numbers, leaf) => {
            let Some(part) = locate_part(&parsed.root, numbers) else {
                return Vec::new();
            };
            match leaf {
                PartLeaf::Content => part.body_bytes(),
                PartLeaf::Header | PartLeaf::Mime => part.header_bytes(),
                PartLeaf::Text => part.body_bytes(),
            }
        }
    }
}

/// Selected headers, original folding kept, in request order, terminated by
/// an empty line. For the NOT form, all headers except the named ones, in
/// message order.
fn filter_headers(part: &Part, names: &[String], include: bool) -> Vec<u8> {
    let mut out = Vec::new();
    if include {
        for name in names {
            for header in part.headers.iter().filter(|h| h.is(name)) {
                out.extend_from_slice(header.raw().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
    } else {
        for header in &part.headers {
            if names.iter().any(|n| header.is(n)) {
                continue;
            }
            out.extend_from_slice(header.raw().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Walk a numeric part path. Part 1 of a non-multipart entity is the entity
/// itself.
fn locate_part<'a>(root: &'a Part, numbers: &[u32]) -> Option<&'a Part> {
    let mut current = root;
    for &n in numbers {
        match &current.body {
            PartBody::Multipart { parts, .. } => {
                current = parts.get(n as usize - 1)?;
            }
            PartBody::Leaf(_) if n == 1 => {}
            PartBody::Leaf(_) => return None,
        }
    }
    Some(current)
}

/// Slice a section per the `<start.len>` partial. Out of range yields the
/// empty string.
pub fn apply_partial(data: Vec<u8>, partial: Option<(u64, u64)>) -> Vec<u8> {
    match partial {
        None => data,
        Some((start, len)) => {
            let start = start as usize;
            if start >= data.len() {
                return Vec::new();
            }
            let end = std::cmp::min(start.saturating_add(len as usize), data.len());
            data[start..end].to_vec()
        }
    }
}

fn address_list_string(addresses: &[Address]) -> String {
    if addresses.is_empty() {
        return "NIL".to_string();
    }
    let mut out = String::from("(");
    for a in addresses {
        out.push('(');
        out.push_str(&quoted_or_nil(a.name.as_deref()));
        out.push_str(" NIL ");
        out.push_str(&quote_string(&a.local));
        out.push(' ');
        out.push_str(&quote_string(&a.domain));
        out.push(')');
    }
    out.push(')');
    out
}

/// The ten-field ENVELOPE structure. Sender and Reply-To fall back to From.
pub fn envelope_string(part: &Part) -> String {
    let header_addresses = |name: &str| -> Vec<Address> {
        part.header_unfolded(name)
            .map(|v| parse_address_list(&v))
            .unwrap_or_default()
    };
    let from = header_addresses("From");
    let sender = match header_addresses("Sender") {
        v if v.is_empty() => from.clone(),
        v => v,
    };
    let reply_to = match header_addresses("Reply-To") {
        v if v.is_empty() => from.clone(),
        v => v,
    };
    format!(
        "({} {} {} {} {} {} {} {} {} {})",
        quoted_or_nil(part.header_unfolded("Date").as_deref()),
        quoted_or_nil(part.header_unfolded("Subject").as_deref()),
        address_list_string(&from),
        address_list_string(&sender),
        address_list_string(&reply_to),
        address_list_string(&header_addresses("To")),
        address_list_string(&header_addresses("Cc")),
        address_list_string(&header_addresses("Bcc")),
        quoted_or_nil(part.header_unfolded("In-Reply-To").as_deref()),
        quoted_or_nil(part.header_unfolded("Message-ID").as_deref()),
    )
}

fn params_string(params: &[(String, String)]) -> String {
    if params.is_empty() {
        return "NIL".to_string();
    }
    let rendered: Vec<String> = params
        .iter()
        .map(|(n, v)| {
            format!(
                "{} {}",
                quote_string(&n.to_ascii_uppercase()),
                quote_string(v)
            )
        })
        .collect();
    format!("({})", rendered.join(" "))
}

fn disposition_string(part: &Part) -> String {
    let Some(value) = part.header_unfolded("Content-Disposition") else {
        return "NIL".to_string();
    };
    let (kind, params_part) = match value.find(';') {
        Some(i) => (value[..i].trim(), value[i + 1..].trim()),
        None => (value.trim(), ""),
    };
    if kind.is_empty() {
        return "NIL".to_string();
    }
    let params = crate::mime::parse_parameters(params_part);
    format!(
        "({} {})",
        quote_string(&kind.to_ascii_uppercase()),
        params_string(&params)
    )
}

/// BODY (non-extensible) or BODYSTRUCTURE (with disposition and language
/// extensions) for one entity.
pub fn body_structure_string(part: &Part, extended: bool) -> String {
    match &part.body {
        PartBody::Multipart { boundary, parts } => {
            let mut out = String::from("(");
            for child in parts {
                out.push_str(&body_structure_string(child, extended));
            }
            let ct = part.content_type();
            out.push(' ');
            out.push_str(&quote_string(&ct.sub.to_ascii_uppercase()));
            if extended {
                out.push(' ');
                out.push_str(&params_string(&[(
                    "BOUNDARY".to_string(),
                    boundary.clone(),
                )]));
                out.push(' ');
                out.push_str(&disposition_string(part));
                out.push_str(" NIL");
            }
            out.push(')');
            out
        }
        PartBody::Leaf(_) => {
            let ct = part.content_type();
            let size = part.body_bytes().len();
            let mut out = format!(
                "({} {} {} {} {} {} {}",
                quote_string(&ct.primary.to_ascii_uppercase()),
                quote_string(&ct.sub.to_ascii_uppercase()),
                params_string(&ct.params),
                quoted_or_nil(part.header_unfolded("Content-ID").as_deref()),
                quoted_or_nil(part.header_unfolded("Content-Description").as_deref()),
                quote_string(&part.transfer_encoding().to_ascii_uppercase()),
                size
            );
            if ct.is_primary("text") {
                out.push_str(&format!(" {}", part.body_line_count()));
            }
            if extended {
                out.push_str(" NIL ");
                out.push_str(&disposition_string(part));
                out.push_str(" NIL");
            }
            out.push(')');
            out
        }
    }
}

/// INTERNALDATE rendering (UTC).
pub fn format_internal_date(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%d-%b-%Y %H:%M:%S +0000").to_string())
        .unwrap_or_else(|| "01-Jan-1970 00:00:00 +0000".to_string())
}

impl<S: AsyncRead + AsyncWrite + Unpin> ImapSession<S> {
    pub(crate) async fn cmd_fetch(
        &mut self,
        tag: &str,
        args: &str,
        uid_mode: bool,
    ) -> io::Result<()> {
        if self.selected.is_none() {
            return self.tagged_no(tag, "no mailbox selected").await;
        }
        let Some((set_text, item_text)) = args.split_once(' ') else {
            return self.tagged_bad(tag, "FETCH needs a set and items").await;
        };
        let set = match SeqSet::parse(set_text) {
            Ok(s) => s,
            Err(e) => return self.tagged_bad(tag, &e).await,
        };
        let mut items = match parse_fetch_items(item_text) {
            Ok(i) => i,
            Err(e) => return self.tagged_bad(tag, &e).await,
        };
        if uid_mode && !items.contains(&FetchItem::Uid) {
            items.insert(0, FetchItem::Uid);
        }

        let (store, mailbox_id, read_only) = {
            let sel = self.selected.as_ref().unwrap();
            (sel.store.clone(), sel.mailbox_id, sel.read_only)
        };
        let links = match store.links(mailbox_id) {
            Ok(l) => l,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        let targets = resolve_targets(&links, &set, uid_mode);

        for (seq, link) in targets {
            let needs_message = items.iter().any(|i| {
                matches!(
                    i,
                    FetchItem::Envelope
                        | FetchItem::Body
                        | FetchItem::BodyStructure
                        | FetchItem::Section { .. }
                )
            });
            let parsed = if needs_message {
                match store.load_message(link.message_id) {
                    Ok(p) => Some(p),
                    Err(e) => return self.respond_store_err(tag, &e).await,
                }
            } else {
                None
            };

            let mut rendered: Vec<Vec<u8>> = Vec::new();
            let mut set_seen = false;
            for item in &items {
                match item {
                    FetchItem::Flags => {
                        let mut flags = link.flags.clone();
                        if link.recent {
                            flags.push("\\Recent".to_string());
                        }
                        rendered.push(format!("FLAGS ({})", flags.join(" ")).into_bytes());
                    }
                    FetchItem::InternalDate => rendered.push(
                        format!(
                            "INTERNALDATE \"{}\"",
                            format_internal_date(link.internal_date)
                        )
                        .into_bytes(),
                    ),
                    FetchItem::Rfc822Size => {
                        let size = match store.message_size(link.message_id) {
                            Ok(s) => s,
                            Err(e) => return self.respond_store_err(tag, &e).await,
                        };
                        rendered.push(format!("RFC822.SIZE {}", size).into_bytes());
                    }
                    FetchItem::Uid => rendered.push(format!("UID {}", link.uid).into_bytes()),
                    FetchItem::Envelope => {
                        let parsed = parsed.as_ref().unwrap();
                        rendered.push(
                            format!("ENVELOPE {}", envelope_string(&parsed.root)).into_bytes(),
                        );
                    }
                    FetchItem::Body => {
                        let parsed = parsed.as_ref().unwrap();
                        rendered.push(
                            format!("BODY {}", body_structure_string(&parsed.root, false))
                                .into_bytes(),
                        );
                    }
                    FetchItem::BodyStructure => {
                        let parsed = parsed.as_ref().unwrap();
                        rendered.push(
                            format!(
                                "BODYSTRUCTURE {}",
                                body_structure_string(&parsed.root, true)
                            )
                            .into_bytes(),
                        );
                    }
                    FetchItem::Section {
                        path,
                        partial,
                        peek,
                        label,
                    } => {
                        let parsed = parsed.as_ref().unwrap();
                        let data = apply_partial(section_bytes(parsed, path), *partial);
                        let mut buf = Vec::new();
                        match partial {
                            Some((start, _)) => {
                                buf.extend_from_slice(format!("{}<{}> ", label, start).as_bytes())
                            }
                            None => buf.extend_from_slice(format!("{} ", label).as_bytes()),
                        }
                        push_literal(&mut buf, &data);
                        rendered.push(buf);
                        if !peek {
                            set_seen = true;
                        }
                    }
                }
            }

            if set_seen && !read_only && !link.has_flag("\\Seen") {
                let mut flags = link.flags.clone();
                flags.push("\\Seen".to_string());
                if let Err(e) = store.set_link_flags(link.id, &flags) {
                    return self.respond_store_err(tag, &e).await;
                }
            }

            let mut response = format!("* {} FETCH (", seq).into_bytes();
            for (i, item) in rendered.iter().enumerate() {
                if i > 0 {
                    response.push(b' ');
                }
                response.extend_from_slice(item);
            }
            response.extend_from_slice(b")\r\n");
            self.write_raw(&response).await?;
        }

        let verb = if uid_mode { "UID FETCH" } else { "FETCH" };
        self.tagged_ok(tag, &format!("{} completed", verb)).await
    }
}

/// Match links against a set: by position (sequence mode) or by UID.
/// Returns (sequence number, link) pairs in sequence order.
pub(crate) fn resolve_targets<'a>(
    links: &'a [Link],
    set: &SeqSet,
    uid_mode: bool,
) -> Vec<(u32, &'a Link)> {
    if links.is_empty() {
        return Vec::new();
    }
    if uid_mode {
        let max_uid = links.last().map(|l| l.uid).unwrap_or(0);
        links
            .iter()
            .enumerate()
            .filter(|(_, l)| set.contains(l.uid, max_uid))
            .map(|(i, l)| (i as u32 + 1, l))
            .collect()
    } else {
        let total = links.len() as u32;
        set.resolve(total)
            .into_iter()
            .map(|seq| (seq, &links[seq as usize - 1]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime;

    fn parse_msg(raw: &[u8]) -> Parsed {
        mime::parse(raw).unwrap()
    }

    #[test]
    fn macros_expand() {
        let items = parse_fetch_items("ALL").unwrap();
        assert_eq!(items.len(), 4);
        let items = parse_fetch_items("FULL").unwrap();
        assert!(items.contains(&FetchItem::Body));
    }

    #[test]
    fn body_vs_bodystructure_vs_section() {
        assert_eq!(parse_fetch_items("BODY").unwrap(), vec![FetchItem::Body]);
        assert_eq!(
            parse_fetch_items("BODYSTRUCTURE").unwrap(),
            vec![FetchItem::BodyStructure]
        );
        let items = parse_fetch_items("BODY[]").unwrap();
        assert!(matches!(
            &items[0],
            FetchItem::Section {
                path: SectionPath::Full,
                peek: false,
                ..
            }
        ));
        let items = parse_fetch_items("BODY.PEEK[HEADER]").unwrap();
        assert!(matches!(
            &items[0],
            FetchItem::Section {
                path: SectionPath::Header,
                peek: true,
                ..
            }
        ));
    }

    #[test]
    fn header_fields_keep_request_order_and_case() {
        let items = parse_fetch_items("BODY.PEEK[HEADER.FIELDS (Subject From)]").unwrap();
        match &items[0] {
            FetchItem::Section {
                path: SectionPath::HeaderFields(names),
                ..
            } => assert_eq!(names, &vec!["Subject".to_string(), "From".to_string()]),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn partial_parses_from_typed_token() {
        let items = parse_fetch_items("BODY[TEXT]<10.20>").unwrap();
        match &items[0] {
            FetchItem::Section { partial, .. } => assert_eq!(*partial, Some((10, 20))),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn numeric_part_sections() {
        let items = parse_fetch_items("BODY[1.2]").unwrap();
        match &items[0] {
            FetchItem::Section {
                path: SectionPath::Part(nums, PartLeaf::Content),
                ..
            } => assert_eq!(nums, &vec![1, 2]),
            other => panic!("unexpected item: {:?}", other),
        }
        let items = parse_fetch_items("BODY[2.HEADER]").unwrap();
        assert!(matches!(
            &items[0],
            FetchItem::Section {
                path: SectionPath::Part(_, PartLeaf::Header),
                ..
            }
        ));
    }

    #[test]
    fn section_extraction() {
        let parsed = parse_msg(b"From: a@b\r\nSubject: Hi\r\n\r\nBody text\r\n");
        assert_eq!(
            section_bytes(&parsed, &SectionPath::Header),
            b"From: a@b\r\nSubject: Hi\r\n\r\n".to_vec()
        );
        assert_eq!(
            section_bytes(&parsed, &SectionPath::Text),
            b"Body text\r\n".to_vec()
        );
        let fields = section_bytes(
            &parsed,
            &SectionPath::HeaderFields(vec!["Subject".to_string()]),
        );
        assert_eq!(fields, b"Subject: Hi\r\n\r\n".to_vec());
    }

    #[test]
    fn partial_out_of_range_is_empty() {
        let data = apply_partial(b"0123456789".to_vec(), Some((10, 5)));
        assert!(data.is_empty());
        let data = apply_partial(b"0123456789".to_vec(), Some((8, 5)));
        assert_eq!(data, b"89".to_vec());
    }

    #[test]
    fn envelope_defaults_sender_to_from() {
        let parsed = parse_msg(
            b"Date: Mon, 7 Feb 1994 21:52:25 -0800\r\nFrom: Alice <a@x.com>\r\nTo: b@y.com\r\nSubject: Hello\r\n\r\n.\r\n",
        );
        let env = envelope_string(&parsed.root);
        assert!(env.starts_with("(\"Mon, 7 Feb 1994 21:52:25 -0800\" \"Hello\""));
        // From, Sender, and Reply-To are the same single address.
        let from = "((\"Alice\" NIL \"a\" \"x.com\"))";
        assert_eq!(env.matches(from).count(), 3);
        assert!(env.contains("((NIL NIL \"b\" \"y.com\"))"));
        assert!(env.ends_with("NIL NIL)"));
    }

    #[test]
    fn bodystructure_leaf_and_multipart() {
        let parsed = parse_msg(b"Content-Type: text/plain; charset=utf-8\r\n\r\nhi\r\n");
        let body = body_structure_string(&parsed.root, false);
        assert_eq!(body, "(\"TEXT\" \"PLAIN\" (\"CHARSET\" \"utf-8\") NIL NIL \"7BIT\" 4 1)");
        let ext = body_structure_string(&parsed.root, true);
        assert!(ext.ends_with(" NIL NIL NIL)"));

        let parsed = parse_msg(
            b"Content-Type: multipart/mixed; boundary=zz\r\n\r\n\
--zz\r\nContent-Type: text/plain\r\n\r\na\r\n\
--zz\r\nContent-Type: application/octet-stream\r\n\r\nbb\r\n\
--zz--\r\n",
        );
        let body = body_structure_string(&parsed.root, false);
        assert!(body.starts_with("(("));
        assert!(body.ends_with(" \"MIXED\")"));
        assert!(body.contains("\"APPLICATION\" \"OCTET-STREAM\""));
        let ext = body_structure_string(&parsed.root, true);
        assert!(ext.contains("(\"BOUNDARY\" \"zz\")"));
    }

    #[test]
    fn internal_date_format() {
        assert_eq!(format_internal_date(0), "01-Jan-1970 00:00:00 +0000");
    }

    #[test]
    fn targets_by_seq_and_uid() {
        let mk = |id: i64, uid: u32| Link {
            id,
            message_id: id,
            mailbox_id: 1,
            uid,
            flags: Vec::new(),
            internal_date: 0,
            recent: false,
        };
        let links = vec![mk(1, 5), mk(2, 9), mk(3, 12)];
        let set = SeqSet::parse("2:3").unwrap();
        let targets = resolve_targets(&links, &set, false);
        assert_eq!(
            targets.iter().map(|(s, l)| (*s, l.uid)).collect::<Vec<_>>(),
            vec![(2, 9), (3, 12)]
        );
        let set = SeqSet::parse("9:*").unwrap();
        let targets = resolve_targets(&links, &set, true);
        assert_eq!(
            targets.iter().map(|(s, l)| (*s, l.uid)).collect::<Vec<_>>(),
            vec![(2, 9), (3, 12)]
        );
    }
}
