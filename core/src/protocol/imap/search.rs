/*
 * search.rs
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

//! SEARCH engine: token stream after an optional CHARSET qualifier, a
//! predicate tree (implicit AND by juxtaposition, OR/NOT by lexical arity,
//! parenthesized groups), evaluated per message.

use std::io;

use chrono::NaiveDate;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::mime::Parsed;
use crate::protocol::imap::seqset::{looks_like_seq_set, SeqSet};
use crate::protocol::imap::session::ImapSession;
use crate::store::Link;

/// Charsets the evaluator accepts; anything else gets BADCHARSET.
const SUPPORTED_CHARSETS: [&str; 2] = ["US-ASCII", "UTF-8"];

#[derive(Debug, Clone, PartialEq)]
pub enum SearchKey {
    All,
    FlagSet(String),
    FlagUnset(String),
    Recent,
    New,
    Old,
    Not(Box<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
    And(Vec<SearchKey>),
    /// Case-insensitive substring in one header (FROM/TO/CC/BCC/SUBJECT and
    /// the generic HEADER key; an empty needle means header presence).
    Header(String, String),
    Body(String),
    Text(String),
    Larger(u64),
    Smaller(u64),
    Uid(SeqSet),
    Seq(SeqSet),
    Before(NaiveDate),
    On(NaiveDate),
    Since(NaiveDate),
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    SentSince(NaiveDate),
}

#[derive(Debug, PartialEq)]
pub enum SearchParseError {
    BadCharset,
    Syntax(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Atom(String),
    Quoted(String),
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>, SearchParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(c) = chars.next() {
                                s.push(c);
                            }
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        _ => s.push(c),
                    }
                }
                if !closed {
                    return Err(SearchParseError::Syntax("unterminated string".to_string()));
                }
                tokens.push(Token::Quoted(s));
            }
            _ => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ' ' || c == '\t' || c == '(' || c == ')' {
                        break;
                    }
                    s.push(c);
                    chars.next();
                }
                tokens.push(Token::Atom(s));
            }
        }
    }
    Ok(tokens)
}

/// Parse a full SEARCH program, including the optional CHARSET qualifier.
pub fn parse_search(input: &str) -> Result<SearchKey, SearchParseError> {
    let mut tokens = tokenize(input)?;
    if tokens.len() >= 2 {
        if let Token::Atom(a) = &tokens[0] {
            if a.eq_ignore_ascii_case("CHARSET") {
                let charset = match &tokens[1] {
                    Token::Atom(c) | Token::Quoted(c) => c.to_ascii_uppercase(),
                    _ => return Err(SearchParseError::Syntax("bad charset".to_string())),
                };
                if !SUPPORTED_CHARSETS.contains(&charset.as_str()) {
                    return Err(SearchParseError::BadCharset);
                }
                tokens.drain(..2);
            }
        }
    }
    if tokens.is_empty() {
        return Err(SearchParseError::Syntax("empty search program".to_string()));
    }
    let mut pos = 0;
    let mut keys = Vec::new();
    while pos < tokens.len() {
        keys.push(parse_key(&tokens, &mut pos)?);
    }
    Ok(if keys.len() == 1 {
        keys.remove(0)
    } else {
        SearchKey::And(keys)
    })
}

fn next_string(tokens: &[Token], pos: &mut usize, what: &str) -> Result<String, SearchParseError> {
    match tokens.get(*pos) {
        Some(Token::Atom(s)) | Some(Token::Quoted(s)) => {
            *pos += 1;
            Ok(s.clone())
        }
        _ => Err(SearchParseError::Syntax(format!("{} needs an argument", what))),
    }
}

fn next_date(tokens: &[Token], pos: &mut usize, what: &str) -> Result<NaiveDate, SearchParseError> {
    let s = next_string(tokens, pos, what)?;
    NaiveDate::parse_from_str(&s, "%d-%b-%Y")
        .map_err(|_| SearchParseError::Syntax(format!("bad date: {}", s)))
}

fn next_number(tokens: &[Token], pos: &mut usize, what: &str) -> Result<u64, SearchParseError> {
    let s = next_string(tokens, pos, what)?;
    s.parse()
        .map_err(|_| SearchParseError::Syntax(format!("bad number: {}", s)))
}

fn parse_key(tokens: &[Token], pos: &mut usize) -> Result<SearchKey, SearchParseError> {
    let token = tokens
        .get(*pos)
        .ok_or_else(|| SearchParseError::Syntax("missing search key".to_string()))?
        .clone();
    *pos += 1;
    match token {
        Token::Open => {
            let mut keys = Vec::new();
            loop {
                match tokens.get(*pos) {
                    Some(Token::Close) => {
                        *pos += 1;
                        break;
                    }
                    Some(_) => keys.push(parse_key(tokens, pos)?),
                    None => {
                        return Err(SearchParseError::Syntax(
                            "unterminated group".to_string(),
                        ))
                    }
                }
            }
            Ok(SearchKey::And(keys))
        }
        Token::Close => Err(SearchParseError::Syntax("unexpected )".to_string())),
        Token::Quoted(s) => Err(SearchParseError::Syntax(format!(
            "unexpected string: {}",
            s
        ))),
        Token::Atom(atom) => {
            let upper = atom.to_ascii_uppercase();
            match upper.as_str() {
                "ALL" => Ok(SearchKey::All),
                "ANSWERED" => Ok(SearchKey::FlagSet("\\Answered".to_string())),
                "DELETED" => Ok(SearchKey::FlagSet("\\Deleted".to_string())),
                "DRAFT" => Ok(SearchKey::FlagSet("\\Draft".to_string())),
                "FLAGGED" => Ok(SearchKey::FlagSet("\\Flagged".to_string())),
                "SEEN" => Ok(SearchKey::FlagSet("\\Seen".to_string())),
                "UNANSWERED" => Ok(SearchKey::FlagUnset("\\Answered".to_string())),
                "UNDELETED" => Ok(SearchKey::FlagUnset("\\Deleted".to_string())),
                "UNDRAFT" => Ok(SearchKey::FlagUnset("\\Draft".to_string())),
                "UNFLAGGED" => Ok(SearchKey::FlagUnset("\\Flagged".to_string())),
                "UNSEEN" => Ok(SearchKey::FlagUnset("\\Seen".to_string())),
                "RECENT" => Ok(SearchKey::Recent),
                "NEW" => Ok(SearchKey::New),
                "OLD" => Ok(SearchKey::Old),
                "NOT" => Ok(SearchKey::Not(Box::new(parse_key(tokens, pos)?))),
                "OR" => {
                    let a = parse_key(tokens, pos)?;
                    let b = parse_key(tokens, pos)?;
                    Ok(SearchKey::Or(Box::new(a), Box::new(b)))
                }
                "FROM" => Ok(SearchKey::Header(
                    "From".to_string(),
                    next_string(tokens, pos, "FROM")?,
                )),
                "TO" => Ok(SearchKey::Header(
                    "To".to_string(),
                    next_string(tokens, pos, "TO")?,
                )),
                "CC" => Ok(SearchKey::Header(
                    "Cc".to_string(),
                    next_string(tokens, pos, "CC")?,
                )),
                "BCC" => Ok(SearchKey::Header(
                    "Bcc".to_string(),
                    next_string(tokens, pos, "BCC")?,
                )),
                "SUBJECT" => Ok(SearchKey::Header(
                    "Subject".to_string(),
                    next_string(tokens, pos, "SUBJECT")?,
                )),
                "HEADER" => {
                    let name = next_string(tokens, pos, "HEADER")?;
                    let value = next_string(tokens, pos, "HEADER")?;
                    Ok(SearchKey::Header(name, value))
                }
                "BODY" => Ok(SearchKey::Body(next_string(tokens, pos, "BODY")?)),
                "TEXT" => Ok(SearchKey::Text(next_string(tokens, pos, "TEXT")?)),
                "KEYWORD" => Ok(SearchKey::FlagSet(next_string(tokens, pos, "KEYWORD")?)),
                "UNKEYWORD" => Ok(SearchKey::FlagUnset(next_string(
                    tokens, pos, "UNKEYWORD",
                )?)),
                "LARGER" => Ok(SearchKey::Larger(next_number(tokens, pos, "LARGER")?)),
                "SMALLER" => Ok(SearchKey::Smaller(next_number(tokens, pos, "SMALLER")?)),
                "UID" => {
                    let s = next_string(tokens, pos, "UID")?;
                    let set = SeqSet::parse(&s)
                        .map_err(SearchParseError::Syntax)?;
                    Ok(SearchKey::Uid(set))
                }
                "BEFORE" => Ok(SearchKey::Before(next_date(tokens, pos, "BEFORE")?)),
                "ON" => Ok(SearchKey::On(next_date(tokens, pos, "ON")?)),
                "SINCE" => Ok(SearchKey::Since(next_date(tokens, pos, "SINCE")?)),
                "SENTBEFORE" => Ok(SearchKey::SentBefore(next_date(
                    tokens, pos, "SENTBEFORE",
                )?)),
                "SENTON" => Ok(SearchKey::SentOn(next_date(tokens, pos, "SENTON")?)),
                "SENTSINCE" => Ok(SearchKey::SentSince(next_date(
                    tokens, pos, "SENTSINCE",
                )?)),
                _ if looks_like_seq_set(&atom) => {
                    let set = SeqSet::parse(&atom)
                        .map_err(SearchParseError::Syntax)?;
                    Ok(SearchKey::Seq(set))
                }
                _ => Err(SearchParseError::Syntax(format!(
                    "unknown search key: {}",
                    atom
                ))),
            }
        }
    }
}

/// Whether evaluating this key requires the message content (headers/body)
/// rather than link metadata alone.
pub fn needs_message(key: &SearchKey) -> bool {
    match key {
        SearchKey::Header(_, _)
        | SearchKey::Body(_)
        | SearchKey::Text(_)
        | SearchKey::SentBefore(_)
        | SearchKey::SentOn(_)
        | SearchKey::SentSince(_) => true,
        SearchKey::Not(k) => needs_message(k),
        SearchKey::Or(a, b) => needs_message(a) || needs_message(b),
        SearchKey::And(keys) => keys.iter().any(needs_message),
        _ => false,
    }
}

/// One candidate message under evaluation.
pub struct MessageCtx<'a> {
    pub link: &'a Link,
    pub seq: u32,
    pub total: u32,
    pub max_uid: u32,
    pub size: u64,
    /// Present when any key in the program needs content.
    pub parsed: Option<&'a Parsed>,
    pub raw: Option<&'a [u8]>,
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn internal_date(ctx: &MessageCtx<'_>) -> Option<NaiveDate> {
    chrono::DateTime::from_timestamp(ctx.link.internal_date, 0).map(|dt| dt.date_naive())
}

fn sent_date(ctx: &MessageCtx<'_>) -> Option<NaiveDate> {
    let parsed = ctx.parsed?;
    let value = parsed.root.header_unfolded("Date")?;
    chrono::DateTime::parse_from_rfc2822(&value)
        .ok()
        .map(|dt| dt.date_naive())
}

pub fn eval(key: &SearchKey, ctx: &MessageCtx<'_>) -> bool {
    match key {
        SearchKey::All => true,
        SearchKey::FlagSet(f) => ctx.link.has_flag(f),
        SearchKey::FlagUnset(f) => !ctx.link.has_flag(f),
        SearchKey::Recent => ctx.link.recent,
        SearchKey::New => ctx.link.recent && !ctx.link.has_flag("\\Seen"),
        SearchKey::Old => !ctx.link.recent,
        SearchKey::Not(k) => !eval(k, ctx),
        SearchKey::Or(a, b) => eval(a, ctx) || eval(b, ctx),
        SearchKey::And(keys) => keys.iter().all(|k| eval(k, ctx)),
        SearchKey::Header(name, needle) => {
            let Some(parsed) = ctx.parsed else {
                return false;
            };
            let headers: Vec<String> = parsed
                .root
                .headers
                .iter()
                .filter(|h| h.is(name))
                .map(|h| h.unfolded())
                .collect();
            if needle.is_empty() {
                !headers.is_empty()
            } else {
                headers.iter().any(|v| contains_ci(v, needle))
            }
        }
        SearchKey::Body(needle) => {
            let Some(parsed) = ctx.parsed else {
                return false;
            };
            contains_ci(
                &String::from_utf8_lossy(&parsed.root.body_bytes()),
                needle,
            )
        }
        SearchKey::Text(needle) => {
            let Some(raw) = ctx.raw else { return false };
            contains_ci(&String::from_utf8_lossy(raw), needle)
        }
        SearchKey::Larger(n) => ctx.size > *n,
        SearchKey::Smaller(n) => ctx.size < *n,
        SearchKey::Uid(set) => set.contains(ctx.link.uid, ctx.max_uid),
        SearchKey::Seq(set) => set.contains(ctx.seq, ctx.total),
        SearchKey::Before(d) => internal_date(ctx).map(|x| x < *d).unwrap_or(false),
        SearchKey::On(d) => internal_date(ctx).map(|x| x == *d).unwrap_or(false),
        SearchKey::Since(d) => internal_date(ctx).map(|x| x >= *d).unwrap_or(false),
        SearchKey::SentBefore(d) => sent_date(ctx).map(|x| x < *d).unwrap_or(false),
        SearchKey::SentOn(d) => sent_date(ctx).map(|x| x == *d).unwrap_or(false),
        SearchKey::SentSince(d) => sent_date(ctx).map(|x| x >= *d).unwrap_or(false),
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ImapSession<S> {
    pub(crate) async fn cmd_search(
        &mut self,
        tag: &str,
        args: &str,
        uid_mode: bool,
    ) -> io::Result<()> {
        if self.selected.is_none() {
            return self.tagged_no(tag, "no mailbox selected").await;
        }
        let key = match parse_search(args) {
            Ok(k) => k,
            Err(SearchParseError::BadCharset) => {
                return self
                    .tagged_no(tag, "[BADCHARSET (US-ASCII UTF-8)] charset not supported")
                    .await;
            }
            Err(SearchParseError::Syntax(e)) => return self.tagged_bad(tag, &e).await,
        };

        let (store, mailbox_id) = {
            let sel = self.selected.as_ref().unwrap();
            (sel.store.clone(), sel.mailbox_id)
        };
        let links = match store.links(mailbox_id) {
            Ok(l) => l,
            Err(e) => return self.respond_store_err(tag, &e).await,
        };
        let total = links.len() as u32;
        let max_uid = links.last().map(|l| l.uid).unwrap_or(0);
        let want_content = needs_message(&key);

        let mut hits = Vec::new();
        for (i, link) in links.iter().enumerate() {
            let seq = i as u32 + 1;
            let size = match store.message_size(link.message_id) {
                Ok(s) => s,
                Err(e) => return self.respond_store_err(tag, &e).await,
            };
            let (parsed, raw) = if want_content {
                match store.load_message(link.message_id) {
                    Ok(p) => {
                        let raw = p.reconstruct();
                        (Some(p), Some(raw))
                    }
                    Err(e) => return self.respond_store_err(tag, &e).await,
                }
            } else {
                (None, None)
            };
            let ctx = MessageCtx {
                link,
                seq,
                total,
                max_uid,
                size,
                parsed: parsed.as_ref(),
                raw: raw.as_deref(),
            };
            if eval(&key, &ctx) {
                hits.push(if uid_mode { link.uid } else { seq });
            }
        }

        let rendered: Vec<String> = hits.iter().map(u32::to_string).collect();
        if rendered.is_empty() {
            self.untagged("SEARCH").await?;
        } else {
            self.untagged(&format!("SEARCH {}", rendered.join(" "))).await?;
        }
        let verb = if uid_mode { "UID SEARCH" } else { "SEARCH" };
        self.tagged_ok(tag, &format!("{} completed", verb)).await
    }
}
