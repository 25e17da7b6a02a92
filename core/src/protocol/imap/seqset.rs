/*
 * seqset.rs
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

//! Sequence-set grammar: `item (',' item)*` where item is `n`, `n:m`, or
//! `*`. Pure over the set expression and the current maximum; storage code
//! enumerates positions against the result. Range endpoints are
//! order-independent; numbers past the maximum are silently dropped, only
//! malformed syntax is an error.

/// One endpoint of a range: a number or `*` (highest existing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Num(u32),
    Star,
}

impl Bound {
    fn value(self, max: u32) -> u32 {
        match self {
            Bound::Num(n) => n,
            Bound::Star => max,
        }
    }
}

/// A parsed sequence set or UID set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqSet {
    ranges: Vec<(Bound, Bound)>,
}

impl SeqSet {
    /// Parse; `Err` means the syntax itself is malformed (tagged BAD).
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() {
            return Err("empty sequence set".to_string());
        }
        let mut ranges = Vec::new();
        for item in input.split(',') {
            let item = item.trim();
            let (lo, hi) = match item.find(':') {
                Some(i) => (parse_bound(&item[..i])?, parse_bound(&item[i + 1..])?),
                None => {
                    let b = parse_bound(item)?;
                    (b, b)
                }
            };
            ranges.push((lo, hi));
        }
        Ok(Self { ranges })
    }

    /// True when `n` is in the set, with `*` standing for `max`.
    pub fn contains(&self, n: u32, max: u32) -> bool {
        self.ranges.iter().any(|&(a, b)| {
            let (a, b) = (a.value(max), b.value(max));
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            n >= lo && n <= hi
        })
    }

    /// All members in 1..=max, ascending. Empty when max is 0.
    pub fn resolve(&self, max: u32) -> Vec<u32> {
        (1..=max).filter(|&n| self.contains(n, max)).collect()
    }
}

fn parse_bound(s: &str) -> Result<Bound, String> {
    let s = s.trim();
    if s == "*" {
        return Ok(Bound::Star);
    }
    match s.parse::<u32>() {
        Ok(n) if n > 0 => Ok(Bound::Num(n)),
        _ => Err(format!("bad sequence number: {}", s)),
    }
}

/// Quick syntactic check used by SEARCH to recognize a bare sequence set.
pub fn looks_like_seq_set(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_digit() || c == ':' || c == ',' || c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singles_and_ranges() {
        let set = SeqSet::parse("1,3:5").unwrap();
        assert_eq!(set.resolve(10), vec![1, 3, 4, 5]);
    }

    #[test]
    fn range_endpoints_are_order_independent() {
        let a = SeqSet::parse("2:4").unwrap();
        let b = SeqSet::parse("4:2").unwrap();
        assert_eq!(a.resolve(10), b.resolve(10));
    }

    #[test]
    fn star_is_the_maximum() {
        let set = SeqSet::parse("*").unwrap();
        assert_eq!(set.resolve(7), vec![7]);
        let set = SeqSet::parse("5:*").unwrap();
        assert_eq!(set.resolve(7), vec![5, 6, 7]);
        // 5:* on a 3-message mailbox: * = 3, endpoints swap.
        assert_eq!(set.resolve(3), vec![3]);
    }

    #[test]
    fn empty_mailbox_resolves_empty() {
        let set = SeqSet::parse("1:*").unwrap();
        assert!(set.resolve(0).is_empty());
    }

    #[test]
    fn out_of_range_is_dropped_silently() {
        let set = SeqSet::parse("8,9").unwrap();
        assert!(set.resolve(3).is_empty());
    }

    #[test]
    fn malformed_is_an_error() {
        assert!(SeqSet::parse("").is_err());
        assert!(SeqSet::parse("a").is_err());
        assert!(SeqSet::parse("0").is_err());
        assert!(SeqSet::parse("1:x").is_err());
    }

    #[test]
    fn seq_set_detection() {
        assert!(looks_like_seq_set("1:5,8"));
        assert!(looks_like_seq_set("*"));
        assert!(!looks_like_seq_set("ALL"));
        assert!(!looks_like_seq_set(""));
    }
}
