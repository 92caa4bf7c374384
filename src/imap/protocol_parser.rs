//
// pyloros - imap module
//
// Copyright 2024 pyloros contributors
//
// This file is part of pyloros.
//
// pyloros is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// pyloros is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with pyloros. If not, see <http://www.gnu.org/licenses/>.
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Parsers for the handful of server responses this crate inspects itself:
//! `CAPABILITY` lists, `METADATA` (RFC 5464) responses and tagged status
//! lines. Everything else on the wire belongs to the feature code driving
//! the connection.

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take, take_until, take_while1},
    combinator::map,
    multi::separated_list1,
    IResult,
};

use crate::error::{Error, ErrorKind, Result};

pub const CRLF: &str = "\r\n";

/// Find the first occurrence of `needle` in `haystack`.
pub fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Strip ASCII whitespace (including CRLF) from both ends.
pub fn trim_whitespace(mut bytes: &[u8]) -> &[u8] {
    while let Some(b) = bytes.first() {
        if !b.is_ascii_whitespace() {
            break;
        }
        bytes = &bytes[1..];
    }
    while let Some(b) = bytes.last() {
        if !b.is_ascii_whitespace() {
            break;
        }
        bytes = &bytes[..bytes.len() - 1];
    }
    bytes
}

pub struct ImapLineIterator<'a> {
    slice: &'a [u8],
}

impl<'a> Iterator for ImapLineIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.slice.is_empty() {
            return None;
        }
        match find_subsequence(self.slice, CRLF.as_bytes()) {
            Some(pos) => {
                let (line, rest) = self.slice.split_at(pos + CRLF.len());
                self.slice = rest;
                Some(line)
            }
            None => {
                let line = self.slice;
                self.slice = &[];
                Some(line)
            }
        }
    }
}

pub trait ImapLineSplit {
    fn split_rn(&self) -> ImapLineIterator;
}

impl ImapLineSplit for [u8] {
    fn split_rn(&self) -> ImapLineIterator {
        ImapLineIterator { slice: self }
    }
}

pub fn capabilities(input: &[u8]) -> IResult<&[u8], Vec<&[u8]>> {
    let (input, _) = take_until("CAPABILITY ")(input)?;
    let (input, _) = tag("CAPABILITY ")(input)?;
    let (input, ret) = separated_list1(tag(" "), is_not(" ]\r\n"))(input)?;
    let (input, _) = take_until(CRLF)(input)?;
    let (input, _) = tag(CRLF)(input)?;
    Ok((input, ret))
}

/// Locate the tagged status line for `tag` in `res` and succeed only on
/// `OK`.
///
/// `NO` and `BAD` replies carry the server's human readable text in the
/// error summary; callers attach the operation context.
pub fn check_tagged_ok(tag: &str, res: &[u8]) -> Result<()> {
    let prefix = format!("{} ", tag);
    for l in res.split_rn() {
        if !l.starts_with(prefix.as_bytes()) {
            continue;
        }
        let rest = trim_whitespace(&l[prefix.len()..]);
        if rest.starts_with(b"OK") {
            return Ok(());
        }
        return Err(Error::new(format!(
            "Server replied: `{}`",
            String::from_utf8_lossy(rest)
        ))
        .set_kind(ErrorKind::Protocol));
    }
    Err(Error::new(format!(
        "Server response did not include a status for command {}.",
        tag
    ))
    .set_kind(ErrorKind::Protocol))
}

fn quoted(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (rest, _) = tag("\"")(input)?;
    let mut ret = Vec::new();
    let mut i = 0;
    while i < rest.len() {
        match rest[i] {
            b'\\' if i + 1 < rest.len() => {
                ret.push(rest[i + 1]);
                i += 2;
            }
            b'"' => return Ok((&rest[i + 1..], ret)),
            other => {
                ret.push(other);
                i += 1;
            }
        }
    }
    Err(nom::Err::Incomplete(nom::Needed::Unknown))
}

fn literal(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, _) = tag("{")(input)?;
    let (input, len) = take_while1(|c: u8| c.is_ascii_digit())(input)?;
    let (input, _) = tag("}")(input)?;
    let (input, _) = tag(CRLF)(input)?;
    let len = std::str::from_utf8(len)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Digit,
        )))?;
    take(len)(input)
}

fn metadata_value(input: &[u8]) -> IResult<&[u8], Option<Vec<u8>>> {
    alt((
        map(tag("NIL"), |_| None),
        map(quoted, Some),
        map(literal, |v: &[u8]| Some(v.to_vec())),
    ))(input)
}

fn entry_name(input: &[u8]) -> IResult<&[u8], String> {
    alt((
        map(quoted, |v| String::from_utf8_lossy(&v).to_string()),
        map(is_not(" )\r\n"), |v: &[u8]| {
            String::from_utf8_lossy(v).to_string()
        }),
    ))(input)
}

fn metadata_entry(input: &[u8]) -> IResult<&[u8], (String, Option<Vec<u8>>)> {
    let (input, name) = entry_name(input)?;
    let (input, _) = tag(" ")(input)?;
    let (input, value) = metadata_value(input)?;
    Ok((input, (name, value)))
}

/// Parse an untagged `* METADATA <mailbox> (<entry> <value> ...)` response.
///
/// Values can be quoted strings, literals or `NIL` (entry exists but has no
/// value, or the server reports an unset entry explicitly).
pub fn metadata_response(input: &[u8]) -> IResult<&[u8], Vec<(String, Option<Vec<u8>>)>> {
    let (input, _) = take_until("METADATA ")(input)?;
    let (input, _) = tag("METADATA ")(input)?;
    let (input, _mailbox) = entry_name(input)?;
    let (input, _) = tag(" (")(input)?;
    let (input, entries) = separated_list1(tag(" "), metadata_entry)(input)?;
    let (input, _) = tag(")")(input)?;
    Ok((input, entries))
}
