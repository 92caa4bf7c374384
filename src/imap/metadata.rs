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

//! Client side of the IMAP `METADATA` extension ([RFC
//! 5464](https://www.rfc-editor.org/rfc/rfc5464)), scoped to what the user
//! store needs: fetching and setting single server (mailbox-less) entries.

use crate::{
    error::{Error, ErrorKind, Result, ResultIntoError},
    imap::{
        protocol_parser::{self, find_subsequence},
        ImapConnection,
    },
};

/// The capability a server must advertise for any of this to work.
pub const CAPABILITY: &str = "METADATA";

/// Fetch the value of `entry` on the server (empty mailbox name).
///
/// `Ok(None)` means the entry is unset; servers report that either with an
/// explicit `NIL` value or by omitting the entry from the response.
pub async fn get_metadata(conn: &mut ImapConnection, entry: &str) -> Result<Option<Vec<u8>>> {
    let mut res = Vec::with_capacity(8 * 1024);
    conn.send_command_raw(format!("GETMETADATA \"\" ({})", entry).as_bytes()).await?;
    let tag = conn.prev_tag();
    conn.read_response(&mut res).await?;
    protocol_parser::check_tagged_ok(&tag, &res)
        .chain_err_summary(|| format!("Could not fetch metadata entry {}", entry))?;
    if find_subsequence(&res, b"* METADATA").is_none() {
        return Ok(None);
    }
    let (_, entries) = protocol_parser::metadata_response(&res).map_err(|_| {
        Error::new(format!(
            "Could not parse METADATA response: `{}`",
            String::from_utf8_lossy(&res)
        ))
        .set_kind(ErrorKind::Protocol)
    })?;
    Ok(entries.into_iter().find(|(name, _)| name == entry).and_then(|(_, value)| value))
}

/// Store `value` under `entry` on the server (empty mailbox name).
///
/// The value is always sent as a literal; arbitrary serialized octets never
/// meet IMAP quoting rules.
pub async fn set_metadata(conn: &mut ImapConnection, entry: &str, value: &[u8]) -> Result<()> {
    let mut res = Vec::with_capacity(1024);
    conn.send_command_raw(
        format!("SETMETADATA \"\" ({} {{{}}}", entry, value.len()).as_bytes(),
    )
    .await?;
    let tag = conn.prev_tag();
    conn.wait_for_continuation_request().await?;
    conn.send_literal(value, b")").await?;
    conn.read_response(&mut res).await?;
    protocol_parser::check_tagged_ok(&tag, &res)
        .chain_err_summary(|| format!("Could not store metadata entry {}", entry))
}
