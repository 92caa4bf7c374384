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

//! Upstream IMAP client: connecting, authenticating and talking to the mail
//! server one command/response exchange at a time.

// In case we forget to wait some future.
#![deny(unused_must_use)]

pub mod protocol_parser;
pub use protocol_parser::*;
mod connection;
pub use connection::*;
mod error;
pub mod metadata;

use std::time::Duration;

use crate::error::Result;

pub type Capabilities = indexmap::IndexSet<Box<[u8]>>;

/// Default deadline for a single protocol exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Where and how to reach the upstream IMAP server.
///
/// Credentials are not part of the upstream configuration: one deployment
/// serves many users, and each user's credentials are supplied at
/// authentication time.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ImapServerConf {
    pub server_hostname: String,
    pub server_port: u16,
    /// Negotiate TLS before any protocol exchange (implicit TLS, usually port
    /// 993).
    pub use_tls: bool,
    /// Upgrade a plaintext connection in-band with `STARTTLS`. Ignored when
    /// `use_tls` is set. Disabling both leaves the connection in plaintext.
    pub use_starttls: bool,
    pub danger_accept_invalid_certs: bool,
    pub timeout: Option<Duration>,
}

impl ImapServerConf {
    /// Resolve a bare domain to an upstream configuration through RFC 6186
    /// SRV records.
    ///
    /// `Ok(None)` means discovery is not configured for this domain, which
    /// callers should treat as "skip this", not as a failure.
    pub async fn from_discovery(domain: &str) -> Result<Option<Self>> {
        let Some(endpoint) = crate::discovery::discover_imap(domain).await? else {
            return Ok(None);
        };
        Ok(Some(Self {
            server_hostname: endpoint.hostname,
            server_port: endpoint.port,
            use_tls: endpoint.implicit_tls,
            use_starttls: !endpoint.implicit_tls,
            danger_accept_invalid_certs: false,
            timeout: Some(DEFAULT_TIMEOUT),
        }))
    }
}
