//
// pyloros - service discovery
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

//! DNS-based service discovery, as defined in [RFC 6186 Use of SRV Records
//! for Locating Email Submission/Access
//! Services](https://www.rfc-editor.org/rfc/rfc6186), with the RFC 8314
//! preference for implicit-TLS service names.
//!
//! "This domain publishes no such record" is a normal outcome
//! (`Ok(None)`); callers treat it as "discovery is not configured" and move
//! on. Only temporary DNS failures (timeouts, unreachable resolvers) are
//! errors, and those are recoverable.

use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    Resolver,
};

use crate::error::{Error, ErrorKind, NetworkErrorKind, Result};

/// A discovered endpoint for one protocol.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServiceEndpoint {
    pub hostname: String,
    pub port: u16,
    /// Whether the service name implies TLS from the first byte
    /// (`_imaps`/`_submissions`) rather than an in-band upgrade.
    pub implicit_tls: bool,
}

/// Discover the IMAP endpoint of `domain`, preferring implicit TLS.
pub async fn discover_imap(domain: &str) -> Result<Option<ServiceEndpoint>> {
    if let Some((hostname, port)) = lookup_srv("_imaps", domain).await? {
        return Ok(Some(ServiceEndpoint {
            hostname,
            port,
            implicit_tls: true,
        }));
    }
    if let Some((hostname, port)) = lookup_srv("_imap", domain).await? {
        return Ok(Some(ServiceEndpoint {
            hostname,
            port,
            implicit_tls: false,
        }));
    }
    Ok(None)
}

/// Discover the mail submission endpoint of `domain`, preferring implicit
/// TLS.
pub async fn discover_submission(domain: &str) -> Result<Option<ServiceEndpoint>> {
    if let Some((hostname, port)) = lookup_srv("_submissions", domain).await? {
        return Ok(Some(ServiceEndpoint {
            hostname,
            port,
            implicit_tls: true,
        }));
    }
    if let Some((hostname, port)) = lookup_srv("_submission", domain).await? {
        return Ok(Some(ServiceEndpoint {
            hostname,
            port,
            implicit_tls: false,
        }));
    }
    Ok(None)
}

async fn lookup_srv(service: &str, domain: &str) -> Result<Option<(String, u16)>> {
    let name = format!("{}._tcp.{}.", service, domain);
    log::trace!("SRV lookup: {}", name);
    let response = smol::unblock(move || {
        let resolver = Resolver::from_system_conf()
            .or_else(|_| Resolver::new(ResolverConfig::default(), ResolverOpts::default()))?;
        resolver.srv_lookup(name)
    })
    .await;
    let lookup = match response {
        Ok(lookup) => lookup,
        Err(err) => {
            return match err.kind() {
                // Not an error: discovery is simply not configured for this
                // domain.
                ResolveErrorKind::NoRecordsFound { .. } => Ok(None),
                ResolveErrorKind::Timeout => Err(Error::new(format!(
                    "SRV lookup of {}._tcp.{} timed out.",
                    service, domain
                ))
                .set_source(Some(std::sync::Arc::new(err)))
                .set_kind(ErrorKind::Timeout)),
                _ => Err(Error::new(format!(
                    "SRV lookup of {}._tcp.{} failed.",
                    service, domain
                ))
                .set_source(Some(std::sync::Arc::new(err)))
                .set_kind(ErrorKind::Network(NetworkErrorKind::HostLookupFailed))),
            };
        }
    };
    let records = lookup
        .iter()
        .map(|srv| {
            (
                srv.priority(),
                srv.target().to_string(),
                srv.port(),
            )
        })
        .collect::<Vec<_>>();
    Ok(select_srv_target(records))
}

/// Pick the most preferred usable record: lowest priority value wins, a `.`
/// target means "service decidedly not available" (RFC 2782).
fn select_srv_target(mut records: Vec<(u16, String, u16)>) -> Option<(String, u16)> {
    records.sort_by_key(|(priority, _, _)| *priority);
    let (_, target, port) = records.into_iter().next()?;
    let target = target.trim_end_matches('.').to_string();
    if target.is_empty() {
        return None;
    }
    Some((target, port))
}
