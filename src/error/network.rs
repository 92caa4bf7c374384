//
// pyloros - error module
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

//! Error kinds for network related errors.

use super::ErrorKind;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum NetworkErrorKind {
    /// Unspecified.
    #[default]
    None,
    /// Name lookup of host failed.
    HostLookupFailed,
    /// Could not establish a connection to the host.
    ConnectionFailed,
    /// An established connection was terminated.
    ConnectionLost,
    /// TLS negotiation failed.
    TLSConnectionFailed,
    /// The TLS connection is invalid.
    InvalidTLSConnection,
    /// Bad server certificate.
    BadServerCertificate,
    /// IO error.
    Io,
    /// The peer violated the network protocol.
    ProtocolViolation,
}

impl NetworkErrorKind {
    pub const fn as_str(&self) -> &'static str {
        use NetworkErrorKind::*;
        match self {
            None => "Unspecified network error",
            HostLookupFailed => "Name lookup of host failed",
            ConnectionFailed => "Connection failed",
            ConnectionLost => "Connection lost",
            TLSConnectionFailed => "TLS connection failed",
            InvalidTLSConnection => "Invalid TLS connection",
            BadServerCertificate => "Bad server certificate",
            Io => "IO error",
            ProtocolViolation => "Protocol violation",
        }
    }

    /// Error kind means there has been a loss of connection.
    pub const fn is_disconnected(&self) -> bool {
        use NetworkErrorKind::*;
        matches!(self, ConnectionLost)
    }

    /// Error kind that retrying cannot fix.
    pub const fn is_fatal(&self) -> bool {
        use NetworkErrorKind::*;
        matches!(self, BadServerCertificate | InvalidTLSConnection | ProtocolViolation)
    }
}

impl From<NetworkErrorKind> for ErrorKind {
    #[inline]
    fn from(kind: NetworkErrorKind) -> Self {
        Self::Network(kind)
    }
}
