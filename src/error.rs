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

//! An error object for `pyloros`.

use std::{borrow::Cow, fmt, io, result, str, string, sync::Arc};

mod network;
pub use network::NetworkErrorKind;

pub type Result<T> = result::Result<T, Error>;

/// Kinds of errors the crate can produce.
///
/// The kind is what callers at the web boundary dispatch on: an
/// [`Authentication`](ErrorKind::Authentication) failure means "re-prompt for
/// credentials", a [`SessionExpired`](ErrorKind::SessionExpired) means
/// "re-authenticate", a recoverable [`Network`](ErrorKind::Network) or
/// [`Timeout`](ErrorKind::Timeout) means "service unavailable, retry".
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ErrorKind {
    /// Unspecified.
    #[default]
    None,
    /// Error kind came from another library.
    External,
    /// The upstream server rejected the supplied credentials.
    Authentication,
    /// The session token is not (or no longer) known to the session manager.
    SessionExpired,
    /// Invalid or missing runtime configuration.
    Configuration,
    /// Network error, see [`NetworkErrorKind`] for details.
    Network(NetworkErrorKind),
    /// An operation exceeded its deadline.
    Timeout,
    /// The remote peer violated the wire protocol.
    Protocol,
    /// A requested entry does not exist.
    NotFound,
    /// A persisted value exists but cannot be decoded.
    DataCorruption,
    /// An invalid value was given or encountered.
    ValueError,
    /// Programming error; please report it.
    Bug,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::None => write!(fmt, "None"),
            Self::External => write!(fmt, "External"),
            Self::Authentication => write!(fmt, "Authentication"),
            Self::SessionExpired => write!(fmt, "Session expired"),
            Self::Configuration => write!(fmt, "Configuration"),
            Self::Network(ref inner) => write!(fmt, "Network ({})", inner.as_str()),
            Self::Timeout => write!(fmt, "Timeout"),
            Self::Protocol => write!(fmt, "Protocol"),
            Self::NotFound => write!(fmt, "Not found"),
            Self::DataCorruption => write!(fmt, "Data corruption"),
            Self::ValueError => write!(fmt, "Invalid value"),
            Self::Bug => write!(fmt, "Bug, please report this!"),
        }
    }
}

impl ErrorKind {
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub const fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication)
    }

    pub const fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Whether retrying the operation can reasonably be expected to succeed.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout) || matches!(self, Self::Network(ref k) if !k.is_fatal())
    }

    /// Whether the error implies the connection it occurred on is gone.
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::Network(ref k) if k.is_disconnected())
    }
}

#[derive(Clone, Debug)]
pub struct Error {
    pub summary: Cow<'static, str>,
    pub details: Option<Cow<'static, str>>,
    pub source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    pub kind: ErrorKind,
}

pub trait IntoError {
    fn set_err_summary<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>;
    fn set_err_kind(self, kind: ErrorKind) -> Error;
}

pub trait ResultIntoError<T> {
    fn chain_err_summary<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>;
    fn chain_err_kind(self, kind: ErrorKind) -> Result<T>;
}

impl<I: Into<Error>> IntoError for I {
    #[inline]
    fn set_err_summary<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>,
    {
        let err: Error = self.into();
        err.set_summary(msg)
    }

    #[inline]
    fn set_err_kind(self, kind: ErrorKind) -> Error {
        let err: Error = self.into();
        err.set_kind(kind)
    }
}

impl<T, I: Into<Error>> ResultIntoError<T> for result::Result<T, I> {
    #[inline]
    fn chain_err_summary<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>,
    {
        self.map_err(|err| err.set_err_summary(msg_fn()))
    }

    #[inline]
    fn chain_err_kind(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|err| err.set_err_kind(kind))
    }
}

impl Error {
    pub fn new<M>(msg: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        Self {
            summary: msg.into(),
            details: None,
            source: None,
            kind: ErrorKind::default(),
        }
    }

    /// Make `summary` the error's headline; the previous headline, if any,
    /// is demoted into the details.
    pub fn set_summary<M>(mut self, summary: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        let new: Cow<'static, str> = summary.into();
        if self.summary.is_empty() {
            self.summary = new;
        } else if new != self.summary {
            let old = std::mem::replace(&mut self.summary, new);
            self.details = Some(match self.details.take() {
                Some(details) => format!("{}. {}", old, details).into(),
                None => old,
            });
        }
        self
    }

    pub fn set_details<M>(mut self, details: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        self.details = Some(details.into());
        self
    }

    pub fn set_source(
        mut self,
        new_val: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = new_val;
        self
    }

    pub fn set_kind(mut self, new_val: ErrorKind) -> Self {
        self.kind = new_val;
        self
    }

    pub const fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.summary)?;
        if let Some(details) = self.details.as_ref() {
            write!(fmt, "\n{}", details)?;
        }
        if let Some(source) = self.source.as_ref() {
            write!(fmt, "\nCaused by: {}", source)?;
        }
        if self.kind != ErrorKind::None {
            write!(fmt, "\nKind: {}", self.kind)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|s| &(*(*s)) as _)
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        use io::ErrorKind as IoKind;

        let kind = match err.kind() {
            IoKind::TimedOut => ErrorKind::Timeout,
            IoKind::ConnectionRefused => {
                ErrorKind::Network(NetworkErrorKind::ConnectionFailed)
            }
            IoKind::ConnectionReset
            | IoKind::ConnectionAborted
            | IoKind::NotConnected
            | IoKind::BrokenPipe
            | IoKind::UnexpectedEof => ErrorKind::Network(NetworkErrorKind::ConnectionLost),
            _ => ErrorKind::Network(NetworkErrorKind::Io),
        };
        Self::new(err.to_string()).set_source(Some(Arc::new(err))).set_kind(kind)
    }
}

impl From<native_tls::Error> for Error {
    #[inline]
    fn from(err: native_tls::Error) -> Self {
        Self::new(err.to_string())
            .set_source(Some(Arc::new(err)))
            .set_kind(ErrorKind::Network(NetworkErrorKind::InvalidTLSConnection))
    }
}

impl From<serde_json::Error> for Error {
    #[inline]
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).set_source(Some(Arc::new(err))).set_kind(ErrorKind::ValueError)
    }
}

impl From<string::FromUtf8Error> for Error {
    #[inline]
    fn from(err: string::FromUtf8Error) -> Self {
        Self::new(err.to_string()).set_source(Some(Arc::new(err))).set_kind(ErrorKind::ValueError)
    }
}

impl From<str::Utf8Error> for Error {
    #[inline]
    fn from(err: str::Utf8Error) -> Self {
        Self::new(err.to_string()).set_source(Some(Arc::new(err))).set_kind(ErrorKind::ValueError)
    }
}

impl From<&str> for Error {
    #[inline]
    fn from(err: &str) -> Self {
        Self::new(err.to_string())
    }
}

impl From<String> for Error {
    #[inline]
    fn from(err: String) -> Self {
        Self::new(err)
    }
}
