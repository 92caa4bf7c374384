//
// pyloros - smtp submission client
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

//! Mail submission client ([RFC 5321](https://www.rfc-editor.org/rfc/rfc5321)
//! / [RFC 6409](https://www.rfc-editor.org/rfc/rfc6409)).
//!
//! Submission connections are deliberately short-lived: a session opens one,
//! authenticates with its own credentials, hands it to the caller and closes
//! it afterwards. They are never pooled; submission is infrequent enough
//! that holding a second long-lived socket per user buys nothing.

use std::{convert::TryFrom, time::Duration};

use futures::io::{AsyncReadExt, AsyncWriteExt};
use native_tls::TlsConnector;
use smallvec::SmallVec;
use smol::Async as AsyncWrapper;

use crate::{
    error::{Error, ErrorKind, NetworkErrorKind, Result, ResultIntoError},
    utils::{
        connections::{tcp_stream_connect, Connection},
        futures::timeout,
    },
};

/// Kind of transport security (`StartTls`/`Tls`/`None`) the client should
/// attempt.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum SmtpSecurity {
    #[serde(alias = "starttls", alias = "STARTTLS")]
    StartTls {
        #[serde(default)]
        danger_accept_invalid_certs: bool,
    },
    #[serde(alias = "tls", alias = "TLS")]
    Tls {
        #[serde(default)]
        danger_accept_invalid_certs: bool,
    },
    #[serde(alias = "none")]
    None,
}

impl Default for SmtpSecurity {
    fn default() -> Self {
        Self::Tls {
            danger_accept_invalid_certs: false,
        }
    }
}

/// Server configuration for connecting the submission client.
///
/// As with [`ImapServerConf`](crate::imap::ImapServerConf), credentials are
/// not part of the configuration; they belong to the session using it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SmtpServerConf {
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub security: SmtpSecurity,
    pub timeout: Option<Duration>,
}

impl SmtpServerConf {
    /// Resolve a bare domain to a submission configuration through RFC 6186
    /// SRV records. `Ok(None)` means discovery is not configured.
    pub async fn from_discovery(domain: &str) -> Result<Option<Self>> {
        let Some(endpoint) = crate::discovery::discover_submission(domain).await? else {
            return Ok(None);
        };
        Ok(Some(Self {
            hostname: endpoint.hostname,
            port: endpoint.port,
            security: if endpoint.implicit_tls {
                SmtpSecurity::Tls {
                    danger_accept_invalid_certs: false,
                }
            } else {
                SmtpSecurity::StartTls {
                    danger_accept_invalid_certs: false,
                }
            },
            timeout: Some(crate::imap::DEFAULT_TIMEOUT),
        }))
    }
}

const EHLO_HOSTNAME: &str = "localhost";

/// SMTP submission session object.
#[derive(Debug)]
pub struct SmtpConnection {
    stream: AsyncWrapper<Connection>,
    read_buffer: String,
    timeout: Option<Duration>,
}

impl SmtpConnection {
    /// Performs connection and, if configured, TLS negotiation. The
    /// connection is not authenticated yet; see
    /// [`authenticate`](Self::authenticate).
    pub async fn new_connection(server_conf: &SmtpServerConf) -> Result<Self> {
        let path = server_conf.hostname.clone();
        let mut res = String::with_capacity(8 * 1024);
        let tcp = {
            let addr = (path.clone(), server_conf.port);
            let timeout_dur = server_conf.timeout;
            smol::unblock(move || tcp_stream_connect(addr, timeout_dur))
                .await
                .chain_err_summary(|| {
                    format!("Could not connect to {}:{}.", path, server_conf.port)
                })?
        };
        let stream = match server_conf.security {
            SmtpSecurity::Tls {
                danger_accept_invalid_certs,
            } => {
                let connector = tls_connector(danger_accept_invalid_certs)?;
                let hostname = path.clone();
                let socket = Connection::new_tcp(tcp);
                let conn = smol::unblock(move || {
                    connector.connect(&hostname, socket).map_err(|err| match err {
                        native_tls::HandshakeError::Failure(err) => Error::from(err),
                        native_tls::HandshakeError::WouldBlock(_) => {
                            Error::new("TLS handshake interrupted.").set_kind(ErrorKind::Network(
                                NetworkErrorKind::InvalidTLSConnection,
                            ))
                        }
                    })
                })
                .await
                .chain_err_summary(|| {
                    format!("Could not initiate TLS negotiation to {}.", path)
                })?;
                AsyncWrapper::new(Connection::new_tls(conn))?
            }
            SmtpSecurity::StartTls { .. } | SmtpSecurity::None => {
                AsyncWrapper::new({
                    let conn = Connection::new_tcp(tcp);
                    #[cfg(feature = "smtp-trace")]
                    {
                        conn.trace(true).with_id("smtp")
                    }
                    #[cfg(not(feature = "smtp-trace"))]
                    {
                        conn
                    }
                })?
            }
        };
        let mut ret = Self {
            stream,
            read_buffer: String::new(),
            timeout: server_conf.timeout,
        };
        ret.read_lines(&mut res, Some((ReplyCode::_220, &[]))).await?;
        ret.send_command(&[b"EHLO ", EHLO_HOSTNAME.as_bytes()]).await?;
        if let SmtpSecurity::StartTls {
            danger_accept_invalid_certs,
        } = server_conf.security
        {
            ret.read_lines(&mut res, Some((ReplyCode::_250, &[]))).await?;
            ret.send_command(&[b"STARTTLS"]).await?;
            ret.read_lines(&mut res, Some((ReplyCode::_220, &[])))
                .await
                .chain_err_kind(ErrorKind::Network(NetworkErrorKind::TLSConnectionFailed))?;
            let connector = tls_connector(danger_accept_invalid_certs)?;
            let socket = ret.stream.into_inner()?;
            socket.set_nonblocking(false)?;
            let hostname = path.clone();
            let conn = smol::unblock(move || {
                connector.connect(&hostname, socket).map_err(|err| match err {
                    native_tls::HandshakeError::Failure(err) => Error::from(err),
                    native_tls::HandshakeError::WouldBlock(_) => {
                        Error::new("TLS handshake interrupted.").set_kind(ErrorKind::Network(
                            NetworkErrorKind::InvalidTLSConnection,
                        ))
                    }
                })
            })
            .await
            .chain_err_summary(|| format!("Could not initiate TLS negotiation to {}.", path))?;
            ret = Self {
                stream: AsyncWrapper::new(Connection::new_tls(conn))?,
                read_buffer: String::new(),
                timeout: server_conf.timeout,
            };
            ret.send_command(&[b"EHLO ", EHLO_HOSTNAME.as_bytes()]).await?;
        }
        ret.read_lines(&mut res, Some((ReplyCode::_250, &[]))).await?;
        Ok(ret)
    }

    /// `AUTH PLAIN` ([RFC 4616](https://www.ietf.org/rfc/rfc4616.txt)) with
    /// the given credentials.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let mut res = String::with_capacity(1024);
        // message = [authzid] UTF8NUL authcid UTF8NUL passwd
        let credentials = {
            let mut buf = Vec::with_capacity(2 + username.len() + password.len());
            buf.push(b'\0');
            buf.extend(username.as_bytes());
            buf.push(b'\0');
            buf.extend(password.as_bytes());
            data_encoding::BASE64.encode(&buf)
        };
        self.send_command(&[b"AUTH PLAIN ", credentials.as_bytes()]).await?;
        self.read_lines(&mut res, Some((ReplyCode::_235, &[])))
            .await
            .chain_err_summary(|| format!("Authentication as {} failed", username))
            .chain_err_kind(ErrorKind::Authentication)?;
        Ok(())
    }

    pub async fn read_lines<'r>(
        &mut self,
        ret: &'r mut String,
        expected_reply_code: Option<(ReplyCode, &[ReplyCode])>,
    ) -> Result<Reply<'r>> {
        let timeout_dur = self.timeout;
        timeout(
            timeout_dur,
            read_lines(&mut self.stream, ret, expected_reply_code, &mut self.read_buffer),
        )
        .await?
    }

    pub async fn send_command(&mut self, command: &[&[u8]]) -> Result<()> {
        let timeout_dur = self.timeout;
        timeout(timeout_dur, async {
            for c in command {
                self.stream.write_all(c).await?;
            }
            self.stream.write_all(b"\r\n").await?;
            self.stream.flush().await?;
            Ok(())
        })
        .await?
    }

    /// Submit a mail: `MAIL FROM`, one `RCPT TO` per recipient, `DATA` with
    /// dot-stuffing.
    ///
    /// Recipients are explicit; this crate does not parse messages to
    /// extract them.
    pub async fn mail_transaction(
        &mut self,
        mail: &str,
        envelope_from: &str,
        rcpt_to: &[&str],
    ) -> Result<()> {
        if rcpt_to.is_empty() {
            return Err(Error::new(
                "Mail submission was aborted because no recipients were given.",
            )
            .set_kind(ErrorKind::ValueError));
        }
        let mut res = String::with_capacity(8 * 1024);
        self.send_command(&[b"MAIL FROM:<", envelope_from.trim().as_bytes(), b">"]).await?;
        self.read_lines(&mut res, Some((ReplyCode::_250, &[]))).await?;
        for rcpt in rcpt_to {
            self.send_command(&[b"RCPT TO:<", rcpt.trim().as_bytes(), b">"]).await?;
            self.read_lines(&mut res, Some((ReplyCode::_250, &[]))).await?;
        }
        self.send_command(&[b"DATA"]).await?;
        self.read_lines(&mut res, Some((ReplyCode::_354, &[]))).await?;
        // Before sending a line of mail text, check the first character of
        // the line. If it is a period, one additional period is inserted at
        // the beginning of the line.
        for line in mail.lines() {
            if line.starts_with('.') {
                self.stream.write_all(b".").await?;
            }
            self.stream.write_all(line.as_bytes()).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.write_all(b".\r\n").await?;
        self.stream.flush().await?;
        self.read_lines(&mut res, Some((ReplyCode::_250, &[]))).await?;
        Ok(())
    }

    /// `QUIT` and wait for the closing reply.
    pub async fn quit(mut self) -> Result<()> {
        let mut res = String::with_capacity(256);
        self.send_command(&[b"QUIT"]).await?;
        self.read_lines(&mut res, Some((ReplyCode::_221, &[]))).await?;
        Ok(())
    }
}

fn tls_connector(danger_accept_invalid_certs: bool) -> Result<TlsConnector> {
    let mut connector = TlsConnector::builder();
    if danger_accept_invalid_certs {
        connector.danger_accept_invalid_certs(true);
    }
    connector
        .build()
        .chain_err_kind(ErrorKind::Network(NetworkErrorKind::TLSConnectionFailed))
}

/// Expected reply code in a single or multi-line reply by the server.
pub type ExpectedReplyCode = Option<(ReplyCode, &'static [ReplyCode])>;

/// Recognized kinds of SMTP reply codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCode {
    /// `<domain>` Service ready.
    _220,
    /// `<domain>` Service closing transmission channel.
    _221,
    /// Authentication successful.
    _235,
    /// Requested mail action okay, completed.
    _250,
    /// AUTH continuation request (RFC 4954).
    _334,
    /// Start mail input; end with `<CRLF>`.`<CRLF>`.
    _354,
    /// `<domain>` Service not available, closing transmission channel.
    _421,
    /// Requested mail action not taken: mailbox unavailable.
    _450,
    /// Requested action aborted: local error in processing.
    _451,
    /// Requested action not taken: insufficient system storage.
    _452,
    /// Syntax error, command unrecognized.
    _500,
    /// Syntax error in parameters or arguments.
    _501,
    /// Command not implemented.
    _502,
    /// Bad sequence of commands.
    _503,
    /// Command parameter not implemented.
    _504,
    /// Must issue a STARTTLS command first.
    _530,
    /// Authentication failed.
    _535,
    /// Requested action not taken: mailbox unavailable.
    _550,
    /// Requested mail action aborted: exceeded storage allocation.
    _552,
    /// Requested action not taken: mailbox name not allowed.
    _553,
    /// Transaction failed.
    _554,
}

impl ReplyCode {
    pub const fn as_str(&self) -> &'static str {
        use ReplyCode::*;
        match self {
            _220 => "Service ready",
            _221 => "Service closing transmission channel",
            _235 => "Authentication successful",
            _250 => "Requested mail action okay, completed",
            _334 => "Intermediate response to the AUTH command",
            _354 => "Start mail input; end with <CRLF>.<CRLF>",
            _421 => "Service not available, closing transmission channel",
            _450 => "Requested mail action not taken: mailbox unavailable",
            _451 => "Requested action aborted: local error in processing",
            _452 => "Requested action not taken: insufficient system storage",
            _500 => "Syntax error, command unrecognized",
            _501 => "Syntax error in parameters or arguments",
            _502 => "Command not implemented",
            _503 => "Bad sequence of commands",
            _504 => "Command parameter not implemented",
            _530 => "Must issue a STARTTLS command first",
            _535 => "Authentication failed",
            _550 => "Requested action not taken: mailbox unavailable",
            _552 => "Requested mail action aborted: exceeded storage allocation",
            _553 => "Requested action not taken: mailbox name not allowed",
            _554 => "Transaction failed",
        }
    }

    pub const fn is_err(&self) -> bool {
        use ReplyCode::*;
        matches!(
            self,
            _421 | _450
                | _451
                | _452
                | _500
                | _501
                | _502
                | _503
                | _504
                | _530
                | _535
                | _550
                | _552
                | _553
                | _554
        )
    }
}

impl TryFrom<&'_ str> for ReplyCode {
    type Error = Error;

    fn try_from(val: &'_ str) -> Result<Self> {
        use ReplyCode::*;
        match val {
            "220" => Ok(_220),
            "221" => Ok(_221),
            "235" => Ok(_235),
            "250" => Ok(_250),
            "334" => Ok(_334),
            "354" => Ok(_354),
            "421" => Ok(_421),
            "450" => Ok(_450),
            "451" => Ok(_451),
            "452" => Ok(_452),
            "500" => Ok(_500),
            "501" => Ok(_501),
            "502" => Ok(_502),
            "503" => Ok(_503),
            "504" => Ok(_504),
            "530" => Ok(_530),
            "535" => Ok(_535),
            "550" => Ok(_550),
            "552" => Ok(_552),
            "553" => Ok(_553),
            "554" => Ok(_554),
            _ => Err(Error::new(format!("Unknown SMTP reply code: {}", val))
                .set_kind(ErrorKind::Protocol)),
        }
    }
}

/// A single line or multi-line server reply, along with its reply code.
#[derive(Clone, Debug)]
pub struct Reply<'s> {
    pub code: ReplyCode,
    pub lines: SmallVec<[&'s str; 16]>,
}

impl<'s> From<Reply<'s>> for Result<ReplyCode> {
    fn from(val: Reply<'s>) -> Self {
        if val.code.is_err() {
            Err(Error::new(val.lines.join("\n")).set_summary(val.code.as_str()))
        } else {
            Ok(val.code)
        }
    }
}

impl<'s> Reply<'s> {
    /// `s` must be raw SMTP output, i.e. each line must start with a 3 digit
    /// reply code, a space or `-`, and end with `\r\n`.
    pub fn new(s: &'s str, code: ReplyCode) -> Self {
        let lines: SmallVec<_> = s
            .lines()
            .map(|l| if l.len() > 4 { &l[4..] } else { "" })
            .collect();
        Self { lines, code }
    }
}

async fn read_lines<'r>(
    _self: &mut (impl futures::io::AsyncRead + std::marker::Unpin + Send),
    ret: &'r mut String,
    expected_reply_code: Option<(ReplyCode, &[ReplyCode])>,
    buffer: &mut String,
) -> Result<Reply<'r>> {
    let mut buf: [u8; 1024] = [0; 1024];
    ret.clear();
    ret.extend(buffer.drain(..));
    let mut last_line_idx: usize = 0;
    'read_loop: loop {
        while let Some(pos) = ret[last_line_idx..].find("\r\n") {
            // "Formally, a reply is defined to be the sequence: a
            // three-digit code, <SP>, one line of text, and <CRLF>, or a
            // multiline reply (as defined in the same section)."
            if ret[last_line_idx..].len() < 4
                || !ret[last_line_idx..].chars().take(3).all(|c| c.is_ascii_digit())
            {
                return Err(
                    Error::new(format!("Invalid SMTP reply: {}", ret)).set_kind(ErrorKind::Protocol)
                );
            }
            let line_end = last_line_idx + pos + "\r\n".len();
            if ret[last_line_idx + 3..].starts_with(' ') {
                // Final line of the reply; stash whatever came after it.
                buffer.push_str(&ret[line_end..]);
                ret.truncate(line_end);
                break 'read_loop;
            }
            last_line_idx = line_end;
        }
        match _self.read(&mut buf).await {
            Ok(0) => {
                if ret.is_empty() {
                    return Err(Error::new("Connection closed by the remote end.")
                        .set_kind(ErrorKind::Network(NetworkErrorKind::ConnectionLost)));
                }
                break;
            }
            Ok(b) => {
                ret.push_str(
                    std::str::from_utf8(&buf[0..b])
                        .chain_err_kind(ErrorKind::Protocol)?,
                );
            }
            Err(err) => {
                return Err(Error::from(err));
            }
        }
    }
    if ret.len() < 3 {
        return Err(Error::new(format!("Invalid SMTP reply: {}", ret)).set_kind(ErrorKind::Protocol));
    }
    let code = ReplyCode::try_from(&ret[..3])?;
    let reply = Reply::new(ret, code);
    if expected_reply_code
        .map(|(exp, exp_list)| exp != reply.code && !exp_list.contains(&reply.code))
        .unwrap_or(false)
    {
        let result: Result<ReplyCode> = reply.clone().into();
        result?;
        return Err(Error::new(format!(
            "Server did not reply with the expected code {:?}: {:?}",
            expected_reply_code.unwrap(),
            reply
        ))
        .set_kind(ErrorKind::Protocol));
    }
    Ok(reply)
}
