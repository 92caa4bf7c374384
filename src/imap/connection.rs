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

use std::{
    borrow::Cow,
    convert::TryFrom,
    net::TcpStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{
    io::{AsyncReadExt, AsyncWriteExt},
    lock::{Mutex as FutureMutex, MutexGuard},
};
use imap_codec::{
    encode::{Encoder, Fragment},
    imap_types::{
        auth::AuthMechanism,
        command::{Command, CommandBody},
        core::{AString, LiteralMode, Tag},
        secret::Secret,
    },
    CommandCodec,
};
use native_tls::TlsConnector;
pub use smol::Async as AsyncWrapper;

use crate::{
    error::*,
    imap::{
        protocol_parser::{self, find_subsequence, trim_whitespace, ImapLineSplit},
        Capabilities, ImapServerConf,
    },
    utils::{
        connections::{tcp_stream_connect, Connection},
        futures::timeout,
    },
};

/// A single authenticated protocol stream.
///
/// The wire protocol is strictly sequential per connection: one command, one
/// response, never interleaved. Nothing here enforces that; the exclusion
/// lives in [`ConnectionMutex`].
#[derive(Debug)]
pub struct ImapStream {
    pub cmd_id: usize,
    pub id: Cow<'static, str>,
    pub stream: AsyncWrapper<Connection>,
    pub timeout: Option<Duration>,
}

fn parse_capabilities(bytes: &[u8], hostname: &str) -> Result<Capabilities> {
    protocol_parser::capabilities(bytes)
        .map(|(_, v)| v.into_iter().map(|v| v.to_vec().into_boxed_slice()).collect())
        .map_err(|_| {
            Error::new(format!(
                "Could not connect to {}: could not parse CAPABILITY response: `{}`",
                hostname,
                String::from_utf8_lossy(bytes)
            ))
            .set_kind(ErrorKind::Protocol)
        })
}

impl ImapStream {
    /// Dial the upstream, negotiate transport security and authenticate.
    ///
    /// Returns the server's post-login capabilities, the stream, and a
    /// cloned handle of the underlying TCP socket for out-of-band
    /// end-of-file watching.
    ///
    /// Connection and TLS problems surface as [`ErrorKind::Network`] values;
    /// rejected credentials as [`ErrorKind::Authentication`], after the
    /// connection has been shut down, so the two are always tellable apart
    /// and no socket outlives a failed login.
    pub async fn new_connection(
        server_conf: &ImapServerConf,
        username: &str,
        password: &str,
        id: Cow<'static, str>,
    ) -> Result<(Capabilities, Self, Option<TcpStream>)> {
        let path = server_conf.server_hostname.clone();
        let mut cmd_id = 1;

        let tcp = {
            let addr = (path.clone(), server_conf.server_port);
            let timeout_dur = server_conf.timeout;
            smol::unblock(move || tcp_stream_connect(addr, timeout_dur))
                .await
                .chain_err_summary(|| {
                    format!("Could not connect to {}:{}.", path, server_conf.server_port)
                })?
        };
        let peer = tcp.try_clone().ok();

        let mut buf = vec![0; Connection::IO_BUF_SIZE];
        let stream = if server_conf.use_tls {
            let connector = Self::tls_connector(server_conf)?;
            let conn = {
                let hostname = path.clone();
                let socket = {
                    let conn = Connection::new_tcp(tcp);
                    #[cfg(feature = "imap-trace")]
                    {
                        conn.trace(true).with_id("imap")
                    }
                    #[cfg(not(feature = "imap-trace"))]
                    {
                        conn
                    }
                };
                smol::unblock(move || {
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
                .chain_err_summary(|| format!("Could not initiate TLS negotiation to {}.", path))?
            };
            AsyncWrapper::new(Connection::new_tls(conn))?
        } else {
            let mut socket = AsyncWrapper::new({
                let conn = Connection::new_tcp(tcp);
                #[cfg(feature = "imap-trace")]
                {
                    conn.trace(true).with_id("imap")
                }
                #[cfg(not(feature = "imap-trace"))]
                {
                    conn
                }
            })?;
            let mut response = Vec::with_capacity(1024);
            loop {
                let len = timeout(server_conf.timeout, socket.read(&mut buf)).await??;
                if len == 0 {
                    return Err(Error::new(format!(
                        "Connection to {} was closed before it sent a greeting.",
                        path
                    ))
                    .set_kind(ErrorKind::Network(NetworkErrorKind::ConnectionLost)));
                }
                response.extend_from_slice(&buf[..len]);
                if let Some(pos) = find_subsequence(&response, b"\r\n") {
                    if !response.starts_with(b"* OK") && !response.starts_with(b"* PREAUTH") {
                        return Err(Error::new(format!(
                            "Unexpected greeting from {}: `{}`",
                            path,
                            String::from_utf8_lossy(&response[..pos])
                        ))
                        .set_kind(ErrorKind::Protocol));
                    }
                    response.drain(0..pos + 2);
                    break;
                }
            }
            if server_conf.use_starttls {
                let err_fn = || {
                    if server_conf.server_port == 993 {
                        "STARTTLS failed. Server port is set to 993, which normally uses TLS. \
                         Maybe try disabling use_starttls."
                    } else {
                        "STARTTLS failed. Is the connection already encrypted?"
                    }
                };
                socket
                    .write_all(format!("M{} STARTTLS\r\n", cmd_id).as_bytes())
                    .await
                    .chain_err_summary(err_fn)?;
                socket.flush().await.chain_err_summary(err_fn)?;
                let tag_start = format!("M{} ", cmd_id);
                cmd_id += 1;
                'starttls: loop {
                    let len = timeout(server_conf.timeout, socket.read(&mut buf)).await??;
                    if len == 0 {
                        return Err(Error::new(err_fn()).set_kind(ErrorKind::Network(
                            NetworkErrorKind::ConnectionLost,
                        )));
                    }
                    response.extend_from_slice(&buf[..len]);
                    for l in response.split_rn() {
                        if !l.starts_with(tag_start.as_bytes()) {
                            continue;
                        }
                        let rest = trim_whitespace(&l[tag_start.len()..]);
                        if !rest.starts_with(b"OK") {
                            return Err(Error::new(format!(
                                "Could not initiate STARTTLS negotiation to {}: `{}`",
                                path,
                                String::from_utf8_lossy(rest)
                            ))
                            .set_kind(ErrorKind::Network(
                                NetworkErrorKind::TLSConnectionFailed,
                            )));
                        }
                        break 'starttls;
                    }
                }
                let connector = Self::tls_connector(server_conf)?;
                let socket = socket.into_inner()?;
                socket.set_nonblocking(false)?;
                let conn = {
                    let hostname = path.clone();
                    smol::unblock(move || {
                        connector.connect(&hostname, socket).map_err(|err| match err {
                            native_tls::HandshakeError::Failure(err) => Error::from(err),
                            native_tls::HandshakeError::WouldBlock(_) => Error::new(
                                "TLS handshake interrupted.",
                            )
                            .set_kind(ErrorKind::Network(
                                NetworkErrorKind::InvalidTLSConnection,
                            )),
                        })
                    })
                    .await
                    .chain_err_summary(|| {
                        format!("Could not initiate TLS negotiation to {}.", path)
                    })?
                };
                AsyncWrapper::new(Connection::new_tls(conn))?
            } else {
                socket
            }
        };

        if let Err(err) = stream.get_ref().set_keepalive(Some(Duration::new(60 * 9, 0))) {
            log::warn!("Could not set TCP keepalive on IMAP connection: {}", err);
        }

        let mut res = Vec::with_capacity(8 * 1024);
        let mut ret = Self {
            cmd_id,
            id,
            stream,
            timeout: server_conf.timeout,
        };
        if server_conf.use_tls {
            // With implicit TLS the greeting arrives encrypted and has not
            // been consumed yet.
            ret.read_lines(&mut res, None, false).await?;
            if !res.starts_with(b"* OK") && !res.starts_with(b"* PREAUTH") {
                return Err(Error::new(format!(
                    "Unexpected greeting from {}: `{}`",
                    path,
                    String::from_utf8_lossy(trim_whitespace(&res))
                ))
                .set_kind(ErrorKind::Protocol));
            }
        }

        ret.send_command(CommandBody::Capability).await?;
        ret.read_response(&mut res).await?;
        let mut capabilities: Capabilities = {
            let line = res
                .split_rn()
                .find(|l| l.starts_with(b"* CAPABILITY"))
                .ok_or_else(|| {
                    Error::new(format!(
                        "Could not connect to {}: expected a CAPABILITY response, got: `{}`",
                        path,
                        String::from_utf8_lossy(trim_whitespace(&res))
                    ))
                    .set_kind(ErrorKind::Protocol)
                })?;
            parse_capabilities(line, &path)?
        };

        if !capabilities.iter().any(|cap| cap.eq_ignore_ascii_case(b"IMAP4rev1")) {
            return Err(Error::new(format!(
                "Could not connect to {}: server is not IMAP4rev1 compliant",
                path
            ))
            .set_kind(ErrorKind::Protocol));
        }

        if capabilities.iter().any(|cap| cap.eq_ignore_ascii_case(b"AUTH=PLAIN")) {
            let credentials = format!("\0{}\0{}", username, password);
            ret.send_command(CommandBody::authenticate_with_ir(
                AuthMechanism::Plain,
                credentials.as_bytes(),
            ))
            .await?;
        } else {
            if capabilities.iter().any(|cap| cap.eq_ignore_ascii_case(b"LOGINDISABLED")) {
                return Err(Error::new(format!(
                    "Could not authenticate to {}: server does not accept the LOGIN command \
                     [LOGINDISABLED]",
                    path
                ))
                .set_kind(ErrorKind::Authentication));
            }
            let username = AString::try_from(username).chain_err_kind(ErrorKind::Bug)?;
            let password = AString::try_from(password).chain_err_kind(ErrorKind::Bug)?;
            ret.send_command(CommandBody::Login {
                username,
                password: Secret::new(password),
            })
            .await?;
        }

        let tag_start = format!("M{} ", ret.cmd_id - 1);
        let mut got_new_capabilities = false;
        'auth: loop {
            ret.read_lines(&mut res, None, false).await?;
            for l in res.split_rn() {
                if l.starts_with(b"* CAPABILITY") {
                    got_new_capabilities = true;
                    capabilities.extend(parse_capabilities(l, &path)?);
                }
                if l.starts_with(tag_start.as_bytes()) {
                    let rest = trim_whitespace(&l[tag_start.len()..]);
                    if !rest.starts_with(b"OK") {
                        // Don't leak the socket: log the failed login out
                        // before reporting it.
                        ret.close_quietly().await;
                        return Err(Error::new(format!(
                            "Authentication as {} failed. Server replied: `{}`",
                            username,
                            String::from_utf8_lossy(rest)
                        ))
                        .set_kind(ErrorKind::Authentication));
                    }
                    break 'auth;
                }
            }
        }

        if !got_new_capabilities {
            // Sending CAPABILITY along with the LOGIN result is only an RFC
            // recommendation, so check for lazy servers.
            ret.send_command(CommandBody::Capability).await?;
            ret.read_response(&mut res).await?;
            capabilities.extend(parse_capabilities(&res, &path)?);
        }

        Ok((capabilities, ret, peer))
    }

    fn tls_connector(server_conf: &ImapServerConf) -> Result<TlsConnector> {
        let mut connector = TlsConnector::builder();
        if server_conf.danger_accept_invalid_certs {
            connector.danger_accept_invalid_certs(true);
        }
        connector
            .build()
            .chain_err_kind(ErrorKind::Network(NetworkErrorKind::TLSConnectionFailed))
    }

    /// Best-effort LOGOUT for teardown paths; all errors are swallowed.
    async fn close_quietly(&mut self) {
        let cmd = format!("M{} LOGOUT\r\n", self.cmd_id);
        self.cmd_id += 1;
        let _ = timeout(Some(Duration::new(4, 0)), async {
            let _ = self.stream.write_all(cmd.as_bytes()).await;
            let _ = self.stream.flush().await;
        })
        .await;
    }

    pub async fn read_response(&mut self, ret: &mut Vec<u8>) -> Result<()> {
        let id = format!("M{} ", self.cmd_id - 1).into_bytes();
        self.read_lines(ret, Some(&id), true).await
    }

    /// Read whole `CRLF`-terminated lines into `ret`.
    ///
    /// With a `termination_string`, keep reading until a line starts with
    /// it; without one, return at the first complete-line boundary. An
    /// unsolicited `* BYE` or end-of-file is a connection loss.
    pub async fn read_lines(
        &mut self,
        ret: &mut Vec<u8>,
        termination_string: Option<&[u8]>,
        keep_termination_string: bool,
    ) -> Result<()> {
        let termination_string = termination_string.filter(|t| !t.is_empty());
        let mut buf: Vec<u8> = vec![0; Connection::IO_BUF_SIZE];
        ret.clear();
        let mut last_line_idx: usize = 0;
        loop {
            match timeout(self.timeout, self.stream.read(&mut buf)).await? {
                Ok(0) => {
                    return Err(Error::new(format!(
                        "{}: connection closed by the remote end.",
                        self.id
                    ))
                    .set_kind(ErrorKind::Network(NetworkErrorKind::ConnectionLost)));
                }
                Ok(b) => {
                    ret.extend_from_slice(&buf[0..b]);
                    while let Some(pos) = find_subsequence(&ret[last_line_idx..], b"\r\n") {
                        let line_end = last_line_idx + pos + b"\r\n".len();
                        if ret[last_line_idx..].starts_with(b"* BYE") {
                            return Err(Error::new(format!(
                                "{}: disconnected: `{}`",
                                self.id,
                                String::from_utf8_lossy(trim_whitespace(
                                    &ret[last_line_idx..line_end]
                                ))
                            ))
                            .set_kind(ErrorKind::Network(NetworkErrorKind::ConnectionLost)));
                        }
                        if let Some(seq) = termination_string {
                            // Some servers erroneously send "+" CRLF instead
                            // of "+" SP CRLF, see
                            // https://github.com/modern-email/defects/issues/7
                            if ret[last_line_idx..].starts_with(seq)
                                || (seq == b"+ " && ret[last_line_idx..].starts_with(b"+"))
                            {
                                if !keep_termination_string {
                                    ret.truncate(last_line_idx);
                                }
                                return Ok(());
                            }
                        }
                        last_line_idx = line_end;
                    }
                    if termination_string.is_none() && last_line_idx == ret.len() && !ret.is_empty()
                    {
                        return Ok(());
                    }
                }
                Err(err) => {
                    return Err(Error::from(err));
                }
            }
        }
    }

    pub async fn wait_for_continuation_request(&mut self) -> Result<()> {
        let mut ret = Vec::new();
        self.read_lines(&mut ret, Some(b"+ "), false).await
    }

    pub async fn send_command(&mut self, body: CommandBody<'_>) -> Result<()> {
        timeout(self.timeout, async {
            let command = {
                let tag = Tag::unvalidated(format!("M{}", self.cmd_id));

                Command { tag, body }
            };
            match command.body {
                CommandBody::Login { .. } => {
                    log::trace!("{}: sent: M{} LOGIN ..", self.id, self.cmd_id);
                }
                CommandBody::Authenticate { .. } => {
                    log::trace!("{}: sent: M{} AUTHENTICATE ..", self.id, self.cmd_id);
                }
                _ => {
                    log::trace!("{}: sent: M{} {:?}", self.id, self.cmd_id, command.body);
                }
            }

            for action in CommandCodec::default().encode(&command) {
                match action {
                    Fragment::Line { data } => {
                        self.stream.write_all(&data).await?;
                    }
                    Fragment::Literal { data, mode } => {
                        // We only need to wait for a continuation request
                        // when we are about to send a synchronizing literal,
                        // i.e., when not using LITERAL+.
                        if mode == LiteralMode::Sync {
                            self.wait_for_continuation_request().await?;
                        }
                        self.stream.write_all(&data).await?;
                    }
                }
                self.stream.flush().await?;
            }

            self.cmd_id += 1;

            Ok(())
        })
        .await?
    }

    pub async fn send_command_raw(&mut self, command: &[u8]) -> Result<()> {
        timeout(self.timeout, async {
            log::trace!(
                "{}: sent: M{} {}",
                self.id,
                self.cmd_id,
                String::from_utf8_lossy(command)
            );
            self.stream.write_all(format!("M{} ", self.cmd_id).as_bytes()).await?;
            self.stream.write_all(command).await?;
            self.stream.write_all(b"\r\n").await?;
            self.stream.flush().await?;
            self.cmd_id += 1;
            Ok(())
        })
        .await?
    }

    /// Send raw literal octets followed by `rest` and CRLF, after the server
    /// granted a continuation request.
    pub async fn send_literal(&mut self, data: &[u8], rest: &[u8]) -> Result<()> {
        timeout(self.timeout, async {
            self.stream.write_all(data).await?;
            self.stream.write_all(rest).await?;
            self.stream.write_all(b"\r\n").await?;
            self.stream.flush().await?;
            Ok(())
        })
        .await?
    }
}

/// Fires the session's disconnect notification, exactly once.
#[derive(Clone, Debug)]
pub struct DisconnectNotifier {
    tx: smol::channel::Sender<()>,
    dead: Arc<AtomicBool>,
}

impl DisconnectNotifier {
    fn notify(&self) {
        if !self.dead.swap(true, Ordering::SeqCst) {
            let _ = self.tx.try_send(());
            self.tx.close();
        }
    }

    pub fn dead_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.dead)
    }
}

/// The receiving end of a connection's disconnect notification.
///
/// [`DisconnectWatch::wait`] resolves when the connection is gone, whether
/// through an explicit logout, an error noticed mid-exchange, or the remote
/// peer closing the socket while the session sits idle (watched through a
/// cloned socket handle peeked for end-of-file).
#[derive(Debug)]
pub struct DisconnectWatch {
    rx: smol::channel::Receiver<()>,
    dead: Arc<AtomicBool>,
    peer: Option<TcpStream>,
}

impl DisconnectWatch {
    pub async fn wait(mut self) {
        let rx = self.rx.clone();
        let explicit = async move {
            let _ = rx.recv().await;
        };
        futures::pin_mut!(explicit);
        match self.peer.take() {
            Some(sock) => {
                let eof = Self::watch_eof(sock);
                futures::pin_mut!(eof);
                futures::future::select(explicit, eof).await;
            }
            None => explicit.await,
        }
        self.dead.store(true, Ordering::SeqCst);
    }

    async fn watch_eof(sock: TcpStream) {
        let Ok(sock) = AsyncWrapper::new(sock) else {
            // No out-of-band watching; the explicit notification still
            // covers errors hit during protocol exchanges.
            return futures::future::pending::<()>().await;
        };
        let mut byte = [0_u8; 1];
        loop {
            if sock.readable().await.is_err() {
                break;
            }
            match sock.get_ref().peek(&mut byte) {
                // TCP FIN: the remote end hung up.
                Ok(0) => break,
                // Response traffic for whoever holds the connection lock.
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
            crate::utils::futures::sleep(Duration::from_millis(500)).await;
        }
    }
}

/// An upstream connection with liveness state and server capabilities.
///
/// The `stream` turns into its terminating error once the connection is
/// gone, so every later caller sees why.
#[derive(Debug)]
pub struct ImapConnection {
    pub id: Cow<'static, str>,
    pub stream: Result<ImapStream>,
    pub server_conf: ImapServerConf,
    pub capabilities: Capabilities,
    notifier: DisconnectNotifier,
}

impl ImapConnection {
    /// Connect and authenticate against `server_conf`.
    ///
    /// Returns the connection and the watch handle that resolves when the
    /// connection disconnects.
    pub async fn new_connection(
        server_conf: &ImapServerConf,
        username: &str,
        password: &str,
        id: Cow<'static, str>,
    ) -> Result<(Self, DisconnectWatch)> {
        let (capabilities, stream, peer) =
            ImapStream::new_connection(server_conf, username, password, id.clone()).await?;
        let (tx, rx) = smol::channel::bounded(1);
        let dead = Arc::new(AtomicBool::new(false));
        let notifier = DisconnectNotifier {
            tx,
            dead: Arc::clone(&dead),
        };
        Ok((
            Self {
                id,
                stream: Ok(stream),
                server_conf: server_conf.clone(),
                capabilities,
                notifier,
            },
            DisconnectWatch { rx, dead, peer },
        ))
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|cap| cap.eq_ignore_ascii_case(capability.as_bytes()))
    }

    /// The tag of the most recently sent command.
    pub fn prev_tag(&self) -> String {
        match self.stream {
            Ok(ref stream) => format!("M{}", stream.cmd_id.saturating_sub(1)),
            Err(_) => "M0".to_string(),
        }
    }

    /// Re-issue `CAPABILITY` and replace the cached capability set.
    pub async fn refresh_capabilities(&mut self) -> Result<()> {
        let mut res = Vec::with_capacity(1024);
        self.send_command(CommandBody::Capability).await?;
        self.read_response(&mut res).await?;
        protocol_parser::check_tagged_ok(&self.prev_tag(), &res)?;
        let hostname = self.server_conf.server_hostname.clone();
        let line = res
            .split_rn()
            .find(|l| l.starts_with(b"* CAPABILITY"))
            .ok_or_else(|| {
                Error::new(format!(
                    "{}: expected a CAPABILITY response, got: `{}`",
                    hostname,
                    String::from_utf8_lossy(trim_whitespace(&res))
                ))
                .set_kind(ErrorKind::Protocol)
            })?;
        self.capabilities = parse_capabilities(line, &hostname)?;
        Ok(())
    }

    pub async fn send_command(&mut self, body: CommandBody<'_>) -> Result<()> {
        let res = match self.stream.as_mut() {
            Ok(stream) => stream.send_command(body).await,
            Err(err) => Err(err.clone()),
        };
        self.process_io_result(res)
    }

    pub async fn send_command_raw(&mut self, command: &[u8]) -> Result<()> {
        let res = match self.stream.as_mut() {
            Ok(stream) => stream.send_command_raw(command).await,
            Err(err) => Err(err.clone()),
        };
        self.process_io_result(res)
    }

    pub async fn send_literal(&mut self, data: &[u8], rest: &[u8]) -> Result<()> {
        let res = match self.stream.as_mut() {
            Ok(stream) => stream.send_literal(data, rest).await,
            Err(err) => Err(err.clone()),
        };
        self.process_io_result(res)
    }

    pub async fn read_response(&mut self, ret: &mut Vec<u8>) -> Result<()> {
        let res = match self.stream.as_mut() {
            Ok(stream) => stream.read_response(ret).await,
            Err(err) => Err(err.clone()),
        };
        self.process_io_result(res)
    }

    pub async fn read_lines(
        &mut self,
        ret: &mut Vec<u8>,
        termination_string: Option<&[u8]>,
        keep_termination_string: bool,
    ) -> Result<()> {
        let res = match self.stream.as_mut() {
            Ok(stream) => {
                stream.read_lines(ret, termination_string, keep_termination_string).await
            }
            Err(err) => Err(err.clone()),
        };
        self.process_io_result(res)
    }

    pub async fn wait_for_continuation_request(&mut self) -> Result<()> {
        let res = match self.stream.as_mut() {
            Ok(stream) => stream.wait_for_continuation_request().await,
            Err(err) => Err(err.clone()),
        };
        self.process_io_result(res)
    }

    /// Log out of the upstream server and fire the disconnect notification.
    pub async fn logout(&mut self) {
        if let Ok(ref mut stream) = self.stream {
            // The server answers LOGOUT with `* BYE`, which read_response
            // reports as a connection loss; both failure and success leave
            // the connection equally logged out.
            let mut res = Vec::with_capacity(256);
            if stream.send_command(CommandBody::Logout).await.is_ok() {
                let _ = stream.read_response(&mut res).await;
            }
        }
        self.mark_dead(Error::new("Session logged out.").set_kind(ErrorKind::SessionExpired));
    }

    /// Record that the connection is gone and notify the watcher.
    pub fn mark_dead(&mut self, err: Error) {
        if self.stream.is_ok() {
            log::trace!("{}: upstream connection closed: {}", self.id, err.summary);
        }
        self.stream = Err(err);
        self.notifier.notify();
    }

    fn process_io_result<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(ref err) = res {
            if err.kind.is_disconnect() {
                self.mark_dead(err.clone());
            }
        }
        res
    }
}

/// Serializes protocol access to one [`ImapConnection`].
///
/// `lock()` refuses once the connection is dead, so no request handler can
/// obtain (or queue on) a connection that can no longer serve it.
#[derive(Debug)]
pub struct ConnectionMutex {
    inner: FutureMutex<ImapConnection>,
    dead: Arc<AtomicBool>,
}

impl ConnectionMutex {
    pub fn new(conn: ImapConnection) -> Self {
        let dead = conn.notifier.dead_handle();
        Self {
            inner: FutureMutex::new(conn),
            dead,
        }
    }

    pub async fn lock(&self) -> Result<MutexGuard<'_, ImapConnection>> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(
                Error::new("Session upstream connection is closed.")
                    .set_kind(ErrorKind::SessionExpired),
            );
        }
        let guard = self.inner.lock().await;
        if let Err(ref err) = guard.stream {
            return Err(Error::new("Session upstream connection is closed.")
                .set_source(Some(Arc::new(err.clone())))
                .set_kind(ErrorKind::SessionExpired));
        }
        Ok(guard)
    }

    /// Lock without the liveness check, for teardown paths.
    pub(crate) async fn lock_raw(&self) -> MutexGuard<'_, ImapConnection> {
        self.inner.lock().await
    }
}
