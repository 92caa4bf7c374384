//
// pyloros
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

//! Session manager, session and store behavior against scripted fake
//! upstream servers.

/// A minimal scripted IMAP server: greeting, `CAPABILITY`,
/// `AUTHENTICATE PLAIN`, `NOOP`, `XPING` (test echo), `METADATA`
/// get/set and `LOGOUT`. Every observable action is recorded so tests can
/// assert on what actually reached the wire.
pub mod server {
    use std::{
        collections::HashMap,
        io::{Read, Write},
        net::{Shutdown, SocketAddr, TcpListener, TcpStream},
        sync::{Arc, Mutex},
        thread,
    };

    #[derive(Clone, Debug)]
    pub struct ServerConfig {
        pub advertise_metadata: bool,
        /// Accepted (username, password) pairs.
        pub accept: Vec<(String, String)>,
    }

    impl ServerConfig {
        pub fn new(advertise_metadata: bool, accept: &[(&str, &str)]) -> Self {
            Self {
                advertise_metadata,
                accept: accept
                    .iter()
                    .map(|(u, p)| (u.to_string(), p.to_string()))
                    .collect(),
            }
        }
    }

    #[derive(Debug, Default)]
    pub struct ServerLog {
        pub capability_commands: usize,
        pub logout_commands: usize,
        pub auth_attempts: usize,
        pub ping_args: Vec<String>,
        pub metadata: HashMap<String, Vec<u8>>,
    }

    pub struct FakeImapServer {
        pub addr: SocketAddr,
        pub log: Arc<Mutex<ServerLog>>,
        conns: Arc<Mutex<Vec<TcpStream>>>,
    }

    impl FakeImapServer {
        /// Hard-close every accepted connection, as if the server process
        /// went away.
        pub fn drop_connections(&self) {
            for conn in self.conns.lock().unwrap().drain(..) {
                let _ = conn.shutdown(Shutdown::Both);
            }
        }
    }

    pub fn spawn(config: ServerConfig) -> FakeImapServer {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(ServerLog::default()));
        let conns: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let log = Arc::clone(&log);
            let conns = Arc::clone(&conns);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    conns.lock().unwrap().push(stream.try_clone().unwrap());
                    let log = Arc::clone(&log);
                    let config = config.clone();
                    thread::spawn(move || {
                        let _ = handle_connection(stream, &config, &log);
                    });
                }
            });
        }
        FakeImapServer { addr, log, conns }
    }

    fn read_line(stream: &mut TcpStream, buf: &mut Vec<u8>) -> std::io::Result<String> {
        buf.clear();
        let mut byte = [0_u8; 1];
        loop {
            let n = stream.read(&mut byte)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "client went away",
                ));
            }
            buf.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        Ok(String::from_utf8_lossy(buf).trim_end().to_string())
    }

    fn handle_connection(
        mut stream: TcpStream,
        config: &ServerConfig,
        log: &Arc<Mutex<ServerLog>>,
    ) -> std::io::Result<()> {
        stream.write_all(b"* OK fake IMAP4rev1 server ready\r\n")?;
        let mut buf = Vec::new();
        loop {
            let line = read_line(&mut stream, &mut buf)?;
            let Some((tag, rest)) = line.split_once(' ') else {
                continue;
            };
            let tag = tag.to_string();
            let (command, args) = match rest.split_once(' ') {
                Some((c, a)) => (c.to_ascii_uppercase(), a.to_string()),
                None => (rest.to_ascii_uppercase(), String::new()),
            };
            match command.as_str() {
                "CAPABILITY" => {
                    log.lock().unwrap().capability_commands += 1;
                    let mut caps = "IMAP4rev1 AUTH=PLAIN".to_string();
                    if config.advertise_metadata {
                        caps.push_str(" METADATA");
                    }
                    stream.write_all(
                        format!(
                            "* CAPABILITY {}\r\n{} OK CAPABILITY completed\r\n",
                            caps, tag
                        )
                        .as_bytes(),
                    )?;
                }
                "AUTHENTICATE" => {
                    log.lock().unwrap().auth_attempts += 1;
                    let b64 = args.split_whitespace().nth(1).unwrap_or_default();
                    let decoded =
                        data_encoding::BASE64.decode(b64.as_bytes()).unwrap_or_default();
                    let mut parts = decoded.split(|b| *b == 0).skip(1);
                    let user = String::from_utf8_lossy(parts.next().unwrap_or_default())
                        .to_string();
                    let pass = String::from_utf8_lossy(parts.next().unwrap_or_default())
                        .to_string();
                    if config.accept.iter().any(|(u, p)| *u == user && *p == pass) {
                        stream
                            .write_all(format!("{} OK authenticated\r\n", tag).as_bytes())?;
                    } else {
                        stream.write_all(
                            format!(
                                "{} NO [AUTHENTICATIONFAILED] invalid credentials\r\n",
                                tag
                            )
                            .as_bytes(),
                        )?;
                    }
                }
                "NOOP" => {
                    stream.write_all(format!("{} OK NOOP completed\r\n", tag).as_bytes())?;
                }
                "XPING" => {
                    log.lock().unwrap().ping_args.push(args.clone());
                    stream.write_all(
                        format!("* XPING PONG {}\r\n{} OK XPING completed\r\n", args, tag)
                            .as_bytes(),
                    )?;
                }
                "GETMETADATA" => {
                    let key = args
                        .trim_start_matches("\"\" (")
                        .trim_end_matches(')')
                        .to_string();
                    let value = log.lock().unwrap().metadata.get(&key).cloned();
                    match value {
                        Some(value) => {
                            stream.write_all(
                                format!("* METADATA \"\" ({} {{{}}}\r\n", key, value.len())
                                    .as_bytes(),
                            )?;
                            stream.write_all(&value)?;
                            stream.write_all(
                                format!(")\r\n{} OK GETMETADATA completed\r\n", tag)
                                    .as_bytes(),
                            )?;
                        }
                        None => {
                            stream.write_all(
                                format!(
                                    "* METADATA \"\" ({} NIL)\r\n{} OK GETMETADATA \
                                     completed\r\n",
                                    key, tag
                                )
                                .as_bytes(),
                            )?;
                        }
                    }
                }
                "SETMETADATA" => {
                    let inner = args.trim_start_matches("\"\" (");
                    let (key, len) = inner.split_once(' ').unwrap();
                    let len: usize = len
                        .trim_start_matches('{')
                        .trim_end_matches('}')
                        .parse()
                        .unwrap();
                    stream.write_all(b"+ ready for literal\r\n")?;
                    let mut value = vec![0_u8; len];
                    stream.read_exact(&mut value)?;
                    // The trailing ")" CRLF after the literal.
                    let _ = read_line(&mut stream, &mut buf)?;
                    log.lock().unwrap().metadata.insert(key.to_string(), value);
                    stream.write_all(
                        format!("{} OK SETMETADATA completed\r\n", tag).as_bytes(),
                    )?;
                }
                "LOGOUT" => {
                    log.lock().unwrap().logout_commands += 1;
                    let _ = stream.write_all(
                        format!(
                            "* BYE fake server logging out\r\n{} OK LOGOUT completed\r\n",
                            tag
                        )
                        .as_bytes(),
                    );
                    let _ = stream.shutdown(Shutdown::Both);
                    return Ok(());
                }
                _ => {
                    stream.write_all(format!("{} BAD unknown command\r\n", tag).as_bytes())?;
                }
            }
        }
    }
}

/// A minimal scripted submission server: `EHLO`, `AUTH PLAIN`,
/// `MAIL FROM`/`RCPT TO`/`DATA`, `QUIT`.
pub mod smtp_server {
    use std::{
        io::{Read, Write},
        net::{SocketAddr, TcpListener, TcpStream},
        sync::{Arc, Mutex},
        thread,
    };

    #[derive(Debug, Default)]
    pub struct SmtpLog {
        pub auth: Vec<(String, String)>,
        /// (envelope from, recipients, message body).
        pub messages: Vec<(String, Vec<String>, String)>,
        pub quits: usize,
    }

    pub struct FakeSmtpServer {
        pub addr: SocketAddr,
        pub log: Arc<Mutex<SmtpLog>>,
    }

    pub fn spawn(accept: &[(&str, &str)]) -> FakeSmtpServer {
        let accept: Vec<(String, String)> = accept
            .iter()
            .map(|(u, p)| (u.to_string(), p.to_string()))
            .collect();
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(SmtpLog::default()));
        {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    let log = Arc::clone(&log);
                    let accept = accept.clone();
                    thread::spawn(move || {
                        let _ = handle_connection(stream, &accept, &log);
                    });
                }
            });
        }
        FakeSmtpServer { addr, log }
    }

    fn read_line(stream: &mut TcpStream, buf: &mut Vec<u8>) -> std::io::Result<String> {
        buf.clear();
        let mut byte = [0_u8; 1];
        loop {
            let n = stream.read(&mut byte)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "client went away",
                ));
            }
            buf.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        Ok(String::from_utf8_lossy(buf).trim_end().to_string())
    }

    fn handle_connection(
        mut stream: TcpStream,
        accept: &[(String, String)],
        log: &Arc<Mutex<SmtpLog>>,
    ) -> std::io::Result<()> {
        stream.write_all(b"220 fake ESMTP ready\r\n")?;
        let mut buf = Vec::new();
        let mut envelope_from = String::new();
        let mut rcpt_to: Vec<String> = Vec::new();
        loop {
            let line = read_line(&mut stream, &mut buf)?;
            let upper = line.to_ascii_uppercase();
            if upper.starts_with("EHLO") {
                stream.write_all(b"250-fake greets you\r\n250 AUTH PLAIN\r\n")?;
            } else if upper.starts_with("AUTH PLAIN") {
                let b64 = line.split_whitespace().nth(2).unwrap_or_default();
                let decoded = data_encoding::BASE64.decode(b64.as_bytes()).unwrap_or_default();
                let mut parts = decoded.split(|b| *b == 0).skip(1);
                let user =
                    String::from_utf8_lossy(parts.next().unwrap_or_default()).to_string();
                let pass =
                    String::from_utf8_lossy(parts.next().unwrap_or_default()).to_string();
                let ok = accept.iter().any(|(u, p)| *u == user && *p == pass);
                log.lock().unwrap().auth.push((user, pass));
                if ok {
                    stream.write_all(b"235 2.7.0 authentication successful\r\n")?;
                } else {
                    stream.write_all(b"535 5.7.8 authentication credentials invalid\r\n")?;
                }
            } else if upper.starts_with("MAIL FROM:") {
                envelope_from = line["MAIL FROM:".len()..]
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string();
                rcpt_to.clear();
                stream.write_all(b"250 ok\r\n")?;
            } else if upper.starts_with("RCPT TO:") {
                rcpt_to.push(
                    line["RCPT TO:".len()..]
                        .trim()
                        .trim_start_matches('<')
                        .trim_end_matches('>')
                        .to_string(),
                );
                stream.write_all(b"250 ok\r\n")?;
            } else if upper == "DATA" {
                stream.write_all(b"354 go ahead\r\n")?;
                let mut body = String::new();
                loop {
                    let data_line = read_line(&mut stream, &mut buf)?;
                    if data_line == "." {
                        break;
                    }
                    body.push_str(data_line.strip_prefix('.').unwrap_or(&data_line));
                    body.push('\n');
                }
                log.lock().unwrap().messages.push((
                    envelope_from.clone(),
                    rcpt_to.clone(),
                    body,
                ));
                stream.write_all(b"250 2.0.0 accepted\r\n")?;
            } else if upper == "QUIT" {
                log.lock().unwrap().quits += 1;
                stream.write_all(b"221 bye\r\n")?;
                return Ok(());
            } else {
                stream.write_all(b"500 unrecognized\r\n")?;
            }
        }
    }
}

mod tests {
    use std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use futures::{executor::block_on, join, FutureExt};
    use pyloros::{
        imap::ImapServerConf,
        session::{Attachment, SessionManager, SessionToken},
        smtp::{SmtpSecurity, SmtpServerConf},
    };

    use super::{
        server::{self, ServerConfig},
        smtp_server,
    };

    fn imap_conf(addr: SocketAddr) -> ImapServerConf {
        ImapServerConf {
            server_hostname: addr.ip().to_string(),
            server_port: addr.port(),
            use_tls: false,
            use_starttls: false,
            danger_accept_invalid_certs: false,
            timeout: Some(Duration::from_secs(10)),
        }
    }

    fn new_manager(
        server: &server::FakeImapServer,
        submission: Option<SmtpServerConf>,
    ) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            imap_conf(server.addr),
            submission,
            Arc::new(AtomicBool::new(false)),
        ))
    }

    fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        false
    }

    #[test]
    fn test_authenticate_issues_fresh_resolving_tokens() {
        let server = server::spawn(ServerConfig::new(
            true,
            &[("alice", "secret"), ("bob", "hunter2")],
        ));
        let manager = new_manager(&server, None);
        let t1 = block_on(manager.authenticate("alice", "secret")).unwrap();
        let t2 = block_on(manager.authenticate("bob", "hunter2")).unwrap();
        assert_ne!(t1, t2);
        assert_eq!(manager.get(&t1).unwrap().username(), "alice");
        assert_eq!(manager.get(&t2).unwrap().username(), "bob");
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_unknown_tokens_are_expired() {
        let server = server::spawn(ServerConfig::new(true, &[("alice", "secret")]));
        let manager = new_manager(&server, None);
        let err = manager.get(&SessionToken::from("never-issued")).unwrap_err();
        assert!(err.kind.is_session_expired());

        // Tokens must not leak across manager instances.
        let token = block_on(manager.authenticate("alice", "secret")).unwrap();
        let other_manager = new_manager(&server, None);
        let err = other_manager.get(&token).unwrap_err();
        assert!(err.kind.is_session_expired());
        assert!(manager.get(&token).is_ok());
    }

    #[test]
    fn test_concurrent_with_connection_calls_never_interleave() {
        let server = server::spawn(ServerConfig::new(true, &[("alice", "secret")]));
        let manager = new_manager(&server, None);
        let token = block_on(manager.authenticate("alice", "secret")).unwrap();
        let session = manager.get(&token).unwrap();

        let s1 = Arc::clone(&session);
        let fut_a = async {
            s1.with_connection(|conn| {
                async move {
                    let mut res = Vec::new();
                    conn.send_command_raw(b"XPING a1").await?;
                    conn.read_response(&mut res).await?;
                    // Yield mid-exchange; without mutual exclusion the other
                    // caller's commands would land here.
                    pyloros::utils::futures::sleep(Duration::from_millis(50)).await;
                    conn.send_command_raw(b"XPING a2").await?;
                    conn.read_response(&mut res).await?;
                    Ok(())
                }
                .boxed()
            })
            .await
        };
        let s2 = Arc::clone(&session);
        let fut_b = async {
            s2.with_connection(|conn| {
                async move {
                    let mut res = Vec::new();
                    conn.send_command_raw(b"XPING b1").await?;
                    conn.read_response(&mut res).await?;
                    pyloros::utils::futures::sleep(Duration::from_millis(50)).await;
                    conn.send_command_raw(b"XPING b2").await?;
                    conn.read_response(&mut res).await?;
                    Ok(())
                }
                .boxed()
            })
            .await
        };
        let (a, b): (pyloros::Result<()>, pyloros::Result<()>) =
            block_on(async { join!(fut_a, fut_b) });
        a.unwrap();
        b.unwrap();

        let ping_args = server.log.lock().unwrap().ping_args.clone();
        assert!(
            ping_args == ["a1", "a2", "b1", "b2"] || ping_args == ["b1", "b2", "a1", "a2"],
            "exchanges interleaved on the wire: {:?}",
            ping_args
        );
    }

    #[test]
    fn test_store_roundtrip_and_repopulation_with_metadata() {
        let server = server::spawn(ServerConfig::new(true, &[("alice", "secret")]));
        let manager = new_manager(&server, None);
        let token = block_on(manager.authenticate("alice", "secret")).unwrap();
        let session = manager.get(&token).unwrap();

        let store = block_on(session.store()).unwrap();
        assert!(store.is_persistent());
        let prefs = serde_json::json!({"theme": "dark", "page_size": 50});
        block_on(store.put("prefs", &prefs)).unwrap();
        assert_eq!(block_on(store.get("prefs")).unwrap(), prefs);

        // The write went to the namespaced remote entry, not only the cache.
        assert!(server
            .log
            .lock()
            .unwrap()
            .metadata
            .contains_key("/private/vendor/pyloros/prefs"));

        // A new session starts with a cold cache; the remote fetch
        // repopulates it.
        let token2 = block_on(manager.authenticate("alice", "secret")).unwrap();
        let session2 = manager.get(&token2).unwrap();
        let store2 = block_on(session2.store()).unwrap();
        assert_eq!(block_on(store2.get("prefs")).unwrap(), prefs);

        let err = block_on(store2.get("no-such-key")).unwrap_err();
        assert!(err.kind.is_not_found());
    }

    #[test]
    fn test_store_falls_back_to_transient_without_metadata() {
        let server = server::spawn(ServerConfig::new(false, &[("alice", "secret")]));
        let warned = Arc::new(AtomicBool::new(false));
        let manager = Arc::new(SessionManager::new(
            imap_conf(server.addr),
            None,
            Arc::clone(&warned),
        ));
        let token = block_on(manager.authenticate("alice", "secret")).unwrap();
        let session = manager.get(&token).unwrap();

        let before = server.log.lock().unwrap().capability_commands;
        let store = block_on(session.store()).unwrap();
        assert!(!store.is_persistent());
        assert!(warned.load(Ordering::SeqCst));

        // Same contract as the persistent backing.
        block_on(store.put("draft", &serde_json::json!("hello"))).unwrap();
        assert_eq!(
            block_on(store.get("draft")).unwrap(),
            serde_json::json!("hello")
        );
        assert!(block_on(store.get("missing")).unwrap_err().kind.is_not_found());

        // The probe ran exactly once for this store instance; asking for the
        // store again reuses it.
        let store_again = block_on(session.store()).unwrap();
        assert!(Arc::ptr_eq(&store, &store_again));
        let after = server.log.lock().unwrap().capability_commands;
        assert_eq!(after - before, 1);

        // Nothing was written upstream.
        assert!(server.log.lock().unwrap().metadata.is_empty());

        // "Restart": a fresh session's transient store starts empty.
        let token2 = block_on(manager.authenticate("alice", "secret")).unwrap();
        let session2 = manager.get(&token2).unwrap();
        let store2 = block_on(session2.store()).unwrap();
        assert!(block_on(store2.get("draft")).unwrap_err().kind.is_not_found());
    }

    #[test]
    fn test_corrupt_remote_value_is_a_hard_error() {
        let server = server::spawn(ServerConfig::new(true, &[("alice", "secret")]));
        let manager = new_manager(&server, None);
        let token = block_on(manager.authenticate("alice", "secret")).unwrap();
        let session = manager.get(&token).unwrap();
        let store = block_on(session.store()).unwrap();

        server.log.lock().unwrap().metadata.insert(
            "/private/vendor/pyloros/settings".to_string(),
            b"{not json at all".to_vec(),
        );
        let err = block_on(store.get("settings")).unwrap_err();
        assert_eq!(err.kind, pyloros::ErrorKind::DataCorruption);
        assert!(!err.kind.is_not_found());
    }

    #[test]
    fn test_failed_login_closes_connection_and_issues_no_token() {
        let server = server::spawn(ServerConfig::new(true, &[("alice", "secret")]));
        let manager = new_manager(&server, None);
        let err = block_on(manager.authenticate("alice", "wrong")).unwrap_err();
        assert!(err.kind.is_authentication(), "kind: {:?}", err.kind);
        assert!(manager.is_empty());
        assert_eq!(server.log.lock().unwrap().auth_attempts, 1);
        // The connection was logged out, not abandoned.
        let log = Arc::clone(&server.log);
        assert!(
            wait_until(move || log.lock().unwrap().logout_commands >= 1),
            "no LOGOUT reached the server after the failed login"
        );
    }

    #[test]
    fn test_end_to_end_ping_then_remote_close_expires_session() {
        let server = server::spawn(ServerConfig::new(true, &[("alice", "secret")]));
        let manager = new_manager(&server, None);
        let token = block_on(manager.authenticate("alice", "secret")).unwrap();

        let session = manager.get(&token).unwrap();
        let response = block_on(session.with_connection(|conn| {
            async move {
                let mut res = Vec::new();
                conn.send_command_raw(b"XPING hello").await?;
                conn.read_response(&mut res).await?;
                Ok(String::from_utf8_lossy(&res).to_string())
            }
            .boxed()
        }))
        .unwrap();
        assert!(response.contains("PONG"), "response: {:?}", response);

        server.drop_connections();
        let manager2 = Arc::clone(&manager);
        let token2 = token.clone();
        assert!(
            wait_until(move || {
                matches!(&manager2.get(&token2), Err(err) if err.kind.is_session_expired())
            }),
            "token still resolved after the upstream connection went away"
        );

        // A dead session also refuses protocol access instead of hanging.
        let err = block_on(session.with_connection(|conn| {
            async move {
                conn.send_command_raw(b"XPING too-late").await?;
                Ok(())
            }
            .boxed()
        }))
        .unwrap_err();
        assert!(err.kind.is_session_expired() || err.kind.is_network());
    }

    #[test]
    fn test_explicit_logout_reclaims_token() {
        let server = server::spawn(ServerConfig::new(true, &[("alice", "secret")]));
        let manager = new_manager(&server, None);
        let token = block_on(manager.authenticate("alice", "secret")).unwrap();
        let session = manager.get(&token).unwrap();
        block_on(session.logout());
        assert!(server.log.lock().unwrap().logout_commands >= 1);
        let manager2 = Arc::clone(&manager);
        let token2 = token.clone();
        assert!(
            wait_until(move || {
                matches!(&manager2.get(&token2), Err(err) if err.kind.is_session_expired())
            }),
            "token still resolved after logout"
        );
    }

    #[test]
    fn test_submission_connection_uses_session_credentials_and_closes() {
        let imap = server::spawn(ServerConfig::new(true, &[("alice", "secret")]));
        let smtp = smtp_server::spawn(&[("alice", "secret")]);
        let submission = SmtpServerConf {
            hostname: smtp.addr.ip().to_string(),
            port: smtp.addr.port(),
            security: SmtpSecurity::None,
            timeout: Some(Duration::from_secs(10)),
        };
        let manager = new_manager(&imap, Some(submission));
        let token = block_on(manager.authenticate("alice", "secret")).unwrap();
        let session = manager.get(&token).unwrap();

        let mail = "Subject: hello\r\n\r\nmeet me at noon.\r\n.hidden dot line\r\n";
        block_on(session.with_submission_connection(|conn| {
            async move {
                conn.mail_transaction(mail, "alice@example.com", &["bob@example.com"]).await
            }
            .boxed()
        }))
        .unwrap();

        let log = smtp.log.lock().unwrap();
        assert_eq!(
            log.auth,
            vec![("alice".to_string(), "secret".to_string())]
        );
        assert_eq!(log.quits, 1);
        assert_eq!(log.messages.len(), 1);
        let (from, rcpts, body) = &log.messages[0];
        assert_eq!(from, "alice@example.com");
        assert_eq!(rcpts, &vec!["bob@example.com".to_string()]);
        assert!(body.contains("meet me at noon."));
        // Dot-stuffing got undone by the server.
        assert!(body.contains("\n.hidden dot line"));
    }

    #[test]
    fn test_submission_without_configured_upstream_is_a_config_error() {
        let imap = server::spawn(ServerConfig::new(true, &[("alice", "secret")]));
        let manager = new_manager(&imap, None);
        let token = block_on(manager.authenticate("alice", "secret")).unwrap();
        let session = manager.get(&token).unwrap();
        let err = block_on(session.with_submission_connection(|_conn| {
            async move { Ok(()) }.boxed()
        }))
        .unwrap_err();
        assert_eq!(err.kind, pyloros::ErrorKind::Configuration);
    }

    #[test]
    fn test_attachment_cache_cap_and_notices() {
        let imap = server::spawn(ServerConfig::new(true, &[("alice", "secret")]));
        let mut manager = SessionManager::new(
            imap_conf(imap.addr),
            None,
            Arc::new(AtomicBool::new(false)),
        );
        manager.attachment_cache_size = 16;
        let manager = Arc::new(manager);
        let token = block_on(manager.authenticate("alice", "secret")).unwrap();
        let session = manager.get(&token).unwrap();

        let small = Attachment {
            filename: "a.txt".to_string(),
            content_type: "text/plain".to_string(),
            bytes: vec![0; 10],
        };
        let id = session.put_attachment(small).unwrap();
        let too_big = Attachment {
            filename: "b.txt".to_string(),
            content_type: "text/plain".to_string(),
            bytes: vec![0; 10],
        };
        assert!(session.put_attachment(too_big.clone()).is_err());
        // Popping the first frees its share of the cap.
        assert_eq!(session.pop_attachment(&id).unwrap().filename, "a.txt");
        assert!(session.pop_attachment(&id).is_none());
        session.put_attachment(too_big).unwrap();

        assert!(session.pop_notice().is_none());
        session.put_notice("message sent");
        assert_eq!(session.pop_notice().unwrap(), "message sent");
        assert!(session.pop_notice().is_none());
    }
}
