//
// pyloros - session module
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

//! Active user sessions and the manager that owns them.
//!
//! A [`Session`] owns exactly one authenticated upstream IMAP connection and
//! the credentials that opened it. The [`SessionManager`] maps opaque bearer
//! tokens to sessions: insertion happens only on successful authentication,
//! removal only when a session's upstream connection disconnects. Two locks
//! are involved and they never nest around I/O: the manager's map lock
//! protects membership, each session's connection mutex protects protocol
//! access.

use std::{
    collections::HashMap,
    fmt,
    sync::{atomic::AtomicBool, Arc, Mutex},
};

use futures::{future::BoxFuture, lock::Mutex as FutureMutex};

use crate::{
    error::{Error, ErrorKind, Result},
    imap::{ConnectionMutex, ImapConnection, ImapServerConf},
    smtp::{SmtpConnection, SmtpServerConf},
    store::Store,
    utils::random,
};

/// Opaque bearer credential identifying a [`Session`] to the web layer.
///
/// Tokens carry no structure: 256 bits from the operating system's CSPRNG,
/// base64url-encoded. Compromise of a token is compromise of the session,
/// nothing less and nothing more.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SessionToken(String);

impl SessionToken {
    pub const ENTROPY_BYTES: usize = 32;

    /// Mint a fresh token.
    ///
    /// Fails when the entropy source does; callers must abort session
    /// creation rather than fall back to anything guessable.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0_u8; Self::ENTROPY_BYTES];
        random::random_bytes(&mut bytes)?;
        Ok(Self(data_encoding::BASE64URL_NOPAD.encode(&bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

impl From<&str> for SessionToken {
    fn from(val: &str) -> Self {
        Self(val.to_string())
    }
}

impl From<String> for SessionToken {
    fn from(val: String) -> Self {
        Self(val)
    }
}

/// An uploaded file staged on the session while a message is being
/// composed.
#[derive(Clone, Debug)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// An active user session.
///
/// The session's password never leaves this struct; consumers authenticate
/// secondary connections through the helpers below instead of reading it.
pub struct Session {
    username: String,
    password: String,
    connection: Arc<ConnectionMutex>,
    submission: Option<SmtpServerConf>,
    transient_warned: Arc<AtomicBool>,
    store: FutureMutex<Option<Arc<Store>>>,
    attachments: Mutex<HashMap<uuid::Uuid, Attachment>>,
    attachment_cache_size: usize,
    notice: Mutex<Option<String>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct(stringify!(Session))
            .field("username", &self.username)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// The username this session authenticated as.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Run `f` against the session's upstream connection.
    ///
    /// This is the only sanctioned way to touch the upstream connection.
    /// The connection lock is held for the whole call and released on every
    /// exit path, so command/response exchanges from concurrent callers
    /// never interleave on the wire. Once the connection has died, this
    /// fails with [`ErrorKind::SessionExpired`] instead of blocking forever.
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut ImapConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.connection.lock().await?;
        f(&mut *conn).await
    }

    /// Open a fresh mail submission connection authenticated with this
    /// session's credentials, run `f`, and close the connection afterwards
    /// no matter what.
    ///
    /// Submission connections are never pooled or shared, and they are
    /// independent of the upstream IMAP connection: no ordering holds
    /// between this and [`with_connection`](Self::with_connection).
    pub async fn with_submission_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut SmtpConnection) -> BoxFuture<'c, Result<T>>,
    {
        let Some(ref conf) = self.submission else {
            return Err(Error::new("No mail submission server is configured.")
                .set_kind(ErrorKind::Configuration));
        };
        let mut conn = SmtpConnection::new_connection(conf).await?;
        conn.authenticate(&self.username, &self.password).await?;
        match f(&mut conn).await {
            Ok(ret) => {
                conn.quit().await?;
                Ok(ret)
            }
            // Dropping the connection closes the socket.
            Err(err) => Err(err),
        }
    }

    /// The session's user store, built on first use.
    ///
    /// The capability probe deciding the backing runs once per session; the
    /// upstream cannot grow or lose the capability without a reconnect, so
    /// re-probing would be wasted round trips.
    pub async fn store(&self) -> Result<Arc<Store>> {
        let mut slot = self.store.lock().await;
        if let Some(store) = slot.as_ref() {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(
            Store::new(
                Arc::clone(&self.connection),
                Arc::clone(&self.transient_warned),
            )
            .await?,
        );
        *slot = Some(Arc::clone(&store));
        Ok(store)
    }

    /// `Authorization` header value for reusing this session's credentials
    /// against HTTP-based services (CalDAV, CardDAV) without re-entering the
    /// password.
    pub fn http_basic_auth(&self) -> String {
        let credentials = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            data_encoding::BASE64.encode(credentials.as_bytes())
        )
    }

    /// Stage an attachment, subject to the session-wide cache size cap.
    pub fn put_attachment(&self, attachment: Attachment) -> Result<uuid::Uuid> {
        let mut attachments = self.attachments.lock().unwrap();
        let total: usize = attachments.values().map(|a| a.bytes.len()).sum();
        if total + attachment.bytes.len() > self.attachment_cache_size {
            return Err(Error::new(
                "Attachments on this session exceed the maximum cached size.",
            )
            .set_kind(ErrorKind::ValueError));
        }
        let id = uuid::Uuid::new_v4();
        attachments.insert(id, attachment);
        Ok(id)
    }

    /// Remove and return a staged attachment. `None` if there is no such
    /// attachment.
    pub fn pop_attachment(&self, id: &uuid::Uuid) -> Option<Attachment> {
        self.attachments.lock().unwrap().remove(id)
    }

    /// Leave a one-shot notice for the next page render.
    pub fn put_notice<M: Into<String>>(&self, notice: M) {
        *self.notice.lock().unwrap() = Some(notice.into());
    }

    pub fn pop_notice(&self) -> Option<String> {
        self.notice.lock().unwrap().take()
    }

    /// Log the session out of the upstream server.
    ///
    /// The manager reclaims the token through the connection's disconnect
    /// notification, the same path a remote hang-up takes.
    pub async fn logout(&self) {
        let mut conn = self.connection.lock_raw().await;
        conn.logout().await;
    }
}

pub const DEFAULT_ATTACHMENT_CACHE_SIZE: usize = 32 * 1024 * 1024;

/// Keeps track of active sessions.
///
/// Created sessions live until their upstream connection signals it has
/// closed, whether by explicit logout or by the remote peer terminating it;
/// that notification is the sole reclamation trigger.
#[derive(Debug)]
pub struct SessionManager {
    imap: ImapServerConf,
    submission: Option<SmtpServerConf>,
    pub attachment_cache_size: usize,
    transient_warned: Arc<AtomicBool>,
    sessions: Mutex<HashMap<SessionToken, Arc<Session>>>,
}

impl SessionManager {
    /// `transient_warned` is the process-scoped "store fallback already
    /// logged" flag, owned by the caller so tests can reset it.
    pub fn new(
        imap: ImapServerConf,
        submission: Option<SmtpServerConf>,
        transient_warned: Arc<AtomicBool>,
    ) -> Self {
        Self {
            imap,
            submission,
            attachment_cache_size: DEFAULT_ATTACHMENT_CACHE_SIZE,
            transient_warned,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Authenticate against the upstream server and create a session.
    ///
    /// On bad credentials the error kind is
    /// [`Authentication`](ErrorKind::Authentication) and no connection is
    /// leaked; on success the returned token resolves through
    /// [`get`](Self::get) until the session's connection goes away.
    pub async fn authenticate(
        self: &Arc<Self>,
        username: &str,
        password: &str,
    ) -> Result<SessionToken> {
        let (mut conn, watch) = ImapConnection::new_connection(
            &self.imap,
            username,
            password,
            "webmail-main".into(),
        )
        .await?;
        let mut token = match SessionToken::generate() {
            Ok(token) => token,
            Err(err) => {
                // A predictable token is worse than no session; release the
                // connection we just opened.
                conn.logout().await;
                return Err(err);
            }
        };
        let session = Arc::new(Session {
            username: username.to_string(),
            password: password.to_string(),
            connection: Arc::new(ConnectionMutex::new(conn)),
            submission: self.submission.clone(),
            transient_warned: Arc::clone(&self.transient_warned),
            store: FutureMutex::new(None),
            attachments: Mutex::new(HashMap::new()),
            attachment_cache_size: self.attachment_cache_size,
            notice: Mutex::new(None),
        });
        loop {
            {
                let mut sessions = self.sessions.lock().unwrap();
                if !sessions.contains_key(&token) {
                    sessions.insert(token.clone(), Arc::clone(&session));
                    break;
                }
            }
            // Token collision. Regenerate outside the map lock; minting
            // reads the entropy source.
            token = match SessionToken::generate() {
                Ok(token) => token,
                Err(err) => {
                    session.logout().await;
                    return Err(err);
                }
            };
        }
        let manager = Arc::clone(self);
        let reclaim_token = token.clone();
        smol::spawn(async move {
            watch.wait().await;
            manager.remove(&reclaim_token);
        })
        .detach();
        Ok(token)
    }

    /// Resolve a token to its session.
    ///
    /// A token that was never issued, or whose session has been reclaimed,
    /// fails with [`ErrorKind::SessionExpired`]; the caller must
    /// re-authenticate.
    pub fn get(&self, token: &SessionToken) -> Result<Arc<Session>> {
        self.sessions.lock().unwrap().get(token).cloned().ok_or_else(|| {
            Error::new("Session expired.").set_kind(ErrorKind::SessionExpired)
        })
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }

    /// Log every live session out, e.g. on shutdown.
    pub async fn close(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            session.logout().await;
        }
    }

    fn remove(&self, token: &SessionToken) {
        if self.sessions.lock().unwrap().remove(token).is_some() {
            log::trace!("Reclaimed a session whose upstream connection closed.");
        }
    }
}
