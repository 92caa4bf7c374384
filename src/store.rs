//
// pyloros - user store
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

//! Per-user persistent key/value storage.
//!
//! Values live server-side in IMAP `METADATA` entries when the upstream
//! supports the extension, fronted by a write-through in-memory cache so
//! repeated reads within a session's lifetime cost nothing. Without the
//! extension the store silently degrades to the in-memory cache alone, which
//! lasts as long as the process; that downgrade is an expected condition,
//! logged once per process at most.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::{Error, ErrorKind, Result, ResultIntoError},
    imap::{metadata, ConnectionMutex},
};

/// Entry names are namespaced under a vendor prefix so they cannot collide
/// with other applications sharing the remote account's metadata.
pub const METADATA_PREFIX: &str = "/private/vendor/pyloros/";

/// A per-user key/value store; either backing obeys the same contract.
///
/// The backing is chosen once, at construction, from a single capability
/// probe; it cannot change for the lifetime of the value.
#[derive(Debug)]
pub enum Store {
    Transient(MemoryStore),
    Imap(ImapStore),
}

impl Store {
    /// Probe the upstream server once and pick the backing.
    ///
    /// `transient_warned` is process-scoped state owned by whoever assembles
    /// the subsystem; it keeps the downgrade notice from repeating for every
    /// session.
    pub async fn new(
        connection: Arc<ConnectionMutex>,
        transient_warned: Arc<AtomicBool>,
    ) -> Result<Self> {
        let supports_metadata = {
            let mut conn = connection.lock().await?;
            conn.refresh_capabilities().await?;
            conn.has_capability(metadata::CAPABILITY)
        };
        if supports_metadata {
            Ok(Self::Imap(ImapStore {
                connection,
                cache: MemoryStore::default(),
            }))
        } else {
            if !transient_warned.swap(true, Ordering::SeqCst) {
                log::warn!(
                    "Upstream IMAP server does not support the METADATA extension; user data \
                     will be stored in memory and lost on restart."
                );
            }
            Ok(Self::Transient(MemoryStore::default()))
        }
    }

    /// Look up `key`, failing with [`ErrorKind::NotFound`] when it has never
    /// been stored.
    pub async fn get(&self, key: &str) -> Result<serde_json::Value> {
        match self {
            Self::Transient(inner) => inner.get(key),
            Self::Imap(inner) => inner.get(key).await,
        }
    }

    /// Typed lookup; a value that exists but does not decode as `T` is data
    /// corruption, not a miss.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self.get(key).await?;
        serde_json::from_value(value).chain_err_kind(ErrorKind::DataCorruption)
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        match self {
            Self::Transient(inner) => {
                inner.put(key, serde_json::to_value(value)?);
                Ok(())
            }
            Self::Imap(inner) => inner.put(key, value).await,
        }
    }

    pub const fn is_persistent(&self) -> bool {
        matches!(self, Self::Imap(_))
    }
}

/// Process-lifetime storage, also used as the remote store's cache.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn get(&self, key: &str) -> Result<serde_json::Value> {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| {
                Error::new(format!("No such entry in store: {}", key))
                    .set_kind(ErrorKind::NotFound)
            })
    }

    pub fn put(&self, key: &str, value: serde_json::Value) {
        self.entries.write().unwrap().insert(key.to_string(), value);
    }
}

/// Remote-backed store: `METADATA` entries under [`METADATA_PREFIX`] with a
/// write-through cache.
///
/// The cache is never stale relative to writes made through this instance;
/// writes made through another session's store become visible here only on
/// entries this instance has not cached yet.
#[derive(Debug)]
pub struct ImapStore {
    connection: Arc<ConnectionMutex>,
    cache: MemoryStore,
}

impl ImapStore {
    fn entry_name(key: &str) -> String {
        format!("{}{}", METADATA_PREFIX, key)
    }

    pub async fn get(&self, key: &str) -> Result<serde_json::Value> {
        match self.cache.get(key) {
            Err(err) if err.kind.is_not_found() => {}
            hit => return hit,
        }
        let entry = Self::entry_name(key);
        let remote = {
            let mut conn = self.connection.lock().await?;
            metadata::get_metadata(&mut conn, &entry).await?
        };
        let Some(raw) = remote else {
            return Err(Error::new(format!("No such entry in store: {}", key))
                .set_kind(ErrorKind::NotFound));
        };
        let value: serde_json::Value = serde_json::from_slice(&raw)
            .chain_err_summary(|| format!("Stored entry {} exists but cannot be decoded", key))
            .chain_err_kind(ErrorKind::DataCorruption)?;
        self.cache.put(key, value.clone());
        Ok(value)
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let raw = serde_json::to_vec(&value)?;
        let entry = Self::entry_name(key);
        {
            let mut conn = self.connection.lock().await?;
            metadata::set_metadata(&mut conn, &entry, &raw).await?;
        }
        // Only after the remote write is confirmed; the cache must never get
        // ahead of the server.
        self.cache.put(key, value);
        Ok(())
    }
}
