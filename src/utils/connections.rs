//
// pyloros - connection layers
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

//! Connection layers (TCP/TLS) to use with upstream mail servers.

use std::{
    net::{TcpStream, ToSocketAddrs},
    os::unix::io::AsRawFd,
    time::Duration,
};

#[cfg(any(target_os = "openbsd", target_os = "netbsd", target_os = "haiku"))]
use libc::SO_KEEPALIVE as KEEPALIVE_OPTION;
#[cfg(any(target_os = "macos", target_os = "ios"))]
use libc::TCP_KEEPALIVE as KEEPALIVE_OPTION;
#[cfg(not(any(
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "haiku",
    target_os = "macos",
    target_os = "ios"
)))]
use libc::TCP_KEEPIDLE as KEEPALIVE_OPTION;
use libc::{c_int, c_void};

pub enum Connection {
    Tcp {
        inner: TcpStream,
        id: Option<&'static str>,
        trace: bool,
    },
    Tls {
        inner: native_tls::TlsStream<Self>,
        id: Option<&'static str>,
        trace: bool,
    },
}

use Connection::*;

impl std::fmt::Debug for Connection {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Tcp { ref id, .. } => fmt
                .debug_struct(stringify!(Connection))
                .field("variant", &stringify!(Tcp))
                .field(stringify!(id), id)
                .finish(),
            Tls { ref id, .. } => fmt
                .debug_struct(stringify!(Connection))
                .field("variant", &stringify!(Tls))
                .field(stringify!(id), id)
                .finish(),
        }
    }
}

macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

impl Connection {
    pub const IO_BUF_SIZE: usize = 64 * 1024;

    pub fn new_tcp(inner: TcpStream) -> Self {
        Self::Tcp {
            inner,
            id: None,
            trace: false,
        }
    }

    pub fn new_tls(mut inner: native_tls::TlsStream<Self>) -> Self {
        let trace = inner.get_ref().is_trace_enabled();
        let id = inner.get_ref().id();
        if trace {
            inner.get_mut().set_trace(false);
        }
        Self::Tls { inner, id, trace }
    }

    pub fn trace(mut self, val: bool) -> Self {
        self.set_trace(val);
        self
    }

    pub fn with_id(mut self, val: &'static str) -> Self {
        match self {
            Tcp { ref mut id, .. } | Tls { ref mut id, .. } => *id = Some(val),
        }
        self
    }

    pub fn set_trace(&mut self, val: bool) {
        match self {
            Tcp { ref mut trace, .. } | Tls { ref mut trace, .. } => *trace = val,
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        match self {
            Tcp { ref inner, .. } => inner.set_nonblocking(nonblocking),
            Tls { ref inner, .. } => inner.get_ref().set_nonblocking(nonblocking),
        }
    }

    pub fn set_read_timeout(&self, dur: Option<Duration>) -> std::io::Result<()> {
        match self {
            Tcp { ref inner, .. } => inner.set_read_timeout(dur),
            Tls { ref inner, .. } => inner.get_ref().set_read_timeout(dur),
        }
    }

    pub fn set_write_timeout(&self, dur: Option<Duration>) -> std::io::Result<()> {
        match self {
            Tcp { ref inner, .. } => inner.set_write_timeout(dur),
            Tls { ref inner, .. } => inner.get_ref().set_write_timeout(dur),
        }
    }

    pub fn set_keepalive(&self, keepalive: Option<Duration>) -> std::io::Result<()> {
        unsafe {
            self.setsockopt(
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                keepalive.is_some() as c_int,
            )?;
            if let Some(dur) = keepalive {
                self.setsockopt(libc::IPPROTO_TCP, KEEPALIVE_OPTION, dur.as_secs() as c_int)?;
            }
            Ok(())
        }
    }

    unsafe fn setsockopt<T>(&self, opt: c_int, val: c_int, payload: T) -> std::io::Result<()>
    where
        T: Copy,
    {
        let payload = std::ptr::addr_of!(payload) as *const c_void;
        syscall!(setsockopt(
            self.as_raw_fd(),
            opt,
            val,
            payload,
            std::mem::size_of::<T>() as libc::socklen_t,
        ))?;
        Ok(())
    }

    fn is_trace_enabled(&self) -> bool {
        match self {
            Tcp { trace, .. } | Tls { trace, .. } => *trace,
        }
    }

    fn id(&self) -> Option<&'static str> {
        match self {
            Tcp { id, .. } | Tls { id, .. } => *id,
        }
    }
}

impl std::io::Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let res = match self {
            Tcp { ref mut inner, .. } => inner.read(buf),
            Tls { ref mut inner, .. } => inner.read(buf),
        };
        if self.is_trace_enabled() {
            if let Ok(len) = &res {
                log::trace!(
                    "[{}] read {} bytes: {:?}",
                    self.id().unwrap_or(stringify!(Connection)),
                    len,
                    String::from_utf8_lossy(&buf[..*len])
                );
            }
        }
        res
    }
}

impl std::io::Write for Connection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.is_trace_enabled() {
            log::trace!(
                "[{}] writing {} bytes: {:?}",
                self.id().unwrap_or(stringify!(Connection)),
                buf.len(),
                String::from_utf8_lossy(buf)
            );
        }
        match self {
            Tcp { ref mut inner, .. } => inner.write(buf),
            Tls { ref mut inner, .. } => inner.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Tcp { ref mut inner, .. } => inner.flush(),
            Tls { ref mut inner, .. } => inner.flush(),
        }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        match self {
            Tcp { ref inner, .. } => inner.as_raw_fd(),
            Tls { ref inner, .. } => inner.get_ref().as_raw_fd(),
        }
    }
}

impl std::os::fd::AsFd for Connection {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        // The fd is owned by the underlying TcpStream, which lives as long
        // as self.
        unsafe { std::os::fd::BorrowedFd::borrow_raw(self.as_raw_fd()) }
    }
}

// Read/write calls never drop the underlying I/O source.
unsafe impl async_io::IoSafe for Connection {}

/// Opens a TCP connection to a remote host, trying each resolved address in
/// turn with `timeout` as a per-attempt connect deadline.
pub fn tcp_stream_connect<A: ToSocketAddrs>(
    addr: A,
    timeout: Option<Duration>,
) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for a in addr.to_socket_addrs()? {
        let attempt = match timeout {
            Some(dur) => TcpStream::connect_timeout(&a, dur),
            None => TcpStream::connect(a),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "could not resolve to any address",
        )
    }))
}
