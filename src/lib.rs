//
// pyloros - lib.rs
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

#![deny(
    unsafe_op_in_unsafe_fn,
    /* groups */
    clippy::correctness,
    clippy::suspicious,
    clippy::complexity,
    clippy::perf,
    /* restriction */
    clippy::dbg_macro,
    /* rustdoc */
    rustdoc::broken_intra_doc_links
)]
#![doc = include_str!("../README.md")]
//!
//! ## Crate layout
//!
//! - Authenticate users and own their sessions (see module [`session`])
//! - Talk to the upstream IMAP server, one caller at a time (see module
//!   [`imap`])
//! - Open short-lived mail submission connections (see module [`smtp`])
//! - Persist per-user data server-side, with a transient fallback (see
//!   module [`store`])
//! - Resolve bare domains to concrete endpoints via DNS SRV records (see
//!   module [`discovery`])

pub mod error;
pub use error::*;
pub mod discovery;
pub mod imap;
pub mod session;
pub use session::*;
pub mod smtp;
pub mod store;
pub use store::*;

pub mod utils;

#[macro_use]
extern crate serde_derive;
pub extern crate data_encoding;
pub extern crate futures;
pub extern crate log;
pub extern crate nom;
pub extern crate serde_json;
pub extern crate smallvec;
pub extern crate smol;
pub extern crate uuid;
