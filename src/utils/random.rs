//
// pyloros - entropy source
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

//! Cryptographically secure random bytes from the operating system.

use std::{fs::File, io::prelude::*};

use crate::error::{Result, ResultIntoError};

/// Fill `buf` with bytes from `/dev/urandom`.
///
/// Session tokens are minted from this; an entropy failure must propagate to
/// the caller instead of producing a predictable value, so unlike most
/// consumers of `/dev/urandom` this returns a `Result`.
pub fn random_bytes(buf: &mut [u8]) -> Result<()> {
    let mut f =
        File::open("/dev/urandom").chain_err_summary(|| "Could not open /dev/urandom")?;
    f.read_exact(buf).chain_err_summary(|| "Could not read from /dev/urandom")?;
    Ok(())
}

pub fn random_u64() -> Result<u64> {
    let mut buffer = [0; 8];
    random_bytes(&mut buffer)?;
    Ok(u64::from_le_bytes(buffer))
}
