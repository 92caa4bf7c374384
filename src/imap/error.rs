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

//! Conversions from `imap-codec` error values.

use std::sync::Arc;

use imap_codec::imap_types::error::ValidationError;

use crate::error::{Error, ErrorKind};

impl From<ValidationError> for Error {
    #[inline]
    fn from(error: ValidationError) -> Self {
        Self {
            summary: error.to_string().into(),
            details: None,
            source: Some(Arc::new(error)),
            kind: ErrorKind::Bug,
        }
    }
}
