//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Dovetail.
//
// Dovetail is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Dovetail is distributed in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// Dovetail. If not, see <http://www.gnu.org/licenses/>.

//! Miscellaneous functions for working with files.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Write `data` into the file at `path`, atomically, replacing anything
/// already there.
///
/// The file is first staged within `tmp`, which must be on the same file
/// system as `path`.
pub fn spit(
    tmp: impl AsRef<Path>,
    path: impl AsRef<Path>,
    mode: u32,
    data: &[u8],
) -> io::Result<()> {
    let mut tf = tempfile::NamedTempFile::new_in(tmp)?;
    tf.as_file_mut().write_all(data)?;
    fs::set_permissions(tf.path(), fs::Permissions::from_mode(mode))?;
    tf.as_file_mut().sync_all()?;
    tf.persist(path)?;
    Ok(())
}

/// Extension trait to make it less of a pain to ignore certain classes of
/// errors on system calls.
pub trait IgnoreKinds {
    /// Convert `self` to success if it is a "not found" error.
    fn ignore_not_found(self) -> Self;
    /// Convert `self` to success if it is an "already exists" error.
    fn ignore_already_exists(self) -> Self;
}

impl IgnoreKinds for io::Result<()> {
    fn ignore_not_found(self) -> Self {
        match self {
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(()),
            r => r,
        }
    }

    fn ignore_already_exists(self) -> Self {
        match self {
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => Ok(()),
            r => r,
        }
    }
}
