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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not enough disk space")]
    NoSpace,
    /// A storage-level failure whose details were already logged at the
    /// point of failure. The message below is all the remote user gets.
    #[error(
        "Internal error occurred. Refer to server log for more information."
    )]
    StorageCritical,
    #[error("Timeout while waiting for UID list lock")]
    UidlistLockTimeout,
    #[error("Mailbox UID list is corrupt")]
    CorruptUidlist,
    #[error("Mailbox index file is corrupt")]
    CorruptIndex,
    #[error("No such mailbox")]
    NxMailbox,
    #[error("Unsupported authentication mechanism")]
    UnsupportedAuthMech,
    #[error("Authentication server isn't connected, try again later..")]
    AuthNotConnected,
    #[error("Authentication servers are busy, wait..")]
    AuthServersBusy,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Whether the error indicates that the disk is out of space.
///
/// Quota exhaustion reports `EDQUOT` rather than `ENOSPC`, but to the user
/// both mean the same thing.
pub fn is_out_of_space(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if nix::libc::ENOSPC == code || nix::libc::EDQUOT == code
    )
}
