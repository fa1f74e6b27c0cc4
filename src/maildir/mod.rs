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

//! Maildir-backed message storage.
//!
//! A mailbox is the classic maildir triple of sibling directories:
//!
//! - `tmp/` — messages being written; never read by anyone else
//! - `new/` — delivered messages no session has seen, named by bare
//!   basename
//! - `cur/` — messages a session has seen, named with a `:2,` flag suffix
//!
//! plus two files of ours in the mailbox root: the UID list (the
//! authoritative UID→filename mapping) and the index (a rebuildable cache
//! of per-message records).
//!
//! The directories are shared with external delivery agents, so nothing
//! here ever takes a directory-wide lock: publication into `new/`/`cur/`
//! relies on unique basenames and the atomicity of `link(2)`, and only the
//! UID list itself is serialised, by its dotlock.

pub mod filename;
pub mod mailbox;
pub mod save;
pub mod tmp;
pub mod uidlist;

pub use self::mailbox::{Mailbox, Transaction};
