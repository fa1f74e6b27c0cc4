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

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;

use super::save::SaveContext;
use super::uidlist::Uidlist;
use crate::index::{index_file_path, Index, IndexTransaction};
use crate::support::error::Error;
use crate::support::file_ops::IgnoreKinds;

/// Permission bits for newly created message files.
const MAIL_CREATE_MODE: u32 = 0o600;

/// An open handle on one maildir mailbox.
///
/// The mailbox root contains the three maildir directories (`tmp/`, `new/`,
/// `cur/`) plus the UID list and index files. The directories are shared
/// with external delivery agents; the UID list and index are ours.
pub struct Mailbox {
    pub(super) root: PathBuf,
    pub(super) tmp_dir: PathBuf,
    pub(super) new_dir: PathBuf,
    pub(super) cur_dir: PathBuf,
    pub(super) mail_create_mode: u32,
    pub(super) uidlist: Uidlist,
    pub(super) index: Index,
}

impl Mailbox {
    /// Create the maildir structure at `root` (whose parent must already
    /// exist) and open it.
    ///
    /// Directories which already exist are left alone, so this doubles as
    /// "open, creating if necessary".
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        for dir in
            [&root, &root.join("tmp"), &root.join("new"), &root.join("cur")]
        {
            fs::DirBuilder::new()
                .mode(0o700)
                .create(dir)
                .ignore_already_exists()?;
        }

        Self::open(root)
    }

    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        let tmp_dir = root.join("tmp");
        let new_dir = root.join("new");
        let cur_dir = root.join("cur");

        if !tmp_dir.is_dir() || !new_dir.is_dir() || !cur_dir.is_dir() {
            return Err(Error::NxMailbox);
        }

        let uidlist = Uidlist::open(&root)?;
        let index = Index::open(index_file_path(&root))?;

        Ok(Mailbox {
            root,
            tmp_dir,
            new_dir,
            cur_dir,
            mail_create_mode: MAIL_CREATE_MODE,
            uidlist,
            index,
        })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut Index {
        &mut self.index
    }

    pub fn uidlist(&self) -> &Uidlist {
        &self.uidlist
    }

    /// Pull in changes other processes have made to the mailbox.
    pub(super) fn sync(&mut self) -> Result<(), Error> {
        self.uidlist.refresh()
    }

    /// Begin a transaction against this mailbox.
    pub fn transaction(&mut self) -> Transaction<'_> {
        let index_txn = IndexTransaction::new(&self.index);
        Transaction {
            mailbox: self,
            index_txn,
            save: None,
        }
    }
}

/// One transaction against a mailbox.
///
/// Messages saved through the transaction are staged in `tmp/` and become
/// visible, with UIDs assigned, only when the whole transaction commits.
/// Dropping the transaction without committing abandons the staged files
/// (rollback additionally unlinks them).
pub struct Transaction<'a> {
    pub(super) mailbox: &'a mut Mailbox,
    pub(super) index_txn: IndexTransaction,
    pub(super) save: Option<SaveContext>,
}
