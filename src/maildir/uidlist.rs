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

//! The UID list: the authoritative mapping from UID to maildir filename.
//!
//! The list lives in a text file in the mailbox root:
//!
//! ```text
//! 1 <uid-validity> <next-uid>
//! <uid> <filename>
//! ...
//! ```
//!
//! Appends to the list are serialised across processes by a dotlock; the
//! file itself is replaced atomically on every rewrite, so readers never
//! see a torn state.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use chrono::prelude::*;
use log::error;

use crate::index::Uid;
use crate::support::error::{is_out_of_space, Error};
use crate::support::file_ops;

pub const UIDLIST_NAME: &str = "uidlist";
const LOCK_SUFFIX: &str = ".lock";
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

bitflags! {
    /// Flags carried on in-memory UID-list records.
    pub struct UidlistRecFlags: u8 {
        /// The file lives in `new/` rather than `cur/`.
        const NEW_DIR = 1 << 0;
        const RECENT = 1 << 1;
    }
}

#[derive(Clone, Debug)]
pub struct UidlistRecord {
    pub uid: Uid,
    pub filename: String,
    pub flags: UidlistRecFlags,
}

/// The in-memory view of a mailbox's UID list.
pub struct Uidlist {
    path: PathBuf,
    lock_path: PathBuf,
    /// Staging directory for atomic rewrites; the mailbox's `tmp/`.
    tmp_dir: PathBuf,
    uid_validity: u32,
    next_uid: u32,
    records: Vec<UidlistRecord>,
}

impl Uidlist {
    pub fn open(mailbox_root: &Path) -> Result<Self, Error> {
        let path = mailbox_root.join(UIDLIST_NAME);
        let lock_path = {
            let mut s = path.clone().into_os_string();
            s.push(LOCK_SUFFIX);
            PathBuf::from(s)
        };

        let mut this = Uidlist {
            path,
            lock_path,
            tmp_dir: mailbox_root.join("tmp"),
            uid_validity: Utc::now().timestamp() as u32,
            next_uid: 1,
            records: Vec::new(),
        };
        this.refresh()?;
        Ok(this)
    }

    /// Re-read the backing file, picking up records appended by concurrent
    /// processes.
    ///
    /// A missing file simply means nothing has ever been committed.
    pub fn refresh(&mut self) -> Result<(), Error> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if io::ErrorKind::NotFound == e.kind() => return Ok(()),
            Err(e) => {
                error!("read({}) failed: {}", self.path.display(), e);
                return Err(Error::StorageCritical);
            },
        };

        let mut lines = data.lines();
        let header = lines.next().ok_or(Error::CorruptUidlist)?;
        let mut fields = header.split(' ');
        let version = fields.next().ok_or(Error::CorruptUidlist)?;
        if "1" != version {
            return Err(Error::CorruptUidlist);
        }
        let uid_validity = fields
            .next()
            .and_then(|f| f.parse::<u32>().ok())
            .ok_or(Error::CorruptUidlist)?;
        let next_uid = fields
            .next()
            .and_then(|f| f.parse::<u32>().ok())
            .filter(|&uid| uid >= 1)
            .ok_or(Error::CorruptUidlist)?;

        let mut records = Vec::new();
        let mut prev_uid = 0u32;
        for line in lines {
            let (uid, fname) =
                line.split_once(' ').ok_or(Error::CorruptUidlist)?;
            let uid =
                uid.parse::<u32>().map_err(|_| Error::CorruptUidlist)?;
            // Records are in strictly increasing UID order, all below
            // next_uid
            if uid <= prev_uid || uid >= next_uid {
                return Err(Error::CorruptUidlist);
            }
            prev_uid = uid;

            records.push(UidlistRecord {
                uid: Uid::of(uid).unwrap(),
                filename: fname.to_owned(),
                flags: UidlistRecFlags::empty(),
            });
        }

        self.uid_validity = uid_validity;
        self.next_uid = next_uid;
        self.records = records;
        Ok(())
    }

    pub fn uid_validity(&self) -> u32 {
        self.uid_validity
    }

    /// The next UID that will be assigned.
    pub fn next_uid(&self) -> Uid {
        Uid::of(self.next_uid).expect("next_uid is never zero")
    }

    pub fn records(&self) -> &[UidlistRecord] {
        &self.records
    }

    /// Take the inter-process append lock, retrying until `timeout` has
    /// elapsed.
    pub fn lock(&self, timeout: Duration) -> Result<UidlistLock, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(_) => {
                    return Ok(UidlistLock {
                        path: self.lock_path.clone(),
                    })
                },
                Err(e) if io::ErrorKind::AlreadyExists == e.kind() => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::UidlistLockTimeout);
                    }
                    std::thread::sleep(
                        LOCK_RETRY_INTERVAL.min(deadline - now),
                    );
                },
                Err(e) => {
                    error!(
                        "open({}) failed: {}",
                        self.lock_path.display(),
                        e
                    );
                    return Err(Error::StorageCritical);
                },
            }
        }
    }

    /// Begin a sync session for appending records.
    ///
    /// The caller must be holding the lock.
    pub fn sync_init(&mut self) -> UidlistSync<'_> {
        UidlistSync {
            uidlist: self,
            added: Vec::new(),
        }
    }
}

/// Scope guard for the UID-list dotlock.
pub struct UidlistLock {
    path: PathBuf,
}

impl Drop for UidlistLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// An in-progress UID-list append session.
///
/// Appends are buffered; UIDs are assigned and the file rewritten only by
/// `finish`. Dropping the session without finishing abandons it with the
/// list untouched, in memory and on disk.
pub struct UidlistSync<'a> {
    uidlist: &'a mut Uidlist,
    added: Vec<(String, UidlistRecFlags)>,
}

impl UidlistSync<'_> {
    /// Append `filename` as the next record of the session.
    pub fn next(
        &mut self,
        filename: &str,
        flags: UidlistRecFlags,
    ) -> Result<(), Error> {
        // A duplicate name would shadow the existing record
        if self.uidlist.records.iter().any(|r| r.filename == filename)
            || self.added.iter().any(|(f, _)| f == filename)
        {
            error!("Duplicate file in uidlist append: {}", filename);
            return Err(Error::StorageCritical);
        }

        self.added.push((filename.to_owned(), flags));
        Ok(())
    }

    /// Assign UIDs to the buffered appends and atomically rewrite the
    /// backing file.
    ///
    /// The in-memory state is only updated once the rewrite has succeeded.
    pub fn finish(self) -> Result<(), Error> {
        if self.added.is_empty() {
            return Ok(());
        }

        let uidlist = self.uidlist;
        let new_next_uid = uidlist.next_uid + self.added.len() as u32;

        let mut data = String::new();
        let _ = writeln!(
            data,
            "1 {} {}",
            uidlist.uid_validity, new_next_uid
        );
        for rec in &uidlist.records {
            let _ = writeln!(data, "{} {}", u32::from(rec.uid), rec.filename);
        }
        let mut new_records = Vec::with_capacity(self.added.len());
        for (ix, (filename, flags)) in self.added.into_iter().enumerate() {
            let uid = uidlist.next_uid + ix as u32;
            let _ = writeln!(data, "{} {}", uid, filename);
            new_records.push(UidlistRecord {
                uid: Uid::of(uid).unwrap(),
                filename,
                flags,
            });
        }

        file_ops::spit(
            &uidlist.tmp_dir,
            &uidlist.path,
            0o600,
            data.as_bytes(),
        )
        .map_err(|e| {
            if is_out_of_space(&e) {
                Error::NoSpace
            } else {
                error!("write({}) failed: {}", uidlist.path.display(), e);
                Error::StorageCritical
            }
        })?;

        uidlist.records.extend(new_records);
        uidlist.next_uid = new_next_uid;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Uidlist) {
        let root = tempfile::TempDir::new().unwrap();
        fs::create_dir(root.path().join("tmp")).unwrap();
        let uidlist = Uidlist::open(root.path()).unwrap();
        (root, uidlist)
    }

    #[test]
    fn fresh_list_starts_at_uid_1() {
        let (_root, uidlist) = fixture();
        assert_eq!(Uid::u(1), uidlist.next_uid());
        assert!(uidlist.records().is_empty());
    }

    #[test]
    fn appends_assign_sequential_uids_and_persist() {
        let (root, mut uidlist) = fixture();

        let mut sync = uidlist.sync_init();
        sync.next("msg.a", UidlistRecFlags::NEW_DIR | UidlistRecFlags::RECENT)
            .unwrap();
        sync.next("msg.b:2,S", UidlistRecFlags::RECENT).unwrap();
        sync.finish().unwrap();

        assert_eq!(Uid::u(3), uidlist.next_uid());
        assert_eq!(Uid::u(1), uidlist.records()[0].uid);
        assert_eq!("msg.a", uidlist.records()[0].filename);
        assert!(uidlist.records()[0]
            .flags
            .contains(UidlistRecFlags::NEW_DIR));
        assert_eq!(Uid::u(2), uidlist.records()[1].uid);

        // A second handle on the same mailbox sees the same state
        let reopened = Uidlist::open(root.path()).unwrap();
        assert_eq!(Uid::u(3), reopened.next_uid());
        assert_eq!(uidlist.uid_validity(), reopened.uid_validity());
        assert_eq!(2, reopened.records().len());
    }

    #[test]
    fn abandoned_session_changes_nothing() {
        let (root, mut uidlist) = fixture();

        {
            let mut sync = uidlist.sync_init();
            sync.next("msg.a", UidlistRecFlags::RECENT).unwrap();
            // dropped without finish()
        }

        assert_eq!(Uid::u(1), uidlist.next_uid());
        assert!(uidlist.records().is_empty());
        assert!(!root.path().join(UIDLIST_NAME).is_file());
    }

    #[test]
    fn duplicate_filename_is_rejected() {
        let (_root, mut uidlist) = fixture();

        let mut sync = uidlist.sync_init();
        sync.next("msg.a", UidlistRecFlags::RECENT).unwrap();
        assert_matches!(
            Err(Error::StorageCritical),
            sync.next("msg.a", UidlistRecFlags::RECENT)
        );
    }

    #[test]
    fn lock_times_out_against_a_holder() {
        let (root, uidlist) = fixture();

        // Simulate another process holding the lock
        fs::File::create(root.path().join("uidlist.lock")).unwrap();
        assert_matches!(
            Err(Error::UidlistLockTimeout),
            uidlist.lock(Duration::from_millis(150)).map(|_| ())
        );

        fs::remove_file(root.path().join("uidlist.lock")).unwrap();
        let lock = uidlist.lock(Duration::from_millis(150)).unwrap();
        assert!(root.path().join("uidlist.lock").is_file());
        drop(lock);
        assert!(!root.path().join("uidlist.lock").is_file());
    }

    #[test]
    fn refresh_rejects_corrupt_files() {
        let (root, mut uidlist) = fixture();

        for content in
            ["", "2 1 1\n", "1 x 1\n", "1 1 5\n3 a\n2 b\n", "1 1 2\n9 a\n"]
        {
            fs::write(root.path().join(UIDLIST_NAME), content).unwrap();
            assert_matches!(Err(Error::CorruptUidlist), uidlist.refresh());
        }
    }
}
