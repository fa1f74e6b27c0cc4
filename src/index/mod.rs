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

//! The mail index: a dense, sequence-ordered array of fixed-size records
//! kept in memory and mirrored to a small binary file in the mailbox root.
//!
//! The index exists so that sessions can address messages by sequence
//! number and by UID without rescanning the maildir directories. It is
//! advisory: it can always be rebuilt from the UID list, so writes to it
//! are not synced.

mod transaction;

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::error;

use crate::support::error::Error;

pub use self::transaction::IndexTransaction;

/// Uniquely identifies a message within a single mailbox.
///
/// UIDs start at 1 and increase monotonically as messages are added to the
/// mailbox. UIDs are never reused. In this implementation, UIDs are
/// assigned strictly sequentially.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(pub NonZeroU32);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl Uid {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Uid(NonZeroU32::new_unchecked(1)) };
    pub const MAX: Self = unsafe { Uid(NonZeroU32::new_unchecked(u32::MAX)) };

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn next(self) -> Option<Self> {
        if Uid::MAX == self {
            None
        } else {
            Some(Uid(NonZeroU32::new(self.0.get() + 1).unwrap()))
        }
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl From<Uid> for u32 {
    fn from(uid: Uid) -> u32 {
        uid.0.get()
    }
}

/// The one-based position of a message in the current mailbox view.
///
/// Unlike a UID, a sequence number is only meaningful against a particular
/// state of the index: expunging shifts the sequence numbers of every
/// later message down.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seqnum(pub NonZeroU32);

impl fmt::Debug for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Seqnum({})", self.0.get())
    }
}

impl Seqnum {
    pub fn of(seqnum: u32) -> Option<Self> {
        NonZeroU32::new(seqnum).map(Seqnum)
    }

    #[cfg(test)]
    pub fn u(seqnum: u32) -> Self {
        Seqnum::of(seqnum).unwrap()
    }

    pub fn to_index(self) -> usize {
        let u: usize = self.0.get().try_into().unwrap();
        u - 1
    }

    pub fn from_index(ix: usize) -> Self {
        Seqnum::of((ix + 1).try_into().unwrap()).unwrap()
    }
}

bitflags! {
    /// The system flags of a message, stored in its index record.
    ///
    /// `RECENT` is special: it never appears in a maildir filename and is
    /// incompatible with placement in `cur/`.
    pub struct MailFlags: u32 {
        const ANSWERED = 1 << 0;
        const FLAGGED = 1 << 1;
        const DELETED = 1 << 2;
        const SEEN = 1 << 3;
        const DRAFT = 1 << 4;
        const RECENT = 1 << 5;
    }
}

/// An inclusive range of UIDs assigned by one committed transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UidRange {
    pub first: Uid,
    pub last: Uid,
}

/// One fixed-size index record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexRecord {
    pub uid: Uid,
    pub flags: MailFlags,
    /// Fixed-width keyword bitmask. Keyword interning happens above this
    /// layer; the save path currently always leaves this zero.
    pub keywords: u64,
}

/// A pending flag-change notification.
///
/// Expunging emits one of these per removed record (old flags going to
/// nothing) so that sessions polling the index can tell their clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlagChange {
    pub uid: Uid,
    pub old_flags: MailFlags,
    pub new_flags: MailFlags,
}

const HEADER_SIZE: u32 = 8;
const RECORD_SIZE: u32 = 16;

/// The in-memory mail index backed by a file.
///
/// Invariants: records are in strictly increasing UID order; the sequence
/// number of a record is its one-based position in the array;
/// `used_file_size` always equals the header size plus `RECORD_SIZE` times
/// the record count.
pub struct Index {
    path: PathBuf,
    records: Vec<IndexRecord>,
    used_file_size: u32,
    flag_changes: Vec<FlagChange>,
}

impl Index {
    /// Open the index file at `path`, creating an empty one if it does not
    /// exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let mut this = Index {
            path,
            records: Vec::new(),
            used_file_size: HEADER_SIZE,
            flag_changes: Vec::new(),
        };

        match fs::File::open(&this.path) {
            Ok(f) => this.load(f)?,
            Err(e) if io::ErrorKind::NotFound == e.kind() => this.save()?,
            Err(e) => return Err(e.into()),
        }

        Ok(this)
    }

    fn load(&mut self, mut f: fs::File) -> Result<(), Error> {
        let file_size = f.metadata()?.len();

        let mut data = Vec::new();
        f.read_to_end(&mut data)?;
        let mut r = &data[..];

        let messages_count = match r.read_u32::<LittleEndian>() {
            Ok(n) => n,
            Err(_) => return Err(Error::CorruptIndex),
        };
        let used_file_size = match r.read_u32::<LittleEndian>() {
            Ok(n) => n,
            Err(_) => return Err(Error::CorruptIndex),
        };

        let expected_size = u64::from(HEADER_SIZE)
            + u64::from(messages_count) * u64::from(RECORD_SIZE);
        if u64::from(used_file_size) != expected_size
            || file_size < u64::from(used_file_size)
        {
            return Err(Error::CorruptIndex);
        }

        let mut records = Vec::with_capacity(messages_count as usize);
        let mut prev_uid = 0u32;
        for _ in 0..messages_count {
            let uid = r.read_u32::<LittleEndian>()
                .map_err(|_| Error::CorruptIndex)?;
            let flags = r.read_u32::<LittleEndian>()
                .map_err(|_| Error::CorruptIndex)?;
            let keywords = r.read_u64::<LittleEndian>()
                .map_err(|_| Error::CorruptIndex)?;

            // UIDs must be strictly increasing (which also excludes uid 0)
            if uid <= prev_uid {
                return Err(Error::CorruptIndex);
            }
            prev_uid = uid;

            records.push(IndexRecord {
                uid: Uid::of(uid).unwrap(),
                flags: MailFlags::from_bits_truncate(flags),
                keywords,
            });
        }

        self.records = records;
        self.used_file_size = used_file_size;
        Ok(())
    }

    /// Rewrite the backing file from the in-memory state and truncate it to
    /// the used size.
    fn save(&mut self) -> Result<(), Error> {
        self.used_file_size =
            HEADER_SIZE + self.records.len() as u32 * RECORD_SIZE;

        let mut buf = Vec::with_capacity(self.used_file_size as usize);
        buf.write_u32::<LittleEndian>(self.records.len() as u32).unwrap();
        buf.write_u32::<LittleEndian>(self.used_file_size).unwrap();
        for rec in &self.records {
            buf.write_u32::<LittleEndian>(rec.uid.into()).unwrap();
            buf.write_u32::<LittleEndian>(rec.flags.bits()).unwrap();
            buf.write_u64::<LittleEndian>(rec.keywords).unwrap();
        }

        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| {
                error!("open({}) failed: {}", self.path.display(), e);
                Error::StorageCritical
            })?;
        f.write_all(&buf).map_err(|e| {
            error!("write({}) failed: {}", self.path.display(), e);
            Error::StorageCritical
        })?;
        f.set_len(u64::from(self.used_file_size)).map_err(|e| {
            error!("truncate({}) failed: {}", self.path.display(), e);
            Error::StorageCritical
        })?;
        Ok(())
    }

    pub fn messages_count(&self) -> u32 {
        self.records.len() as u32
    }

    /// Look up the record at the given sequence number, if any.
    pub fn lookup(&self, seq: Seqnum) -> Option<&IndexRecord> {
        self.records.get(seq.to_index())
    }

    /// Return the record after the one at `seq`, if any.
    pub fn next(&self, seq: Seqnum) -> Option<&IndexRecord> {
        self.records.get(seq.to_index() + 1)
    }

    /// Binary-search for the smallest-sequence record whose UID falls in
    /// `[first_uid, last_uid]`.
    pub fn lookup_uid_range(
        &self,
        first_uid: Uid,
        last_uid: Uid,
    ) -> Option<(&IndexRecord, Seqnum)> {
        assert!(first_uid <= last_uid);

        if self.records.is_empty() {
            return None;
        }

        let recs = &self.records;
        let mut idx = 0;
        let mut left = 0;
        let mut right = recs.len();

        while left < right {
            idx = (left + right) / 2;

            if recs[idx].uid < first_uid {
                left = idx + 1;
            } else if recs[idx].uid > first_uid {
                right = idx;
            } else {
                break;
            }
        }

        if recs[idx].uid < first_uid || recs[idx].uid > last_uid {
            // could still be the next one
            idx += 1;
            if idx == recs.len()
                || recs[idx].uid < first_uid
                || recs[idx].uid > last_uid
            {
                return None;
            }
        }

        Some((&recs[idx], Seqnum::from_index(idx)))
    }

    /// Expunge every record from `first` through `last` (inclusive).
    ///
    /// Emits a flag-change notification per expunged record, compacts the
    /// array by shifting the tail down, and truncates the backing file.
    /// Surviving records after the range have their sequence numbers
    /// shifted down by the length of the range.
    pub fn expunge_range(
        &mut self,
        first: Seqnum,
        last: Seqnum,
    ) -> Result<(), Error> {
        let first_ix = first.to_index();
        let last_ix = last.to_index();
        assert!(first_ix <= last_ix);
        assert!(last_ix < self.records.len());

        for rec in &self.records[first_ix..=last_ix] {
            self.flag_changes.push(FlagChange {
                uid: rec.uid,
                old_flags: rec.flags,
                new_flags: MailFlags::empty(),
            });
        }

        self.records.drain(first_ix..=last_ix);
        self.save()
    }

    /// Drain the accumulated flag-change notifications.
    pub fn take_flag_changes(&mut self) -> Vec<FlagChange> {
        std::mem::take(&mut self.flag_changes)
    }

    /// Append fully-formed records at the end of the array.
    ///
    /// Used by `IndexTransaction::apply`; the records must continue the
    /// strictly-increasing UID order.
    pub(crate) fn append_records(
        &mut self,
        recs: &[IndexRecord],
    ) -> Result<(), Error> {
        let mut prev = self.records.last().map(|r| r.uid.into()).unwrap_or(0);
        for rec in recs {
            assert!(u32::from(rec.uid) > prev, "appended UIDs out of order");
            prev = rec.uid.into();
        }

        self.records.extend_from_slice(recs);
        self.save()
    }
}

pub(crate) fn index_file_path(mailbox_root: &Path) -> PathBuf {
    mailbox_root.join("index")
}
