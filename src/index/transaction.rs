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

use super::{Index, IndexRecord, MailFlags, Seqnum, Uid};
use crate::support::error::Error;

#[derive(Clone, Debug)]
struct PendingAppend {
    uid: Option<Uid>,
    flags: MailFlags,
    keywords: u64,
}

/// A queue of appends against an `Index`.
///
/// Appends receive in-memory sequence numbers immediately (continuing from
/// the index's current count) but no UIDs; UIDs are assigned as a
/// contiguous range at commit time, once the next free UID is known under
/// the UID-list lock.
pub struct IndexTransaction {
    base_count: u32,
    appends: Vec<PendingAppend>,
}

impl IndexTransaction {
    pub fn new(index: &Index) -> Self {
        IndexTransaction {
            base_count: index.messages_count(),
            appends: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.appends.is_empty()
    }

    /// Append a placeholder record and return its in-memory sequence
    /// number.
    pub fn append(&mut self) -> Seqnum {
        self.appends.push(PendingAppend {
            uid: None,
            flags: MailFlags::empty(),
            keywords: 0,
        });
        Seqnum::of(self.base_count + self.appends.len() as u32).unwrap()
    }

    /// Replace the flags and keywords of the pending append at `seq`.
    ///
    /// Panics if `seq` does not belong to this transaction.
    pub fn update_flags(
        &mut self,
        seq: Seqnum,
        flags: MailFlags,
        keywords: u64,
    ) {
        let ix = seq
            .to_index()
            .checked_sub(self.base_count as usize)
            .expect("sequence predates this transaction");
        let pending = &mut self.appends[ix];
        pending.flags = flags;
        pending.keywords = keywords;
    }

    /// Drop the most recent pending append, which must be the one that was
    /// assigned `seq`.
    ///
    /// Used when the message being saved for that record failed and its
    /// staged file was discarded.
    pub fn cancel_last(&mut self, seq: Seqnum) {
        assert_eq!(
            self.base_count + self.appends.len() as u32,
            seq.0.get(),
            "cancelled append is not the most recent one"
        );
        self.appends.pop();
    }

    /// Assign a contiguous UID range starting at `first` to the pending
    /// appends, in order. Returns the last UID of the range, or `None` if
    /// there are no pending appends.
    pub fn assign_uids(&mut self, first: Uid) -> Option<Uid> {
        let mut uid = first;
        let mut last = None;
        for (ix, pending) in self.appends.iter_mut().enumerate() {
            if ix > 0 {
                uid = uid.next().expect("UID space exhausted");
            }
            pending.uid = Some(uid);
            last = Some(uid);
        }
        last
    }

    /// Push the now-fully-assigned records into the index.
    ///
    /// Panics if `assign_uids` has not run.
    pub fn apply(self, index: &mut Index) -> Result<(), Error> {
        let records: Vec<IndexRecord> = self
            .appends
            .into_iter()
            .map(|pending| IndexRecord {
                uid: pending.uid.expect("append committed without a UID"),
                flags: pending.flags,
                keywords: pending.keywords,
            })
            .collect();
        index.append_records(&records)
    }
}
