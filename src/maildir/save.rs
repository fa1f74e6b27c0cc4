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

//! Transactional message saving.
//!
//! Each message of a transaction is streamed into a uniquely-named file
//! under `tmp/` and fsynced there. Commit is the only publication step:
//! under the UID-list lock, every staged file is hard-linked into `new/`
//! or `cur/` in the order the messages were saved, the UID list gains the
//! matching records, and the index transaction's placeholder records get
//! their contiguous UID range. Any failure before the UID list is
//! rewritten unlinks whatever was already linked, leaving the mailbox as
//! it was.

use std::fs;
use std::io::{self, Read};
use std::os::unix::io::IntoRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::prelude::*;
use log::error;

use super::filename;
use super::mailbox::{Mailbox, Transaction};
use super::tmp::{self, MessageWriter};
use super::uidlist::{Uidlist, UidlistRecFlags};
use crate::index::{MailFlags, Seqnum, UidRange};
use crate::support::error::{is_out_of_space, Error};
use crate::support::file_ops::IgnoreKinds;

const UIDLIST_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// One file staged under `tmp/`, immutable once recorded.
pub(super) struct MaildirFilename {
    /// The name under `tmp/`.
    basename: String,
    /// The flag-suffixed name under `cur/`, or `None` when the destination
    /// is `new/`.
    dest: Option<String>,
}

impl MaildirFilename {
    fn dest_filename(&self) -> &str {
        self.dest.as_deref().unwrap_or(&self.basename)
    }
}

/// The save state of one transaction.
///
/// `output` is `Some` exactly while a message body is being streamed; the
/// staged-file record for that message is the *last* element of `files`,
/// and the failure paths of `save_finish` pop it.
pub(super) struct SaveContext {
    files: Vec<MaildirFilename>,
    output: Option<MessageWriter>,
    /// The stream error recorded by a failed `save_continue`, kept so
    /// `save_finish` can classify it for the user.
    output_error: Option<io::Error>,
    received_date: Option<DateTime<Utc>>,
    seq: Option<Seqnum>,
    save_crlf: bool,
    failed: bool,
}

impl SaveContext {
    fn new() -> Self {
        SaveContext {
            files: Vec::new(),
            output: None,
            output_error: None,
            received_date: None,
            seq: None,
            save_crlf: std::env::var_os("MAIL_SAVE_CRLF")
                .map_or(false, |v| !v.is_empty()),
            failed: false,
        }
    }

    /// The user-facing rendition of the recorded stream error, without
    /// consuming it.
    fn stream_error(&self) -> Error {
        match self.output_error {
            Some(ref e) if is_out_of_space(e) => Error::NoSpace,
            _ => Error::StorageCritical,
        }
    }
}

impl Transaction<'_> {
    /// Begin saving one message.
    ///
    /// A fresh file is created under `tmp/` and the index transaction
    /// gains a placeholder record carrying `flags`. If `received_date` is
    /// given, it will become the file's mtime at `save_finish`.
    ///
    /// The message lands in `new/` unless it carries any flag beyond
    /// `RECENT`: files in `new/` cannot encode flags, and writing wrong
    /// flags there would mislead other maildir readers, so flagged
    /// messages go to `cur/` with a flag suffix instead.
    pub fn save_init(
        &mut self,
        flags: MailFlags,
        received_date: Option<DateTime<Utc>>,
    ) -> Result<(), Error> {
        if self.save.is_none() {
            self.save = Some(SaveContext::new());
        }
        let ctx = self.save.as_mut().unwrap();
        assert!(
            ctx.output.is_none(),
            "save_init while a message is still being written"
        );

        let (file, basename) =
            match tmp::create_tmp(&self.mailbox.tmp_dir, self.mailbox.mail_create_mode)
            {
                Ok(v) => v,
                Err(e) => {
                    ctx.failed = true;
                    return Err(e);
                },
            };

        ctx.received_date = received_date;
        ctx.output = Some(MessageWriter::new(file, ctx.save_crlf));

        // Every newly saved message is recent until a session sees it
        let flags = flags | MailFlags::RECENT;
        let dest = if MailFlags::RECENT == flags {
            None
        } else {
            Some(filename::set_flags(&basename, flags))
        };
        ctx.files.push(MaildirFilename { basename, dest });

        let seq = self.index_txn.append();
        self.index_txn.update_flags(seq, flags, 0);
        ctx.seq = Some(seq);

        ctx.output_error = None;
        ctx.failed = false;
        Ok(())
    }

    /// Stream bytes from `input` into the message being saved until the
    /// input is exhausted.
    ///
    /// Errors are sticky: once a write has failed, this and `save_finish`
    /// keep reporting failure for the current message.
    pub fn save_continue(
        &mut self,
        input: &mut dyn Read,
    ) -> Result<(), Error> {
        let ctx = self
            .save
            .as_mut()
            .expect("save_continue without save_init");
        if ctx.failed {
            return Err(ctx.stream_error());
        }

        let output = ctx.output.as_mut().expect("no message being written");
        match io::copy(input, output) {
            Ok(_) => Ok(()),
            Err(e) => {
                ctx.failed = true;
                let user_error = if is_out_of_space(&e) {
                    Error::NoSpace
                } else {
                    Error::StorageCritical
                };
                ctx.output_error = Some(e);
                Err(user_error)
            },
        }
    }

    /// Close out the message being saved.
    ///
    /// On success the staged file is durable under `tmp/` (flushed,
    /// fsynced, mtime set to the received date) but not yet visible in
    /// `new/` or `cur/`; the captured sequence number is returned and the
    /// transaction is ready for another `save_init`. On failure the staged
    /// file is unlinked and its records dropped.
    pub fn save_finish(&mut self) -> Result<Seqnum, Error> {
        let ctx = self
            .save
            .as_mut()
            .expect("save_finish without save_init");

        if ctx.failed && ctx.output.is_none() {
            // tmp file creation failed; nothing was staged
            return Err(ctx.stream_error());
        }

        let path = self.mailbox.tmp_dir.join(
            &ctx.files
                .last()
                .expect("open message with no staged file record")
                .basename,
        );

        let writer = ctx
            .output
            .take()
            .expect("save_finish with no open message");
        match writer.finish() {
            Ok(file) => {
                // The body is fully on disk only now that the buffered
                // writer has flushed; the mtime must be set after the last
                // write or the write would clobber it again.
                if let Some(received) = ctx.received_date {
                    // The received date is carried in the mtime; atime is
                    // just "now"
                    let atime = nix::sys::time::TimeVal::new(
                        Utc::now().timestamp() as nix::libc::time_t,
                        0,
                    );
                    let mtime = nix::sys::time::TimeVal::new(
                        received.timestamp() as nix::libc::time_t,
                        received.timestamp_subsec_micros()
                            as nix::libc::suseconds_t,
                    );
                    if let Err(e) =
                        nix::sys::stat::utimes(&path, &atime, &mtime)
                    {
                        ctx.failed = true;
                        error!("utimes({}) failed: {}", path.display(), e);
                    }
                }

                if let Err(e) = file.sync_all() {
                    error!("fsync({}) failed: {}", path.display(), e);
                    ctx.failed = true;
                }
                let fd = file.into_raw_fd();
                if let Err(e) = nix::unistd::close(fd) {
                    error!("close({}) failed: {}", path.display(), e);
                    ctx.failed = true;
                }
            },
            Err(e) => {
                // losing buffered data on flush is a write failure
                if ctx.output_error.is_none() {
                    ctx.output_error = Some(e);
                }
                ctx.failed = true;
            },
        }

        if ctx.failed {
            if let Err(e) = fs::remove_file(&path).ignore_not_found() {
                error!("unlink({}) failed: {}", path.display(), e);
            }

            ctx.files.pop();
            let seq = ctx.seq.take().expect("open message with no sequence");
            let result = match ctx.output_error.take() {
                Some(e) if is_out_of_space(&e) => Error::NoSpace,
                Some(e) => {
                    error!("write({}) failed: {}", path.display(), e);
                    Error::StorageCritical
                },
                None => Error::StorageCritical,
            };
            self.index_txn.cancel_last(seq);
            return Err(result);
        }

        Ok(ctx.seq.expect("open message with no sequence"))
    }

    /// Abandon the message currently being saved.
    ///
    /// The staged file is unlinked and dropped from the transaction; other
    /// messages already saved in this transaction are unaffected.
    pub fn save_cancel(&mut self) {
        if self.save.is_some() {
            self.save.as_mut().unwrap().failed = true;
            let _ = self.save_finish();
        }
    }

    /// Atomically publish every message saved in this transaction.
    ///
    /// Returns the contiguous UID range that was assigned, or `None` if
    /// the transaction saved nothing.
    pub fn commit(self) -> Result<Option<UidRange>, Error> {
        let Transaction {
            mailbox,
            mut index_txn,
            save,
        } = self;

        let ctx = match save {
            Some(ctx) => ctx,
            None => return Ok(None),
        };
        assert!(
            ctx.output.is_none(),
            "commit while a message is still being written"
        );
        if ctx.files.is_empty() {
            // every save in this transaction failed or was cancelled
            return Ok(None);
        }

        let _lock = match mailbox.uidlist.lock(UIDLIST_LOCK_TIMEOUT) {
            Ok(lock) => lock,
            Err(e) => {
                commit_abort(mailbox, &ctx, 0);
                return Err(e);
            },
        };

        // Pull in whatever concurrent appenders published before we took
        // the lock, so the next-UID we read below is current.
        if let Err(e) = mailbox.sync() {
            commit_abort(mailbox, &ctx, 0);
            return Err(e);
        }

        let first_uid = mailbox.uidlist.next_uid();
        let last_uid = index_txn
            .assign_uids(first_uid)
            .expect("staged files without index appends");

        let publish_result = {
            let Mailbox {
                ref tmp_dir,
                ref new_dir,
                ref cur_dir,
                ref mut uidlist,
                ..
            } = *mailbox;
            publish_files(tmp_dir, new_dir, cur_dir, uidlist, &ctx.files)
        };
        if let Err((e, published)) = publish_result {
            commit_abort(mailbox, &ctx, published);
            return Err(e);
        }

        // A concurrent appender slipping past the lock would show up here
        assert_eq!(
            u32::from(last_uid) + 1,
            u32::from(mailbox.uidlist.next_uid()),
            "UID list advanced past our transaction during commit"
        );

        // The transaction is complete once the UID list rewrite has
        // landed; the index is a rebuildable cache, so failing to update
        // it must not fail the commit (the messages are already durably
        // delivered).
        if let Err(e) = index_txn.apply(&mut mailbox.index) {
            error!(
                "Failed to update index for {}: {}",
                mailbox.root.display(),
                e
            );
        }

        Ok(Some(UidRange {
            first: first_uid,
            last: last_uid,
        }))
    }

    /// Abandon the whole transaction, unlinking every staged file.
    pub fn rollback(self) {
        let Transaction { mailbox, save, .. } = self;

        if let Some(ctx) = save {
            assert!(
                ctx.output.is_none(),
                "rollback while a message is still being written"
            );
            remove_tmp_files(&mailbox.tmp_dir, &ctx.files);
        }
    }

    #[cfg(test)]
    pub(super) fn staged_files(&self) -> Vec<(String, Option<String>)> {
        self.save
            .as_ref()
            .map(|ctx| {
                ctx.files
                    .iter()
                    .map(|mf| (mf.basename.clone(), mf.dest.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn dest_path(
    new_dir: &Path,
    cur_dir: &Path,
    mf: &MaildirFilename,
) -> PathBuf {
    match mf.dest {
        None => new_dir.join(&mf.basename),
        Some(ref dest) => cur_dir.join(dest),
    }
}

/// Publish one staged file: hard-link it from `tmp/` to its destination,
/// then remove the `tmp/` entry.
///
/// link() rather than rename(): it fails cleanly if a concurrent delivery
/// took the destination name, and on success publication is atomic. The
/// unlink afterwards merely removes the second name of the same inode, so
/// it runs regardless of the link outcome.
fn file_move(
    tmp_dir: &Path,
    new_dir: &Path,
    cur_dir: &Path,
    mf: &MaildirFilename,
) -> Result<(), Error> {
    let tmp_path = tmp_dir.join(&mf.basename);
    let dest = dest_path(new_dir, cur_dir, mf);

    let ret = match nix::unistd::linkat(
        None,
        &tmp_path,
        None,
        &dest,
        nix::unistd::LinkatFlags::SymlinkFollow,
    ) {
        Ok(()) => Ok(()),
        Err(errno)
            if nix::errno::Errno::ENOSPC == errno
                || nix::errno::Errno::EDQUOT == errno =>
        {
            Err(Error::NoSpace)
        },
        Err(errno) => {
            error!(
                "link({}, {}) failed: {}",
                tmp_path.display(),
                dest.display(),
                errno
            );
            Err(Error::StorageCritical)
        },
    };

    if let Err(e) = fs::remove_file(&tmp_path).ignore_not_found() {
        error!("unlink({}) failed: {}", tmp_path.display(), e);
    }

    ret
}

/// Link every staged file to its destination, in insertion order, feeding
/// the destination names into a UID-list sync session which is finished at
/// the end.
///
/// On error, returns the number of staged entries whose destination files
/// had been published by that point (and the abandoned sync session leaves
/// the UID list untouched).
fn publish_files(
    tmp_dir: &Path,
    new_dir: &Path,
    cur_dir: &Path,
    uidlist: &mut Uidlist,
    files: &[MaildirFilename],
) -> Result<(), (Error, usize)> {
    let mut sync = uidlist.sync_init();

    for (pos, mf) in files.iter().enumerate() {
        if let Err(e) = file_move(tmp_dir, new_dir, cur_dir, mf) {
            // the current file never reached its destination
            return Err((e, pos));
        }
        if let Err(e) = sync.next(
            mf.dest_filename(),
            UidlistRecFlags::NEW_DIR | UidlistRecFlags::RECENT,
        ) {
            // the current file did reach its destination
            return Err((e, pos + 1));
        }
    }

    sync.finish().map_err(|e| (e, files.len()))
}

/// Undo a partially-published commit: unlink the destination files of the
/// first `published` staged entries, then fall through to the normal
/// rollback of the `tmp/` files.
fn commit_abort(mailbox: &Mailbox, ctx: &SaveContext, published: usize) {
    for mf in &ctx.files[..published] {
        let _ =
            fs::remove_file(dest_path(&mailbox.new_dir, &mailbox.cur_dir, mf));
    }
    remove_tmp_files(&mailbox.tmp_dir, &ctx.files);
}

fn remove_tmp_files(tmp_dir: &Path, files: &[MaildirFilename]) {
    // Entries already moved out of tmp/ fail with ENOENT, which is fine
    for mf in files {
        let _ = fs::remove_file(tmp_dir.join(&mf.basename));
    }
}
