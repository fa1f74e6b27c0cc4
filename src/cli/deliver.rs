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
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::prelude::*;
use log::{error, info};

use super::main::DeliverSubcommand;
use crate::index::MailFlags;
use crate::maildir::{filename, Mailbox, Transaction};
use crate::support::error::Error;
use crate::support::sysexits::*;

pub(super) fn deliver(cmd: DeliverSubcommand) {
    let mut mailbox = if cmd.create {
        match Mailbox::create(&cmd.mailbox) {
            Ok(mailbox) => mailbox,
            Err(e) => die!(
                EX_CANTCREAT,
                "Failed to create {}: {}",
                cmd.mailbox.display(),
                e
            ),
        }
    } else {
        match Mailbox::open(&cmd.mailbox) {
            Ok(mailbox) => mailbox,
            Err(Error::NxMailbox) => die!(
                EX_CANTCREAT,
                "{}: Non-existent mailbox",
                cmd.mailbox.display()
            ),
            Err(e) => die!(
                EX_SOFTWARE,
                "Failed to open {}: {}",
                cmd.mailbox.display(),
                e
            ),
        }
    };

    let mut base_flags = MailFlags::empty();
    for &flag in &cmd.flag {
        base_flags |= flag;
    }

    let mut inputs = cmd.inputs;
    if inputs.is_empty() {
        inputs.push(PathBuf::from("-"));
    }

    // All inputs go into one transaction so the delivery is all-or-nothing
    let mut txn = mailbox.transaction();
    for item in &inputs {
        if let Err(e) =
            deliver_single(&mut txn, base_flags, cmd.maildir_flags, item)
        {
            error!("Unable to process {}: {}", item.display(), e);
            txn.rollback();
            match e {
                Error::Io(ref io_e)
                    if io::ErrorKind::NotFound == io_e.kind() =>
                {
                    EX_NOINPUT
                },
                Error::NoSpace => EX_TEMPFAIL,
                Error::Io(_) => EX_IOERR,
                _ => EX_SOFTWARE,
            }
            .exit();
        }
    }

    match txn.commit() {
        Ok(Some(range)) => info!(
            "Delivered {} message(s) as UIDs {}-{}",
            inputs.len(),
            u32::from(range.first),
            u32::from(range.last),
        ),
        Ok(None) => (),
        Err(e @ Error::NoSpace) | Err(e @ Error::UidlistLockTimeout) => {
            die!(EX_TEMPFAIL, "Failed to deliver: {}", e)
        },
        Err(e) => die!(EX_SOFTWARE, "Failed to deliver: {}", e),
    }
}

fn deliver_single(
    txn: &mut Transaction<'_>,
    base_flags: MailFlags,
    maildir_flags: bool,
    item: &Path,
) -> Result<(), Error> {
    let mut reader: Box<dyn Read> = if Path::new("-") == item {
        Box::new(io::stdin().lock())
    } else {
        Box::new(io::BufReader::new(fs::File::open(item)?))
    };

    let mut flags = base_flags;
    if maildir_flags {
        if let Some(name) = item.file_name().and_then(|n| n.to_str()) {
            flags |= filename::parse_flags(name);
        }
    }

    txn.save_init(flags, Some(Utc::now()))?;
    match txn.save_continue(&mut reader) {
        Ok(()) => txn.save_finish().map(|_| ()),
        Err(e) => {
            // retire the staged file for this message before bailing
            let _ = txn.save_finish();
            Err(e)
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dir_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| {
                entry.unwrap().file_name().to_string_lossy().into_owned()
            })
            .collect();
        names.sort();
        names
    }

    #[test]
    fn multi_input_delivery_lands_in_one_transaction() {
        let root = tempfile::TempDir::new().unwrap();
        let mut mailbox = Mailbox::create(root.path().join("mbox")).unwrap();

        let plain = root.path().join("plain-message");
        let seen = root.path().join("seen-message:2,S");
        fs::write(&plain, b"plain body\n").unwrap();
        fs::write(&seen, b"seen body\n").unwrap();

        let mut txn = mailbox.transaction();
        deliver_single(&mut txn, MailFlags::empty(), true, &plain).unwrap();
        deliver_single(&mut txn, MailFlags::empty(), true, &seen).unwrap();
        let range = txn.commit().unwrap().unwrap();

        assert_eq!(1, u32::from(range.first));
        assert_eq!(2, u32::from(range.last));
        assert_eq!(1, dir_names(&mailbox.root().join("new")).len());

        let cur = dir_names(&mailbox.root().join("cur"));
        assert_eq!(1, cur.len());
        assert!(cur[0].ends_with(":2,S"));
    }

    #[test]
    fn missing_input_leaves_the_mailbox_untouched() {
        let root = tempfile::TempDir::new().unwrap();
        let mut mailbox = Mailbox::create(root.path().join("mbox")).unwrap();

        let good = root.path().join("good-message");
        fs::write(&good, b"good\n").unwrap();

        let mut txn = mailbox.transaction();
        deliver_single(&mut txn, MailFlags::empty(), false, &good).unwrap();
        let result = deliver_single(
            &mut txn,
            MailFlags::empty(),
            false,
            &root.path().join("nonexistent"),
        );
        assert_matches!(Err(Error::Io(_)), result);
        txn.rollback();

        assert!(dir_names(&mailbox.root().join("new")).is_empty());
        assert!(dir_names(&mailbox.root().join("cur")).is_empty());
        assert!(dir_names(&mailbox.root().join("tmp")).is_empty());
    }

    #[test]
    fn explicit_flags_are_combined_with_filename_flags() {
        let root = tempfile::TempDir::new().unwrap();
        let mut mailbox = Mailbox::create(root.path().join("mbox")).unwrap();

        let input = root.path().join("message:2,S");
        fs::write(&input, b"body\n").unwrap();

        let mut txn = mailbox.transaction();
        deliver_single(&mut txn, MailFlags::FLAGGED, true, &input).unwrap();
        txn.commit().unwrap().unwrap();

        let cur = dir_names(&mailbox.root().join("cur"));
        assert_eq!(1, cur.len());
        assert!(cur[0].ends_with(":2,FS"), "unexpected name {}", cur[0]);
    }
}
