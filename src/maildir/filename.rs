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

//! Maildir filename generation and the `:2,` flag-suffix encoding.

use chrono::prelude::*;
use lazy_static::lazy_static;
use rand::{rngs::OsRng, Rng};

use crate::index::MailFlags;

lazy_static! {
    static ref HOSTNAME: String = sanitised_hostname();
}

fn sanitised_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        // '/' and ':' have structural meaning in maildir filenames
        .map(|h| h.replace('/', "_").replace(':', "_"))
        .unwrap_or_else(|| "localhost".to_owned())
}

/// Generate a fresh maildir basename.
///
/// The name is unique across hosts and processes; two calls from the same
/// process within the same microsecond can collide, so callers creating
/// files must be prepared to retry with `generate_salted`.
pub fn generate() -> String {
    let now = Utc::now();
    format!(
        "{}.M{}P{}.{}",
        now.timestamp(),
        now.timestamp_subsec_micros(),
        std::process::id(),
        &*HOSTNAME,
    )
}

/// Like `generate`, but with enough randomness mixed in to make collision
/// retries converge immediately.
pub(crate) fn generate_salted() -> String {
    let now = Utc::now();
    format!(
        "{}.M{}R{}P{}.{}",
        now.timestamp(),
        now.timestamp_subsec_micros(),
        OsRng.gen::<u32>(),
        std::process::id(),
        &*HOSTNAME,
    )
}

/// Encode `flags` into `basename`, producing a name suitable for `cur/`.
///
/// Any existing info suffix on `basename` is replaced. The flag letters
/// must appear in ASCII order or other maildir readers will duplicate the
/// file. `RECENT` has no letter; a file in `cur/` is by definition not
/// recent.
pub fn set_flags(basename: &str, flags: MailFlags) -> String {
    // Everything from the first ':' on is the replaceable info suffix
    let base = match basename.find(':') {
        Some(pos) => &basename[..pos],
        None => basename,
    };

    let mut name = String::with_capacity(base.len() + 8);
    name.push_str(base);
    name.push_str(":2,");
    if flags.contains(MailFlags::DRAFT) {
        name.push('D');
    }
    if flags.contains(MailFlags::FLAGGED) {
        name.push('F');
    }
    if flags.contains(MailFlags::ANSWERED) {
        name.push('R');
    }
    if flags.contains(MailFlags::SEEN) {
        name.push('S');
    }
    if flags.contains(MailFlags::DELETED) {
        name.push('T');
    }
    name
}

/// Recover the flag set encoded in a maildir filename.
///
/// Names without an info suffix, and letters we do not understand, produce
/// no flags.
pub fn parse_flags(name: &str) -> MailFlags {
    let mut flags = MailFlags::empty();

    let info = match name.find(':') {
        Some(pos) => &name[pos + 1..],
        None => return flags,
    };
    let letters = match info.strip_prefix("2,") {
        Some(letters) => letters,
        None => return flags,
    };

    for ch in letters.chars() {
        flags |= match ch {
            'D' => MailFlags::DRAFT,
            'F' => MailFlags::FLAGGED,
            'R' => MailFlags::ANSWERED,
            'S' => MailFlags::SEEN,
            'T' => MailFlags::DELETED,
            _ => MailFlags::empty(),
        };
    }

    flags
}
