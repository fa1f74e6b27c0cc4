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

use std::path::PathBuf;

use structopt::StructOpt;

use crate::index::MailFlags;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    Deliver(DeliverSubcommand),
    CheckAuth(CheckAuthSubcommand),
}

/// Deliver or import mail.
///
/// By default, this reads one message from standard input and delivers it
/// into the given maildir mailbox.
///
/// A maildir mailbox can be imported by passing its files into this
/// command individually; all inputs of one invocation are appended in a
/// single transaction, so either every message is delivered or none is.
/// For example:
///
/// ls old-mail/cur/* | xargs -d'\n' dovetail deliver --mailbox ~/Maildir
#[derive(StructOpt)]
pub(super) struct DeliverSubcommand {
    /// Path of the maildir mailbox root (containing tmp/, new/, cur/).
    #[structopt(long, parse(from_os_str))]
    pub(super) mailbox: PathBuf,

    /// Create the mailbox if it does not exist.
    #[structopt(long)]
    pub(super) create: bool,

    /// Set the given flag on the delivered message(s). May be passed more
    /// than once. Flags: answered, flagged, deleted, seen, draft.
    #[structopt(long = "flag", parse(try_from_str = parse_flag))]
    pub(super) flag: Vec<MailFlags>,

    /// Additionally derive flags from the maildir `:2,` suffix of each
    /// input filename.
    #[structopt(long)]
    pub(super) maildir_flags: bool,

    /// Files to deliver; "-" (the default) reads standard input.
    #[structopt(parse(from_os_str))]
    pub(super) inputs: Vec<PathBuf>,
}

/// Probe the auth worker sockets.
///
/// Connects to every auth worker socket in the given directory, waits for
/// their handshakes, and reports the union of the advertised SASL
/// mechanisms. Exits non-zero if no worker answers.
#[derive(StructOpt)]
pub(super) struct CheckAuthSubcommand {
    /// Directory containing the auth worker sockets.
    #[structopt(long, default_value = ".", parse(from_os_str))]
    pub(super) socket_dir: PathBuf,
}

fn parse_flag(s: &str) -> Result<MailFlags, String> {
    match s.trim_start_matches('\\').to_ascii_lowercase().as_str() {
        "answered" => Ok(MailFlags::ANSWERED),
        "flagged" => Ok(MailFlags::FLAGGED),
        "deleted" => Ok(MailFlags::DELETED),
        "seen" => Ok(MailFlags::SEEN),
        "draft" => Ok(MailFlags::DRAFT),
        _ => Err(format!("Unknown flag: {}", s)),
    }
}

pub fn main() {
    crate::init_simple_log();

    match Command::from_args() {
        Command::Deliver(cmd) => super::deliver::deliver(cmd),
        Command::CheckAuth(cmd) => super::check_auth::check_auth(cmd),
    }
}
