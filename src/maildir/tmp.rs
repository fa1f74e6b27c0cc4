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

//! Staging of message files under a maildir's `tmp/` directory.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use log::error;

use super::filename;
use crate::support::crlf::CrlfWriter;
use crate::support::error::{is_out_of_space, Error};

const MAX_CREATE_ATTEMPTS: u32 = 128;

/// Create a uniquely-named file under `tmpdir`, open for writing with the
/// given mode.
///
/// Returns the open file and its basename. The caller owns the file and is
/// responsible for unlinking it on every failure path.
pub fn create_tmp(
    tmpdir: &Path,
    mode: u32,
) -> Result<(fs::File, String), Error> {
    for attempt in 0..MAX_CREATE_ATTEMPTS {
        let basename = if 0 == attempt {
            filename::generate()
        } else {
            filename::generate_salted()
        };
        let path = tmpdir.join(&basename);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&path)
        {
            Ok(file) => return Ok((file, basename)),
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => continue,
            Err(e) if is_out_of_space(&e) => {
                error!("open({}) failed: {}", path.display(), e);
                return Err(Error::NoSpace);
            },
            Err(e) => {
                error!("open({}) failed: {}", path.display(), e);
                return Err(Error::StorageCritical);
            },
        }
    }

    error!(
        "Gave up generating a unique filename under {}",
        tmpdir.display()
    );
    Err(Error::StorageCritical)
}

/// The buffered output stream of one message body being staged, with
/// optional LF to CRLF conversion on the way out.
pub enum MessageWriter {
    Plain(io::BufWriter<fs::File>),
    Crlf(CrlfWriter<io::BufWriter<fs::File>>),
}

impl MessageWriter {
    pub fn new(file: fs::File, crlf: bool) -> Self {
        let buf = io::BufWriter::new(file);
        if crlf {
            MessageWriter::Crlf(CrlfWriter::new(buf))
        } else {
            MessageWriter::Plain(buf)
        }
    }

    /// Flush everything buffered and hand back the underlying file so the
    /// caller can sync and close it.
    pub fn finish(self) -> io::Result<fs::File> {
        let buf = match self {
            MessageWriter::Plain(w) => w,
            // The CRLF filter itself buffers nothing
            MessageWriter::Crlf(w) => w.into_inner(),
        };
        buf.into_inner().map_err(|e| e.into_error())
    }
}

impl Write for MessageWriter {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        match *self {
            MessageWriter::Plain(ref mut w) => w.write(src),
            MessageWriter::Crlf(ref mut w) => w.write(src),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            MessageWriter::Plain(ref mut w) => w.flush(),
            MessageWriter::Crlf(ref mut w) => w.flush(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn rapid_creation_produces_distinct_files() {
        let root = tempfile::TempDir::new().unwrap();

        let mut names = Vec::new();
        for _ in 0..32 {
            let (_file, basename) = create_tmp(root.path(), 0o600).unwrap();
            names.push(basename);
        }

        names.sort();
        names.dedup();
        assert_eq!(32, names.len());
    }

    #[test]
    fn requested_mode_is_applied() {
        let root = tempfile::TempDir::new().unwrap();
        let (file, _basename) = create_tmp(root.path(), 0o640).unwrap();

        let mode = file.metadata().unwrap().permissions().mode();
        assert_eq!(0o640, mode & 0o777);
    }

    #[test]
    fn crlf_mode_converts_message_body() {
        let root = tempfile::TempDir::new().unwrap();
        let (file, basename) = create_tmp(root.path(), 0o600).unwrap();

        let mut writer = MessageWriter::new(file, true);
        writer.write_all(b"A\nB\r\nC\n").unwrap();
        let file = writer.finish().unwrap();
        file.sync_all().unwrap();
        drop(file);

        let mut content = Vec::new();
        fs::File::open(root.path().join(&basename))
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(b"A\r\nB\r\nC\r\n".to_vec(), content);
    }
}
