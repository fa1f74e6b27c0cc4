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

use std::io::{self, Write};

/// A writer which expands every bare LF in its input to CRLF.
///
/// An LF already preceded by CR passes through untouched, even when the CR
/// and the LF arrive in separate `write` calls, so feeding canonical DOS
/// line endings through the filter is a no-op.
#[derive(Debug)]
pub struct CrlfWriter<W> {
    inner: W,
    last_was_cr: bool,
}

impl<W> CrlfWriter<W> {
    pub fn new(inner: W) -> Self {
        CrlfWriter {
            inner,
            last_was_cr: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CrlfWriter<W> {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        let mut start = 0;
        for ix in memchr::memchr_iter(b'\n', src) {
            let preceded_by_cr = if 0 == ix {
                self.last_was_cr
            } else {
                b'\r' == src[ix - 1]
            };

            self.inner.write_all(&src[start..ix])?;
            if preceded_by_cr {
                self.inner.write_all(b"\n")?;
            } else {
                self.inner.write_all(b"\r\n")?;
            }
            start = ix + 1;
        }
        self.inner.write_all(&src[start..])?;

        if let Some(&last) = src.last() {
            self.last_was_cr = b'\r' == last;
        }

        Ok(src.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
