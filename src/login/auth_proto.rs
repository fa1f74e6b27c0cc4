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

//! The wire format spoken with auth worker processes.
//!
//! Everything is fixed-layout little-endian structures over a local stream
//! socket. The login side only ever encodes client→server frames and
//! decodes server→client frames, so that is all that exists here.

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Maximum size for an auth reply. 50kB should be more than enough.
pub const MAX_INBUF_SIZE: usize = 1024 * 50;

/// Maximum payload of one continued request.
pub const MAX_REQUEST_DATA_SIZE: usize = 4096;

/// The output-buffer headroom a connection must have to accept another
/// frame: one continue header plus its maximal payload.
pub const MAX_OUTBUF_SIZE: usize =
    REQUEST_CONTINUE_SIZE + MAX_REQUEST_DATA_SIZE;

pub const HANDSHAKE_INPUT_SIZE: usize = 4;
pub const HANDSHAKE_OUTPUT_SIZE: usize = 8;
pub const REQUEST_NEW_SIZE: usize = 10;
pub const REQUEST_CONTINUE_SIZE: usize = 9;
pub const REPLY_SIZE: usize = 9;

pub const REQUEST_TYPE_NEW: u8 = 1;
pub const REQUEST_TYPE_CONTINUE: u8 = 2;

bitflags! {
    /// The SASL mechanisms a worker can advertise, as wire bits.
    pub struct AuthMech: u32 {
        const PLAIN = 1 << 0;
        const DIGEST_MD5 = 1 << 1;
        const ANONYMOUS = 1 << 2;
        const CRAM_MD5 = 1 << 3;
    }
}

/// The protocol a login session is authenticating for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthProtocol {
    Imap = 1,
    Pop3 = 2,
}

/// The disposition of an auth reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyResult {
    /// More client input is needed before the worker can decide.
    Continue = 1,
    Success = 2,
    Failure = 3,
}

impl ReplyResult {
    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            1 => Some(ReplyResult::Continue),
            2 => Some(ReplyResult::Success),
            3 => Some(ReplyResult::Failure),
            _ => None,
        }
    }
}

/// Encode the one-shot client handshake carrying our identity.
pub fn encode_handshake_input(pid: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HANDSHAKE_INPUT_SIZE);
    buf.write_u32::<LittleEndian>(pid).unwrap();
    buf
}

/// The worker's half of the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeOutput {
    pub pid: u32,
    pub mechanisms: AuthMech,
}

impl HandshakeOutput {
    /// Decode from a buffer of exactly `HANDSHAKE_OUTPUT_SIZE` bytes.
    pub fn decode(mut buf: &[u8]) -> Self {
        assert_eq!(HANDSHAKE_OUTPUT_SIZE, buf.len());
        let pid = buf.read_u32::<LittleEndian>().unwrap();
        let mechs = buf.read_u32::<LittleEndian>().unwrap();
        HandshakeOutput {
            pid,
            // unknown mechanism bits are simply never routed to
            mechanisms: AuthMech::from_bits_truncate(mechs),
        }
    }
}

pub struct RequestNew {
    pub id: u32,
    pub protocol: AuthProtocol,
    pub mech: AuthMech,
}

impl RequestNew {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REQUEST_NEW_SIZE);
        buf.push(REQUEST_TYPE_NEW);
        buf.write_u32::<LittleEndian>(self.id).unwrap();
        buf.push(self.protocol as u8);
        buf.write_u32::<LittleEndian>(self.mech.bits()).unwrap();
        buf
    }
}

/// The header of a continued request; `data_size` payload bytes follow.
pub struct RequestContinue {
    pub id: u32,
    pub data_size: u32,
}

impl RequestContinue {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REQUEST_CONTINUE_SIZE);
        buf.push(REQUEST_TYPE_CONTINUE);
        buf.write_u32::<LittleEndian>(self.id).unwrap();
        buf.write_u32::<LittleEndian>(self.data_size).unwrap();
        buf
    }
}

/// The header of a worker reply; `data_size` payload bytes follow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthReply {
    pub id: u32,
    pub result: ReplyResult,
    pub data_size: u32,
}

impl AuthReply {
    /// Decode from a buffer of exactly `REPLY_SIZE` bytes.
    ///
    /// Returns `None` if the result byte is not one we know, which is a
    /// protocol violation on the worker's part.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        assert_eq!(REPLY_SIZE, buf.len());
        let id = buf.read_u32::<LittleEndian>().unwrap();
        let result = ReplyResult::from_wire(buf.read_u8().unwrap())?;
        let data_size = buf.read_u32::<LittleEndian>().unwrap();
        Some(AuthReply {
            id,
            result,
            data_size,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn client_frames_have_fixed_little_endian_layout() {
        assert_eq!(
            vec![0x78, 0x56, 0x34, 0x12],
            encode_handshake_input(0x12345678)
        );

        let new = RequestNew {
            id: 0x0102_0304,
            protocol: AuthProtocol::Imap,
            mech: AuthMech::CRAM_MD5,
        }
        .encode();
        assert_eq!(
            vec![1, 0x04, 0x03, 0x02, 0x01, 1, 0x08, 0, 0, 0],
            new
        );
        assert_eq!(REQUEST_NEW_SIZE, new.len());

        let cont = RequestContinue {
            id: 7,
            data_size: 0x0100,
        }
        .encode();
        assert_eq!(vec![2, 7, 0, 0, 0, 0x00, 0x01, 0, 0], cont);
        assert_eq!(REQUEST_CONTINUE_SIZE, cont.len());
    }

    #[test]
    fn reply_decoding() {
        let reply =
            AuthReply::decode(&[9, 0, 0, 0, 2, 5, 0, 0, 0]).unwrap();
        assert_eq!(9, reply.id);
        assert_eq!(ReplyResult::Success, reply.result);
        assert_eq!(5, reply.data_size);

        // Result byte 4 is not a thing
        assert_eq!(None, AuthReply::decode(&[9, 0, 0, 0, 4, 0, 0, 0, 0]));
    }

    #[test]
    fn handshake_decoding_drops_unknown_mechanism_bits() {
        let hs =
            HandshakeOutput::decode(&[42, 0, 0, 0, 0x09, 0xF0, 0, 0]);
        assert_eq!(42, hs.pid);
        assert_eq!(AuthMech::PLAIN | AuthMech::CRAM_MD5, hs.mechanisms);
    }
}
