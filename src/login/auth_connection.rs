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

//! One connection to an auth worker process.
//!
//! The socket deliberately stays in blocking mode: the login process
//! depends critically on the auth process, so sends simply wait. Reads are
//! driven by readiness notifications from a per-connection task; each read
//! opts out of blocking per-call, so a spurious wakeup cannot stall the
//! event loop.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::{Rc, Weak};

use log::{debug, error, warn};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use super::auth_mux::MuxInner;
use super::auth_proto::{
    self, AuthMech, AuthReply, HandshakeOutput, HANDSHAKE_OUTPUT_SIZE,
    MAX_INBUF_SIZE, MAX_OUTBUF_SIZE, REPLY_SIZE,
};

/// The continuation invoked for every reply to a request, and exactly once
/// with `(None, None)` if the connection dies while the request is
/// pending.
pub type AuthCallback = dyn FnMut(Option<&AuthReply>, Option<&[u8]>);

pub(super) struct AuthRequest {
    pub(super) mech: AuthMech,
    pub(super) callback: Box<AuthCallback>,
}

/// A live connection to one auth worker.
///
/// Shared ownership: the multiplexer's registry holds one strong count,
/// and every outstanding caller-held request holds another. `destroy`
/// detaches from the registry and kills the socket, but the value lives
/// until the last holder lets go.
pub struct AuthConnection {
    pub(super) mux: Weak<MuxInner>,
    /// The socket's filename within the auth socket directory.
    pub(super) name: String,
    /// The raw descriptor, or -1 once the connection is dead.
    pub(super) fd: Cell<RawFd>,
    stream: RefCell<Option<UnixStream>>,
    pub(super) requests: RefCell<HashMap<u32, AuthRequest>>,
    /// The worker's pid, learned from the handshake.
    pid: Cell<u32>,
    pub(super) available_mechs: Cell<AuthMech>,
    handshake_received: Cell<bool>,
    /// A reply header whose payload has not fully arrived yet.
    pending_reply: Cell<Option<AuthReply>>,
    /// Bytes queued for sending but not yet on the wire. Since the socket
    /// blocks, this is zero except transiently; it exists to give the
    /// saturation check something honest to look at.
    pub(super) outbuf_pending: Cell<usize>,
}

impl AuthConnection {
    /// Connect to the worker socket `name` under the multiplexer's socket
    /// directory and send our handshake.
    ///
    /// On success the connection has been pushed onto the registry and its
    /// reader task spawned onto the current `LocalSet`.
    pub(super) fn connect(
        mux: &Rc<MuxInner>,
        name: &str,
    ) -> Option<Rc<AuthConnection>> {
        let path = mux.socket_dir.join(name);
        let stream = match UnixStream::connect(&path) {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    "Can't connect to auth process at {}: {}",
                    path.display(),
                    e
                );
                mux.reconnect.set(true);
                return None;
            },
        };

        let fd = stream.as_raw_fd();
        let conn = Rc::new(AuthConnection {
            mux: Rc::downgrade(mux),
            name: name.to_owned(),
            fd: Cell::new(fd),
            stream: RefCell::new(Some(stream)),
            requests: RefCell::new(HashMap::new()),
            pid: Cell::new(0),
            available_mechs: Cell::new(AuthMech::empty()),
            handshake_received: Cell::new(false),
            pending_reply: Cell::new(None),
            outbuf_pending: Cell::new(0),
        });

        mux.connections.borrow_mut().push(Rc::clone(&conn));
        mux.waiting_handshake_count
            .set(mux.waiting_handshake_count.get() + 1);

        if let Err(e) =
            conn.send(&auth_proto::encode_handshake_input(mux.client_pid))
        {
            warn!("Error sending handshake to auth process: {}", e);
            conn.destroy();
            return None;
        }

        tokio::task::spawn_local(input_task(Rc::clone(&conn)));
        Some(conn)
    }

    /// Whether the output buffer has room for another `size`-byte frame.
    pub(super) fn have_space(&self, size: usize) -> bool {
        self.outbuf_pending.get() + size <= MAX_OUTBUF_SIZE
    }

    /// Send raw bytes to the worker, blocking until they are accepted.
    pub(super) fn send(&self, data: &[u8]) -> io::Result<()> {
        match *self.stream.borrow() {
            Some(ref stream) => {
                let mut stream: &UnixStream = stream;
                stream.write_all(data)
            },
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Tear the connection down.
    ///
    /// Detaches from the registry, wakes the reader task so it can release
    /// the socket, and invokes every pending request's callback with
    /// `(None, None)`. Idempotent; the heap value itself lives until the
    /// last strong count is gone.
    pub(super) fn destroy(&self) {
        if -1 == self.fd.get() {
            return;
        }
        self.fd.set(-1);

        if let Some(mux) = self.mux.upgrade() {
            mux.connections
                .borrow_mut()
                .retain(|c| !std::ptr::eq(Rc::as_ptr(c), self as *const Self));
            if !self.handshake_received.get() {
                mux.waiting_handshake_count
                    .set(mux.waiting_handshake_count.get() - 1);
            }
        }

        // Wake the reader task; it drops its readiness registration and
        // closes the socket on its way out.
        if let Some(ref stream) = *self.stream.borrow() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }

        let requests = std::mem::take(&mut *self.requests.borrow_mut());
        for (id, mut request) in requests {
            debug!("Aborting {:?} request {}", request.mech, id);
            (request.callback)(None, None);
        }
    }

    /// Consume as many complete frames from `inbuf` as possible.
    ///
    /// Returns false if the worker violated the protocol and the
    /// connection must die.
    fn process_input(&self, inbuf: &mut Vec<u8>) -> bool {
        if !self.handshake_received.get() {
            if inbuf.len() < HANDSHAKE_OUTPUT_SIZE {
                return true;
            }
            if inbuf.len() > HANDSHAKE_OUTPUT_SIZE {
                error!(
                    "BUG: Auth process sent us too large handshake \
                     ({} vs {})",
                    inbuf.len(),
                    HANDSHAKE_OUTPUT_SIZE
                );
                return false;
            }

            let handshake =
                HandshakeOutput::decode(&inbuf[..HANDSHAKE_OUTPUT_SIZE]);
            inbuf.clear();
            return self.handle_handshake(handshake);
        }

        loop {
            let reply = match self.pending_reply.get() {
                Some(reply) => reply,
                None => {
                    if inbuf.len() < REPLY_SIZE {
                        return true;
                    }
                    let reply = match AuthReply::decode(&inbuf[..REPLY_SIZE])
                    {
                        Some(reply) => reply,
                        None => {
                            error!(
                                "BUG: Auth process (pid {}) sent us a reply \
                                 with an unknown result",
                                self.pid.get()
                            );
                            return false;
                        },
                    };
                    if reply.data_size as usize > MAX_INBUF_SIZE {
                        error!(
                            "BUG: Auth process (pid {}) sent us an \
                             oversized reply payload ({} bytes)",
                            self.pid.get(),
                            reply.data_size
                        );
                        return false;
                    }

                    inbuf.drain(..REPLY_SIZE);
                    self.pending_reply.set(Some(reply));
                    reply
                },
            };

            if inbuf.len() < reply.data_size as usize {
                return true;
            }

            // we've got a full reply
            self.pending_reply.set(None);
            let data: Vec<u8> =
                inbuf.drain(..reply.data_size as usize).collect();
            self.handle_reply(&reply, &data);

            if -1 == self.fd.get() {
                // a callback killed the connection
                return false;
            }
        }
    }

    fn handle_handshake(&self, handshake: HandshakeOutput) -> bool {
        if 0 == handshake.pid {
            error!("BUG: Auth process said it's PID 0");
            return false;
        }

        self.pid.set(handshake.pid);
        self.available_mechs.set(handshake.mechanisms);
        self.handshake_received.set(true);

        if let Some(mux) = self.mux.upgrade() {
            mux.waiting_handshake_count
                .set(mux.waiting_handshake_count.get() - 1);
            mux.update_available_mechs();
        }
        true
    }

    fn handle_reply(&self, reply: &AuthReply, data: &[u8]) {
        // The request leaves the table for the duration of the callback
        // and only returns for an intermediate result, so a terminal reply
        // has retired it before the callback can observe the table. (The
        // corollary: a callback must not abort its own request while
        // handling a Continue reply.)
        let request = self.requests.borrow_mut().remove(&reply.id);
        let mut request = match request {
            Some(request) => request,
            None => {
                error!(
                    "BUG: Auth process (pid {}) sent us reply with \
                     unknown ID {}",
                    self.pid.get(),
                    reply.id
                );
                return;
            },
        };

        (request.callback)(Some(reply), Some(data));

        if auth_proto::ReplyResult::Continue == reply.result {
            self.requests.borrow_mut().insert(reply.id, request);
        }
    }
}

/// The per-connection reader: waits for readiness, pulls bytes, and feeds
/// the frame state machine until the connection dies.
async fn input_task(conn: Rc<AuthConnection>) {
    let fd = conn.fd.get();
    let async_fd = match AsyncFd::with_interest(fd, Interest::READABLE) {
        Ok(async_fd) => async_fd,
        Err(e) => {
            error!("Failed to watch auth socket {}: {}", conn.name, e);
            conn.destroy();
            conn.stream.borrow_mut().take();
            return;
        },
    };

    let mut inbuf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let mut guard = match async_fd.readable().await {
            Ok(guard) => guard,
            Err(_) => break,
        };
        if -1 == conn.fd.get() {
            // destroyed while we were parked
            break;
        }

        // The socket stays blocking for the sake of sends; reads opt out
        // per-call.
        let nread = match guard.try_io(|afd| {
            nix::sys::socket::recv(
                *afd.get_ref(),
                &mut chunk,
                nix::sys::socket::MsgFlags::MSG_DONTWAIT,
            )
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
        }) {
            Err(_would_block) => continue,
            Ok(Ok(0)) => {
                // disconnected
                if let Some(mux) = conn.mux.upgrade() {
                    mux.reconnect.set(true);
                }
                break;
            },
            Ok(Err(e)) => {
                error!("read(auth socket {}) failed: {}", conn.name, e);
                if let Some(mux) = conn.mux.upgrade() {
                    mux.reconnect.set(true);
                }
                break;
            },
            Ok(Ok(nread)) => nread,
        };

        inbuf.extend_from_slice(&chunk[..nread]);
        if inbuf.len() > MAX_INBUF_SIZE {
            error!(
                "BUG: Auth process sent us more than {} bytes of data",
                MAX_INBUF_SIZE
            );
            break;
        }

        if !conn.process_input(&mut inbuf) {
            break;
        }
    }

    conn.destroy();
    // With the readiness registration gone, close the socket the task was
    // watching.
    drop(async_fd);
    conn.stream.borrow_mut().take();
}
