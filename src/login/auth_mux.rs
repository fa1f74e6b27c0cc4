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

//! The auth multiplexer: brokers login exchanges between the many client
//! sessions of this process and the pool of auth worker processes.
//!
//! One connection exists per worker socket found in the socket directory
//! (the process is chrooted in production, so that directory is `"."`).
//! New requests are routed to the first connection advertising the wanted
//! mechanism with room in its output buffer; replies are correlated back
//! by request id. Workers that disappear are reconnected by a once-a-
//! second rescan whenever the reconnect flag is set.

use std::cell::{Cell, RefCell};
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use log::{error, warn};

use super::auth_connection::{AuthCallback, AuthConnection, AuthRequest};
use super::auth_proto::{
    AuthMech, AuthProtocol, RequestContinue, RequestNew, REQUEST_NEW_SIZE,
};
use crate::support::error::Error;

/// The shared state behind an `AuthMultiplexer`.
///
/// This is what the original architecture kept in process-wide globals;
/// grouping it lets connections reach back to it through a weak reference.
pub(super) struct MuxInner {
    pub(super) socket_dir: PathBuf,
    /// Our identity, sent in every handshake.
    pub(super) client_pid: u32,
    pub(super) connections: RefCell<Vec<Rc<AuthConnection>>>,
    /// Union of the mechanisms advertised across all connections. Only
    /// refreshed when a handshake arrives, so it can go stale when a
    /// worker dies; the per-connection sets are what routing trusts.
    pub(super) available_mechs: Cell<AuthMech>,
    pub(super) request_id_counter: Cell<u32>,
    pub(super) reconnect: Cell<bool>,
    pub(super) waiting_handshake_count: Cell<u32>,
}

impl MuxInner {
    pub(super) fn new(socket_dir: PathBuf, client_pid: u32) -> Self {
        MuxInner {
            socket_dir,
            client_pid,
            connections: RefCell::new(Vec::new()),
            available_mechs: Cell::new(AuthMech::empty()),
            request_id_counter: Cell::new(0),
            reconnect: Cell::new(false),
            waiting_handshake_count: Cell::new(0),
        }
    }

    pub(super) fn update_available_mechs(&self) {
        let mut mechs = AuthMech::empty();
        for conn in self.connections.borrow().iter() {
            mechs |= conn.available_mechs.get();
        }
        self.available_mechs.set(mechs);
    }

    /// Allocate the next request id. Ids increase monotonically and are
    /// not recycled; id 0 is reserved and skipped on wrap-around.
    pub(super) fn allocate_request_id(&self) -> u32 {
        let mut id = self.request_id_counter.get().wrapping_add(1);
        if 0 == id {
            id = 1;
        }
        self.request_id_counter.set(id);
        id
    }
}

/// The login process's broker for authentication exchanges.
///
/// Must be created and used on a tokio `LocalSet`; every connection runs
/// its reader as a local task, and the reconnect timer is one too.
pub struct AuthMultiplexer {
    pub(super) inner: Rc<MuxInner>,
    timer: Option<tokio::task::JoinHandle<()>>,
}

impl AuthMultiplexer {
    /// Scan `socket_dir` for worker sockets, connect to each, and install
    /// the reconnect timer.
    ///
    /// `client_pid` is our identity for worker handshakes.
    pub fn init(
        socket_dir: impl Into<PathBuf>,
        client_pid: u32,
    ) -> AuthMultiplexer {
        let inner = Rc::new(MuxInner::new(socket_dir.into(), client_pid));
        connect_missing(&inner);

        let weak = Rc::downgrade(&inner);
        let timer = tokio::task::spawn_local(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(
                tokio::time::MissedTickBehavior::Delay,
            );
            loop {
                interval.tick().await;
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                if inner.reconnect.get() {
                    connect_missing(&inner);
                }
            }
        });

        AuthMultiplexer {
            inner,
            timer: Some(timer),
        }
    }

    /// Whether every discovered worker is connected and past its
    /// handshake.
    pub fn is_connected(&self) -> bool {
        !self.inner.reconnect.get()
            && 0 == self.inner.waiting_handshake_count.get()
    }

    /// The union of the mechanisms advertised across all connections.
    pub fn available_mechs(&self) -> AuthMech {
        self.inner.available_mechs.get()
    }

    /// Begin a new authentication exchange.
    ///
    /// `callback` is invoked for every reply the worker sends for this
    /// request, and with `(None, None)` if the connection dies first.
    pub fn init_request(
        &self,
        mech: AuthMech,
        protocol: AuthProtocol,
        callback: Box<AuthCallback>,
    ) -> Result<AuthRequestHandle, Error> {
        if self.inner.reconnect.get() {
            connect_missing(&self.inner);
        }

        let conn = self.get_connection(mech, REQUEST_NEW_SIZE)?;

        let id = self.inner.allocate_request_id();
        conn.requests
            .borrow_mut()
            .insert(id, AuthRequest { mech, callback });

        let frame = RequestNew { id, protocol, mech }.encode();
        if let Err(e) = conn.send(&frame) {
            // The teardown fires this request's callback with (None,
            // None), so returning the handle anyway looks to the caller
            // like an immediately-failed exchange.
            warn!("Error sending request to auth process: {}", e);
            conn.destroy();
        }

        Ok(AuthRequestHandle { conn, id })
    }

    /// Pick the first connection that advertises `mech` and has output
    /// headroom for a `size`-byte frame.
    fn get_connection(
        &self,
        mech: AuthMech,
        size: usize,
    ) -> Result<Rc<AuthConnection>, Error> {
        let mut found = false;
        for conn in self.inner.connections.borrow().iter() {
            if conn.available_mechs.get().contains(mech) {
                if conn.have_space(size) {
                    return Ok(Rc::clone(conn));
                }

                found = true;
            }
        }

        if found {
            warn!("Authentication servers are busy");
            Err(Error::AuthServersBusy)
        } else if !self.inner.available_mechs.get().contains(mech) {
            Err(Error::UnsupportedAuthMech)
        } else {
            self.inner.reconnect.set(true);
            Err(Error::AuthNotConnected)
        }
    }

    /// Destroy every connection (aborting their pending requests) and
    /// stop the reconnect timer.
    pub fn deinit(&mut self) {
        let connections: Vec<Rc<AuthConnection>> =
            self.inner.connections.borrow().clone();
        for conn in connections {
            conn.destroy();
        }

        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for AuthMultiplexer {
    fn drop(&mut self) {
        self.deinit();
    }
}

/// A caller's handle on one in-flight authentication exchange.
///
/// Holds a strong count on the connection for as long as the caller keeps
/// it.
pub struct AuthRequestHandle {
    pub(super) conn: Rc<AuthConnection>,
    pub(super) id: u32,
}

impl AuthRequestHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Send more client input for this exchange.
    ///
    /// A send failure tears down the whole connection, which aborts every
    /// pending request on it, this one included.
    pub fn send_continue(&self, data: &[u8]) {
        let mut frame = RequestContinue {
            id: self.id,
            data_size: data.len() as u32,
        }
        .encode();
        frame.extend_from_slice(data);

        if let Err(e) = self.conn.send(&frame) {
            warn!(
                "Error sending continue request to auth process: {}",
                e
            );
            self.conn.destroy();
        }
    }

    /// Abandon the exchange.
    ///
    /// The worker is not told; if it sends another reply for this id,
    /// that surfaces as an unknown id and is dropped.
    pub fn abort(self) {
        self.conn.requests.borrow_mut().remove(&self.id);
    }
}

/// Rescan the socket directory and connect every worker socket not
/// already represented.
///
/// The reconnect flag stays set unless at least one connect succeeds, so
/// the timer keeps retrying.
pub(super) fn connect_missing(inner: &Rc<MuxInner>) {
    inner.reconnect.set(true);

    let entries = match fs::read_dir(&inner.socket_dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!(
                "opendir({}) failed when trying to get list of \
                 authentication servers: {}",
                inner.socket_dir.display(),
                e
            );
            return;
        },
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if name.starts_with('.') {
            continue;
        }

        if inner.connections.borrow().iter().any(|c| c.name == name) {
            // already connected
            continue;
        }

        let is_socket =
            entry.file_type().map_or(false, |t| t.is_socket());
        if is_socket && AuthConnection::connect(inner, &name).is_some() {
            inner.reconnect.set(false);
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::future::Future;
    use std::path::PathBuf;
    use std::rc::Rc;

    use byteorder::{LittleEndian, WriteBytesExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::super::auth_proto::*;
    use super::*;

    fn run_local<T>(f: impl Future<Output = T>) -> T {
        crate::init_test_log();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let local = tokio::task::LocalSet::new();
        rt.block_on(local.run_until(f))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for condition");
    }

    fn handshake_bytes(pid: u32, mechs: AuthMech) -> Vec<u8> {
        let mut buf = Vec::new();
        byteorder::WriteBytesExt::write_u32::<LittleEndian>(&mut buf, pid).unwrap();
        byteorder::WriteBytesExt::write_u32::<LittleEndian>(&mut buf, mechs.bits()).unwrap();
        buf
    }

    fn reply_bytes(id: u32, result: u8, data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        byteorder::WriteBytesExt::write_u32::<LittleEndian>(&mut buf, id).unwrap();
        buf.push(result);
        byteorder::WriteBytesExt::write_u32::<LittleEndian>(&mut buf, data.len() as u32).unwrap();
        buf.extend_from_slice(data);
        buf
    }

    /// Bind a fake worker at `path` which completes the handshake
    /// advertising `mechs` and then runs `script` on the connection.
    fn spawn_worker<F, Fut>(path: PathBuf, mechs: AuthMech, script: F)
    where
        F: FnOnce(tokio::net::UnixStream) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        tokio::task::spawn_local(async move {
            let (mut sock, _) = listener.accept().await.unwrap();

            let mut hs = [0u8; HANDSHAKE_INPUT_SIZE];
            sock.read_exact(&mut hs).await.unwrap();
            sock.write_all(&handshake_bytes(4242, mechs)).await.unwrap();

            script(sock).await;
        });
    }

    async fn read_new_frame(sock: &mut tokio::net::UnixStream) -> u32 {
        let mut frame = [0u8; REQUEST_NEW_SIZE];
        sock.read_exact(&mut frame).await.unwrap();
        assert_eq!(REQUEST_TYPE_NEW, frame[0]);
        u32::from_le_bytes(frame[1..5].try_into().unwrap())
    }

    #[test]
    fn plain_auth_round_trip() {
        run_local(async {
            let dir = tempfile::TempDir::new().unwrap();
            spawn_worker(
                dir.path().join("auth-worker"),
                AuthMech::PLAIN,
                |mut sock| async move {
                    let mut frame = [0u8; REQUEST_NEW_SIZE];
                    sock.read_exact(&mut frame).await.unwrap();
                    assert_eq!(REQUEST_TYPE_NEW, frame[0]);
                    let id =
                        u32::from_le_bytes(frame[1..5].try_into().unwrap());
                    assert_eq!(AuthProtocol::Imap as u8, frame[5]);
                    assert_eq!(
                        AuthMech::PLAIN.bits(),
                        u32::from_le_bytes(frame[6..10].try_into().unwrap())
                    );

                    sock.write_all(&reply_bytes(id, 2, b"user"))
                        .await
                        .unwrap();
                    std::future::pending::<()>().await;
                },
            );

            let mut mux = AuthMultiplexer::init(dir.path(), 77);
            wait_until(|| mux.is_connected()).await;

            let outcome = Rc::new(RefCell::new(None));
            let outcome2 = Rc::clone(&outcome);
            let request = mux
                .init_request(
                    AuthMech::PLAIN,
                    AuthProtocol::Imap,
                    Box::new(move |reply, data| {
                        *outcome2.borrow_mut() = Some((
                            reply.copied(),
                            data.map(|d| d.to_vec()),
                        ));
                    }),
                )
                .unwrap();

            wait_until(|| outcome.borrow().is_some()).await;
            let (reply, data) = outcome.borrow_mut().take().unwrap();
            let reply = reply.unwrap();
            assert_eq!(request.id(), reply.id);
            assert_eq!(ReplyResult::Success, reply.result);
            assert_eq!(b"user".to_vec(), data.unwrap());

            // the terminal reply retired the request
            assert!(request.conn.requests.borrow().is_empty());

            // a mechanism nobody advertises is rejected outright
            assert_matches!(
                Err(Error::UnsupportedAuthMech),
                mux.init_request(
                    AuthMech::CRAM_MD5,
                    AuthProtocol::Imap,
                    Box::new(|_, _| ()),
                )
                .map(|_| ())
            );

            mux.deinit();
        });
    }

    #[test]
    fn continue_reply_keeps_request_pending() {
        run_local(async {
            let dir = tempfile::TempDir::new().unwrap();
            spawn_worker(
                dir.path().join("auth-worker"),
                AuthMech::CRAM_MD5,
                |mut sock| async move {
                    let id = read_new_frame(&mut sock).await;
                    sock.write_all(&reply_bytes(id, 1, b"challenge"))
                        .await
                        .unwrap();

                    let mut cont = [0u8; REQUEST_CONTINUE_SIZE];
                    sock.read_exact(&mut cont).await.unwrap();
                    assert_eq!(REQUEST_TYPE_CONTINUE, cont[0]);
                    assert_eq!(
                        id,
                        u32::from_le_bytes(cont[1..5].try_into().unwrap())
                    );
                    let data_size =
                        u32::from_le_bytes(cont[5..9].try_into().unwrap())
                            as usize;
                    let mut payload = vec![0u8; data_size];
                    sock.read_exact(&mut payload).await.unwrap();
                    assert_eq!(b"response".to_vec(), payload);

                    sock.write_all(&reply_bytes(id, 3, b"")).await.unwrap();
                    std::future::pending::<()>().await;
                },
            );

            let mut mux = AuthMultiplexer::init(dir.path(), 77);
            wait_until(|| mux.is_connected()).await;

            let replies = Rc::new(RefCell::new(Vec::new()));
            let replies2 = Rc::clone(&replies);
            let request = mux
                .init_request(
                    AuthMech::CRAM_MD5,
                    AuthProtocol::Pop3,
                    Box::new(move |reply, data| {
                        replies2.borrow_mut().push((
                            reply.map(|r| r.result),
                            data.map(|d| d.to_vec()),
                        ));
                    }),
                )
                .unwrap();

            wait_until(|| 1 == replies.borrow().len()).await;
            assert_eq!(
                (Some(ReplyResult::Continue), Some(b"challenge".to_vec())),
                replies.borrow()[0]
            );
            // an intermediate reply leaves the request in the table
            assert!(request
                .conn
                .requests
                .borrow()
                .contains_key(&request.id()));

            request.send_continue(b"response");
            wait_until(|| 2 == replies.borrow().len()).await;
            assert_eq!(
                (Some(ReplyResult::Failure), Some(Vec::new())),
                replies.borrow()[1]
            );
            assert!(request.conn.requests.borrow().is_empty());

            mux.deinit();
        });
    }

    #[test]
    fn worker_death_aborts_pending_requests() {
        run_local(async {
            let dir = tempfile::TempDir::new().unwrap();
            spawn_worker(
                dir.path().join("auth-worker"),
                AuthMech::PLAIN,
                |mut sock| async move {
                    // swallow the request, then drop the connection
                    let _ = read_new_frame(&mut sock).await;
                },
            );

            let mut mux = AuthMultiplexer::init(dir.path(), 77);
            wait_until(|| mux.is_connected()).await;

            let calls = Rc::new(RefCell::new(Vec::new()));
            let calls2 = Rc::clone(&calls);
            let _request = mux
                .init_request(
                    AuthMech::PLAIN,
                    AuthProtocol::Imap,
                    Box::new(move |reply, data| {
                        calls2
                            .borrow_mut()
                            .push((reply.is_some(), data.is_some()));
                    }),
                )
                .unwrap();

            wait_until(|| !calls.borrow().is_empty()).await;
            // exactly one callback, with the null reply signalling abort
            assert_eq!(vec![(false, false)], *calls.borrow());

            // the death also scheduled a reconnect attempt
            assert!(!mux.is_connected());

            mux.deinit();
        });
    }

    #[test]
    fn teardown_releases_all_connection_references() {
        run_local(async {
            let dir = tempfile::TempDir::new().unwrap();
            spawn_worker(
                dir.path().join("auth-worker"),
                AuthMech::PLAIN,
                |_sock| async move {
                    std::future::pending::<()>().await;
                },
            );

            let mut mux = AuthMultiplexer::init(dir.path(), 77);
            wait_until(|| mux.is_connected()).await;

            let request = mux
                .init_request(
                    AuthMech::PLAIN,
                    AuthProtocol::Imap,
                    Box::new(|_, _| ()),
                )
                .unwrap();
            let weak = Rc::downgrade(&request.conn);

            request.abort();
            mux.deinit();

            // once the reader task has unwound, nothing holds the
            // connection any more
            wait_until(|| weak.upgrade().is_none()).await;
        });
    }

    #[test]
    fn aborted_request_reply_is_ignored() {
        run_local(async {
            let dir = tempfile::TempDir::new().unwrap();
            spawn_worker(
                dir.path().join("auth-worker"),
                AuthMech::PLAIN,
                |mut sock| async move {
                    let id = read_new_frame(&mut sock).await;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    sock.write_all(&reply_bytes(id, 2, b"late"))
                        .await
                        .unwrap();
                    std::future::pending::<()>().await;
                },
            );

            let mut mux = AuthMultiplexer::init(dir.path(), 77);
            wait_until(|| mux.is_connected()).await;

            let called = Rc::new(RefCell::new(false));
            let called2 = Rc::clone(&called);
            let request = mux
                .init_request(
                    AuthMech::PLAIN,
                    AuthProtocol::Imap,
                    Box::new(move |_, _| *called2.borrow_mut() = true),
                )
                .unwrap();
            let conn = Rc::clone(&request.conn);
            request.abort();

            tokio::time::sleep(Duration::from_millis(300)).await;

            // the late reply hit an unknown id: logged, dropped, and the
            // connection survived
            assert!(!*called.borrow());
            assert!(-1 != conn.fd.get());
            assert!(mux.is_connected());

            mux.deinit();
        });
    }

    #[test]
    fn saturated_connections_report_busy() {
        run_local(async {
            let dir = tempfile::TempDir::new().unwrap();
            spawn_worker(
                dir.path().join("auth-worker"),
                AuthMech::PLAIN,
                |_sock| async move {
                    std::future::pending::<()>().await;
                },
            );

            let mut mux = AuthMultiplexer::init(dir.path(), 77);
            wait_until(|| mux.is_connected()).await;

            let conn = Rc::clone(&mux.inner.connections.borrow()[0]);
            conn.outbuf_pending.set(MAX_OUTBUF_SIZE);
            assert_matches!(
                Err(Error::AuthServersBusy),
                mux.init_request(
                    AuthMech::PLAIN,
                    AuthProtocol::Imap,
                    Box::new(|_, _| ()),
                )
                .map(|_| ())
            );

            conn.outbuf_pending.set(0);
            let request = mux.init_request(
                AuthMech::PLAIN,
                AuthProtocol::Imap,
                Box::new(|_, _| ()),
            );
            assert!(request.is_ok());

            mux.deinit();
        });
    }

    #[test]
    fn routing_error_precedence() {
        run_local(async {
            let dir = tempfile::TempDir::new().unwrap();
            spawn_worker(
                dir.path().join("auth-worker"),
                AuthMech::PLAIN,
                |_sock| async move {
                    std::future::pending::<()>().await;
                },
            );

            let mut mux = AuthMultiplexer::init(dir.path(), 77);
            wait_until(|| mux.is_connected()).await;

            // Kill the connection by hand. The process-wide mechanism
            // union goes stale on purpose, which is exactly what
            // distinguishes "not connected" from "unsupported".
            let conn = Rc::clone(&mux.inner.connections.borrow()[0]);
            conn.destroy();

            assert_matches!(
                Err(Error::AuthNotConnected),
                mux.init_request(
                    AuthMech::PLAIN,
                    AuthProtocol::Imap,
                    Box::new(|_, _| ()),
                )
                .map(|_| ())
            );
            assert!(mux.inner.reconnect.get());

            mux.deinit();
        });
    }

    #[test]
    fn no_workers_means_unsupported_mechanism() {
        run_local(async {
            let dir = tempfile::TempDir::new().unwrap();

            let mut mux = AuthMultiplexer::init(dir.path(), 77);
            assert!(!mux.is_connected());
            assert_matches!(
                Err(Error::UnsupportedAuthMech),
                mux.init_request(
                    AuthMech::PLAIN,
                    AuthProtocol::Imap,
                    Box::new(|_, _| ()),
                )
                .map(|_| ())
            );

            mux.deinit();
        });
    }

    #[test]
    fn reconnect_timer_picks_up_new_workers() {
        run_local(async {
            let dir = tempfile::TempDir::new().unwrap();

            // No sockets yet: init leaves the reconnect flag pending
            let mut mux = AuthMultiplexer::init(dir.path(), 77);
            assert!(!mux.is_connected());

            spawn_worker(
                dir.path().join("auth-worker"),
                AuthMech::PLAIN,
                |_sock| async move {
                    std::future::pending::<()>().await;
                },
            );

            // The 1-second rescan finds the new socket
            wait_until(|| mux.is_connected()).await;
            assert!(mux
                .inner
                .available_mechs
                .get()
                .contains(AuthMech::PLAIN));

            mux.deinit();
        });
    }

    #[test]
    fn request_ids_are_unique_and_skip_zero() {
        let inner = MuxInner::new(PathBuf::from("."), 1);

        inner.request_id_counter.set(u32::MAX - 1);
        assert_eq!(u32::MAX, inner.allocate_request_id());
        // 0 is reserved and skipped on wrap
        assert_eq!(1, inner.allocate_request_id());
        assert_eq!(2, inner.allocate_request_id());
    }
}
