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

use std::time::Duration;

use super::main::CheckAuthSubcommand;
use crate::login::AuthMultiplexer;
use crate::support::sysexits::*;

/// How long to wait for every worker to finish its handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) fn check_auth(cmd: CheckAuthSubcommand) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => die!(EX_OSERR, "Failed to set up event loop: {}", e),
    };

    let socket_dir = cmd.socket_dir;
    let mux_dir = socket_dir.clone();

    let local = tokio::task::LocalSet::new();
    let (connected, mechs) = rt.block_on(local.run_until(async move {
        let mut mux = AuthMultiplexer::init(mux_dir, std::process::id());

        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        while !mux.is_connected() && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let result = (mux.is_connected(), mux.available_mechs());
        mux.deinit();
        result
    }));

    if !connected {
        die!(
            EX_TEMPFAIL,
            "No auth workers answering under {}",
            socket_dir.display()
        );
    }

    println!("auth workers OK; mechanisms: {:?}", mechs);
}
