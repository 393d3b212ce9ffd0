// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{net, sync::atomic::Ordering, thread};

use anyhow::Context;
use tracing::{error, info, instrument};

use super::{worker, EngineCtx};
use crate::protocol::Session;

/// The accept loop. Runs on its own thread until the shutdown flag
/// flips; `stop()` wakes it out of a blocking accept with a throwaway
/// self-connection.
#[instrument(skip_all)]
pub(crate) fn serve(listener: net::TcpListener, ctx: EngineCtx) {
    for stream in listener.incoming() {
        if ctx.shutdown.load(Ordering::Acquire) {
            info!("shutdown flag set, listener exiting");
            break;
        }
        match stream {
            Ok(stream) => {
                if let Err(err) = handle_conn(stream, &ctx) {
                    error!("handling new connection: {err:?}");
                }
            }
            Err(err) => {
                error!("accepting stream: {err:?}");
            }
        }
    }
}

/// Deal with one inbound connection on the listener thread. Blocking
/// here is fine: serializing attach through this thread is what makes
/// the single-session policy airtight.
fn handle_conn(stream: net::TcpStream, ctx: &EngineCtx) -> anyhow::Result<()> {
    let peer = stream.peer_addr().context("getting peer address")?;
    {
        let shared = ctx.shared.lock().unwrap();
        if shared.connected {
            // Single-session engine: close the socket without writing
            // a single frame.
            info!("refusing connection from {peer}: a session is already attached");
            if let Err(e) = stream.shutdown(net::Shutdown::Both) {
                info!("closing refused connection: {e}");
            }
            return Ok(());
        }
    }

    info!("accepted runtime connection from {peer}");

    // Register the socket with the facade before blocking in attach,
    // so stop() can close it and wake us even if the peer never
    // produces its init frame.
    let conn = stream.try_clone().context("cloning session stream")?;
    {
        let mut shared = ctx.shared.lock().unwrap();
        shared.conn = Some(conn);
    }
    // stop() flips the flag before it takes the socket; re-checking
    // here closes the window where it ran between our connected check
    // and the registration above.
    if ctx.shutdown.load(Ordering::Acquire) {
        ctx.shared.lock().unwrap().conn = None;
        if let Err(e) = stream.shutdown(net::Shutdown::Both) {
            info!("closing connection during shutdown: {e}");
        }
        return Ok(());
    }

    let mut session = Session::new(stream);
    let init = match session.attach().context("waiting for init frame") {
        Ok(init) => init,
        Err(e) => {
            ctx.shared.lock().unwrap().conn = None;
            return Err(e);
        }
    };

    {
        let mut shared = ctx.shared.lock().unwrap();
        shared.connected = true;
    }

    let worker_ctx = ctx.clone();
    let handle = thread::spawn(move || worker::run(session, init, worker_ctx));
    if ctx.worker_tx.send(handle).is_err() {
        // The facade is gone; nobody will join the worker, but it
        // still tears itself down via the shutdown flag.
        info!("facade dropped the worker handle channel");
    }

    Ok(())
}
