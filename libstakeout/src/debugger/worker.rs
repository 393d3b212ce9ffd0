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

use std::{collections::BTreeMap, sync::atomic::Ordering};

use anyhow::Context;
use stakeout_protocol::{DbgpStatus, InitRecord, RunResult, WireError};
use tracing::{debug, error, info, instrument, warn};

use super::EngineCtx;
use crate::{
    hooks::{emit, DebuggerState, DetachReason},
    protocol::Session,
    queue::Operation,
};

/// The session worker: one thread per attached session, spawned by
/// the listener, draining the operation queue against the session
/// until the runtime goes away or the engine shuts down.
#[instrument(skip_all)]
pub(crate) fn run(mut session: Session, init: InitRecord, ctx: EngineCtx) {
    let reason = drive(&mut session, &init, &ctx);

    // Teardown happens here on every exit path: close the socket,
    // forget the per-session path mapping, flip the connected flag,
    // and only then tell the front-end.
    session.shutdown();
    {
        let mut shared = ctx.shared.lock().unwrap();
        shared.connected = false;
        shared.conn = None;
        shared.reconciler.clear();
    }
    info!("session ended: {reason:?}");
    emit(ctx.hooks.on_detached(reason));
}

fn drive(session: &mut Session, init: &InitRecord, ctx: &EngineCtx) -> DetachReason {
    emit(ctx.hooks.on_attached(init));

    // Work out which local file the runtime's URI corresponds to;
    // everything breakpoint-shaped depends on this mapping.
    let local = {
        let mut shared = ctx.shared.lock().unwrap();
        shared.reconciler.reconcile(&init.file_uri, ctx.fs.as_ref())
    };
    match local {
        Some(local) => {
            debug!("runtime file {} is local file {}", init.file_uri, local);
            let reconciler = ctx.shared.lock().unwrap().reconciler.clone();
            let replayed = {
                let mut registry = ctx.registry.lock().unwrap();
                registry.replay(session, &reconciler, ctx.hooks.as_ref())
            };
            if let Err(e) = replayed {
                return classify(&e);
            }
        }
        None => {
            warn!("could not reconcile {} against the local base path", init.file_uri);
            emit(ctx.hooks.on_message(&format!(
                "no local file matches {}; breakpoints will not be set",
                init.file_uri
            )));
        }
    }

    // One status probe so the front-end knows what it attached to.
    match session.status() {
        Ok(status) => emit(ctx.hooks.on_message(&format!("runtime status: {status}"))),
        Err(e) => {
            if ctx.shutdown.load(Ordering::Acquire) {
                return DetachReason::Requested;
            }
            return classify(&e);
        }
    }
    forward_streams(session, ctx);

    loop {
        if ctx.shutdown.load(Ordering::Acquire) {
            return DetachReason::Requested;
        }
        let ops = ctx.queue.drain();
        if ops.is_empty() {
            // drain only comes back empty once the queue is shut down
            return DetachReason::Requested;
        }
        for op in ops {
            // An operation in flight when stop() lands gets to finish,
            // but the rest of the batch is abandoned.
            if ctx.shutdown.load(Ordering::Acquire) {
                return DetachReason::Requested;
            }
            let flow = execute(op, session, ctx);
            forward_streams(session, ctx);
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished) => return DetachReason::Finished,
                Err(e) => {
                    // stop() interrupts in-flight commands by closing
                    // the socket; that read error is not the peer's
                    // fault.
                    if ctx.shutdown.load(Ordering::Acquire) {
                        return DetachReason::Requested;
                    }
                    return classify(&e);
                }
            }
        }
    }
}

enum Flow {
    Continue,
    Finished,
}

fn execute(op: Operation, session: &mut Session, ctx: &EngineCtx) -> anyhow::Result<Flow> {
    debug!("executing {op:?}");
    match op {
        Operation::Run { done } => {
            let result = session.run().context("executing run")?;
            let state = build_state(result, session, ctx)?;
            if let Some(done) = done {
                done(&state);
            }
            emit(ctx.hooks.on_paused(&state));
            if state.status.is_terminal() {
                return Ok(Flow::Finished);
            }
            Ok(Flow::Continue)
        }
        Operation::SetBreakpoint { file_name, index } => {
            let remote = ctx.shared.lock().unwrap().reconciler.remote_path_for(&file_name);
            let remote = match remote {
                Some(remote) => remote,
                None => {
                    emit(ctx.hooks.on_message(&format!(
                        "no remote path for {file_name}; breakpoint not sent"
                    )));
                    return Ok(Flow::Continue);
                }
            };
            let bp = match ctx.registry.lock().unwrap().get(&file_name, index) {
                Some(bp) => bp.clone(),
                None => {
                    warn!("breakpoint {file_name}[{index}] vanished from the registry");
                    return Ok(Flow::Continue);
                }
            };
            match session.breakpoint_set(&bp, &remote) {
                Ok(id) => {
                    if let Some(stored) = ctx.registry.lock().unwrap().get_mut(&file_name, index) {
                        stored.set_id(id);
                    }
                    emit(ctx.hooks.on_message(&format!("breakpoint set at {}", bp.describe())));
                }
                Err(e) => match e.root_cause().downcast_ref::<WireError>() {
                    Some(WireError::Protocol(_)) => {
                        emit(ctx.hooks.on_message(&format!(
                            "failed to set breakpoint at {}: {e:#}",
                            bp.describe()
                        )));
                    }
                    _ => return Err(e),
                },
            }
            Ok(Flow::Continue)
        }
        Operation::ChangeContext { context_id } => {
            let names = session.get_context_names().context("listing contexts")?;
            let context =
                session.get_context(context_id, 0).context("fetching context properties")?;
            emit(ctx.hooks.on_context(&names, &context));
            Ok(Flow::Continue)
        }
    }
}

/// Turn a run result into the state the front-end renders: resolve
/// the pause location to a local file and pull the variable contexts
/// while the runtime is stopped there.
fn build_state(
    result: RunResult,
    session: &mut Session,
    ctx: &EngineCtx,
) -> anyhow::Result<DebuggerState> {
    if result.status != DbgpStatus::Break {
        return Ok(DebuggerState {
            status: result.status,
            file_name: None,
            line_number: None,
            context_names: vec![],
            context: BTreeMap::new(),
        });
    }

    let context_names = session.get_context_names().context("listing contexts")?;
    let context = session.get_context(0, 0).context("fetching context properties")?;
    let file_name = result.filename.as_deref().and_then(|uri| {
        let mut shared = ctx.shared.lock().unwrap();
        shared.reconciler.reconcile(uri, ctx.fs.as_ref())
    });
    if file_name.is_none() {
        debug!("pause location {:?} has no local counterpart", result.filename);
    }

    Ok(DebuggerState {
        status: result.status,
        file_name,
        line_number: result.lineno,
        context_names,
        context,
    })
}

/// Sort a session-fatal error into a detach reason. A peer hangup is
/// a normal way for a session to end; everything else means the
/// conversation went off the rails.
fn classify(err: &anyhow::Error) -> DetachReason {
    match err.root_cause().downcast_ref::<WireError>() {
        Some(WireError::SocketClosed) => {
            info!("session closed by peer: {err:#}");
            DetachReason::Eof
        }
        Some(_) => {
            error!("session-fatal wire error: {err:?}");
            DetachReason::Protocol
        }
        None => {
            error!("session error: {err:?}");
            DetachReason::Protocol
        }
    }
}

/// Pass any buffered runtime output (stdout/stderr stream frames)
/// along to the front-end.
fn forward_streams(session: &mut Session, ctx: &EngineCtx) {
    for stream in session.take_streams() {
        let text = String::from_utf8_lossy(&stream.data);
        emit(ctx.hooks.on_message(&format!("[{}] {}", stream.kind, text.trim_end())));
    }
}
