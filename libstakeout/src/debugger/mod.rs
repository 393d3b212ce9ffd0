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

use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
};

use anyhow::{anyhow, Context};
use crossbeam_channel as channel;
use tracing::{debug, info, instrument, warn};

mod listener;
mod worker;

use crate::{
    breakpoints::{Breakpoint, BreakpointRegistry},
    fs::FileSystem,
    hooks::{self, Hooks},
    queue::{Operation, OperationQueue},
    reconcile::PathReconciler,
};

/// Mutable engine state shared between the front-end thread, the
/// listener thread and the session worker. Small enough that one
/// mutex around the lot is the whole concurrency story; the operation
/// queue has its own lock.
pub(crate) struct Shared {
    /// Whether a session is currently attached. The listener consults
    /// this to refuse second connections; the facade consults it to
    /// drop operations enqueued with nobody to run them.
    pub connected: bool,
    /// A clone of the live session's socket so `stop()` can shut it
    /// down and wake a worker blocked in a read. The worker owns the
    /// session itself.
    pub conn: Option<TcpStream>,
    pub reconciler: PathReconciler,
    pub listen_addr: Option<SocketAddr>,
}

/// The bundle of shared handles the listener and worker threads run
/// with.
#[derive(Clone)]
pub(crate) struct EngineCtx {
    pub hooks: Arc<dyn Hooks + Send + Sync>,
    pub fs: Arc<dyn FileSystem + Send + Sync>,
    pub registry: Arc<Mutex<BreakpointRegistry>>,
    pub queue: Arc<OperationQueue>,
    pub shared: Arc<Mutex<Shared>>,
    pub shutdown: Arc<AtomicBool>,
    /// Worker join handles flow back to the facade over this channel
    /// so `stop()` can join them.
    pub worker_tx: channel::Sender<thread::JoinHandle<()>>,
}

/// The debugger engine facade. Owns the breakpoint registry, the
/// operation queue and the path reconciler, accepts at most one
/// runtime session at a time, and reports everything that happens
/// through the injected [`Hooks`].
pub struct Debugger {
    ctx: EngineCtx,
    host: String,
    port: u16,
    listener: Option<thread::JoinHandle<()>>,
    worker_rx: channel::Receiver<thread::JoinHandle<()>>,
}

impl Debugger {
    pub fn new(
        base_path: PathBuf,
        host: String,
        port: u16,
        ui: Arc<dyn Hooks + Send + Sync>,
        fs: Arc<dyn FileSystem + Send + Sync>,
    ) -> Self {
        let (worker_tx, worker_rx) = channel::unbounded();
        Debugger {
            ctx: EngineCtx {
                hooks: ui,
                fs,
                registry: Arc::new(Mutex::new(BreakpointRegistry::new())),
                queue: Arc::new(OperationQueue::new()),
                shared: Arc::new(Mutex::new(Shared {
                    connected: false,
                    conn: None,
                    reconciler: PathReconciler::new(base_path),
                    listen_addr: None,
                })),
                shutdown: Arc::new(AtomicBool::new(false)),
                worker_tx,
            },
            host,
            port,
            listener: None,
            worker_rx,
        }
    }

    /// Bind the listening socket and spawn the listener thread. The
    /// engine waits for runtimes from here on; it never dials out.
    #[instrument(skip_all)]
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.listener.is_some() {
            return Err(anyhow!("engine already started"));
        }

        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .with_context(|| format!("binding to {}:{}", self.host, self.port))?;
        let addr = listener.local_addr().context("getting bound address")?;
        info!("listening on {addr}");
        {
            // unwrap to propagate lock poisoning
            let mut shared = self.ctx.shared.lock().unwrap();
            shared.listen_addr = Some(addr);
        }
        hooks::emit(self.ctx.hooks.on_listening(&self.host, addr.port()));

        let ctx = self.ctx.clone();
        self.listener = Some(thread::spawn(move || listener::serve(listener, ctx)));
        Ok(())
    }

    /// Tear the whole engine down: detach any live session, stop the
    /// listener and join every thread we spawned. After this returns
    /// no engine thread is running and no engine socket is open.
    #[instrument(skip_all)]
    pub fn stop(&mut self) -> anyhow::Result<()> {
        info!("stopping engine");
        self.ctx.shutdown.store(true, Ordering::Release);
        self.ctx.queue.shutdown();

        let listen_addr = {
            let mut shared = self.ctx.shared.lock().unwrap();
            if let Some(conn) = shared.conn.take() {
                // wakes a worker blocked in a socket read
                if let Err(e) = conn.shutdown(std::net::Shutdown::Both) {
                    debug!("shutting down session socket: {e}");
                }
            }
            shared.listen_addr.take()
        };

        // The listener blocks in accept; a throwaway connection gets
        // it to come around and notice the shutdown flag.
        if let Some(addr) = listen_addr {
            match TcpStream::connect(addr) {
                Ok(stream) => drop(stream),
                Err(e) => debug!("listener wake connect: {e}"),
            }
        }

        if let Some(handle) = self.listener.take() {
            if handle.join().is_err() {
                warn!("listener thread panicked");
            }
        }
        for handle in self.worker_rx.try_iter() {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }

        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.shared.lock().unwrap().connected
    }

    /// The address the engine actually bound, once started. Mostly
    /// interesting when the configured port was 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ctx.shared.lock().unwrap().listen_addr
    }

    /// Record a breakpoint. It is pushed to the current session right
    /// away (via the operation queue) if one is attached, and replayed
    /// onto every future session.
    pub fn add_breakpoint(&self, bp: Breakpoint) {
        let (file_name, index) = {
            let mut registry = self.ctx.registry.lock().unwrap();
            let file_name = bp.file_name().to_string();
            registry.add(bp);
            (file_name.clone(), registry.for_file(&file_name).len() - 1)
        };
        if self.is_connected() {
            self.ctx.queue.enqueue(Operation::SetBreakpoint { file_name, index });
        }
    }

    /// The stored breakpoints for one file, in insertion order.
    pub fn breakpoints_for(&self, file_name: &str) -> Vec<Breakpoint> {
        self.ctx.registry.lock().unwrap().for_file(file_name).to_vec()
    }

    /// Schedule an operation against the current session. Without a
    /// session there is nothing to run it against, so it is quietly
    /// dropped; the return value says which happened.
    pub fn enqueue_operation(&self, op: Operation) -> bool {
        if !self.is_connected() {
            debug!("dropping {op:?}: no session attached");
            return false;
        }
        self.ctx.queue.enqueue(op)
    }

    /// Map a runtime-reported file URI to a local path relative to the
    /// base directory, deriving the client base path as a side effect.
    pub fn find_file(&self, file_uri: &str) -> Option<String> {
        let mut shared = self.ctx.shared.lock().unwrap();
        shared.reconciler.reconcile(file_uri, self.ctx.fs.as_ref())
    }

    /// Read a source file. With `relative` set the path is taken to be
    /// relative to the configured base directory.
    pub fn open_file(&self, path: &str, relative: bool) -> anyhow::Result<Vec<u8>> {
        let full = if relative {
            let shared = self.ctx.shared.lock().unwrap();
            shared.reconciler.base_path().join(path)
        } else {
            PathBuf::from(path)
        };
        self.ctx.fs.read(&full)
    }
}
