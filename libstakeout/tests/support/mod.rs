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

//! Test harness: a scripted stand-in for a DBGP runtime plus a hook
//! implementation that records everything the engine reports.

use std::{
    collections::BTreeMap,
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::Arc,
    thread, time,
};

use crossbeam_channel as channel;
use libstakeout::{Debugger, DebuggerState, DetachReason, Hooks, OsFileSystem};
use stakeout_protocol::{ContextName, InitRecord, Property};

pub const EVENT_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// Plays the runtime side of the wire: dials the engine, frames
/// payloads, and reads the engine's NUL-terminated commands.
pub struct MockRuntime {
    stream: TcpStream,
}

impl MockRuntime {
    pub fn connect(addr: SocketAddr) -> Self {
        let mut last_err = None;
        for _ in 0..50 {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(EVENT_TIMEOUT))
                        .expect("setting mock read timeout");
                    return MockRuntime { stream };
                }
                Err(e) => {
                    last_err = Some(e);
                    thread::sleep(time::Duration::from_millis(20));
                }
            }
        }
        panic!("could not connect to the engine at {addr}: {last_err:?}");
    }

    /// Write one payload with the `<len>NUL<payload>NUL` framing.
    pub fn send_frame(&mut self, payload: &str) {
        let mut out = payload.len().to_string().into_bytes();
        out.push(0);
        out.extend_from_slice(payload.as_bytes());
        out.push(0);
        self.stream.write_all(&out).expect("writing frame to engine");
    }

    pub fn send_init(&mut self, file_uri: &str) {
        self.send_frame(&format!(
            r#"<init appid="APPID" idekey="IDE_KEY" session="DBGP_COOKIE" thread="THREAD_ID" parent="PARENT_APPID" language="PHP" protocol_version="1.0" fileuri="{file_uri}"></init>"#
        ));
    }

    /// Read one NUL-terminated command off the wire.
    pub fn expect_command(&mut self) -> String {
        let mut bytes = vec![];
        let mut byte = [0u8; 1];
        loop {
            let nread = self.stream.read(&mut byte).expect("reading command byte");
            if nread == 0 {
                panic!(
                    "engine closed the connection mid-command; got '{}'",
                    String::from_utf8_lossy(&bytes)
                );
            }
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
        }
        String::from_utf8(bytes).expect("command to be utf-8")
    }

    /// Assert the engine closed this connection without sending
    /// anything.
    pub fn expect_eof(&mut self) {
        let mut byte = [0u8; 1];
        let nread = self.stream.read(&mut byte).expect("reading from refused connection");
        assert_eq!(nread, 0, "expected EOF, engine sent 0x{:02x}", byte[0]);
    }
}

/// Pull the `-i` argument back out of a command so responses can echo
/// it.
pub fn tid_of(command: &str) -> String {
    let mut words = command.split_whitespace();
    while let Some(word) = words.next() {
        if word == "-i" {
            return words.next().expect("a transaction id after -i").to_string();
        }
    }
    panic!("command '{command}' has no -i flag");
}

pub fn respond_status(runtime: &mut MockRuntime, command: &str, status: &str) {
    let tid = tid_of(command);
    runtime.send_frame(&format!(
        r#"<response command="status" status="{status}" reason="ok" transaction_id="{tid}"></response>"#
    ));
}

pub fn respond_breakpoint_set(runtime: &mut MockRuntime, command: &str, id: &str) {
    let tid = tid_of(command);
    runtime.send_frame(&format!(
        r#"<response command="breakpoint_set" transaction_id="{tid}" id="{id}"></response>"#
    ));
}

/// Everything the engine reported, in owned form.
#[derive(Debug, Clone)]
pub enum Seen {
    Listening(u16),
    Attached(InitRecord),
    Message(String),
    Paused(DebuggerState),
    Context { names: Vec<ContextName>, properties: BTreeMap<String, Property> },
    Detached(DetachReason),
}

/// A `Hooks` impl that forwards every callback into a channel so
/// tests can assert on the stream of events.
pub struct Recorder {
    tx: channel::Sender<Seen>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, channel::Receiver<Seen>) {
        let (tx, rx) = channel::unbounded();
        (Arc::new(Recorder { tx }), rx)
    }
}

impl Hooks for Recorder {
    fn on_listening(&self, _host: &str, port: u16) -> anyhow::Result<()> {
        self.tx.send(Seen::Listening(port))?;
        Ok(())
    }

    fn on_attached(&self, init: &InitRecord) -> anyhow::Result<()> {
        self.tx.send(Seen::Attached(init.clone()))?;
        Ok(())
    }

    fn on_message(&self, text: &str) -> anyhow::Result<()> {
        self.tx.send(Seen::Message(text.to_string()))?;
        Ok(())
    }

    fn on_paused(&self, state: &DebuggerState) -> anyhow::Result<()> {
        self.tx.send(Seen::Paused(state.clone()))?;
        Ok(())
    }

    fn on_context(
        &self,
        names: &[ContextName],
        context: &BTreeMap<String, Property>,
    ) -> anyhow::Result<()> {
        self.tx.send(Seen::Context { names: names.to_vec(), properties: context.clone() })?;
        Ok(())
    }

    fn on_detached(&self, reason: DetachReason) -> anyhow::Result<()> {
        self.tx.send(Seen::Detached(reason))?;
        Ok(())
    }
}

/// An engine listening on an ephemeral port with a scratch base
/// directory and recorded events.
pub struct TestEngine {
    pub debugger: Debugger,
    pub events: channel::Receiver<Seen>,
    pub addr: SocketAddr,
    pub dir: tempfile::TempDir,
}

pub fn start_engine() -> TestEngine {
    let dir = tempfile::tempdir().expect("creating scratch dir");
    let (hooks, events) = Recorder::new();
    let mut debugger = Debugger::new(
        dir.path().to_path_buf(),
        String::from("127.0.0.1"),
        0,
        hooks,
        Arc::new(OsFileSystem),
    );
    debugger.start().expect("engine to start");
    let addr = debugger.local_addr().expect("a bound address");
    TestEngine { debugger, events, addr, dir }
}

pub fn next_event(events: &channel::Receiver<Seen>) -> Seen {
    events.recv_timeout(EVENT_TIMEOUT).expect("an engine event")
}

/// Skip forward to the first event matching the predicate.
pub fn wait_for<F>(events: &channel::Receiver<Seen>, pred: F) -> Seen
where
    F: Fn(&Seen) -> bool,
{
    loop {
        let event = next_event(events);
        if pred(&event) {
            return event;
        }
    }
}
