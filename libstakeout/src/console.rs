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

//! The bundled line-oriented front-end. The engine only requires the
//! `Hooks` surface, so anything from an editor plugin to a full TUI
//! can sit in this seat; this one keeps the tool usable from a bare
//! terminal.

use std::{
    collections::BTreeMap,
    io::{self, BufRead},
    thread,
};

use anyhow::Context;
use crossbeam_channel as channel;
use stakeout_protocol::{ContextName, InitRecord, Property};
use tracing::{debug, info};

use crate::{
    breakpoints::Breakpoint,
    consts,
    debugger::Debugger,
    hooks::{DebuggerState, DetachReason, Hooks},
    queue::Operation,
};

/// Everything the front-end can learn about, in owned form so it can
/// cross from the engine threads to the UI thread.
pub(crate) enum Event {
    Listening { host: String, port: u16 },
    Attached(InitRecord),
    Message(String),
    Paused(DebuggerState),
    Context { names: Vec<ContextName>, context: BTreeMap<String, Property> },
    Detached(DetachReason),
    /// A termination signal arrived; shut down cleanly.
    Interrupted,
}

/// The engine invokes hooks from its own threads; this impl just
/// ships each event over a channel so the UI thread can render at its
/// leisure.
pub(crate) struct ConsoleHooks {
    tx: channel::Sender<Event>,
}

impl ConsoleHooks {
    pub fn new(tx: channel::Sender<Event>) -> Self {
        ConsoleHooks { tx }
    }
}

impl Hooks for ConsoleHooks {
    fn on_listening(&self, host: &str, port: u16) -> anyhow::Result<()> {
        self.tx
            .send(Event::Listening { host: host.to_string(), port })
            .context("forwarding listening event")
    }

    fn on_attached(&self, init: &InitRecord) -> anyhow::Result<()> {
        self.tx.send(Event::Attached(init.clone())).context("forwarding attach event")
    }

    fn on_message(&self, text: &str) -> anyhow::Result<()> {
        self.tx.send(Event::Message(text.to_string())).context("forwarding message")
    }

    fn on_paused(&self, state: &DebuggerState) -> anyhow::Result<()> {
        self.tx.send(Event::Paused(state.clone())).context("forwarding pause event")
    }

    fn on_context(
        &self,
        names: &[ContextName],
        context: &BTreeMap<String, Property>,
    ) -> anyhow::Result<()> {
        self.tx
            .send(Event::Context { names: names.to_vec(), context: context.clone() })
            .context("forwarding context event")
    }

    fn on_detached(&self, reason: DetachReason) -> anyhow::Result<()> {
        self.tx.send(Event::Detached(reason)).context("forwarding detach event")
    }
}

enum Next {
    Continue,
    Quit,
}

/// Run the console loop until the user quits or stdin goes away.
/// Takes ownership of the debugger; it is stopped before returning.
pub(crate) fn run(mut debugger: Debugger, events: channel::Receiver<Event>) -> anyhow::Result<()> {
    debugger.start()?;

    // stdin is its own blocking read, so it gets its own thread and
    // everything funnels into the select below.
    let (input_tx, input_rx) = channel::unbounded();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            if input_tx.send(line).is_err() {
                break;
            }
        }
        debug!("stdin closed");
    });

    println!("stakeout: type 'help' for commands");
    let res = loop {
        channel::select! {
            recv(events) -> event => match event {
                Ok(event) => {
                    if let Next::Quit = render_event(&debugger, event) {
                        break Ok(());
                    }
                }
                Err(_) => break Ok(()),
            },
            recv(input_rx) -> line => match line {
                Ok(line) => {
                    if let Next::Quit = handle_command(&debugger, line.trim()) {
                        break Ok(());
                    }
                }
                // stdin went away; keep serving events is pointless
                // for an interactive tool, so wind down.
                Err(_) => break Ok(()),
            },
        }
    };

    debugger.stop()?;
    res
}

fn render_event(debugger: &Debugger, event: Event) -> Next {
    match event {
        Event::Listening { host, port } => {
            println!("listening on {host}:{port}");
        }
        Event::Attached(init) => {
            println!(
                "runtime attached: language={} protocol={} idekey={}",
                init.language, init.protocol_version, init.idekey
            );
            println!("  entry point: {}", init.file_uri);
        }
        Event::Message(text) => println!("{text}"),
        Event::Paused(state) => render_pause(debugger, &state),
        Event::Context { names, context } => {
            render_context(&names, &context);
        }
        Event::Detached(reason) => {
            let text = match reason {
                DetachReason::Eof => "runtime disconnected",
                DetachReason::Finished => "runtime finished",
                DetachReason::Protocol => "session aborted on a protocol error",
                DetachReason::Requested => "session detached",
            };
            println!("{text}; listening for the next connection");
        }
        Event::Interrupted => {
            info!("interrupt received, shutting down");
            return Next::Quit;
        }
    }
    Next::Continue
}

fn render_pause(debugger: &Debugger, state: &DebuggerState) {
    match (&state.file_name, state.line_number) {
        (Some(file), Some(line)) => {
            println!("paused at {file}:{line}");
            match debugger.open_file(file, true) {
                Ok(content) => {
                    let breakpoints: Vec<u32> = debugger
                        .breakpoints_for(file)
                        .iter()
                        .map(|bp| match bp {
                            Breakpoint::Line { line_number, .. } => *line_number,
                        })
                        .collect();
                    print_source(&content, Some(line), &breakpoints);
                }
                Err(e) => println!("could not read {file}: {e:#}"),
            }
            render_context(&state.context_names, &state.context);
        }
        _ => println!("runtime status: {}", state.status),
    }
}

fn render_context(names: &[ContextName], context: &BTreeMap<String, Property>) {
    if !names.is_empty() {
        let list: Vec<String> =
            names.iter().map(|name| format!("{}={}", name.id, name.name)).collect();
        println!("contexts: {}", list.join(" "));
    }
    for (fullname, prop) in context {
        let value = match &prop.data {
            Some(data) => {
                let text = String::from_utf8_lossy(data);
                let mut preview: String = text.chars().take(60).collect();
                if text.chars().count() > 60 {
                    preview.push('…');
                }
                format!(" = {preview}")
            }
            None => String::new(),
        };
        let data_type =
            if prop.data_type.is_empty() { String::from("?") } else { prop.data_type.clone() };
        println!("  {fullname} ({data_type}){value}");
    }
}

/// Print a window of source around `current`, marking the paused line
/// and any lines carrying breakpoints.
fn print_source(content: &[u8], current: Option<u32>, breakpoints: &[u32]) {
    let text = String::from_utf8_lossy(content);
    let lines: Vec<&str> = text.lines().collect();

    let (first, last) = match current {
        Some(current) => {
            let current = current as usize;
            (
                current.saturating_sub(consts::SOURCE_CONTEXT_LINES + 1),
                (current + consts::SOURCE_CONTEXT_LINES).min(lines.len()),
            )
        }
        None => (0, lines.len()),
    };

    for (i, line) in lines.iter().enumerate().take(last).skip(first) {
        let lineno = (i + 1) as u32;
        let marker = if Some(lineno) == current {
            "=>"
        } else if breakpoints.contains(&lineno) {
            " B"
        } else {
            "  "
        };
        println!("{marker} {lineno:4} {line}");
    }
}

fn handle_command(debugger: &Debugger, line: &str) -> Next {
    let mut words = line.split_whitespace();
    let command = match words.next() {
        Some(command) => command,
        None => return Next::Continue,
    };
    let args: Vec<&str> = words.collect();

    match command {
        "r" | "run" => {
            if !debugger.enqueue_operation(Operation::run()) {
                println!("no runtime attached; waiting for a connection");
            }
        }
        "b" | "break" => match parse_breakpoint(&args) {
            Some((file, line)) => {
                debugger.add_breakpoint(Breakpoint::line(file.to_string(), line));
                println!("breakpoint recorded at {file}:{line}");
            }
            None => println!("usage: break <file> <line>"),
        },
        "c" | "context" => {
            let context_id = args.first().and_then(|raw| raw.parse().ok()).unwrap_or(0);
            if !debugger.enqueue_operation(Operation::ChangeContext { context_id }) {
                println!("no runtime attached; waiting for a connection");
            }
        }
        "o" | "open" => match args.first() {
            Some(path) => match debugger.open_file(path, true) {
                Ok(content) => {
                    let breakpoints: Vec<u32> = debugger
                        .breakpoints_for(path)
                        .iter()
                        .map(|bp| match bp {
                            Breakpoint::Line { line_number, .. } => *line_number,
                        })
                        .collect();
                    print_source(&content, None, &breakpoints);
                }
                Err(e) => println!("could not read {path}: {e:#}"),
            },
            None => println!("usage: open <file>"),
        },
        "h" | "help" | "?" => print_help(),
        "q" | "quit" | "exit" => return Next::Quit,
        other => println!("unknown command '{other}'; type 'help' for commands"),
    }
    Next::Continue
}

fn parse_breakpoint<'a>(args: &[&'a str]) -> Option<(&'a str, u32)> {
    match args {
        [file, line] => {
            let line: u32 = line.parse().ok()?;
            if line == 0 {
                return None;
            }
            Some((file, line))
        }
        _ => None,
    }
}

fn print_help() {
    println!("commands:");
    println!("  run                resume the runtime (r)");
    println!("  break <file> <ln>  set a line breakpoint (b)");
    println!("  context [id]       show variables for a context (c)");
    println!("  open <file>        print a source file (o)");
    println!("  help               this text (h)");
    println!("  quit               detach and exit (q)");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn breakpoint_args_parse() {
        assert_eq!(parse_breakpoint(&["index.php", "42"]), Some(("index.php", 42)));
        assert_eq!(parse_breakpoint(&["index.php"]), None);
        assert_eq!(parse_breakpoint(&["index.php", "nope"]), None);
        assert_eq!(parse_breakpoint(&["index.php", "0"]), None);
        assert_eq!(parse_breakpoint(&[]), None);
    }
}
