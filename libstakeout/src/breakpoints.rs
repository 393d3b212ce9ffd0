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
    collections::BTreeMap,
    io::{Read, Write},
};

use stakeout_protocol::WireError;
use tracing::{debug, info};

use crate::{
    hooks::{self, Hooks},
    protocol::{Command, Session},
    reconcile::PathReconciler,
};

/// A breakpoint the user wants applied to every session. Only line
/// breakpoints exist today; the variants DBGP defines for call,
/// return, exception and watch breakpoints slot in beside `Line` when
/// they grow a front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Breakpoint {
    Line {
        /// Local path of the file, relative to the configured base
        /// directory.
        file_name: String,
        line_number: u32,
        enabled: bool,
        /// The runtime-assigned id, populated once the breakpoint has
        /// been pushed to a live session. Opaque to us.
        id: Option<String>,
    },
}

impl Breakpoint {
    pub fn line(file_name: String, line_number: u32) -> Self {
        Breakpoint::Line { file_name, line_number, enabled: true, id: None }
    }

    pub fn file_name(&self) -> &str {
        match self {
            Breakpoint::Line { file_name, .. } => file_name,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Breakpoint::Line { id, .. } => id.as_deref(),
        }
    }

    pub fn set_id(&mut self, new_id: String) {
        match self {
            Breakpoint::Line { id, .. } => *id = Some(new_id),
        }
    }

    /// "file:line" for log lines and front-end messages.
    pub fn describe(&self) -> String {
        match self {
            Breakpoint::Line { file_name, line_number, .. } => {
                format!("{file_name}:{line_number}")
            }
        }
    }

    /// Build the `breakpoint_set` command for this breakpoint.
    /// `remote_path` is the runtime-side path for the file.
    pub(crate) fn to_command(&self, tid: u32, remote_path: &str) -> Command {
        match self {
            Breakpoint::Line { line_number, enabled, .. } => {
                Command::new("breakpoint_set", tid)
                    .flag('t', "line")
                    .flag('n', *line_number)
                    .flag('f', remote_path)
                    .flag('r', i32::from(*enabled))
            }
        }
    }
}

/// The in-memory set of breakpoints, keyed by local file name. It is
/// created with the facade and outlives individual sessions; a fresh
/// session gets the whole set replayed onto it right after attach.
///
/// Files iterate in lexicographic order and breakpoints within a file
/// keep insertion order, so replay order is stable. Duplicate
/// file/line pairs are allowed; the runtime decides what to make of
/// them.
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    files: BTreeMap<String, Vec<Breakpoint>>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the file's sequence, creating it if this is the
    /// file's first breakpoint.
    pub fn add(&mut self, bp: Breakpoint) {
        debug!("recording breakpoint at {}", bp.describe());
        self.files.entry(bp.file_name().to_string()).or_default().push(bp);
    }

    /// The breakpoints stored for one file, in insertion order.
    pub fn for_file(&self, file_name: &str) -> &[Breakpoint] {
        self.files.get(file_name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get(&self, file_name: &str, index: usize) -> Option<&Breakpoint> {
        self.files.get(file_name).and_then(|bps| bps.get(index))
    }

    pub fn get_mut(&mut self, file_name: &str, index: usize) -> Option<&mut Breakpoint> {
        self.files.get_mut(file_name).and_then(|bps| bps.get_mut(index))
    }

    pub fn len(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.files.values().all(Vec::is_empty)
    }

    /// Push every stored breakpoint onto a freshly attached session
    /// and record the ids the runtime hands back. Replay is best
    /// effort: a breakpoint the runtime rejects is reported through
    /// the front-end and skipped, but a dead socket aborts the whole
    /// pass since nothing else will work either.
    pub fn replay<S: Read + Write>(
        &mut self,
        session: &mut Session<S>,
        reconciler: &PathReconciler,
        ui: &dyn Hooks,
    ) -> anyhow::Result<()> {
        for (file_name, bps) in self.files.iter_mut() {
            let remote_path = match reconciler.remote_path_for(file_name) {
                Some(path) => path,
                None => {
                    hooks::emit(ui.on_message(&format!(
                        "no remote path for {file_name}, skipping its breakpoints"
                    )));
                    continue;
                }
            };
            for bp in bps.iter_mut() {
                match session.breakpoint_set(bp, &remote_path) {
                    Ok(id) => {
                        info!("breakpoint {} registered as id {}", bp.describe(), id);
                        bp.set_id(id);
                    }
                    Err(e) => match e.root_cause().downcast_ref::<WireError>() {
                        Some(WireError::Protocol(_)) => {
                            hooks::emit(ui.on_message(&format!(
                                "failed to set breakpoint at {}: {e:#}",
                                bp.describe()
                            )));
                        }
                        _ => return Err(e),
                    },
                }
            }
        }
        Ok(())
    }
}
