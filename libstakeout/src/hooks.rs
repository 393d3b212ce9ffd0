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

use std::collections::BTreeMap;

use stakeout_protocol::{ContextName, DbgpStatus, InitRecord, Property};
use tracing::warn;

/// Everything a front-end needs to render a pause: where the runtime
/// stopped and what is in scope there. Built once per pause event and
/// never mutated. `file_name` is the local relative path when the
/// reported URI reconciled against the base directory, and absent
/// otherwise (or when the runtime finished rather than breaking).
#[derive(Debug, Clone)]
pub struct DebuggerState {
    pub status: DbgpStatus,
    pub file_name: Option<String>,
    pub line_number: Option<u32>,
    pub context_names: Vec<ContextName>,
    pub context: BTreeMap<String, Property>,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    /// The runtime closed the connection.
    Eof,
    /// The runtime reported a terminal status and the engine hung up.
    Finished,
    /// The session died to a framing, XML or protocol violation.
    Protocol,
    /// `stop()` was called on the facade.
    Requested,
}

/// Callbacks the front-end implements to observe the engine. They are
/// invoked inline on engine threads (the listener and the session
/// worker), so implementations MUST NOT block for extended periods of
/// time; a front-end with its own event loop should forward these
/// into a channel and return.
///
/// Any errors returned will simply be logged.
///
/// All hooks do nothing by default.
pub trait Hooks {
    /// The engine has bound its socket and is waiting for a runtime
    /// to dial in.
    fn on_listening(&self, _host: &str, _port: u16) -> anyhow::Result<()> {
        Ok(())
    }

    /// A runtime connected and its `init` frame was accepted.
    fn on_attached(&self, _init: &InitRecord) -> anyhow::Result<()> {
        Ok(())
    }

    /// Free-form text the front-end should show the user: runtime
    /// output, non-fatal errors, progress notes.
    fn on_message(&self, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// A `run` operation completed and the runtime is paused (or
    /// finished; check the status).
    fn on_paused(&self, _state: &DebuggerState) -> anyhow::Result<()> {
        Ok(())
    }

    /// A context switch completed.
    fn on_context(
        &self,
        _names: &[ContextName],
        _context: &BTreeMap<String, Property>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// The session ended. The engine keeps listening for the next
    /// runtime connection unless the detach was requested.
    fn on_detached(&self, _reason: DetachReason) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hook results are never load bearing for the engine; log and move
/// on.
pub(crate) fn emit(res: anyhow::Result<()>) {
    if let Err(e) = res {
        warn!("hook returned an error: {e:#}");
    }
}
