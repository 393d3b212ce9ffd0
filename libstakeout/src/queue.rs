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
    collections::VecDeque,
    fmt,
    sync::{Condvar, Mutex},
};

use crate::hooks::DebuggerState;

/// A semantic action the front-end schedules against the live
/// session. The worker pops these off the queue and runs them one at
/// a time.
pub enum Operation {
    /// Resume the runtime until it breaks or finishes. The optional
    /// callback fires with the resulting state before the `on_paused`
    /// hook does.
    Run { done: Option<Box<dyn FnOnce(&DebuggerState) + Send>> },
    /// Push one stored breakpoint (identified by its registry
    /// position) to the runtime.
    SetBreakpoint { file_name: String, index: usize },
    /// Fetch the properties of another context at the current pause
    /// position.
    ChangeContext { context_id: u32 },
}

impl Operation {
    pub fn run() -> Self {
        Operation::Run { done: None }
    }
}

// Manual because the Run callback has no Debug.
impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operation::Run { done } => {
                write!(f, "Run {{ done: {} }}", if done.is_some() { "Some(_)" } else { "None" })
            }
            Operation::SetBreakpoint { file_name, index } => {
                write!(f, "SetBreakpoint {{ file_name: {file_name:?}, index: {index} }}")
            }
            Operation::ChangeContext { context_id } => {
                write!(f, "ChangeContext {{ context_id: {context_id} }}")
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    ops: VecDeque<Operation>,
    shutdown: bool,
}

/// The FIFO hand-off point between the front-end and the session
/// worker. Producers append and signal; the worker moves everything
/// out in one go and re-waits when there is nothing left. The
/// shutdown flag lives under the same lock so a worker can never miss
/// it between the check and the wait.
#[derive(Default)]
pub struct OperationQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation and wake the worker. Returns false if the
    /// queue has been shut down, in which case the operation is
    /// dropped.
    pub fn enqueue(&self, op: Operation) -> bool {
        // unwrap to propagate lock poisoning
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown {
            return false;
        }
        inner.ops.push_back(op);
        self.cond.notify_all();
        true
    }

    /// Move every queued operation out in enqueue order. Blocks until
    /// at least one operation is available or the queue is shut down;
    /// after shutdown it returns whatever is left without waiting.
    pub fn drain(&self) -> Vec<Operation> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.shutdown || !inner.ops.is_empty() {
                return inner.ops.drain(..).collect();
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Flip the shutdown flag and wake any blocked worker.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        self.cond.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().unwrap().shutdown
    }
}
