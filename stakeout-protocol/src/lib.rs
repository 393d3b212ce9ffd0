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

//! Bare data types for the DBGP wire protocol. Wire types are plain
//! structs; the framing and XML handling that produces them lives in
//! the engine crate.

use std::{fmt, str};

/// InitRecord holds the attributes of the `<init>` element, the first
/// frame a runtime sends after dialing in. All fields are attested by
/// the runtime and immutable for the lifetime of the session. A field
/// the runtime left off parses as an empty string rather than an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitRecord {
    pub appid: String,
    pub idekey: String,
    pub session: String,
    pub thread: String,
    pub parent: String,
    pub language: String,
    pub protocol_version: String,
    /// Absolute URI of the script the runtime paused in, typically of
    /// the form `file:///srv/app/index.php`.
    pub file_uri: String,
}

/// The execution status a runtime reports in its responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbgpStatus {
    Starting,
    Stopping,
    Stopped,
    Running,
    Break,
}

impl DbgpStatus {
    /// Terminal states mean the runtime is done executing and the
    /// session is about to go away.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DbgpStatus::Stopped | DbgpStatus::Stopping)
    }
}

impl str::FromStr for DbgpStatus {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(DbgpStatus::Starting),
            "stopping" => Ok(DbgpStatus::Stopping),
            "stopped" => Ok(DbgpStatus::Stopped),
            "running" => Ok(DbgpStatus::Running),
            "break" => Ok(DbgpStatus::Break),
            _ => Err(WireError::Protocol(format!("unknown status '{s}'"))),
        }
    }
}

impl fmt::Display for DbgpStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DbgpStatus::Starting => "starting",
            DbgpStatus::Stopping => "stopping",
            DbgpStatus::Stopped => "stopped",
            DbgpStatus::Running => "running",
            DbgpStatus::Break => "break",
        };
        f.write_str(s)
    }
}

/// What a `run` command came back with. `filename` and `lineno` are
/// only present when the runtime stopped on a breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub status: DbgpStatus,
    pub filename: Option<String>,
    pub lineno: Option<u32>,
}

/// One entry from a `context_names` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextName {
    pub id: u32,
    pub name: String,
}

/// A variable reported by `context_get`. The attributes are recorded
/// as the runtime sent them; missing attributes become empty strings.
/// `data` holds the decoded value payload if one was present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub fullname: String,
    pub data_type: String,
    pub classname: String,
    pub constant: String,
    pub children: String,
    pub size: String,
    pub page: String,
    pub pagesize: String,
    pub address: String,
    pub key: String,
    pub encoding: String,
    pub numchildren: String,
    pub data: Option<Vec<u8>>,
}

/// Output the runtime forwarded over a `<stream>` frame (stdout or
/// stderr of the debugged program).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    /// Which stream this came from, `stdout` or `stderr`.
    pub kind: String,
    pub data: Vec<u8>,
}

/// The session-fatal error taxonomy for the wire. Everything here
/// except `SocketClosed` indicates a peer we can no longer trust;
/// there is no resync, the session just ends.
#[derive(Debug)]
pub enum WireError {
    /// The peer closed the connection (EOF mid-frame or between
    /// frames).
    SocketClosed,
    /// Malformed length prefix or missing NUL separator.
    Framing(String),
    /// The payload was not well-formed XML.
    Xml(String),
    /// Well-formed XML that violates the DBGP exchange: unexpected
    /// root element, missing required attribute, transaction id
    /// mismatch.
    Protocol(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireError::SocketClosed => f.write_str("socket closed"),
            WireError::Framing(msg) => write!(f, "framing error: {msg}"),
            WireError::Xml(msg) => write!(f, "xml error: {msg}"),
            WireError::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for WireError {}
