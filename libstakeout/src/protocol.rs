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
    fmt::Write as _,
    io::{self, Read, Write},
    net::TcpStream,
    str,
};

use anyhow::Context;
use base64::{engine::general_purpose, Engine as _};
use quick_xml::events::{BytesStart, Event};
use stakeout_protocol::{
    ContextName, DbgpStatus, InitRecord, Property, RunResult, StreamRecord, WireError,
};
use tracing::{debug, trace};

use crate::{breakpoints::Breakpoint, consts};

/// One outgoing DBGP command. The wire form is
/// `cmd -i <tid> [-x val ...] [-- <base64-data>]NUL`; the transaction
/// id flag always comes first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: &'static str,
    tid: u32,
    flags: Vec<(char, String)>,
    data: Option<Vec<u8>>,
}

impl Command {
    pub fn new(name: &'static str, tid: u32) -> Self {
        Command { name, tid, flags: vec![], data: None }
    }

    pub fn flag<V: ToString>(mut self, letter: char, value: V) -> Self {
        self.flags.push((letter, value.to_string()));
        self
    }

    /// Attach a raw data argument. It rides at the end of the command
    /// behind `--`, base64 encoded.
    pub fn data<D: Into<Vec<u8>>>(mut self, data: D) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// Render the command in wire form, including the trailing NUL.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} -i {}", self.name, self.tid);
        for (letter, value) in &self.flags {
            // infallible, String's fmt::Write never errors
            let _ = write!(out, " -{letter} {value}");
        }
        if let Some(data) = &self.data {
            let _ = write!(out, " -- {}", general_purpose::STANDARD.encode(data));
        }
        let mut bytes = out.into_bytes();
        bytes.push(0);
        bytes
    }
}

/// A parsed DBGP frame. The root element of the payload tells us
/// which of the three frame shapes we are looking at.
#[derive(Debug)]
pub enum Frame {
    Init(InitRecord),
    Response(Response),
    Stream(StreamRecord),
}

/// The parts of a `<response>` element the engine consumes.
#[derive(Debug, Default)]
pub struct Response {
    pub command: String,
    pub transaction_id: String,
    pub status: Option<String>,
    pub reason: Option<String>,
    pub id: Option<String>,
    /// The `<error code=..>message</error>` child, if the runtime
    /// rejected the command.
    pub error: Option<String>,
    /// The `<xdebug:message filename=.. lineno=..>` child of a break
    /// response.
    pub message: Option<PauseLocation>,
    pub contexts: Vec<ContextName>,
    pub properties: Vec<Property>,
}

/// Where the runtime stopped, from the `<xdebug:message>` child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseLocation {
    pub filename: String,
    pub lineno: u32,
}

/// Read one `<len>NUL<payload>NUL` frame off the wire and return the
/// raw XML payload. The length prefix is decimal ASCII with no sign
/// and no leading whitespace, and both NUL separators must be present.
pub fn read_frame<R: Read>(r: &mut R) -> anyhow::Result<Vec<u8>> {
    let len = read_len(r)?;
    if len > consts::MAX_PAYLOAD_BYTES {
        return Err(WireError::Framing(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len,
            consts::MAX_PAYLOAD_BYTES
        ))
        .into());
    }

    let mut payload = vec![0; len];
    read_exact_or_closed(r, &mut payload)?;

    let mut nul = [0u8; 1];
    read_exact_or_closed(r, &mut nul)?;
    if nul[0] != 0 {
        return Err(WireError::Framing(format!(
            "expected NUL after payload, got 0x{:02x}",
            nul[0]
        ))
        .into());
    }

    Ok(payload)
}

/// Scan the decimal ASCII length prefix byte by byte until the NUL
/// separator.
fn read_len<R: Read>(r: &mut R) -> anyhow::Result<usize> {
    let mut digits: Vec<u8> = Vec::with_capacity(8);
    loop {
        let mut byte = [0u8; 1];
        let nread = match r.read(&mut byte) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_disconnect(&e) => return Err(WireError::SocketClosed.into()),
            Err(e) => return Err(e).context("reading frame length"),
        };
        if nread == 0 {
            return Err(WireError::SocketClosed.into());
        }
        match byte[0] {
            0 => break,
            b @ b'0'..=b'9' => digits.push(b),
            b => {
                return Err(WireError::Framing(format!(
                    "non-digit byte 0x{b:02x} in length prefix"
                ))
                .into())
            }
        }
        if digits.len() > 9 {
            return Err(
                WireError::Framing(String::from("length prefix longer than 9 digits")).into()
            );
        }
    }

    if digits.is_empty() {
        return Err(WireError::Framing(String::from("empty length prefix")).into());
    }
    let len = str::from_utf8(&digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| WireError::Framing(String::from("unparsable length prefix")))?;
    Ok(len)
}

fn read_exact_or_closed<R: Read>(r: &mut R, buf: &mut [u8]) -> anyhow::Result<()> {
    let mut off = 0;
    while off < buf.len() {
        let nread = match r.read(&mut buf[off..]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_disconnect(&e) => return Err(WireError::SocketClosed.into()),
            Err(e) => return Err(e).context("reading frame payload"),
        };
        if nread == 0 {
            return Err(WireError::SocketClosed.into());
        }
        off += nread;
    }
    Ok(())
}

fn write_all_or_closed<W: Write>(w: &mut W, buf: &[u8]) -> anyhow::Result<()> {
    match w.write_all(buf) {
        Ok(()) => Ok(()),
        Err(e) if is_disconnect(&e) => Err(WireError::SocketClosed.into()),
        Err(e) => Err(e).context("writing command bytes"),
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

fn xml_err<E: std::fmt::Display>(e: E) -> WireError {
    WireError::Xml(format!("{e}"))
}

/// Parse one frame payload. The root element must be `init`,
/// `response` or `stream`.
pub fn parse_frame(payload: &[u8]) -> anyhow::Result<Frame> {
    let text = str::from_utf8(payload)
        .map_err(|e| WireError::Xml(format!("payload is not utf-8: {e}")))?;
    let mut reader = quick_xml::Reader::from_str(text);

    // Scan forward to the root element, skipping the XML declaration
    // and any leading whitespace.
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => continue,
            Event::Text(t) => {
                let t = t.unescape().map_err(xml_err)?;
                if t.trim().is_empty() {
                    continue;
                }
                return Err(WireError::Xml(String::from("text before root element")).into());
            }
            Event::Start(e) => return parse_root(&mut reader, &e, false),
            Event::Empty(e) => return parse_root(&mut reader, &e, true),
            Event::Eof => {
                return Err(WireError::Xml(String::from("empty document")).into());
            }
            _ => return Err(WireError::Xml(String::from("unexpected content before root")).into()),
        }
    }
}

fn parse_root(
    reader: &mut quick_xml::Reader<&[u8]>,
    root: &BytesStart,
    self_closing: bool,
) -> anyhow::Result<Frame> {
    let attrs = attributes(root)?;
    match root.name().as_ref() {
        b"init" => Ok(Frame::Init(parse_init(&attrs))),
        b"response" => Ok(Frame::Response(parse_response(reader, attrs, self_closing)?)),
        b"stream" => Ok(Frame::Stream(parse_stream(reader, attrs, self_closing)?)),
        other => Err(WireError::Protocol(format!(
            "unexpected root element <{}>",
            String::from_utf8_lossy(other)
        ))
        .into()),
    }
}

fn attributes(e: &BytesStart) -> anyhow::Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| WireError::Xml(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| WireError::Xml(format!("bad attribute value: {e}")))?
            .into_owned();
        out.insert(key, value);
    }
    Ok(out)
}

fn attr(attrs: &BTreeMap<String, String>, key: &str) -> String {
    attrs.get(key).cloned().unwrap_or_default()
}

fn parse_init(attrs: &BTreeMap<String, String>) -> InitRecord {
    InitRecord {
        appid: attr(attrs, "appid"),
        idekey: attr(attrs, "idekey"),
        session: attr(attrs, "session"),
        thread: attr(attrs, "thread"),
        parent: attr(attrs, "parent"),
        language: attr(attrs, "language"),
        protocol_version: attr(attrs, "protocol_version"),
        file_uri: attr(attrs, "fileuri"),
    }
}

fn parse_u32(attrs: &BTreeMap<String, String>, key: &str, element: &str) -> anyhow::Result<u32> {
    let raw = attrs
        .get(key)
        .ok_or_else(|| WireError::Protocol(format!("<{element}> missing {key} attribute")))?;
    raw.parse().map_err(|_| {
        WireError::Protocol(format!("<{element}> has non-numeric {key} '{raw}'")).into()
    })
}

struct PropBuilder {
    prop: Property,
    raw: String,
}

impl PropBuilder {
    fn finish(self) -> anyhow::Result<Property> {
        let mut prop = self.prop;
        let raw = self.raw.trim();
        if !raw.is_empty() {
            if prop.encoding == "base64" {
                let bytes = general_purpose::STANDARD.decode(raw).map_err(|e| {
                    WireError::Protocol(format!(
                        "property '{}' carries invalid base64: {e}",
                        prop.fullname
                    ))
                })?;
                prop.data = Some(bytes);
            } else {
                prop.data = Some(raw.as_bytes().to_vec());
            }
        }
        Ok(prop)
    }
}

fn property_from(attrs: &BTreeMap<String, String>) -> Property {
    Property {
        name: attr(attrs, "name"),
        fullname: attr(attrs, "fullname"),
        data_type: attr(attrs, "type"),
        classname: attr(attrs, "classname"),
        constant: attr(attrs, "constant"),
        children: attr(attrs, "children"),
        size: attr(attrs, "size"),
        page: attr(attrs, "page"),
        pagesize: attr(attrs, "pagesize"),
        address: attr(attrs, "address"),
        key: attr(attrs, "key"),
        encoding: attr(attrs, "encoding"),
        numchildren: attr(attrs, "numchildren"),
        data: None,
    }
}

fn parse_response(
    reader: &mut quick_xml::Reader<&[u8]>,
    attrs: BTreeMap<String, String>,
    self_closing: bool,
) -> anyhow::Result<Response> {
    let mut resp = Response {
        command: attr(&attrs, "command"),
        transaction_id: attrs
            .get("transaction_id")
            .cloned()
            .ok_or_else(|| WireError::Protocol(String::from("<response> missing transaction_id")))?,
        status: attrs.get("status").cloned(),
        reason: attrs.get("reason").cloned(),
        id: attrs.get("id").cloned(),
        ..Response::default()
    };
    if self_closing {
        return Ok(resp);
    }

    // Properties nest (an array's members are `<property>` children of
    // the array's own `<property>` element). A stack flattens them the
    // same way the DOM's getElementsByTagName would.
    let mut prop_stack: Vec<PropBuilder> = vec![];
    let mut in_error = false;
    let mut error_code = String::new();
    let mut error_text = String::new();
    let mut depth = 1u32;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                depth += 1;
                let attrs = attributes(&e)?;
                match e.name().as_ref() {
                    b"property" => {
                        prop_stack.push(PropBuilder { prop: property_from(&attrs), raw: String::new() })
                    }
                    b"context" => resp.contexts.push(ContextName {
                        id: parse_u32(&attrs, "id", "context")?,
                        name: attr(&attrs, "name"),
                    }),
                    b"xdebug:message" => {
                        resp.message = Some(PauseLocation {
                            filename: attr(&attrs, "filename"),
                            lineno: parse_u32(&attrs, "lineno", "xdebug:message")?,
                        })
                    }
                    b"error" => {
                        in_error = true;
                        error_code = attr(&attrs, "code");
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => {
                let attrs = attributes(&e)?;
                match e.name().as_ref() {
                    b"property" => resp
                        .properties
                        .push(PropBuilder { prop: property_from(&attrs), raw: String::new() }.finish()?),
                    b"context" => resp.contexts.push(ContextName {
                        id: parse_u32(&attrs, "id", "context")?,
                        name: attr(&attrs, "name"),
                    }),
                    b"xdebug:message" => {
                        resp.message = Some(PauseLocation {
                            filename: attr(&attrs, "filename"),
                            lineno: parse_u32(&attrs, "lineno", "xdebug:message")?,
                        })
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                let t = t.unescape().map_err(xml_err)?;
                if let Some(top) = prop_stack.last_mut() {
                    top.raw.push_str(&t);
                } else if in_error {
                    error_text.push_str(&t);
                }
            }
            Event::CData(c) => {
                let t = String::from_utf8_lossy(&c.into_inner()).into_owned();
                if let Some(top) = prop_stack.last_mut() {
                    top.raw.push_str(&t);
                } else if in_error {
                    error_text.push_str(&t);
                }
            }
            Event::End(e) => {
                match e.name().as_ref() {
                    b"property" => {
                        if let Some(builder) = prop_stack.pop() {
                            resp.properties.push(builder.finish()?);
                        }
                    }
                    b"error" => {
                        in_error = false;
                        let text = error_text.trim();
                        resp.error = Some(if text.is_empty() {
                            format!("code {error_code}")
                        } else {
                            format!("{text} (code {error_code})")
                        });
                    }
                    _ => {}
                }
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Event::Eof => {
                return Err(WireError::Xml(String::from("truncated response document")).into())
            }
            _ => {}
        }
    }

    Ok(resp)
}

fn parse_stream(
    reader: &mut quick_xml::Reader<&[u8]>,
    attrs: BTreeMap<String, String>,
    self_closing: bool,
) -> anyhow::Result<StreamRecord> {
    let kind = attr(&attrs, "type");
    let encoding = attr(&attrs, "encoding");
    let mut raw = String::new();
    if !self_closing {
        let mut depth = 1u32;
        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(_) => depth += 1,
                Event::Text(t) => raw.push_str(&t.unescape().map_err(xml_err)?),
                Event::CData(c) => raw.push_str(&String::from_utf8_lossy(&c.into_inner())),
                Event::End(_) => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                Event::Eof => {
                    return Err(WireError::Xml(String::from("truncated stream document")).into())
                }
                _ => {}
            }
        }
    }

    let raw = raw.trim();
    let data = if encoding == "base64" && !raw.is_empty() {
        general_purpose::STANDARD
            .decode(raw)
            .map_err(|e| WireError::Protocol(format!("stream carries invalid base64: {e}")))?
    } else {
        raw.as_bytes().to_vec()
    };
    Ok(StreamRecord { kind, data })
}

/// A Session owns the socket for one accepted runtime connection and
/// issues DBGP commands over it. Commands are strictly serialized:
/// there is exactly one outstanding command at a time and its response
/// is consumed before the next command goes out. There is no
/// pipelining and no internal locking; after attach the worker thread
/// owns the session exclusively, so Session makes no attempt to be
/// thread safe.
pub struct Session<S = TcpStream> {
    pub(crate) stream: S,
    next_tid: u32,
    /// `stream` frames that arrived while we were waiting for a
    /// command response. The worker forwards them to the front-end.
    pending_streams: Vec<StreamRecord>,
}

impl<S: Read + Write> Session<S> {
    pub fn new(stream: S) -> Self {
        Session { stream, next_tid: 1, pending_streams: vec![] }
    }

    /// Block until the runtime's `init` frame arrives and return it.
    /// Must be called exactly once, immediately after the connection
    /// is accepted; any other frame in this position is fatal.
    pub fn attach(&mut self) -> anyhow::Result<InitRecord> {
        let payload = read_frame(&mut self.stream).context("reading init frame")?;
        match parse_frame(&payload)? {
            Frame::Init(init) => {
                debug!("attached: idekey={} fileuri={}", init.idekey, init.file_uri);
                Ok(init)
            }
            Frame::Response(_) | Frame::Stream(_) => {
                Err(WireError::Protocol(String::from("expected <init> as the first frame")).into())
            }
        }
    }

    /// Issue `status` and report what the runtime is up to.
    pub fn status(&mut self) -> anyhow::Result<DbgpStatus> {
        let tid = self.alloc_tid();
        let resp = self.execute(Command::new("status", tid))?;
        require_status(&resp)
    }

    /// Issue `run`. Blocks until the runtime pauses again or finishes.
    /// On a break the pause location is extracted from the
    /// `<xdebug:message>` child.
    pub fn run(&mut self) -> anyhow::Result<RunResult> {
        let tid = self.alloc_tid();
        let resp = self.execute(Command::new("run", tid))?;
        let status = require_status(&resp)?;
        if status == DbgpStatus::Break {
            let msg = match resp.message {
                Some(msg) => msg,
                None => {
                    return Err(WireError::Protocol(String::from(
                        "break response without an <xdebug:message> child",
                    ))
                    .into())
                }
            };
            Ok(RunResult { status, filename: Some(msg.filename), lineno: Some(msg.lineno) })
        } else {
            Ok(RunResult { status, filename: None, lineno: None })
        }
    }

    /// Push one breakpoint to the runtime. `remote_path` is the
    /// runtime-side path for the breakpoint's file, as derived by the
    /// path reconciler. Returns the runtime-assigned breakpoint id.
    pub fn breakpoint_set(
        &mut self,
        bp: &Breakpoint,
        remote_path: &str,
    ) -> anyhow::Result<String> {
        let tid = self.alloc_tid();
        let resp = self.execute(bp.to_command(tid, remote_path))?;
        if let Some(error) = resp.error {
            return Err(WireError::Protocol(format!("runtime rejected breakpoint: {error}")).into());
        }
        match resp.id {
            Some(id) => Ok(id),
            None => {
                Err(WireError::Protocol(String::from("breakpoint_set response without an id"))
                    .into())
            }
        }
    }

    /// List the contexts (Local/Global/Class and so on) the runtime
    /// exposes at the current position.
    pub fn get_context_names(&mut self) -> anyhow::Result<Vec<ContextName>> {
        let tid = self.alloc_tid();
        let resp = self.execute(Command::new("context_names", tid))?;
        Ok(resp.contexts)
    }

    /// Fetch the properties of one context, keyed by fullname. A
    /// context with no properties comes back as an empty map.
    pub fn get_context(
        &mut self,
        context_id: u32,
        stack_depth: u32,
    ) -> anyhow::Result<BTreeMap<String, Property>> {
        let tid = self.alloc_tid();
        let resp = self.execute(
            Command::new("context_get", tid).flag('d', stack_depth).flag('c', context_id),
        )?;
        let mut properties = BTreeMap::new();
        for prop in resp.properties {
            properties.insert(prop.fullname.clone(), prop);
        }
        Ok(properties)
    }

    /// Take the `stream` frames that piled up while commands were in
    /// flight.
    pub fn take_streams(&mut self) -> Vec<StreamRecord> {
        std::mem::take(&mut self.pending_streams)
    }

    fn alloc_tid(&mut self) -> u32 {
        let tid = self.next_tid;
        self.next_tid += 1;
        tid
    }

    /// Send one command and read frames until its response shows up.
    /// Stream frames that arrive in the meantime are buffered; anything
    /// else out of order is fatal.
    fn execute(&mut self, command: Command) -> anyhow::Result<Response> {
        let tid = command.tid();
        let bytes = command.encode();
        trace!("sending command: {}", String::from_utf8_lossy(&bytes[..bytes.len() - 1]));
        write_all_or_closed(&mut self.stream, &bytes)?;

        loop {
            let payload = read_frame(&mut self.stream).context("reading response frame")?;
            match parse_frame(&payload)? {
                Frame::Response(resp) => {
                    if resp.transaction_id != tid.to_string() {
                        return Err(WireError::Protocol(format!(
                            "expected transaction id {}, got '{}'",
                            tid, resp.transaction_id
                        ))
                        .into());
                    }
                    return Ok(resp);
                }
                Frame::Stream(stream) => {
                    trace!("buffering {} stream frame ({} bytes)", stream.kind, stream.data.len());
                    self.pending_streams.push(stream);
                }
                Frame::Init(_) => {
                    return Err(WireError::Protocol(String::from(
                        "unexpected <init> frame mid-session",
                    ))
                    .into())
                }
            }
        }
    }
}

impl Session<TcpStream> {
    /// Close the underlying socket. Used on teardown paths; errors are
    /// not interesting because the peer may already be gone.
    pub fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(std::net::Shutdown::Both) {
            debug!("shutting down session socket: {e}");
        }
    }
}

fn require_status(resp: &Response) -> anyhow::Result<DbgpStatus> {
    if let Some(error) = &resp.error {
        return Err(WireError::Protocol(format!(
            "runtime rejected {} command: {error}",
            resp.command
        ))
        .into());
    }
    match &resp.status {
        Some(s) => Ok(s.parse::<DbgpStatus>()?),
        None => Err(WireError::Protocol(format!(
            "{} response without a status attribute",
            resp.command
        ))
        .into()),
    }
}


#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::{testutil::*, *};

    const INIT_PAYLOAD: &str = r#"<init appid="APPID" idekey="IDE_KEY" session="DBGP_COOKIE" thread="THREAD_ID" parent="PARENT_APPID" language="LANGUAGE_NAME" protocol_version="1.0" fileuri="file://path/to/file"></init>"#;

    fn wire_error(err: &anyhow::Error) -> &WireError {
        err.root_cause().downcast_ref::<WireError>().expect("a WireError in the chain")
    }

    #[test]
    fn decodes_framed_payload() {
        let mut input = io::Cursor::new(frame(INIT_PAYLOAD));
        let payload = read_frame(&mut input).expect("frame to decode");
        assert_eq!(payload, INIT_PAYLOAD.as_bytes());
    }

    #[test]
    fn framing_rejects_non_digit_length() {
        let mut input = io::Cursor::new(b"12x\0whatever\0".to_vec());
        let err = read_frame(&mut input).expect_err("framing to fail");
        assert_matches!(wire_error(&err), WireError::Framing(_));
    }

    #[test]
    fn framing_rejects_missing_trailing_nul() {
        let mut input = io::Cursor::new(b"3\0abcX".to_vec());
        let err = read_frame(&mut input).expect_err("framing to fail");
        assert_matches!(wire_error(&err), WireError::Framing(_));
    }

    #[test]
    fn eof_mid_payload_is_socket_closed() {
        let mut input = io::Cursor::new(b"10\0abc".to_vec());
        let err = read_frame(&mut input).expect_err("read to fail");
        assert_matches!(wire_error(&err), WireError::SocketClosed);
    }

    #[test]
    fn eof_before_length_is_socket_closed() {
        let mut input = io::Cursor::new(vec![]);
        let err = read_frame(&mut input).expect_err("read to fail");
        assert_matches!(wire_error(&err), WireError::SocketClosed);
    }

    #[test]
    fn zero_length_payload_is_xml_error() {
        let mut input = io::Cursor::new(b"0\0\0".to_vec());
        let payload = read_frame(&mut input).expect("framing itself to succeed");
        let err = parse_frame(&payload).expect_err("parse to fail");
        assert_matches!(wire_error(&err), WireError::Xml(_));
    }

    #[test]
    fn unknown_root_is_protocol_error() {
        let err = parse_frame(b"<notify name=\"x\"/>").expect_err("parse to fail");
        assert_matches!(wire_error(&err), WireError::Protocol(_));
    }

    #[test]
    fn command_encoding_puts_transaction_id_first() {
        let cmd = Command::new("breakpoint_set", 7)
            .flag('t', "line")
            .flag('n', 42)
            .flag('f', "file:///srv/app/index.php")
            .flag('r', 1);
        assert_eq!(
            cmd.encode(),
            b"breakpoint_set -i 7 -t line -n 42 -f file:///srv/app/index.php -r 1\0".to_vec()
        );
    }

    #[test]
    fn command_encoding_base64s_data_arg() {
        let cmd = Command::new("eval", 3).data(b"$x == 1".to_vec());
        let encoded = cmd.encode();
        let text = String::from_utf8_lossy(&encoded[..encoded.len() - 1]).into_owned();
        assert_eq!(text, format!("eval -i 3 -- {}", general_purpose::STANDARD.encode(b"$x == 1")));
        assert_eq!(*encoded.last().expect("a trailing byte"), 0);
    }

    #[test]
    fn attach_parses_init_record() {
        let mut session = Session::new(MockStream::with_payload(frame(INIT_PAYLOAD)));
        let init = session.attach().expect("attach to succeed");
        assert_eq!(init.idekey, "IDE_KEY");
        assert_eq!(init.session, "DBGP_COOKIE");
        assert_eq!(init.thread, "THREAD_ID");
        assert_eq!(init.parent, "PARENT_APPID");
        assert_eq!(init.language, "LANGUAGE_NAME");
        assert_eq!(init.protocol_version, "1.0");
        assert_eq!(init.file_uri, "file://path/to/file");
    }

    #[test]
    fn attach_rejects_non_init_frame() {
        let payload = r#"<response command="status" status="starting" reason="ok" transaction_id="1"></response>"#;
        let mut session = Session::new(MockStream::with_payload(frame(payload)));
        let err = session.attach().expect_err("attach to fail");
        assert_matches!(wire_error(&err), WireError::Protocol(_));
    }

    #[test]
    fn status_returns_parsed_status() {
        let payload = r#"<response command="status" status="starting" reason="ok" transaction_id="1"></response>"#;
        let mut session = Session::new(MockStream::with_payload(frame(payload)));
        let status = session.status().expect("status to succeed");
        assert_eq!(status, DbgpStatus::Starting);
        assert_eq!(session.stream.commands(), vec![String::from("status -i 1")]);
    }

    #[test]
    fn transaction_id_mismatch_is_protocol_error() {
        let payload = r#"<response command="status" status="starting" reason="ok" transaction_id="9"></response>"#;
        let mut session = Session::new(MockStream::with_payload(frame(payload)));
        let err = session.status().expect_err("status to fail");
        assert_matches!(wire_error(&err), WireError::Protocol(_));
    }

    #[test]
    fn transaction_ids_increase_per_command() {
        let mut input = frame(
            r#"<response command="status" status="starting" reason="ok" transaction_id="1"></response>"#,
        );
        input.extend_from_slice(&frame(
            r#"<response command="status" status="running" reason="ok" transaction_id="2"></response>"#,
        ));
        let mut session = Session::new(MockStream::with_payload(input));
        assert_eq!(session.status().expect("first status"), DbgpStatus::Starting);
        assert_eq!(session.status().expect("second status"), DbgpStatus::Running);
        assert_eq!(
            session.stream.commands(),
            vec![String::from("status -i 1"), String::from("status -i 2")]
        );
    }

    #[test]
    fn run_break_extracts_pause_location() {
        let payload = r#"<response command="run" status="break" reason="ok" transaction_id="1"><xdebug:message filename="file:///srv/app/public/index.php" lineno="42"/></response>"#;
        let mut session = Session::new(MockStream::with_payload(frame(payload)));
        let result = session.run().expect("run to succeed");
        assert_eq!(result.status, DbgpStatus::Break);
        assert_eq!(result.filename.as_deref(), Some("file:///srv/app/public/index.php"));
        assert_eq!(result.lineno, Some(42));
    }

    #[test]
    fn run_stopping_has_no_location() {
        let payload =
            r#"<response command="run" status="stopping" reason="ok" transaction_id="1"></response>"#;
        let mut session = Session::new(MockStream::with_payload(frame(payload)));
        let result = session.run().expect("run to succeed");
        assert_eq!(result.status, DbgpStatus::Stopping);
        assert_eq!(result.filename, None);
        assert_eq!(result.lineno, None);
    }

    #[test]
    fn run_break_without_message_is_protocol_error() {
        let payload =
            r#"<response command="run" status="break" reason="ok" transaction_id="1"></response>"#;
        let mut session = Session::new(MockStream::with_payload(frame(payload)));
        let err = session.run().expect_err("run to fail");
        assert_matches!(wire_error(&err), WireError::Protocol(_));
    }

    #[test]
    fn context_names_lists_every_context() {
        let payload = r#"<response command="context_names" transaction_id="1"><context name="Local" id="0"/><context name="Global" id="1"/><context name="Class" id="2"/></response>"#;
        let mut session = Session::new(MockStream::with_payload(frame(payload)));
        let names = session.get_context_names().expect("context_names to succeed");
        assert_eq!(
            names,
            vec![
                ContextName { id: 0, name: String::from("Local") },
                ContextName { id: 1, name: String::from("Global") },
                ContextName { id: 2, name: String::from("Class") },
            ]
        );
    }

    #[test]
    fn context_get_keys_properties_by_fullname() {
        let encoded = general_purpose::STANDARD.encode(b"hello");
        let payload = format!(
            r#"<response command="context_get" transaction_id="1"><property name="greeting" fullname="$greeting" type="string" size="5" encoding="base64">{encoded}</property><property name="count" fullname="$count" type="int">3</property></response>"#
        );
        let mut session = Session::new(MockStream::with_payload(frame(&payload)));
        let context = session.get_context(0, 0).expect("context_get to succeed");
        assert_eq!(
            session.stream.commands(),
            vec![String::from("context_get -i 1 -d 0 -c 0")]
        );

        let greeting = &context["$greeting"];
        assert_eq!(greeting.name, "greeting");
        assert_eq!(greeting.data_type, "string");
        assert_eq!(greeting.data.as_deref(), Some(b"hello".as_slice()));

        let count = &context["$count"];
        assert_eq!(count.data.as_deref(), Some(b"3".as_slice()));
    }

    #[test]
    fn context_get_flattens_nested_properties() {
        let payload = r#"<response command="context_get" transaction_id="1"><property name="arr" fullname="$arr" type="array" children="1" numchildren="1"><property name="0" fullname="$arr[0]" type="int">7</property></property></response>"#;
        let mut session = Session::new(MockStream::with_payload(frame(payload)));
        let context = session.get_context(0, 0).expect("context_get to succeed");
        assert_eq!(context.len(), 2);
        assert!(context.contains_key("$arr"));
        assert_eq!(context["$arr[0]"].data.as_deref(), Some(b"7".as_slice()));
    }

    #[test]
    fn context_get_empty_context_is_empty_map() {
        let payload = r#"<response command="context_get" transaction_id="1"></response>"#;
        let mut session = Session::new(MockStream::with_payload(frame(payload)));
        let context = session.get_context(0, 0).expect("context_get to succeed");
        assert!(context.is_empty());
    }

    #[test]
    fn stream_frames_are_buffered_until_taken() {
        let stream_payload = format!(
            r#"<stream type="stdout" encoding="base64">{}</stream>"#,
            general_purpose::STANDARD.encode(b"some output\n")
        );
        let mut input = frame(&stream_payload);
        input.extend_from_slice(&frame(
            r#"<response command="status" status="break" reason="ok" transaction_id="1"></response>"#,
        ));
        let mut session = Session::new(MockStream::with_payload(input));
        let status = session.status().expect("status to succeed");
        assert_eq!(status, DbgpStatus::Break);

        let streams = session.take_streams();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].kind, "stdout");
        assert_eq!(streams[0].data, b"some output\n".to_vec());
        assert!(session.take_streams().is_empty());
    }

    #[test]
    fn error_response_surfaces_runtime_message() {
        let payload = r#"<response command="status" transaction_id="1"><error code="5"><message>command is not available</message></error></response>"#;
        let mut session = Session::new(MockStream::with_payload(frame(payload)));
        let err = session.status().expect_err("status to fail");
        let msg = format!("{}", wire_error(&err));
        assert!(msg.contains("command is not available"));
        assert!(msg.contains("code 5"));
    }
}
