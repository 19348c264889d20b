//! Binary TCP adapter with header framing described in configuration.
//!
//! A fixed-size header carries the message type and the body size; the
//! per-message-type configuration sections describe how to decode the body
//! into named fields. When the header carries no size, bodies are read
//! until the configured footer appears. The canonical text of a frame is a
//! JSON object of its decoded fields, repacked byte-exact on replay.
//!
//! Three reserved ASCII headers are recognised on their first eight bytes
//! and handled as line-oriented control messages instead of framed binary.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use log::{debug, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::{RcConfig, GENERAL_SECTION};
use crate::dispatcher::Forward;
use crate::error::{Error, Result};
use crate::server::ServerState;
use crate::traffic::{wire, TrafficItem, TrafficTag};

pub const HEADER_SECTION: &str = "tcp_header";

/// The reserved ASCII prefixes, compared against the first eight bytes.
const ASCII_CONTROL_PREFIXES: [&[u8; 8]; 3] = [b"SUT_SERV", b"TERMINAT", b"CAPTUREM"];

/// A `struct`-style pack/unpack codec: an optional endianness prefix
/// followed by count-code items, e.g. `>HH16s`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldCodec {
    big_endian: bool,
    items: Vec<(usize, char)>,
}

impl FieldCodec {
    pub fn parse(format: &str) -> Option<Self> {
        let mut chars = format.chars().peekable();
        let big_endian = match chars.peek() {
            Some('>') => {
                chars.next();
                true
            }
            Some('<') => {
                chars.next();
                false
            }
            _ => true,
        };
        let mut items = Vec::new();
        let mut count = String::new();
        for c in chars {
            if c.is_ascii_digit() {
                count.push(c);
                continue;
            }
            if !matches!(c, 'b' | 'B' | 'h' | 'H' | 'i' | 'I' | 'l' | 'L' | 'q' | 'Q' | 's' | 'x')
            {
                return None;
            }
            let n: usize = if count.is_empty() { 1 } else { count.parse().ok()? };
            count.clear();
            items.push((n, c));
        }
        if !count.is_empty() {
            return None;
        }
        Some(Self { big_endian, items })
    }

    fn code_size(code: char) -> usize {
        match code {
            'b' | 'B' | 'x' | 's' => 1,
            'h' | 'H' => 2,
            'i' | 'I' | 'l' | 'L' => 4,
            'q' | 'Q' => 8,
            _ => 0,
        }
    }

    /// The fixed byte size of one packed record.
    pub fn size(&self) -> usize {
        self.items
            .iter()
            .map(|&(count, code)| count * Self::code_size(code))
            .sum()
    }

    /// Decode one packed record into JSON values, one per field. An `s`
    /// item is one string; a counted numeric item yields `count` numbers.
    pub fn unpack(&self, bytes: &[u8]) -> Option<Vec<Value>> {
        if bytes.len() < self.size() {
            return None;
        }
        let mut buffer = bytes;
        let mut values = Vec::new();
        for &(count, code) in &self.items {
            match code {
                's' => {
                    let raw = buffer.copy_to_bytes(count);
                    let text = String::from_utf8_lossy(&raw)
                        .trim_end_matches('\0')
                        .to_string();
                    values.push(Value::String(text));
                }
                'x' => buffer.advance(count),
                _ => {
                    for _ in 0..count {
                        values.push(self.read_number(&mut buffer, code)?);
                    }
                }
            }
        }
        Some(values)
    }

    fn read_number(&self, buffer: &mut &[u8], code: char) -> Option<Value> {
        let value = match (code, self.big_endian) {
            ('b', _) => i64::from(buffer.get_i8()),
            ('B', _) => i64::from(buffer.get_u8()),
            ('h', true) => i64::from(buffer.get_i16()),
            ('h', false) => i64::from(buffer.get_i16_le()),
            ('H', true) => i64::from(buffer.get_u16()),
            ('H', false) => i64::from(buffer.get_u16_le()),
            ('i' | 'l', true) => i64::from(buffer.get_i32()),
            ('i' | 'l', false) => i64::from(buffer.get_i32_le()),
            ('I' | 'L', true) => i64::from(buffer.get_u32()),
            ('I' | 'L', false) => i64::from(buffer.get_u32_le()),
            ('q', true) => buffer.get_i64(),
            ('q', false) => buffer.get_i64_le(),
            ('Q', true) => i64::try_from(buffer.get_u64()).ok()?,
            ('Q', false) => i64::try_from(buffer.get_u64_le()).ok()?,
            _ => return None,
        };
        Some(json!(value))
    }

    /// Re-encode values produced by [`unpack`](Self::unpack).
    pub fn pack(&self, values: &[Value]) -> Option<Vec<u8>> {
        let mut buffer = BytesMut::with_capacity(self.size());
        let mut next = values.iter();
        for &(count, code) in &self.items {
            match code {
                's' => {
                    let text = next.next()?.as_str()?;
                    let mut raw = text.as_bytes().to_vec();
                    raw.resize(count, 0);
                    buffer.put_slice(&raw);
                }
                'x' => buffer.put_bytes(0, count),
                _ => {
                    for _ in 0..count {
                        let number = next.next()?.as_i64()?;
                        self.write_number(&mut buffer, code, number)?;
                    }
                }
            }
        }
        Some(buffer.to_vec())
    }

    fn write_number(&self, buffer: &mut BytesMut, code: char, number: i64) -> Option<()> {
        match (code, self.big_endian) {
            ('b', _) => buffer.put_i8(i8::try_from(number).ok()?),
            ('B', _) => buffer.put_u8(u8::try_from(number).ok()?),
            ('h', true) => buffer.put_i16(i16::try_from(number).ok()?),
            ('h', false) => buffer.put_i16_le(i16::try_from(number).ok()?),
            ('H', true) => buffer.put_u16(u16::try_from(number).ok()?),
            ('H', false) => buffer.put_u16_le(u16::try_from(number).ok()?),
            ('i' | 'l', true) => buffer.put_i32(i32::try_from(number).ok()?),
            ('i' | 'l', false) => buffer.put_i32_le(i32::try_from(number).ok()?),
            ('I' | 'L', true) => buffer.put_u32(u32::try_from(number).ok()?),
            ('I' | 'L', false) => buffer.put_u32_le(u32::try_from(number).ok()?),
            ('q', true) => buffer.put_i64(number),
            ('q', false) => buffer.put_i64_le(number),
            ('Q', true) => buffer.put_u64(u64::try_from(number).ok()?),
            ('Q', false) => buffer.put_u64_le(u64::try_from(number).ok()?),
            _ => return None,
        }
        Some(())
    }
}

/// One message schema: named fields over a codec, with assumed and
/// enforced values and an optional subtype selector.
#[derive(Debug, Clone)]
pub struct MessageSchema {
    pub fields: Vec<String>,
    pub codec: FieldCodec,
    /// Field values filled in when packing, checked loosely when present.
    pub assume: Vec<(String, Value)>,
    /// Field values that must match for the schema to apply.
    pub enforce: Vec<(String, Value)>,
    /// Body field whose value selects a finer `[<type>.<value>]` schema.
    pub subtype: Option<String>,
    /// The body may legitimately be shorter than the schema.
    pub incomplete: bool,
}

impl MessageSchema {
    pub fn from_section(config: &RcConfig, section: &str) -> Option<Self> {
        let format = config.get(section, "format")?;
        let codec = FieldCodec::parse(format)?;
        let parse_pairs = |key: &str| {
            config
                .get_list(section, key)
                .iter()
                .filter_map(|pair| {
                    let (field, value) = pair.split_once('=')?;
                    let value = value
                        .parse::<i64>()
                        .map(|n| json!(n))
                        .unwrap_or_else(|_| Value::String(value.to_string()));
                    Some((field.to_string(), value))
                })
                .collect::<Vec<_>>()
        };
        Some(Self {
            fields: config.get_list(section, "fields"),
            codec,
            assume: parse_pairs("assume"),
            enforce: parse_pairs("enforce"),
            subtype: config.get(section, "subtype").map(str::to_string),
            incomplete: config.get_bool(section, "incomplete", false),
        })
    }

    /// Decode bytes into a field-name to value map.
    pub fn decode(&self, bytes: &[u8]) -> Option<BTreeMap<String, Value>> {
        let values = self.codec.unpack(bytes)?;
        let map: BTreeMap<String, Value> = self
            .fields
            .iter()
            .cloned()
            .zip(values)
            .collect();
        for (field, expected) in &self.enforce {
            if map.get(field) != Some(expected) {
                return None;
            }
        }
        Some(map)
    }

    pub fn encode(&self, map: &BTreeMap<String, Value>) -> Option<Vec<u8>> {
        let values: Vec<Value> = self
            .fields
            .iter()
            .map(|field| {
                map.get(field)
                    .or_else(|| {
                        self.assume
                            .iter()
                            .find(|(name, _)| name == field)
                            .map(|(_, value)| value)
                    })
                    .cloned()
                    .unwrap_or(json!(0))
            })
            .collect();
        self.codec.pack(&values)
    }
}

/// The whole framing grammar: header schema, size/type field names, the
/// optional footer and the per-message-type body schemas.
#[derive(Debug, Clone)]
pub struct Framing {
    pub header: MessageSchema,
    pub size_field: String,
    pub type_field: String,
    pub footer: Option<Vec<u8>>,
    config: RcConfig,
}

impl Framing {
    pub fn from_config(config: &RcConfig) -> Option<Self> {
        let header = MessageSchema::from_section(config, HEADER_SECTION)?;
        Some(Self {
            header,
            size_field: config
                .get_or(HEADER_SECTION, "size_field", "body_size")
                .to_string(),
            type_field: config
                .get_or(HEADER_SECTION, "type_field", "msg_type")
                .to_string(),
            footer: config
                .get(GENERAL_SECTION, "tcp_footer")
                .map(|footer| unescape_bytes(footer)),
            config: config.clone(),
        })
    }

    pub fn header_size(&self) -> usize {
        self.header.codec.size()
    }

    fn type_section(&self, header: &BTreeMap<String, Value>) -> Option<String> {
        let value = header.get(&self.type_field)?;
        let name = match value {
            Value::String(name) => name.clone(),
            other => other.to_string(),
        };
        self.config.has_section(&name).then_some(name)
    }

    /// Decode header plus body into the canonical JSON text.
    pub fn decode_frame(&self, header_bytes: &[u8], body: &[u8]) -> Option<String> {
        let header = self.header.decode(header_bytes)?;
        let mut rendered = BTreeMap::new();
        for (field, value) in &header {
            if field != &self.size_field {
                rendered.insert(field.clone(), value.clone());
            }
        }
        match self.type_section(&header) {
            Some(section) => {
                let schema = MessageSchema::from_section(&self.config, &section)?;
                let sub_size = schema.codec.size();
                let readable = if schema.incomplete {
                    body.len().min(sub_size)
                } else {
                    sub_size
                };
                let decoded = schema.decode(body.get(..readable)?)?;
                let mut remainder = &body[readable..];
                if let Some(subtype_field) = &schema.subtype {
                    if let Some(value) = decoded.get(subtype_field) {
                        let sub_section = format!("{section}.{}", text_of(value));
                        if let Some(sub_schema) =
                            MessageSchema::from_section(&self.config, &sub_section)
                        {
                            if let Some(sub_map) = sub_schema.decode(remainder) {
                                remainder = &remainder[sub_schema.codec.size().min(remainder.len())..];
                                rendered.extend(sub_map);
                            }
                        }
                    }
                }
                rendered.extend(decoded);
                if !remainder.is_empty() {
                    rendered.insert("_trailing".to_string(), json!(hex_encode(remainder)));
                }
            }
            None => {
                rendered.insert("_raw".to_string(), json!(hex_encode(body)));
            }
        }
        serde_json::to_string(&rendered).ok()
    }

    /// Re-encode a canonical JSON text into header plus body bytes.
    pub fn encode_frame(&self, text: &str) -> Option<Vec<u8>> {
        let rendered: BTreeMap<String, Value> = serde_json::from_str(text).ok()?;
        let body = match rendered.get("_raw") {
            Some(raw) => hex_decode(raw.as_str()?)?,
            None => {
                let mut header_view = BTreeMap::new();
                for field in &self.header.fields {
                    if let Some(value) = rendered.get(field) {
                        header_view.insert(field.clone(), value.clone());
                    }
                }
                let section = self.type_section(&header_view)?;
                let schema = MessageSchema::from_section(&self.config, &section)?;
                let mut body = schema.encode(&rendered)?;
                if let Some(subtype_field) = &schema.subtype {
                    if let Some(value) = rendered.get(subtype_field) {
                        let sub_section = format!("{section}.{}", text_of(value));
                        if let Some(sub_schema) =
                            MessageSchema::from_section(&self.config, &sub_section)
                        {
                            body.extend(sub_schema.encode(&rendered)?);
                        }
                    }
                }
                if let Some(trailing) = rendered.get("_trailing").and_then(Value::as_str) {
                    body.extend(hex_decode(trailing)?);
                }
                body
            }
        };

        let mut header_map: BTreeMap<String, Value> = rendered
            .iter()
            .filter(|(field, _)| self.header.fields.contains(field))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();
        header_map.insert(self.size_field.clone(), json!(body.len() as i64));
        let mut frame = self.header.encode(&header_map)?;
        frame.extend(body);
        if let Some(footer) = &self.footer {
            if !self.header.fields.iter().any(|f| f == &self.size_field) {
                frame.extend_from_slice(footer);
            }
        }
        Some(frame)
    }

    fn has_size_field(&self) -> bool {
        self.header.fields.iter().any(|field| field == &self.size_field)
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

/// Interpret `\xNN`, `\r`, `\n`, `\0` escapes in a configured footer.
fn unescape_bytes(text: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut utf8 = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            continue;
        }
        match chars.next() {
            Some('x') => {
                let hi = chars.next().unwrap_or('0');
                let lo = chars.next().unwrap_or('0');
                let value = u8::from_str_radix(&format!("{hi}{lo}"), 16).unwrap_or(0);
                bytes.push(value);
            }
            Some('r') => bytes.push(b'\r'),
            Some('n') => bytes.push(b'\n'),
            Some('0') => bytes.push(0),
            Some(other) => {
                let mut utf8 = [0u8; 4];
                bytes.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes());
            }
            None => {}
        }
    }
    bytes
}

pub async fn run(state: Arc<ServerState>, listener: TcpListener) {
    let Some(framing) = Framing::from_config(&state.config) else {
        warn!("No [tcp_header] framing configured, falling back to line traffic");
        return super::line_tcp::run(state, listener).await;
    };
    let framing = Arc::new(framing);

    // Secondary listener for synchronisation between related mock servers.
    if let Ok(synch_listener) = TcpListener::bind("127.0.0.1:0").await {
        if let Ok(address) = synch_listener.local_addr() {
            debug!("Synch listener on {address}");
        }
        let synch_state = state.clone();
        tokio::spawn(run_synch(synch_state, synch_listener));
    }

    loop {
        if state.is_stopping() {
            break;
        }
        tokio::select! {
            _ = state.shutdown.notified() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {e}");
                        continue;
                    }
                };
                debug!("Framed TCP connection from {peer}");
                let conn_state = state.clone();
                let conn_framing = framing.clone();
                state.spawn_handler(async move {
                    if let Err(e) = handle_connection(conn_state, conn_framing, stream).await {
                        debug!("Framed connection ended: {e}");
                    }
                });
            }
        }
    }
    debug!("Framed TCP listener closed");
}

/// Accept `CAPTUREMOCK_SYNCH` / `CAPTUREMOCK_STATUS` probes.
async fn run_synch(state: Arc<ServerState>, listener: TcpListener) {
    loop {
        if state.is_stopping() {
            break;
        }
        tokio::select! {
            _ = state.shutdown.notified() => break,
            accepted = listener.accept() => {
                let Ok((mut stream, _)) = accepted else { continue };
                let mut line = vec![0u8; 64];
                let Ok(length) = stream.read(&mut line).await else { continue };
                let message = String::from_utf8_lossy(&line[..length]);
                let reply = if message.starts_with(wire::SYNCH) {
                    "OK\n".to_string()
                } else if message.starts_with(wire::STATUS) {
                    "SERVING\n".to_string()
                } else {
                    continue;
                };
                let _ = stream.write_all(reply.as_bytes()).await;
            }
        }
    }
}

async fn handle_connection(
    state: Arc<ServerState>,
    framing: Arc<Framing>,
    mut stream: TcpStream,
) -> Result<()> {
    let header_timeout = Duration::from_secs_f64(
        state
            .config
            .get_float(GENERAL_SECTION, "header_timeout", 0.5),
    );
    let mut pending: Vec<u8> = Vec::new();
    loop {
        // The ASCII control prefixes share the stream with framed binary;
        // they are decided on the first eight bytes.
        if !fill_to(&mut stream, &mut pending, 8, header_timeout).await? {
            return Ok(());
        }
        let first_eight: [u8; 8] = pending[..8].try_into().expect("eight bytes buffered");
        if ASCII_CONTROL_PREFIXES.iter().any(|prefix| **prefix == first_eight) {
            let line = read_control_line(&mut stream, &mut pending).await?;
            let text = line.trim_end_matches(['\r', '\n']);
            if text == wire::TERMINATE_SERVER {
                state.trigger_shutdown();
                return Ok(());
            }
            if let Some(address) = text.strip_prefix(&format!("{}:", wire::SUT_SERVER)) {
                state.dispatcher.set_forward_target(address);
                continue;
            }
            if text.starts_with(wire::SYNCH) || text.starts_with(wire::STATUS) {
                stream.write_all(b"OK\n").await?;
                continue;
            }
            warn!("Unrecognised control message: {text:?}");
            continue;
        }

        let header_size = framing.header_size();
        if !fill_to(&mut stream, &mut pending, header_size, header_timeout).await? {
            return Ok(());
        }
        let Some(header) = framing.header.decode(&pending[..header_size]) else {
            // Malformed header: drop one byte and retry matching.
            warn!("Header matched no format, discarding one byte");
            pending.remove(0);
            continue;
        };

        let body = if framing.has_size_field() {
            let size = header
                .get(&framing.size_field)
                .and_then(Value::as_i64)
                .unwrap_or(0)
                .max(0) as usize;
            if !fill_to(&mut stream, &mut pending, header_size + size, header_timeout).await? {
                return Ok(());
            }
            pending[header_size..header_size + size].to_vec()
        } else {
            let footer = framing.footer.clone().unwrap_or_default();
            read_until_footer(&mut stream, &mut pending, header_size, &footer, header_timeout)
                .await?
        };
        let frame_size = header_size
            + body.len()
            + if framing.has_size_field() {
                0
            } else {
                framing.footer.as_ref().map_or(0, Vec::len)
            };
        let raw_frame: Vec<u8> = pending.drain(..frame_size.min(pending.len())).collect();

        let Some(text) = framing.decode_frame(&raw_frame[..header_size], &body) else {
            warn!("Frame decoded no schema, discarding");
            continue;
        };
        let item =
            TrafficItem::incoming(state.dispatcher.incoming_tag(), text).with_data(raw_frame.clone());
        let request = state.dispatcher.next_request_number();
        let forward = FramedForward {
            target: state.dispatcher.forward_target(),
            framing: framing.clone(),
            raw_frame,
            timeout: header_timeout,
        };
        match state.dispatcher.process(item, request, &forward).await {
            Ok(responses) => {
                for response in responses {
                    let bytes = match &response.data {
                        Some(data) => data.clone(),
                        None => match framing.encode_frame(&response.text) {
                            Some(bytes) => bytes,
                            None => {
                                warn!("Could not re-encode response frame");
                                continue;
                            }
                        },
                    };
                    stream.write_all(&bytes).await?;
                }
                stream.flush().await?;
            }
            Err(Error::ReplayMismatch(message)) => {
                stream
                    .write_all(format!("{}: {message}\n", wire::MISMATCH).as_bytes())
                    .await?;
                stream.flush().await?;
                return Ok(());
            }
            Err(e) => {
                warn!("Framed dispatch failed: {e}");
                return Ok(());
            }
        }
    }
}

/// Grow `pending` from the stream until it holds `target` bytes. The
/// header timeout only applies once a partial message is buffered; an
/// idle connection may stay quiet indefinitely. Returns false on EOF or
/// on a timed-out partial read.
async fn fill_to(
    stream: &mut TcpStream,
    pending: &mut Vec<u8>,
    target: usize,
    timeout: Duration,
) -> Result<bool> {
    let mut chunk = [0u8; 4096];
    while pending.len() < target {
        let read = if pending.is_empty() {
            stream.read(&mut chunk).await?
        } else {
            match tokio::time::timeout(timeout, stream.read(&mut chunk)).await {
                Ok(read) => read?,
                Err(_elapsed) => return Ok(false),
            }
        };
        if read == 0 {
            return Ok(false);
        }
        pending.extend_from_slice(&chunk[..read]);
    }
    Ok(true)
}

async fn read_control_line(stream: &mut TcpStream, pending: &mut Vec<u8>) -> Result<String> {
    let mut chunk = [0u8; 1024];
    while !pending.contains(&b'\n') {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        pending.extend_from_slice(&chunk[..read]);
    }
    let end = pending
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(pending.len());
    let line: Vec<u8> = pending.drain(..end).collect();
    Ok(String::from_utf8_lossy(&line).to_string())
}

/// With no length field, bodies are read until the footer shows up.
async fn read_until_footer(
    stream: &mut TcpStream,
    pending: &mut Vec<u8>,
    header_size: usize,
    footer: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    if footer.is_empty() {
        return Ok(Vec::new());
    }
    loop {
        if let Some(at) = find_subsequence(&pending[header_size..], footer) {
            return Ok(pending[header_size..header_size + at].to_vec());
        }
        let before = pending.len();
        if !fill_to(stream, pending, before + 1, timeout).await? {
            return Ok(pending[header_size..].to_vec());
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Client path: relay the raw frame and read one framed response back.
struct FramedForward {
    target: Option<String>,
    framing: Arc<Framing>,
    raw_frame: Vec<u8>,
    timeout: Duration,
}

#[async_trait]
impl Forward for FramedForward {
    async fn forward(&self, _item: &TrafficItem) -> std::io::Result<Vec<TrafficItem>> {
        let Some(target) = &self.target else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no real server registered",
            ));
        };
        let mut stream = TcpStream::connect(target.as_str()).await?;
        stream.write_all(&self.raw_frame).await?;
        stream.flush().await?;

        let mut reply = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match tokio::time::timeout(self.timeout, stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(read)) => reply.extend_from_slice(&chunk[..read]),
                Ok(Err(e)) => return Err(e),
            }
        }
        if reply.is_empty() {
            return Ok(Vec::new());
        }
        let header_size = self.framing.header_size();
        let text = reply
            .get(..header_size)
            .and_then(|header| self.framing.decode_frame(header, reply.get(header_size..)?))
            .unwrap_or_else(|| format!("{{\"_raw\":\"{}\"}}", hex_encode(&reply)));
        Ok(vec![TrafficItem::outgoing(TrafficTag::Srv, text).with_data(reply)])
    }
}
