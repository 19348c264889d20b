//! HTTP adapter: a full request handler for GET/POST/PUT/PATCH/DELETE/
//! OPTIONS plus the `/capturemock/*` meta-endpoints.
//!
//! Incoming requests canonicalise to `METHOD /path` with the body on
//! continuation lines and the surviving headers as `--HEA:` annotations;
//! responses carry `STATUS reason`, body and headers the same way.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::config::GENERAL_SECTION;
use crate::dispatcher::Forward;
use crate::error::{Error, Result};
use crate::server::ServerState;
use crate::traffic::{TrafficItem, TrafficTag};

pub const SHUTDOWN_PATH: &str = "/capturemock/shutdownServer";
pub const SET_LOCATION_PATH: &str = "/capturemock/setServerLocation";
pub const REDIRECT_PATH_PREFIX: &str = "/capturemock/sendPathRedirect/";
pub const PROXY_TARGET_COOKIE: &str = "capturemock_proxy_target";

/// Headers never worth recording, on top of the configured ignore list.
const ALWAYS_IGNORED_HEADERS: &[&str] = &["host", "content-length", "connection"];

/// One installed path redirect: a proxy-target-id to server map plus
/// optional regex rewrites applied to the composed target.
#[derive(Debug, Clone, Deserialize)]
pub struct RedirectEntry {
    pub matcher: HashMap<String, String>,
    #[serde(default)]
    pub replace: HashMap<String, String>,
}

/// Redirect table keyed by path prefix, installed at runtime via
/// `POST /capturemock/sendPathRedirect/<key>`.
#[derive(Debug, Default)]
pub struct RedirectTable {
    entries: std::sync::Mutex<HashMap<String, RedirectEntry>>,
}

impl RedirectTable {
    pub fn install(&self, key: String, entry: RedirectEntry) {
        self.entries.lock().expect("poisoned lock").insert(key, entry);
    }

    fn lookup(&self, path: &str) -> Option<(String, RedirectEntry)> {
        let entries = self.entries.lock().expect("poisoned lock");
        entries
            .iter()
            .find(|(key, _)| path.starts_with(&format!("/{key}")))
            .map(|(key, entry)| (key.clone(), entry.clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("poisoned lock").is_empty()
    }
}

pub async fn run(state: Arc<ServerState>, listener: TcpListener) {
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
                debug!("HTTP connection from {peer}");
                let io = TokioIo::new(stream);
                let service_state = state.clone();
                let service = service_fn(move |request| {
                    let state = service_state.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(handle_request(state, request).await)
                    }
                });
                // Connections outlive requests under keep-alive; requests
                // are tracked and serialised inside the handler instead.
                tokio::spawn(async move {
                    let connection = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service);
                    if let Err(e) = connection.await {
                        debug!("HTTP connection ended: {e}");
                    }
                });
            }
        }
    }
    debug!("HTTP listener closed");
}

async fn handle_request(
    state: Arc<ServerState>,
    request: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let _in_flight = state.track_request();
    let _serial = state.serial_guard().await;
    let method = request.method().clone();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let headers = request.headers().clone();
    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Failed to read request body: {e}");
            return plain_response(StatusCode::BAD_REQUEST, "unreadable request body");
        }
    };

    // Meta-endpoints are served internally, never dispatched.
    if path == SHUTDOWN_PATH {
        state.trigger_shutdown();
        return plain_response(StatusCode::OK, "shutting down");
    }
    if path == SET_LOCATION_PATH {
        let address = String::from_utf8_lossy(&body).trim().to_string();
        state.dispatcher.set_forward_target(&address);
        return plain_response(StatusCode::OK, "forward target registered");
    }
    if let Some(key) = path.strip_prefix(REDIRECT_PATH_PREFIX) {
        return match serde_json::from_slice::<RedirectEntry>(&body) {
            Ok(entry) => {
                state.redirects.install(key.to_string(), entry);
                plain_response(StatusCode::OK, "redirect installed")
            }
            Err(e) => plain_response(StatusCode::BAD_REQUEST, &format!("bad redirect table: {e}")),
        };
    }
    if !state.redirects.is_empty() {
        if let Some(response) = try_redirect(&state, &path, &headers) {
            return response;
        }
    }

    let ignored = ignored_headers(&state);
    let mut item_headers = Vec::new();
    for (name, value) in &headers {
        let name_text = name.as_str().to_ascii_lowercase();
        if ignored.iter().any(|ignored| ignored == &name_text) {
            continue;
        }
        item_headers.push((
            canonical_header_name(name.as_str()),
            String::from_utf8_lossy(value.as_bytes()).to_string(),
        ));
    }

    let body_text = render_body(&state, &headers, &body);
    let mut text = format!("{method} {path}");
    if !body_text.is_empty() {
        text.push('\n');
        text.push_str(&body_text);
    }
    let mut item = TrafficItem::incoming(TrafficTag::Cli, text);
    item.headers = item_headers;

    let forward = HttpForward {
        target: state.dispatcher.forward_target(),
        method,
        path,
        headers,
        body,
        ignored,
    };
    let request_number = state.dispatcher.next_request_number();
    match state.dispatcher.process(item, request_number, &forward).await {
        Ok(responses) => render_response(&responses),
        Err(Error::ReplayMismatch(message)) => plain_response(StatusCode::BAD_REQUEST, &message),
        Err(e) => plain_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn try_redirect(
    state: &ServerState,
    path: &str,
    headers: &hyper::HeaderMap,
) -> Option<Response<Full<Bytes>>> {
    let (_, entry) = state.redirects.lookup(path)?;
    let target_id = cookie_value(headers, PROXY_TARGET_COOKIE);
    let Some(server) = target_id.as_deref().and_then(|id| entry.matcher.get(id)) else {
        return Some(plain_response(
            StatusCode::NOT_FOUND,
            "no proxy target for this client",
        ));
    };
    let mut target = format!("{server}{path}");
    for (pattern, replacement) in &entry.replace {
        match regex::Regex::new(pattern) {
            Ok(pattern) => target = pattern.replace_all(&target, replacement.as_str()).into_owned(),
            Err(e) => warn!("Ignoring invalid redirect replace pattern: {e}"),
        }
    }
    debug!("Redirecting {path} to {target}");
    Some(
        Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header(header::LOCATION, target)
            .body(Full::new(Bytes::new()))
            .expect("valid redirect response"),
    )
}

fn cookie_value(headers: &hyper::HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|cookie| {
        let (key, value) = cookie.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn ignored_headers(state: &ServerState) -> Vec<String> {
    let mut ignored: Vec<String> = ALWAYS_IGNORED_HEADERS.iter().map(|h| h.to_string()).collect();
    for header in state
        .config
        .get_list(GENERAL_SECTION, "ignore_http_headers")
    {
        ignored.push(header.to_ascii_lowercase());
    }
    ignored
}

/// `content-type` back to `Content-Type`: the journal keeps the
/// conventional rendering.
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Canonical body text. Multipart file parts are replaced by a placeholder
/// and their contents stored on the recording side for byte-exact replay.
fn render_body(state: &ServerState, headers: &hyper::HeaderMap, body: &[u8]) -> String {
    if body.is_empty() {
        return String::new();
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if let Some(boundary) = content_type
        .split("boundary=")
        .nth(1)
        .filter(|_| content_type.starts_with("multipart/"))
    {
        return render_multipart(state, body, boundary.trim_matches('"'));
    }
    String::from_utf8_lossy(body).to_string()
}

fn render_multipart(state: &ServerState, body: &[u8], boundary: &str) -> String {
    let text = String::from_utf8_lossy(body);
    let delimiter = format!("--{boundary}");
    let mut rendered = Vec::new();
    for part in text.split(delimiter.as_str()) {
        let part = part.trim_matches(|c| c == '\r' || c == '\n');
        if part.is_empty() || part == "--" {
            continue;
        }
        let (part_headers, part_body) = part.split_once("\r\n\r\n").unwrap_or((part, ""));
        match filename_of(part_headers) {
            Some(name) => {
                if let Some(dir) = state.edit_record_dir() {
                    if let Err(e) = std::fs::write(dir.join(&name), part_body.as_bytes()) {
                        warn!("Could not store multipart file {name}: {e}");
                    }
                }
                rendered.push(format!("<File Contents for {name}>"));
            }
            None => rendered.push(part_body.to_string()),
        }
    }
    rendered.join("\n")
}

fn filename_of(part_headers: &str) -> Option<String> {
    part_headers
        .split("filename=\"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .map(|name| name.to_string())
}

/// Turn replayed or forwarded SRV traffic back into an HTTP response,
/// adding permissive CORS headers.
fn render_response(responses: &[TrafficItem]) -> Response<Full<Bytes>> {
    let Some(item) = responses.iter().find(|r| r.tag == TrafficTag::Srv) else {
        // backend unreachable in record mode: empty payload, not an error
        return plain_response(StatusCode::OK, "");
    };
    let (status_line, body) = item.text.split_once('\n').unwrap_or((item.text.as_str(), ""));
    let status = status_line
        .split_whitespace()
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);

    let mut builder = Response::builder().status(status);
    for (name, value) in &item.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !item
        .headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("access-control-allow-origin"))
    {
        builder = builder
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, PUT, PATCH, DELETE, OPTIONS")
            .header("Access-Control-Allow-Headers", "*");
    }
    builder
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|e| {
            warn!("Could not build response: {e}");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "bad recorded response")
        })
}

fn plain_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid plain response")
}

/// Client path: replay the live request against the real backend.
struct HttpForward {
    target: Option<String>,
    method: Method,
    path: String,
    headers: hyper::HeaderMap,
    body: Bytes,
    ignored: Vec<String>,
}

#[async_trait]
impl Forward for HttpForward {
    async fn forward(&self, _item: &TrafficItem) -> std::io::Result<Vec<TrafficItem>> {
        let Some(target) = &self.target else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no backend registered",
            ));
        };
        let client = hyper_util::client::legacy::Client::builder(
            hyper_util::rt::TokioExecutor::new(),
        )
        .build_http::<Full<Bytes>>();
        let uri: hyper::Uri = format!("http://{target}{}", self.path)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let mut request = Request::builder().method(self.method.clone()).uri(uri);
        for (name, value) in &self.headers {
            if name.as_str().eq_ignore_ascii_case("host") {
                continue;
            }
            request = request.header(name, value);
        }
        let request = request
            .body(Full::new(self.body.clone()))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        let response = client
            .request(request)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, e))?
            .to_bytes();

        let mut text = format!(
            "{} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .trim_end()
        .to_string();
        let body_text = String::from_utf8_lossy(&body);
        if !body_text.is_empty() {
            text.push('\n');
            text.push_str(&body_text);
        }
        let mut item = TrafficItem::outgoing(TrafficTag::Srv, text);
        for (name, value) in &headers {
            let lowered = name.as_str().to_ascii_lowercase();
            if self.ignored.iter().any(|ignored| ignored == &lowered)
                || lowered == "transfer-encoding"
                || lowered == "date"
            {
                continue;
            }
            item.headers.push((
                canonical_header_name(name.as_str()),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            ));
        }
        Ok(vec![item])
    }
}

/// HTTP termination goes through the internal shutdown endpoint.
pub async fn send_terminate(address: &SocketAddr) -> Result<()> {
    let mut stream = TcpStream::connect(address).await?;
    let request = format!(
        "GET {SHUTDOWN_PATH} HTTP/1.1\r\nHost: {address}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
