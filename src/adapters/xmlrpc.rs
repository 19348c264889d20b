//! XML-RPC adapter.
//!
//! The canonical descriptor is the method name plus its rendered parameter
//! tuple, e.g. `inventory.count('warehouse-2', 5)`. A response is either a
//! rendered return value or a fault, journalled as `FAULT <code>: <text>`.
//! Every method goes through one dispatch path; there is no per-method
//! registry.

use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{header, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use quick_xml::events::Event;
use tokio::net::TcpListener;

use crate::dispatcher::Forward;
use crate::error::Error;
use crate::server::ServerState;
use crate::traffic::{TrafficItem, TrafficTag};

const FAULT_PREFIX: &str = "FAULT ";

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
                debug!("XML-RPC connection from {peer}");
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
                        debug!("XML-RPC connection ended: {e}");
                    }
                });
            }
        }
    }
    debug!("XML-RPC listener closed");
}

async fn handle_request(
    state: Arc<ServerState>,
    request: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let _in_flight = state.track_request();
    let _serial = state.serial_guard().await;
    let path = request.uri().path().to_string();
    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Failed to read request body: {e}");
            return xml_response(&render_fault(1, "unreadable request body"));
        }
    };
    if path == super::http::SHUTDOWN_PATH {
        state.trigger_shutdown();
        return xml_response(&render_method_response("'shutting down'"));
    }

    let Some((method, params)) = parse_method_call(&String::from_utf8_lossy(&body)) else {
        return xml_response(&render_fault(1, "unparseable methodCall"));
    };
    let text = format!("{method}({})", params.join(", "));
    let item = TrafficItem::incoming(TrafficTag::Cli, text);
    let forward = XmlRpcForward {
        target: state.dispatcher.forward_target(),
        path,
        body,
    };
    let request_number = state.dispatcher.next_request_number();
    match state.dispatcher.process(item, request_number, &forward).await {
        Ok(responses) => {
            let value = responses
                .iter()
                .find(|r| r.tag == TrafficTag::Srv || r.tag == TrafficTag::Ret)
                .map(|r| r.text.as_str())
                .unwrap_or("''");
            match value.strip_prefix(FAULT_PREFIX) {
                Some(fault) => {
                    let (code, message) = fault.split_once(": ").unwrap_or(("1", fault));
                    xml_response(&render_fault(code.parse().unwrap_or(1), message))
                }
                None => xml_response(&render_method_response(value)),
            }
        }
        Err(Error::ReplayMismatch(message)) => xml_response(&render_fault(1, &message)),
        Err(e) => xml_response(&render_fault(1, &e.to_string())),
    }
}

/// Extract the method name and rendered parameter literals.
fn parse_method_call(xml: &str) -> Option<(String, Vec<String>)> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut method = None;
    let mut params = Vec::new();
    let mut path: Vec<String> = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                path.push(String::from_utf8_lossy(element.name().as_ref()).to_string());
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(text)) => {
                let text = text.unescape().ok()?.to_string();
                if text.trim().is_empty() {
                    continue;
                }
                match path.last().map(String::as_str) {
                    Some("methodName") => method = Some(text.trim().to_string()),
                    Some("string") | Some("value") => params.push(format!("'{text}'")),
                    Some("i4") | Some("int") | Some("double") => {
                        params.push(text.trim().to_string())
                    }
                    Some("boolean") => params.push(
                        if text.trim() == "1" { "True" } else { "False" }.to_string(),
                    ),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("Malformed methodCall: {e}");
                return None;
            }
            _ => {}
        }
    }
    Some((method?, params))
}

/// Parse a backend methodResponse into canonical journal text.
fn parse_method_response(xml: &str) -> String {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut path: Vec<String> = Vec::new();
    let mut in_fault = false;
    let mut fault_code = String::from("1");
    let mut fault_string = String::new();
    let mut member_name = String::new();
    let mut value = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                let name = String::from_utf8_lossy(element.name().as_ref()).to_string();
                if name == "fault" {
                    in_fault = true;
                }
                path.push(name);
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(text)) => {
                let Ok(text) = text.unescape() else { continue };
                if text.trim().is_empty() {
                    continue;
                }
                match path.last().map(String::as_str) {
                    Some("name") => member_name = text.trim().to_string(),
                    Some("string") | Some("value") if in_fault => {
                        if member_name == "faultString" {
                            fault_string = text.to_string();
                        }
                    }
                    Some("i4") | Some("int") if in_fault => {
                        if member_name == "faultCode" {
                            fault_code = text.trim().to_string();
                        }
                    }
                    Some("string") | Some("value") => value = Some(format!("'{text}'")),
                    Some("i4") | Some("int") | Some("double") => {
                        value = Some(text.trim().to_string())
                    }
                    Some("boolean") => {
                        value = Some(
                            if text.trim() == "1" { "True" } else { "False" }.to_string(),
                        )
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    if in_fault {
        format!("{FAULT_PREFIX}{fault_code}: {fault_string}")
    } else {
        value.unwrap_or_else(|| "''".to_string())
    }
}

fn render_value(text: &str) -> String {
    if let Some(inner) = text.strip_prefix('\'').and_then(|rest| rest.strip_suffix('\'')) {
        format!("<string>{}</string>", escape_xml(inner))
    } else if text == "True" || text == "False" {
        format!("<boolean>{}</boolean>", u8::from(text == "True"))
    } else if text.parse::<i64>().is_ok() {
        format!("<int>{text}</int>")
    } else if text.parse::<f64>().is_ok() {
        format!("<double>{text}</double>")
    } else {
        format!("<string>{}</string>", escape_xml(text))
    }
}

fn render_method_response(value: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<methodResponse><params><param><value>{}</value></param></params></methodResponse>",
        render_value(value)
    )
}

fn render_fault(code: i64, message: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<methodResponse><fault><value><struct>\
         <member><name>faultCode</name><value><int>{code}</int></value></member>\
         <member><name>faultString</name><value><string>{}</string></value></member>\
         </struct></value></fault></methodResponse>",
        escape_xml(message)
    )
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn xml_response(body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/xml")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid XML response")
}

/// Client path: relay the raw methodCall to the real endpoint.
struct XmlRpcForward {
    target: Option<String>,
    path: String,
    body: Bytes,
}

#[async_trait]
impl Forward for XmlRpcForward {
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
        let request = Request::builder()
            .method(hyper::Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "text/xml")
            .body(Full::new(self.body.clone()))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let response = client
            .request(request)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e))?;
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, e))?
            .to_bytes();
        let text = parse_method_response(&String::from_utf8_lossy(&body));
        Ok(vec![TrafficItem::outgoing(TrafficTag::Srv, text)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CALL: &str = "<?xml version=\"1.0\"?>\n<methodCall>\
        <methodName>inventory.count</methodName>\
        <params><param><value><string>warehouse-2</string></value></param>\
        <param><value><i4>5</i4></value></param></params></methodCall>";

    #[test]
    fn method_calls_canonicalise_to_name_and_tuple() {
        let (method, params) = parse_method_call(CALL).unwrap();
        assert_eq!(method, "inventory.count");
        assert_eq!(params, vec!["'warehouse-2'", "5"]);
    }

    #[test]
    fn responses_round_trip_through_the_canonical_text() {
        let xml = render_method_response("'South Dakota'");
        assert_eq!(parse_method_response(&xml), "'South Dakota'");
        let xml = render_method_response("17");
        assert_eq!(parse_method_response(&xml), "17");
    }

    #[test]
    fn faults_keep_code_and_message() {
        let xml = render_fault(4, "too many parameters");
        assert_eq!(parse_method_response(&xml), "FAULT 4: too many parameters");
    }
}
