//! Line-oriented TCP and UDP adapter.
//!
//! The request is a newline-terminated text message beginning with a known
//! socket-id prefix; the reply is raw bytes. Several traffic classes share
//! the one listener and the socket id picks between them. UDP behaves the
//! same except that each datagram is one request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::config::GENERAL_SECTION;
use crate::dispatcher::Forward;
use crate::error::{Error, Result};
use crate::server::ServerState;
use crate::traffic::{
    join_command_reply, wire, CommandInvocation, TrafficItem, TrafficTag,
};

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
                debug!("Connection from {peer}");
                let state = state.clone();
                let conn_state = state.clone();
                state.spawn_handler(async move {
                    if let Err(e) = handle_connection(conn_state, stream).await {
                        warn!("Connection handler failed: {e}");
                    }
                });
            }
        }
    }
    debug!("Line TCP listener closed");
}

pub async fn run_udp(state: Arc<ServerState>, socket: UdpSocket) {
    let mut buffer = vec![0u8; 65_536];
    loop {
        if state.is_stopping() {
            break;
        }
        tokio::select! {
            _ = state.shutdown.notified() => break,
            received = socket.recv_from(&mut buffer) => {
                let (length, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Failed to receive datagram: {e}");
                        continue;
                    }
                };
                let text = String::from_utf8_lossy(&buffer[..length])
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                match handle_message(&state, &text).await {
                    Ok(Some(reply)) => {
                        if let Err(e) = socket.send_to(&reply, peer).await {
                            warn!("Failed to send datagram reply: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let _ = socket.send_to(mismatch_payload(&e).as_bytes(), peer).await;
                    }
                }
            }
        }
    }
    debug!("UDP listener closed");
}

async fn handle_connection(state: Arc<ServerState>, mut stream: TcpStream) -> Result<()> {
    let mut reader = BufReader::new(&mut stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let text = line.trim_end_matches(['\r', '\n']).to_string();
    if text.is_empty() {
        return Ok(());
    }

    match handle_message(&state, &text).await {
        Ok(Some(reply)) => {
            stream.write_all(&reply).await?;
            stream.flush().await?;
        }
        Ok(None) => {}
        Err(e) => {
            stream.write_all(mismatch_payload(&e).as_bytes()).await?;
            stream.flush().await?;
        }
    }
    Ok(())
}

/// Recognise control messages at the byte level, parse everything else
/// into a typed traffic item and dispatch it.
async fn handle_message(state: &Arc<ServerState>, text: &str) -> Result<Option<Vec<u8>>> {
    if text == wire::TERMINATE_SERVER {
        state.trigger_shutdown();
        return Ok(None);
    }
    if let Some(address) = text.strip_prefix(&format!("{}:", wire::SUT_SERVER)) {
        state.dispatcher.set_forward_target(address);
        return Ok(None);
    }
    if let Some(rest) = text.strip_prefix(&format!("{}:", wire::SUT_COMMAND_KILL)) {
        // SUT_COMMAND_KILL:<signal>:SUT_SEP:<pid> - tell the shim to
        // re-raise the signal so the caller sees the real termination cause
        let signal: i32 = rest
            .split(wire::SUT_SEP)
            .next()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(15);
        return Ok(Some(join_command_reply("", "", -signal).into_bytes()));
    }

    if let Some(payload) = text.strip_prefix(&format!("{}:", wire::SUT_COMMAND_LINE)) {
        let Some(invocation) = CommandInvocation::parse(payload) else {
            warn!("Discarding malformed command message");
            return Ok(Some(join_command_reply("", "unparseable command message", 1).into_bytes()));
        };
        let item = TrafficItem::incoming(TrafficTag::Cmd, invocation.descriptor_text());
        let request = state.dispatcher.next_request_number();
        let forward = CommandForward { invocation };
        let responses = state.dispatcher.process(item, request, &forward).await?;
        return Ok(Some(render_command_reply(&responses).into_bytes()));
    }

    if let Some(payload) = text.strip_prefix(&format!("{}:", wire::SUT_PYTHON_CALL)) {
        let item = TrafficItem::incoming(TrafficTag::Pyt, payload);
        let request = state.dispatcher.next_request_number();
        let responses = state
            .dispatcher
            .process(item, request, &line_forward(state))
            .await?;
        let reply: Vec<u8> = responses
            .iter()
            .filter(|r| r.tag == TrafficTag::Ret)
            .flat_map(|r| r.wire_bytes())
            .collect();
        return Ok(Some(reply));
    }

    // Generic client (or, playing client, server) traffic
    let item = TrafficItem::incoming(state.dispatcher.incoming_tag(), text);
    let request = state.dispatcher.next_request_number();
    let responses = state
        .dispatcher
        .process(item, request, &line_forward(state))
        .await?;
    let mut reply = Vec::new();
    for response in &responses {
        if response.tag == TrafficTag::Fil && response.data.is_none() {
            // already applied to disk by the dispatcher
            continue;
        }
        reply.extend_from_slice(&response.wire_bytes());
    }
    Ok(Some(reply))
}

fn mismatch_payload(error: &Error) -> String {
    match error {
        Error::ReplayMismatch(message) => format!("{}: {message}\n", wire::MISMATCH),
        other => format!("{}: {other}\n", wire::MISMATCH),
    }
}

/// Fold OUT/ERR/EXC responses into the shim reply format.
fn render_command_reply(responses: &[TrafficItem]) -> String {
    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut exit_code = 0;
    for response in responses {
        match response.tag {
            TrafficTag::Out => stdout.push_str(&response.text),
            TrafficTag::Err => stderr.push_str(&response.text),
            TrafficTag::Exc => exit_code = response.text.trim().parse().unwrap_or(0),
            _ => {}
        }
    }
    join_command_reply(&stdout, &stderr, exit_code)
}

fn line_forward(state: &Arc<ServerState>) -> LineForward {
    LineForward {
        target: state.dispatcher.forward_target(),
        timeout: Duration::from_secs_f64(
            state
                .config
                .get_float(GENERAL_SECTION, "connection_timeout", 0.2),
        ),
    }
}

/// Client path for line traffic: connect to the registered real server,
/// send the message, read the reply.
struct LineForward {
    target: Option<String>,
    timeout: Duration,
}

#[async_trait]
impl Forward for LineForward {
    async fn forward(&self, item: &TrafficItem) -> std::io::Result<Vec<TrafficItem>> {
        let Some(target) = &self.target else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no real server registered",
            ));
        };
        let mut stream = TcpStream::connect(target.as_str()).await?;
        stream.write_all(item.text.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reply = Vec::new();
        // The backend may keep the stream open: stop at the read timeout.
        match tokio::time::timeout(self.timeout, stream.read_to_end(&mut reply)).await {
            Ok(result) => {
                result?;
            }
            Err(_elapsed) => debug!("Read timeout on forwarded connection"),
        }
        let text = String::from_utf8_lossy(&reply).to_string();
        Ok(vec![TrafficItem::outgoing(TrafficTag::Srv, text)])
    }
}

/// Client path for command-line traffic: run the real command.
struct CommandForward {
    invocation: CommandInvocation,
}

#[async_trait]
impl Forward for CommandForward {
    async fn forward(&self, _item: &TrafficItem) -> std::io::Result<Vec<TrafficItem>> {
        let Some(program) = self.invocation.argv.first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command line",
            ));
        };
        let mut command = tokio::process::Command::new(program);
        command.args(&self.invocation.argv[1..]);
        if !self.invocation.working_dir.is_empty() {
            command.current_dir(&self.invocation.working_dir);
        }
        // The shim reports PATH with the intercept directory stripped, so
        // the real executable resolves instead of the shim itself.
        command.envs(self.invocation.environment.iter().cloned());
        let output = command.output().await?;

        let mut responses = Vec::new();
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.is_empty() {
            responses.push(TrafficItem::outgoing(TrafficTag::Out, stdout.into_owned()));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            responses.push(TrafficItem::outgoing(TrafficTag::Err, stderr.into_owned()));
        }
        let exit_code = output.status.code().unwrap_or(1);
        responses.push(TrafficItem::outgoing(TrafficTag::Exc, exit_code.to_string()));
        Ok(responses)
    }
}

pub async fn send_terminate_tcp(address: &SocketAddr) -> Result<()> {
    let mut stream = TcpStream::connect(address).await?;
    stream
        .write_all(format!("{}\n", wire::TERMINATE_SERVER).as_bytes())
        .await?;
    stream.flush().await?;
    Ok(())
}

pub async fn send_terminate_udp(address: &SocketAddr) -> Result<()> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket
        .send_to(format!("{}\n", wire::TERMINATE_SERVER).as_bytes(), address)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_replies_merge_out_err_and_exit_code() {
        let responses = vec![
            TrafficItem::outgoing(TrafficTag::Out, "hello\n"),
            TrafficItem::outgoing(TrafficTag::Exc, "3"),
        ];
        assert_eq!(render_command_reply(&responses), "hello\n|TT_CMD_SEP||TT_CMD_SEP|3");
    }

    #[test]
    fn mismatches_render_with_the_reserved_marker() {
        let payload = mismatch_payload(&Error::ReplayMismatch("no match for \"x\"".into()));
        assert!(payload.starts_with("CAPTUREMOCK MISMATCH: "));
        assert!(payload.ends_with('\n'));
    }
}
