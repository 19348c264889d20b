//! FTP adapter: command verbs intercepted at the protocol layer.
//!
//! `LIST` and `RETR` produce one request item each, answered by a data
//! channel payload (`LST`/`FIL`) plus a control channel status (`SRV`).
//! `STOR` uploads land in the recording edit directory; a `STOR` path of
//! the form `SUT_SERVER=<host:port>` registers the downstream real server
//! instead of transferring anything.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::dispatcher::Forward;
use crate::error::{Error, Result};
use crate::server::ServerState;
use crate::traffic::{wire, TrafficItem, TrafficTag};

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
                debug!("FTP connection from {peer}");
                let conn_state = state.clone();
                state.spawn_handler(async move {
                    if let Err(e) = handle_session(conn_state, stream).await {
                        debug!("FTP session ended: {e}");
                    }
                });
            }
        }
    }
    debug!("FTP listener closed");
}

struct Session {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    data_listener: Option<TcpListener>,
    cwd: String,
}

impl Session {
    async fn reply(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Deliver a payload over the PASV data channel.
    async fn send_data(&mut self, payload: &[u8]) -> Result<()> {
        let Some(listener) = self.data_listener.take() else {
            self.reply("425 Use PASV first").await?;
            return Ok(());
        };
        self.reply("150 Opening data connection").await?;
        let (mut data, _) = listener.accept().await?;
        data.write_all(payload).await?;
        data.flush().await?;
        drop(data);
        Ok(())
    }

    async fn receive_data(&mut self) -> Result<Vec<u8>> {
        let Some(listener) = self.data_listener.take() else {
            self.reply("425 Use PASV first").await?;
            return Ok(Vec::new());
        };
        self.reply("150 Ready to receive").await?;
        let (mut data, _) = listener.accept().await?;
        let mut payload = Vec::new();
        data.read_to_end(&mut payload).await?;
        Ok(payload)
    }
}

async fn handle_session(state: Arc<ServerState>, stream: TcpStream) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut session = Session {
        reader: BufReader::new(read_half),
        writer: write_half,
        data_listener: None,
        cwd: "/".to_string(),
    };
    session.reply("220 CaptureMock FTP service ready").await?;

    loop {
        let mut line = String::new();
        if session.reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let line = line.trim_end();
        let (verb, argument) = line.split_once(' ').unwrap_or((line, ""));
        match verb.to_ascii_uppercase().as_str() {
            "USER" => session.reply("331 Password required").await?,
            "PASS" => session.reply("230 Logged in").await?,
            "SYST" => session.reply("215 UNIX Type: L8").await?,
            "TYPE" => session.reply("200 Type set").await?,
            "NOOP" => session.reply("200 OK").await?,
            "PWD" => {
                let cwd = session.cwd.clone();
                session.reply(&format!("257 \"{cwd}\"")).await?;
            }
            "CWD" => {
                session.cwd = argument.to_string();
                session.reply("250 Directory changed").await?;
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let address = listener.local_addr()?;
                let port = address.port();
                session.data_listener = Some(listener);
                session
                    .reply(&format!(
                        "227 Entering Passive Mode (127,0,0,1,{},{})",
                        port / 256,
                        port % 256
                    ))
                    .await?;
            }
            "LIST" => {
                let path = if argument.is_empty() { session.cwd.clone() } else { argument.to_string() };
                transfer(&state, &mut session, "LIST", &path, TrafficTag::Lst).await?;
            }
            "RETR" => transfer(&state, &mut session, "RETR", argument, TrafficTag::Fil).await?,
            "STOR" => {
                if let Some(address) = argument.strip_prefix(&format!("{}=", wire::SUT_SERVER)) {
                    state.dispatcher.set_forward_target(address);
                    session.reply("226 Forward target registered").await?;
                    continue;
                }
                let payload = session.receive_data().await?;
                store_upload(&state, argument, &payload);
                let item = TrafficItem::incoming(TrafficTag::Cli, format!("STOR {argument}"))
                    .with_data(payload);
                let request = state.dispatcher.next_request_number();
                match state.dispatcher.process(item, request, &NoFtpForward).await {
                    Ok(_) | Err(Error::ReplayMismatch(_)) => {
                        session.reply("226 Transfer complete").await?;
                    }
                    Err(e) => {
                        warn!("STOR dispatch failed: {e}");
                        session.reply("451 Transfer failed").await?;
                    }
                }
            }
            "QUIT" => {
                session.reply("221 Goodbye").await?;
                return Ok(());
            }
            _ => session.reply("502 Command not implemented").await?,
        }
    }
}

/// Run a LIST or RETR through the dispatcher: data payload on the data
/// channel, recorded status on the control channel.
async fn transfer(
    state: &Arc<ServerState>,
    session: &mut Session,
    verb: &str,
    path: &str,
    payload_tag: TrafficTag,
) -> Result<()> {
    let item = TrafficItem::incoming(TrafficTag::Cli, format!("{verb} {path}"));
    let request = state.dispatcher.next_request_number();
    let forward = FtpForward {
        target: state.dispatcher.forward_target(),
        verb: verb.to_string(),
        path: path.to_string(),
        payload_tag,
    };
    match state.dispatcher.process(item, request, &forward).await {
        Ok(responses) => {
            let payload: Vec<u8> = responses
                .iter()
                .filter(|r| r.tag == payload_tag)
                .flat_map(|r| r.wire_bytes())
                .collect();
            session.send_data(&payload).await?;
            let status = responses
                .iter()
                .find(|r| r.tag == TrafficTag::Srv)
                .map(|r| r.text.clone())
                .unwrap_or_else(|| "226 Transfer complete".to_string());
            session.reply(&status).await?;
        }
        Err(Error::ReplayMismatch(message)) => {
            session
                .reply(&format!("550 {}: {message}", wire::MISMATCH))
                .await?;
        }
        Err(e) => {
            warn!("{verb} dispatch failed: {e}");
            session.reply("451 Transfer failed").await?;
        }
    }
    Ok(())
}

fn store_upload(state: &ServerState, path: &str, payload: &[u8]) {
    let Some(dir) = state.edit_record_dir() else {
        return;
    };
    let name = path.rsplit('/').next().unwrap_or(path);
    if let Err(e) = std::fs::write(dir.join(name), payload) {
        warn!("Could not store uploaded file {name}: {e}");
    }
}

/// Client path for LIST/RETR against the registered downstream server.
struct FtpForward {
    target: Option<String>,
    verb: String,
    path: String,
    payload_tag: TrafficTag,
}

#[async_trait]
impl Forward for FtpForward {
    async fn forward(&self, _item: &TrafficItem) -> std::io::Result<Vec<TrafficItem>> {
        let Some(target) = &self.target else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no downstream FTP server registered",
            ));
        };
        let mut control = BufReader::new(TcpStream::connect(target.as_str()).await?);
        expect_reply(&mut control).await?; // 220
        send_command(&mut control, "USER anonymous").await?;
        expect_reply(&mut control).await?; // 331
        send_command(&mut control, "PASS capturemock").await?;
        expect_reply(&mut control).await?; // 230
        send_command(&mut control, "TYPE I").await?;
        expect_reply(&mut control).await?;
        send_command(&mut control, "PASV").await?;
        let pasv = expect_reply(&mut control).await?;
        let data_address = parse_pasv(&pasv).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "unparseable PASV reply")
        })?;
        send_command(&mut control, &format!("{} {}", self.verb, self.path)).await?;
        expect_reply(&mut control).await?; // 150
        let mut data = TcpStream::connect(data_address).await?;
        let mut payload = Vec::new();
        data.read_to_end(&mut payload).await?;
        drop(data);
        let status = expect_reply(&mut control).await?; // 226

        let payload_item = match self.payload_tag {
            TrafficTag::Lst => TrafficItem::outgoing(
                TrafficTag::Lst,
                String::from_utf8_lossy(&payload).to_string(),
            ),
            _ => TrafficItem::outgoing(
                TrafficTag::Fil,
                format!("{} bytes for {}", payload.len(), self.path),
            )
            .with_data(payload),
        };
        Ok(vec![
            payload_item,
            TrafficItem::outgoing(TrafficTag::Srv, status.trim_end().to_string()),
        ])
    }
}

/// Upload traffic has no client path: the payload already arrived.
struct NoFtpForward;

#[async_trait]
impl Forward for NoFtpForward {
    async fn forward(&self, _item: &TrafficItem) -> std::io::Result<Vec<TrafficItem>> {
        Ok(vec![TrafficItem::outgoing(
            TrafficTag::Srv,
            "226 Transfer complete".to_string(),
        )])
    }
}

async fn send_command(control: &mut BufReader<TcpStream>, command: &str) -> std::io::Result<()> {
    control.get_mut().write_all(command.as_bytes()).await?;
    control.get_mut().write_all(b"\r\n").await?;
    control.get_mut().flush().await
}

async fn expect_reply(control: &mut BufReader<TcpStream>) -> std::io::Result<String> {
    let mut line = String::new();
    control.read_line(&mut line).await?;
    Ok(line)
}

/// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` to `h1.h2.h3.h4:port`.
fn parse_pasv(reply: &str) -> Option<String> {
    let inner = reply.split('(').nth(1)?.split(')').next()?;
    let fields: Vec<u16> = inner
        .split(',')
        .map(|f| f.trim().parse().ok())
        .collect::<Option<Vec<_>>>()?;
    if fields.len() != 6 {
        return None;
    }
    Some(format!(
        "{}.{}.{}.{}:{}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        fields[4] * 256 + fields[5]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasv_replies_decode_to_an_address() {
        assert_eq!(
            parse_pasv("227 Entering Passive Mode (127,0,0,1,4,210)").as_deref(),
            Some("127.0.0.1:1234")
        );
        assert_eq!(parse_pasv("500 nonsense"), None);
    }
}
