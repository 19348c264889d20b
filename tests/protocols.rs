//! Replay round trips for the non-HTTP protocol adapters.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};

use capturemock::{CaptureMode, CaptureServer, DispatcherBuilder, RcConfig};

async fn start_replay_server(
    protocol: &str,
    journal: &str,
) -> (CaptureServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let replay_path = dir.path().join("replay.journal");
    std::fs::write(&replay_path, journal).unwrap();
    let mut config = RcConfig::new();
    config.add_str(&format!("[general]\nserver_protocol = {protocol}\n"));
    let dispatcher = DispatcherBuilder::new(CaptureMode::Replay, config.clone())
        .replay_file(Some(replay_path))
        .build()
        .unwrap();
    let server = CaptureServer::start(config, dispatcher).await.unwrap();
    (server, dir)
}

#[tokio::test]
async fn udp_datagrams_replay_like_tcp_lines() {
    // Arrange
    let (server, _dir) = start_replay_server("classic_udp", "<-CLI:ping\n->SRV:pong\n").await;

    // Act
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(b"ping\n", server.address()).await.unwrap();
    let mut buffer = [0u8; 1024];
    let (length, _) = socket.recv_from(&mut buffer).await.unwrap();

    // Assert
    assert_eq!(&buffer[..length], b"pong");
    server.shutdown().await;
}

#[tokio::test]
async fn xmlrpc_calls_replay_their_recorded_value() {
    // Arrange
    let (server, _dir) = start_replay_server(
        "xmlrpc",
        "<-CLI:inventory.count('warehouse-2', 5)\n->SRV:7\n",
    )
    .await;

    // Act
    let body = "<?xml version=\"1.0\"?><methodCall>\
        <methodName>inventory.count</methodName>\
        <params><param><value><string>warehouse-2</string></value></param>\
        <param><value><i4>5</i4></value></param></params></methodCall>";
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/RPC2", server.address()))
        .header("Content-Type", "text/xml")
        .body(body)
        .send()
        .await
        .unwrap();

    // Assert
    let text = response.text().await.unwrap();
    assert!(text.contains("<methodResponse>"), "got: {text}");
    assert!(text.contains("<int>7</int>"), "got: {text}");
    server.shutdown().await;
}

#[tokio::test]
async fn xmlrpc_mismatches_come_back_as_faults() {
    // Arrange
    let (server, _dir) = start_replay_server(
        "xmlrpc",
        "<-CLI:inventory.count('warehouse-2', 5)\n->SRV:7\n",
    )
    .await;

    // Act - a method that was never recorded
    let body = "<?xml version=\"1.0\"?><methodCall>\
        <methodName>inventory.drop</methodName><params/></methodCall>";
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/RPC2", server.address()))
        .body(body)
        .send()
        .await
        .unwrap();

    // Assert
    let text = response.text().await.unwrap();
    assert!(text.contains("<fault>"), "got: {text}");
    assert!(text.contains("faultString"), "got: {text}");
    server.shutdown().await;
}

#[tokio::test]
async fn ftp_list_replays_listing_and_status() {
    // Arrange
    let journal =
        "<-CLI:LIST /\n->LST:file_a.txt\nfile_b.txt\n->SRV:226 Transfer complete\n";
    let (server, _dir) = start_replay_server("ftp", journal).await;

    // Act - a hand-rolled passive-mode client session
    let control = TcpStream::connect(server.address()).await.unwrap();
    let (read_half, mut writer) = control.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("220"), "greeting: {line}");

    for (command, expected) in [("USER test", "331"), ("PASS secret", "230"), ("PASV", "227")] {
        writer
            .write_all(format!("{command}\r\n").as_bytes())
            .await
            .unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with(expected), "{command} -> {line}");
    }
    let data_address = pasv_address(&line).expect("unparseable PASV reply");

    writer.write_all(b"LIST /\r\n").await.unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("150"), "LIST -> {line}");

    let mut data = TcpStream::connect(data_address).await.unwrap();
    let mut listing = String::new();
    data.read_to_string(&mut listing).await.unwrap();

    line.clear();
    reader.read_line(&mut line).await.unwrap();

    // Assert
    assert_eq!(listing, "file_a.txt\nfile_b.txt");
    assert!(line.starts_with("226"), "status: {line}");

    // close the session so shutdown does not wait out the grace period
    drop(reader);
    drop(writer);
    server.shutdown().await;
}

fn pasv_address(reply: &str) -> Option<String> {
    let inner = reply.split('(').nth(1)?.split(')').next()?;
    let fields: Vec<u16> = inner
        .split(',')
        .map(|field| field.trim().parse().ok())
        .collect::<Option<Vec<_>>>()?;
    (fields.len() == 6).then(|| {
        format!(
            "{}.{}.{}.{}:{}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            fields[4] * 256 + fields[5]
        )
    })
}
