use capturemock::{CaptureMode, CaptureServer, DispatcherBuilder, RcConfig};

const ITEMS_JOURNAL: &str = "<-CLI:GET /items/42\n->SRV:200 OK\n{\"id\":42}\n--HEA:Content-Type=application/json\n";

async fn start_server(
    mode: CaptureMode,
    journal: Option<&str>,
    record: Option<&std::path::Path>,
) -> (CaptureServer, tempfile::TempDir) {
    start_server_with(mode, journal, record, "").await
}

async fn start_server_with(
    mode: CaptureMode,
    journal: Option<&str>,
    record: Option<&std::path::Path>,
    extra_config: &str,
) -> (CaptureServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RcConfig::new();
    config.add_str("[general]\nserver_protocol = http\n");
    config.add_str(extra_config);
    let mut builder = DispatcherBuilder::new(mode, config.clone());
    if let Some(journal) = journal {
        let replay_path = dir.path().join("replay.journal");
        std::fs::write(&replay_path, journal).unwrap();
        builder = builder.replay_file(Some(replay_path));
    }
    if let Some(record) = record {
        builder = builder.record_file(Some(record.to_path_buf()));
    }
    let dispatcher = builder.build().unwrap();
    let server = CaptureServer::start(config, dispatcher).await.unwrap();
    (server, dir)
}

#[tokio::test]
async fn replay_serves_status_body_and_headers_with_no_backend() {
    // Arrange
    let (server, _dir) = start_server(CaptureMode::Replay, Some(ITEMS_JOURNAL), None).await;

    // Act
    let response = reqwest::get(format!("http://{}/items/42", server.address()))
        .await
        .unwrap();

    // Assert
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("Content-Type").unwrap(),
        "application/json"
    );
    assert_eq!(response.text().await.unwrap(), "{\"id\":42}");
    server.shutdown().await;
}

#[tokio::test]
async fn replay_mismatch_is_a_descriptive_client_error() {
    // Arrange - exact matching, so near misses are refused
    let (server, _dir) = start_server_with(
        CaptureMode::Replay,
        Some(ITEMS_JOURNAL),
        None,
        "use_exact_matching = true\n",
    )
    .await;

    // Act - a POST was never recorded
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/items", server.address()))
        .body("{}")
        .send()
        .await
        .unwrap();

    // Assert
    assert_eq!(response.status(), 400);
    server.shutdown().await;
}

#[tokio::test]
async fn record_mode_forwards_and_journals_the_conversation() {
    // Arrange - the "real backend" is a replay server with the session
    let (backend, _backend_dir) =
        start_server(CaptureMode::Replay, Some(ITEMS_JOURNAL), None).await;
    let record_dir = tempfile::tempdir().unwrap();
    let record_path = record_dir.path().join("record.journal");
    let (front, _front_dir) = start_server(CaptureMode::Record, None, Some(&record_path)).await;

    let client = reqwest::Client::new();
    client
        .post(format!("http://{}/capturemock/setServerLocation", front.address()))
        .body(backend.address().to_string())
        .send()
        .await
        .unwrap();

    // Act
    let response = client
        .get(format!("http://{}/items/42", front.address()))
        .send()
        .await
        .unwrap();

    // Assert - the SUT saw the backend's answer...
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "{\"id\":42}");
    front.shutdown().await;
    backend.shutdown().await;

    // ...and the journal can drive the next replay run
    let journal = std::fs::read_to_string(&record_path).unwrap();
    assert!(journal.contains("<-CLI:GET /items/42\n"), "journal: {journal}");
    assert!(journal.contains("->SRV:200 OK\n{\"id\":42}\n"), "journal: {journal}");
    assert!(journal.contains("--HEA:Content-Type=application/json\n"), "journal: {journal}");
}

#[tokio::test]
async fn shutdown_endpoint_stops_the_server() {
    // Arrange
    let (server, _dir) = start_server(CaptureMode::Replay, Some(ITEMS_JOURNAL), None).await;

    // Act
    reqwest::get(format!(
        "http://{}/capturemock/shutdownServer",
        server.address()
    ))
    .await
    .unwrap();

    // Assert
    tokio::time::timeout(std::time::Duration::from_secs(2), server.wait())
        .await
        .expect("server did not shut down in time");
}

#[tokio::test]
async fn path_redirects_answer_with_307_to_the_cookie_target() {
    // Arrange
    let (server, _dir) = start_server(CaptureMode::Replay, Some(ITEMS_JOURNAL), None).await;
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    client
        .post(format!(
            "http://{}/capturemock/sendPathRedirect/items",
            server.address()
        ))
        .body("{\"matcher\":{\"staging\":\"http://backend.test\"}}")
        .send()
        .await
        .unwrap();

    // Act - with the proxy-target cookie
    let redirected = client
        .get(format!("http://{}/items/42", server.address()))
        .header("Cookie", "capturemock_proxy_target=staging")
        .send()
        .await
        .unwrap();
    // ...and without it
    let unmatched = client
        .get(format!("http://{}/items/42", server.address()))
        .send()
        .await
        .unwrap();

    // Assert
    assert_eq!(redirected.status(), 307);
    assert_eq!(
        redirected.headers().get("Location").unwrap(),
        "http://backend.test/items/42"
    );
    assert_eq!(unmatched.status(), 404);
    server.shutdown().await;
}
