use super::*;
use crate::testutil::{wait_for_state, MockFactory};
use axum::body::Body;
use axum::http::Request;
use http_body_util::BodyExt;
use rust_xlsxwriter::Workbook;
use std::time::Duration;
use tower::ServiceExt;
use wasend_core::{
    config::DispatchConfig,
    link::{DeviceEvent, LinkState},
};

const BOUNDARY: &str = "wasend-test-boundary";

struct TestApp {
    router: Router,
    factory: Arc<MockFactory>,
    sessions: Arc<SessionRegistry>,
}

fn test_app(api_key: &str) -> TestApp {
    let factory = MockFactory::new();
    let sessions = Arc::new(SessionRegistry::new(
        factory.clone(),
        Duration::from_secs(60),
    ));
    let dispatch = Arc::new(DispatchService::new(&DispatchConfig {
        send_interval_ms: 0,
        timeout_secs: 60,
    }));
    let config = ApiConfig {
        api_key: api_key.to_string(),
        ..ApiConfig::default()
    };
    let state = ApiState::new(Arc::clone(&sessions), dispatch, &config);
    TestApp {
        router: build_router(state, &config),
        factory,
        sessions,
    }
}

impl TestApp {
    async fn call(&self, req: Request<Body>) -> (StatusCode, Value) {
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.call(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    /// Link the default session through the HTTP API and the mock device.
    async fn link(&self) {
        let (status, _) = self.get("/link-device").await;
        assert_eq!(status, StatusCode::OK);
        let device = self.factory.device(DEFAULT_SESSION_ID);
        device.emit(DeviceEvent::Qr("abc123".into())).await;
        device.emit(DeviceEvent::Paired).await;
        let session = self.sessions.get_or_create(DEFAULT_SESSION_ID).await.unwrap();
        wait_for_state(&session, LinkState::Linked).await;
    }
}

fn recipients_xlsx() -> Vec<u8> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.write_string(0, 0, "Name").unwrap();
    sheet.write_string(0, 1, "Phone").unwrap();
    sheet.write_string(1, 0, "Alice").unwrap();
    sheet.write_string(1, 1, "+55 11 99988-7766").unwrap();
    sheet.write_string(2, 0, "Bob").unwrap();
    sheet.write_number(2, 1, 919876543210.0).unwrap();
    workbook.save_to_buffer().unwrap()
}

/// Hand-built multipart body with optional `message` and `file` parts.
fn send_request(message: Option<&str>, file: Option<&[u8]>) -> Request<Body> {
    let mut body: Vec<u8> = Vec::new();
    if let Some(message) = message {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"message\"\r\n\r\n{message}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some(file) = file {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"contacts.xlsx\"\r\n\
                 Content-Type: application/vnd.openxmlformats-officedocument.spreadsheetml.sheet\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(file);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::post("/send-messages")
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_health_no_auth() {
    let app = test_app("");
    let (status, json) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["sessions"], 0);
}

#[tokio::test]
async fn test_auth_required_when_configured() {
    let app = test_app("secret");

    let (status, json) = app.get("/state").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["kind"], "unauthorized");

    let req = Request::get("/state")
        .header("Authorization", "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.call(req).await.0, StatusCode::UNAUTHORIZED);

    let req = Request::get("/state")
        .header("Authorization", "Bearer secret")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.call(req).await.0, StatusCode::OK);

    assert_eq!(app.get("/state?token=secret").await.0, StatusCode::OK);
    assert_eq!(app.get("/state?token=nope").await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_state_of_new_session_is_unlinked() {
    let app = test_app("");
    let (status, json) = app.get("/state?session=tab-2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["session_id"], "tab-2");
    assert_eq!(json["state"], "unlinked");
}

#[tokio::test]
async fn test_invalid_session_id_rejected() {
    let app = test_app("");
    let (status, json) = app.get("/state?session=../etc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "invalid_input");
}

#[tokio::test]
async fn test_link_device_then_qr_available() {
    let app = test_app("");
    let (status, json) = app.get("/link-device").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "awaiting_scan");
    assert_eq!(json["session"], DEFAULT_SESSION_ID);

    assert_eq!(app.get("/qr").await.0, StatusCode::NOT_FOUND);

    app.factory
        .device(DEFAULT_SESSION_ID)
        .emit(DeviceEvent::Qr("abc123".into()))
        .await;
    let session = app.sessions.get_or_create(DEFAULT_SESSION_ID).await.unwrap();
    for _ in 0..100 {
        if session.snapshot().await.qr.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (status, json) = app.get("/qr").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["qr"], "abc123");
    let png = BASE64
        .decode(json["qr_png_base64"].as_str().unwrap())
        .unwrap();
    assert_eq!(&png[..4], b"\x89PNG");
}

#[tokio::test]
async fn test_link_device_start_failure_is_502() {
    let app = test_app("");
    *app.factory
        .device(DEFAULT_SESSION_ID)
        .connect_error
        .lock()
        .unwrap() = Some("store unavailable".into());

    let (status, json) = app.get("/link-device").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["kind"], "link_failed");

    let (_, state) = app.get("/state").await;
    assert_eq!(state["state"], "failed");
}

#[tokio::test]
async fn test_scenario_link_then_send() {
    let app = test_app("");
    app.link().await;

    let file = recipients_xlsx();
    let (status, json) = app.call(send_request(Some("Hello"), Some(&file))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], "Messages sent successfully!");
    assert_eq!(json["report"]["sent"], 2);
    assert_eq!(json["report"]["failed"], 0);

    assert_eq!(
        app.factory.device(DEFAULT_SESSION_ID).sent_phones(),
        vec!["5511999887766", "919876543210"]
    );
}

#[tokio::test]
async fn test_scenario_auth_failure_blocks_send() {
    let app = test_app("");
    app.get("/link-device").await;
    app.factory
        .device(DEFAULT_SESSION_ID)
        .emit(DeviceEvent::AuthFailed("Unable to authenticate".into()))
        .await;
    let session = app.sessions.get_or_create(DEFAULT_SESSION_ID).await.unwrap();
    wait_for_state(&session, LinkState::Failed).await;

    let file = recipients_xlsx();
    let (status, json) = app.call(send_request(Some("Hello"), Some(&file))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["kind"], "not_linked");
    assert!(app.factory.device(DEFAULT_SESSION_ID).sent_phones().is_empty());
}

#[tokio::test]
async fn test_scenario_empty_message_rejected() {
    let app = test_app("");
    app.link().await;

    let file = recipients_xlsx();
    let (status, json) = app.call(send_request(Some(""), Some(&file))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "invalid_input");

    let (status, _) = app.call(send_request(None, Some(&file))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.call(send_request(Some("Hello"), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(app.factory.device(DEFAULT_SESSION_ID).sent_phones().is_empty());
}

#[tokio::test]
async fn test_scenario_malformed_file_keeps_link() {
    let app = test_app("");
    app.link().await;

    let (status, json) = app
        .call(send_request(Some("Hello"), Some(b"not a workbook")))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["kind"], "malformed_spreadsheet");
    assert!(json["error"]
        .as_str()
        .unwrap()
        .starts_with("malformed spreadsheet"));

    let (_, state) = app.get("/state").await;
    assert_eq!(state["state"], "linked");
}

#[tokio::test]
async fn test_send_when_never_linked_is_409() {
    let app = test_app("");
    let file = recipients_xlsx();
    let (status, json) = app.call(send_request(Some("Hello"), Some(&file))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["kind"], "not_linked");
}

#[tokio::test]
async fn test_all_recipients_failed_returns_report() {
    let app = test_app("");
    app.link().await;
    let device = app.factory.device(DEFAULT_SESSION_ID);
    device.fail_sends_to("5511999887766");
    device.fail_sends_to("919876543210");

    let file = recipients_xlsx();
    let (status, json) = app.call(send_request(Some("Hello"), Some(&file))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["kind"], "send_failed");
    assert_eq!(json["report"]["total"], 2);
    assert_eq!(json["report"]["failed"], 2);
}

#[tokio::test]
async fn test_unlink_device() {
    let app = test_app("");
    app.link().await;

    let req = Request::post("/unlink-device").body(Body::empty()).unwrap();
    let (status, json) = app.call(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "unlinked");

    let (_, state) = app.get("/state").await;
    assert_eq!(state["state"], "unlinked");
    assert!(app
        .factory
        .device(DEFAULT_SESSION_ID)
        .logged_out
        .load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let app = test_app("");
    app.link().await;

    let (_, other) = app.get("/state?session=other").await;
    assert_eq!(other["state"], "unlinked");
    let (_, default) = app.get("/state").await;
    assert_eq!(default["state"], "linked");
}

#[test]
fn test_status_mapping() {
    assert_eq!(status_for(ErrorKind::InvalidInput), StatusCode::BAD_REQUEST);
    assert_eq!(status_for(ErrorKind::NotLinked), StatusCode::CONFLICT);
    assert_eq!(status_for(ErrorKind::DispatchBusy), StatusCode::CONFLICT);
    assert_eq!(
        status_for(ErrorKind::MalformedSpreadsheet),
        StatusCode::UNPROCESSABLE_ENTITY
    );
    assert_eq!(status_for(ErrorKind::SendFailed), StatusCode::BAD_GATEWAY);
}

#[test]
fn test_constant_time_eq() {
    assert!(constant_time_eq("secret", "secret"));
    assert!(!constant_time_eq("secret", "secreT"));
    assert!(!constant_time_eq("secret", "secrets"));
}

// ---------------------------------------------------------------------------
// Push sockets
// ---------------------------------------------------------------------------

/// Serve the router on an ephemeral port.
async fn spawn_server(router: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    addr
}

async fn next_frame<S>(ws: &mut S) -> Value
where
    S: futures::Stream<
            Item = Result<
                tokio_tungstenite::tungstenite::Message,
                tokio_tungstenite::tungstenite::Error,
            >,
        > + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no frame within 2s")
            .expect("socket closed")
            .unwrap();
        if msg.is_text() {
            return serde_json::from_str(msg.to_text().unwrap()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_events_socket_sends_state_then_link_events() {
    let app = test_app("");
    let addr = spawn_server(app.router.clone()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/events"))
        .await
        .unwrap();

    let first = next_frame(&mut ws).await;
    assert_eq!(first["event"], "state");
    assert_eq!(first["data"]["state"], "unlinked");

    let session = app.sessions.get_or_create(DEFAULT_SESSION_ID).await.unwrap();
    session.initiate_link().await.unwrap();
    let device = app.factory.device(DEFAULT_SESSION_ID);

    device.emit(DeviceEvent::Qr("abc123".into())).await;
    assert_eq!(
        next_frame(&mut ws).await,
        json!({"event": "qr", "data": "abc123"})
    );

    device.emit(DeviceEvent::Paired).await;
    assert_eq!(next_frame(&mut ws).await, json!({"event": "ready"}));
}

#[tokio::test]
async fn test_events_socket_survives_auth_failure() {
    let app = test_app("");
    let addr = spawn_server(app.router.clone()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/events"))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut ws).await["event"], "state");

    let session = app.sessions.get_or_create(DEFAULT_SESSION_ID).await.unwrap();
    let device = app.factory.device(DEFAULT_SESSION_ID);

    session.initiate_link().await.unwrap();
    device
        .emit(DeviceEvent::AuthFailed("pairing rejected".into()))
        .await;
    assert_eq!(
        next_frame(&mut ws).await,
        json!({"event": "auth_failure", "data": "pairing rejected"})
    );

    // Same socket, next attempt.
    session.initiate_link().await.unwrap();
    device.emit(DeviceEvent::Qr("second".into())).await;
    assert_eq!(
        next_frame(&mut ws).await,
        json!({"event": "qr", "data": "second"})
    );
}

#[tokio::test]
async fn test_events_socket_requires_token() {
    let app = test_app("secret");
    let addr = spawn_server(app.router.clone()).await;

    assert!(tokio_tungstenite::connect_async(format!("ws://{addr}/events"))
        .await
        .is_err());

    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/events?token=secret"))
            .await
            .unwrap();
    assert_eq!(next_frame(&mut ws).await["event"], "state");
}

#[tokio::test]
async fn test_socket_io_handshake_served() {
    let app = test_app("");
    let resp = app
        .router
        .clone()
        .oneshot(
            Request::get("/socket.io/?EIO=4&transport=polling")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let body = String::from_utf8(body.to_vec()).unwrap();
    assert!(body.starts_with("0{"), "not an engine.io open packet: {body}");
    assert!(body.contains("\"sid\""));
}

/// One long-polling GET; the server answers as soon as packets are queued.
async fn engine_poll(http: &reqwest::Client, url: &str) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        http.get(url).send().await.unwrap().text().await.unwrap()
    })
    .await
    .expect("poll timed out")
}

/// Keep polling until `needle` shows up in the received packets.
async fn poll_until(http: &reqwest::Client, url: &str, needle: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = String::new();
    while !seen.contains(needle) {
        assert!(
            Instant::now() < deadline,
            "never received {needle}, got {seen}"
        );
        seen.push_str(&engine_poll(http, url).await);
    }
    seen
}

#[tokio::test]
async fn test_socket_io_client_receives_qr_and_ready() {
    let app = test_app("");
    let addr = spawn_server(app.router.clone()).await;
    let http = reqwest::Client::new();
    let base = format!("http://{addr}/socket.io/?EIO=4&transport=polling");

    let open = engine_poll(&http, &base).await;
    let handshake: Value = serde_json::from_str(open.strip_prefix('0').unwrap()).unwrap();
    let sid = handshake["sid"].as_str().unwrap();
    let url = format!("{base}&sid={sid}");

    // Join the default namespace.
    let joined = http.post(&url).body("40").send().await.unwrap();
    assert!(joined.status().is_success());

    let received = poll_until(&http, &url, r#"42["state""#).await;
    assert!(received.contains(r#""state":"unlinked""#), "{received}");

    let session = app.sessions.get_or_create(DEFAULT_SESSION_ID).await.unwrap();
    session.initiate_link().await.unwrap();
    let device = app.factory.device(DEFAULT_SESSION_ID);

    device.emit(DeviceEvent::Qr("abc123".into())).await;
    poll_until(&http, &url, r#"42["qr","abc123"]"#).await;

    device.emit(DeviceEvent::Paired).await;
    poll_until(&http, &url, r#"42["ready""#).await;
}

#[tokio::test]
async fn test_socket_io_client_receives_auth_failure() {
    let app = test_app("");
    let addr = spawn_server(app.router.clone()).await;
    let http = reqwest::Client::new();
    let base = format!("http://{addr}/socket.io/?EIO=4&transport=polling");

    let open = engine_poll(&http, &base).await;
    let handshake: Value = serde_json::from_str(open.strip_prefix('0').unwrap()).unwrap();
    let url = format!("{base}&sid={}", handshake["sid"].as_str().unwrap());
    http.post(&url).body("40").send().await.unwrap();
    poll_until(&http, &url, r#"42["state""#).await;

    let session = app.sessions.get_or_create(DEFAULT_SESSION_ID).await.unwrap();
    session.initiate_link().await.unwrap();
    app.factory
        .device(DEFAULT_SESSION_ID)
        .emit(DeviceEvent::AuthFailed("pairing rejected".into()))
        .await;
    poll_until(&http, &url, r#"42["auth_failure","pairing rejected"]"#).await;
}
