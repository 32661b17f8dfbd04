//! End-to-end request lifecycle over an in-memory connection

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use orderly::app::Application;
use orderly::config::ServerConfig;
use orderly::http::connection::Connection;
use orderly::http::context::{
    BodyConsumer, CloseHook, Completion, Context, HeadersHook, Outcome,
};
use orderly::http::controller::Controller;
use orderly::http::error::{AppError, ValidationError};
use orderly::http::gate::DeliveryGate;
use orderly::http::parser::RequestLine;
use orderly::http::request::{Method, Request};
use orderly::http::response::{Response, StatusCode};
use orderly::server::spawn::WorkerPool;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

struct TestApp;

#[async_trait]
impl Application for TestApp {
    async fn call(&self, ctx: &mut Context) -> Result<Outcome, AppError> {
        let path = ctx.request.path.clone();
        match path.as_str() {
            "/slow" => {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok(Response::text(StatusCode::OK, "slow").into())
            }
            "/fast" => Ok(Response::text(StatusCode::OK, "fast").into()),
            "/invalid" => Err(AppError::validation(422, "bad input")),
            "/boom" => Err(AppError::msg("database exploded")),
            "/panic" => panic!("handler panicked"),
            "/echo" => {
                let mut body = String::new();
                ctx.request.body.read_to_string(&mut body)?;
                Ok(Response::text(StatusCode::OK, body).into())
            }
            "/stream" => {
                ctx.stream_start(StatusCode::OK, [("Content-Type", "text/plain")])
                    .await?;
                ctx.stream_send("a").await?;
                ctx.stream_send("b").await?;
                ctx.stream_close().await?;
                // Ignored: the stream already answered
                Ok(Response::text(StatusCode::OK, "unused").into())
            }
            "/stream-open" => {
                ctx.stream_start(StatusCode::OK, [("Content-Type", "text/plain")])
                    .await?;
                ctx.stream_send(Bytes::from_static(b"x")).await?;
                Ok(Outcome::Deferred)
            }
            "/deferred" => {
                let completion = ctx.defer();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    completion.respond(Response::text(StatusCode::OK, "later"));
                });
                Ok(Outcome::Deferred)
            }
            "/deferred-fail" => {
                let completion = ctx.defer();
                tokio::spawn(async move {
                    completion.fail(ValidationError::new(409, "already taken"));
                });
                Ok(Outcome::Deferred)
            }
            "/deferred-dropped" => {
                drop(ctx.defer());
                Ok(Outcome::Deferred)
            }
            _ => Ok(Response::text(StatusCode::NOT_FOUND, "missing").into()),
        }
    }
}

fn text_response(status_line: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
        status_line,
        body.len(),
        body
    )
}

fn closing_text(status_line: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nConnection: close\r\nContent-Length: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
        status_line,
        body.len(),
        body
    )
}

fn ok(body: &str) -> String {
    text_response("200 OK", body)
}

fn json_error(status_line: &str, message: &str) -> String {
    let body = format!(r#"{{"error":"{}"}}"#, message);
    format!(
        "HTTP/1.1 {}\r\nConnection: close\r\nContent-Length: {}\r\nContent-Type: application/json\r\n\r\n{}",
        status_line,
        body.len(),
        body
    )
}

/// Sends `input` and collects what the server writes until it closes its
/// side or goes quiet, then hangs up.
async fn exchange(config: ServerConfig, input: &[u8]) -> String {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(Connection::new(server, Arc::new(config)).run());

    client.write_all(input).await.unwrap();

    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_millis(300), client.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => panic!("read failed: {}", e),
        }
    }

    drop(client);
    handle.await.unwrap().unwrap();

    String::from_utf8(out).unwrap()
}

#[tokio::test]
async fn test_pipelined_responses_keep_arrival_order() {
    let out = exchange(
        ServerConfig::new(TestApp),
        b"GET /slow HTTP/1.1\r\n\r\nGET /fast HTTP/1.1\r\n\r\n",
    )
    .await;

    assert_eq!(out, ok("slow") + &ok("fast"));
}

#[tokio::test]
async fn test_pipelined_order_with_worker_pool() {
    let config = ServerConfig::new(TestApp).spawner(WorkerPool::new(2));
    let out = exchange(
        config,
        b"GET /slow HTTP/1.1\r\n\r\nGET /fast HTTP/1.1\r\n\r\nGET /slow HTTP/1.1\r\n\r\n",
    )
    .await;

    assert_eq!(out, ok("slow") + &ok("fast") + &ok("slow"));
}

#[tokio::test]
async fn test_validation_failure_closes_connection() {
    let out = exchange(
        ServerConfig::new(TestApp),
        b"GET /invalid HTTP/1.1\r\n\r\nGET /fast HTTP/1.1\r\n\r\n",
    )
    .await;

    assert_eq!(out, json_error("422 Unprocessable Entity", "bad input"));
}

#[tokio::test]
async fn test_fault_message_outside_production() {
    let out = exchange(ServerConfig::new(TestApp), b"GET /boom HTTP/1.1\r\n\r\n").await;

    assert_eq!(out, closing_text("500 Internal Server Error", "database exploded"));
}

#[tokio::test]
async fn test_fault_message_hidden_in_production() {
    let config = ServerConfig::new(TestApp).production(true);
    let out = exchange(config, b"GET /boom HTTP/1.1\r\n\r\n").await;

    assert_eq!(
        out,
        closing_text("500 Internal Server Error", "Internal Server Error")
    );
    assert!(!out.contains("exploded"));
}

#[tokio::test]
async fn test_panic_becomes_server_error() {
    let out = exchange(
        ServerConfig::new(TestApp),
        b"GET /panic HTTP/1.1\r\n\r\nGET /fast HTTP/1.1\r\n\r\n",
    )
    .await;

    assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(out.contains("handler panicked"));
    assert!(!out.contains("fast"));
}

#[tokio::test]
async fn test_http10_closes_by_default() {
    let out = exchange(
        ServerConfig::new(TestApp),
        b"GET /fast HTTP/1.0\r\n\r\nGET /fast HTTP/1.0\r\n\r\n",
    )
    .await;

    assert_eq!(out, closing_text("200 OK", "fast"));
}

#[tokio::test]
async fn test_http10_keep_alive() {
    let out = exchange(
        ServerConfig::new(TestApp),
        b"GET /fast HTTP/1.0\r\nConnection: keep-alive\r\n\r\nGET /fast HTTP/1.0\r\n\r\nGET /fast HTTP/1.0\r\n\r\n",
    )
    .await;

    assert_eq!(out, ok("fast") + &closing_text("200 OK", "fast"));
}

#[tokio::test]
async fn test_http11_connection_close() {
    let out = exchange(
        ServerConfig::new(TestApp),
        b"GET /fast HTTP/1.1\r\nConnection: close\r\n\r\nGET /fast HTTP/1.1\r\n\r\n",
    )
    .await;

    assert_eq!(out, closing_text("200 OK", "fast"));
}

#[tokio::test]
async fn test_streaming_waits_for_predecessor() {
    let out = exchange(
        ServerConfig::new(TestApp),
        b"GET /slow HTTP/1.1\r\n\r\nGET /stream HTTP/1.1\r\n\r\nGET /fast HTTP/1.1\r\n\r\n",
    )
    .await;

    // The stream closes the connection, so the third request is never answered
    assert_eq!(
        out,
        ok("slow") + "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\nab"
    );
}

#[tokio::test]
async fn test_stream_left_open_is_closed() {
    let out = exchange(
        ServerConfig::new(TestApp),
        b"GET /stream-open HTTP/1.1\r\n\r\n",
    )
    .await;

    assert_eq!(
        out,
        "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\nx"
    );
}

#[tokio::test]
async fn test_deferred_response_keeps_order() {
    let out = exchange(
        ServerConfig::new(TestApp),
        b"GET /deferred HTTP/1.1\r\n\r\nGET /fast HTTP/1.1\r\n\r\n",
    )
    .await;

    assert_eq!(out, ok("later") + &ok("fast"));
}

#[tokio::test]
async fn test_dropped_completion_is_a_server_error() {
    let out = exchange(
        ServerConfig::new(TestApp),
        b"GET /deferred-dropped HTTP/1.1\r\n\r\n",
    )
    .await;

    assert_eq!(
        out,
        closing_text(
            "500 Internal Server Error",
            "deferred response was dropped without completing"
        )
    );
}

#[tokio::test]
async fn test_failed_completion_is_mapped() {
    let out = exchange(
        ServerConfig::new(TestApp),
        b"GET /deferred-fail HTTP/1.1\r\n\r\nGET /fast HTTP/1.1\r\n\r\n",
    )
    .await;

    assert_eq!(out, json_error("409 Conflict", "already taken"));
}

#[tokio::test]
async fn test_body_is_rewound_for_application() {
    let out = exchange(
        ServerConfig::new(TestApp),
        b"POST /echo HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world",
    )
    .await;

    assert_eq!(out, ok("hello world"));
}

#[tokio::test]
async fn test_head_response_has_no_body() {
    let out = exchange(ServerConfig::new(TestApp), b"HEAD /fast HTTP/1.1\r\n\r\n").await;

    assert_eq!(
        out,
        "HTTP/1.1 200 OK\r\nContent-Length: 4\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n"
    );
}

#[tokio::test]
async fn test_malformed_request_is_rejected() {
    let out = exchange(
        ServerConfig::new(TestApp),
        b"GET /fast HTTP/1.1\r\n\r\nBROKEN\r\n\r\n",
    )
    .await;

    assert_eq!(
        out,
        ok("fast") + &json_error("400 Bad Request", "malformed request line")
    );
}

#[tokio::test]
async fn test_access_log_receives_every_request() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let config = ServerConfig::new(TestApp).access_log(
        move |req: &Request, resp: &Response, elapsed_ms: f64| -> anyhow::Result<()> {
            assert!(elapsed_ms >= 0.0);
            sink.lock()
                .unwrap()
                .push((req.path.clone(), resp.status.as_u16()));
            Ok(())
        },
    );

    exchange(
        config,
        b"GET /fast HTTP/1.1\r\n\r\nGET /nope HTTP/1.1\r\n\r\nGET /invalid HTTP/1.1\r\n\r\n",
    )
    .await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ("/fast".to_string(), 200),
            ("/nope".to_string(), 404),
            ("/invalid".to_string(), 422),
        ]
    );
}

#[tokio::test]
async fn test_failing_access_log_does_not_affect_response() {
    let config = ServerConfig::new(TestApp).access_log(
        |_: &Request, _: &Response, _: f64| -> anyhow::Result<()> {
            anyhow::bail!("log sink unavailable")
        },
    );

    let out = exchange(config, b"GET /fast HTTP/1.1\r\n\r\nGET /fast HTTP/1.1\r\n\r\n").await;

    assert_eq!(out, ok("fast") + &ok("fast"));
}

struct RequireAuth;

#[async_trait]
impl HeadersHook for RequireAuth {
    async fn after_headers(&mut self, request: &mut Request) -> Result<(), AppError> {
        if request.header("HTTP_AUTHORIZATION").is_none() {
            return Err(AppError::validation(401, "missing credentials"));
        }
        Ok(())
    }
}

struct AuthApp {
    called: Arc<AtomicBool>,
}

#[async_trait]
impl Application for AuthApp {
    fn prepare(&self, ctx: &mut Context) {
        ctx.headers_hook = Some(Box::new(RequireAuth));
    }

    async fn call(&self, _ctx: &mut Context) -> Result<Outcome, AppError> {
        self.called.store(true, Ordering::SeqCst);
        Ok(Response::text(StatusCode::OK, "welcome").into())
    }
}

#[tokio::test]
async fn test_headers_hook_failure_answers_early() {
    let called = Arc::new(AtomicBool::new(false));
    let app = AuthApp {
        called: Arc::clone(&called),
    };

    let out = exchange(
        ServerConfig::new(app),
        b"POST /upload HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc",
    )
    .await;

    assert_eq!(out, json_error("401 Unauthorized", "missing credentials"));
    assert!(!called.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_headers_hook_pass() {
    let called = Arc::new(AtomicBool::new(false));
    let app = AuthApp {
        called: Arc::clone(&called),
    };

    let out = exchange(
        ServerConfig::new(app),
        b"GET / HTTP/1.1\r\nAuthorization: Bearer t\r\n\r\n",
    )
    .await;

    assert_eq!(out, ok("welcome"));
    assert!(called.load(Ordering::SeqCst));
}

struct Collect(Arc<Mutex<Vec<u8>>>);

#[async_trait]
impl BodyConsumer for Collect {
    async fn consume(&mut self, chunk: Bytes) -> Result<(), AppError> {
        self.0.lock().unwrap().extend_from_slice(&chunk);
        Ok(())
    }
}

struct UploadApp {
    collected: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl Application for UploadApp {
    fn prepare(&self, ctx: &mut Context) {
        ctx.body_consumer = Some(Box::new(Collect(Arc::clone(&self.collected))));
    }

    async fn call(&self, ctx: &mut Context) -> Result<Outcome, AppError> {
        let consumed = self.collected.lock().unwrap().len();
        let body = format!("buffered={} consumed={}", ctx.request.body.len(), consumed);
        Ok(Response::text(StatusCode::OK, body).into())
    }
}

#[tokio::test]
async fn test_body_consumer_replaces_buffer() {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let app = UploadApp {
        collected: Arc::clone(&collected),
    };

    let out = exchange(
        ServerConfig::new(app),
        b"POST /upload HTTP/1.1\r\nContent-Length: 6\r\n\r\nabcdef",
    )
    .await;

    assert_eq!(out, ok("buffered=0 consumed=6"));
    assert_eq!(collected.lock().unwrap().as_slice(), b"abcdef");
}

struct FlagOnClose {
    closed: Arc<AtomicBool>,
    fail: bool,
}

#[async_trait]
impl CloseHook for FlagOnClose {
    async fn on_close(&mut self, _request: &Request) -> Result<(), AppError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail {
            return Err(AppError::msg("cleanup failed"));
        }
        Ok(())
    }
}

struct CloseApp {
    closed: Arc<AtomicBool>,
    fail: bool,
}

#[async_trait]
impl Application for CloseApp {
    fn prepare(&self, ctx: &mut Context) {
        ctx.close_hook = Some(Box::new(FlagOnClose {
            closed: Arc::clone(&self.closed),
            fail: self.fail,
        }));
    }

    async fn call(&self, _ctx: &mut Context) -> Result<Outcome, AppError> {
        Ok(Response::text(StatusCode::OK, "done").into())
    }
}

#[tokio::test]
async fn test_close_hook_runs_on_disconnect_mid_body() {
    for fail in [false, true] {
        let closed = Arc::new(AtomicBool::new(false));
        let app = CloseApp {
            closed: Arc::clone(&closed),
            fail,
        };

        let out = exchange(
            ServerConfig::new(app),
            b"POST /upload HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc",
        )
        .await;

        assert_eq!(out, "");
        assert!(closed.load(Ordering::SeqCst));
    }
}

#[tokio::test]
async fn test_controller_normalizes_and_defers() {
    let (mut client, server) = tokio::io::duplex(1024);
    let mut gate = DeliveryGate::new(Box::new(server));
    let mut controller = Controller::new(Arc::new(ServerConfig::new(TestApp)), gate.reserve());

    controller
        .on_headers_parsed(
            RequestLine {
                method: Method::POST,
                target: "/items?sort=asc".to_string(),
                major: 1,
                minor: 1,
            },
            vec![
                ("Host".to_string(), "example.com:8080".to_string()),
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("X-Request-Id".to_string(), "abc".to_string()),
            ],
        )
        .await;
    controller.on_body_chunk(Bytes::from_static(b"data")).await;

    let request = &controller.context().request;
    assert_eq!(request.header("SERVER_NAME"), Some("example.com"));
    assert_eq!(request.header("SERVER_PORT"), Some("8080"));
    assert_eq!(request.header("CONTENT_TYPE"), Some("text/plain"));
    assert_eq!(request.header("HTTP_X_REQUEST_ID"), Some("abc"));
    assert_eq!(request.query.as_deref(), Some("sort=asc"));
    assert_eq!(request.version, "1.1");
    assert_eq!(request.body.as_bytes(), b"data");
    assert!(!controller.is_finished());

    // Deferred writes nothing
    controller.on_application_result(Outcome::Deferred).await;
    assert!(!controller.context().has_responded());

    controller
        .on_application_result(Outcome::Immediate(Response::text(StatusCode::CREATED, "ok")))
        .await;
    assert!(controller.context().has_responded());

    drop(controller);
    drop(gate);
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    assert_eq!(
        String::from_utf8(out).unwrap(),
        text_response("201 Created", "ok")
    );
}

struct TickerApp {
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Application for TickerApp {
    fn prepare(&self, ctx: &mut Context) {
        ctx.close_hook = Some(Box::new(FlagOnClose {
            closed: Arc::clone(&self.closed),
            fail: false,
        }));
    }

    async fn call(&self, ctx: &mut Context) -> Result<Outcome, AppError> {
        ctx.stream_start(StatusCode::OK, [("Content-Type", "text/plain")])
            .await?;
        loop {
            tokio::time::sleep(Duration::from_millis(5)).await;
            ctx.stream_send("tick").await?;
        }
    }
}

#[tokio::test]
async fn test_close_hook_runs_when_stream_loses_client() {
    let closed = Arc::new(AtomicBool::new(false));
    let app = TickerApp {
        closed: Arc::clone(&closed),
    };

    let (mut client, server) = tokio::io::duplex(1024);
    let handle = tokio::spawn(Connection::new(server, Arc::new(ServerConfig::new(app))).run());

    client.write_all(b"GET /ticks HTTP/1.1\r\n\r\n").await.unwrap();
    let mut status_line = [0u8; 17];
    client.read_exact(&mut status_line).await.unwrap();
    assert_eq!(&status_line, b"HTTP/1.1 200 OK\r\n");

    drop(client);
    handle.await.unwrap().unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !closed.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("close hook never ran");
}

struct ParkingApp {
    closed: Arc<AtomicBool>,
    parked: Arc<Mutex<Vec<Completion>>>,
}

#[async_trait]
impl Application for ParkingApp {
    fn prepare(&self, ctx: &mut Context) {
        ctx.close_hook = Some(Box::new(FlagOnClose {
            closed: Arc::clone(&self.closed),
            fail: false,
        }));
    }

    async fn call(&self, ctx: &mut Context) -> Result<Outcome, AppError> {
        if ctx.request.path == "/sleep" {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.parked.lock().unwrap().push(ctx.defer());
        Ok(Outcome::Deferred)
    }
}

async fn hang_up_while_pending(path: &str) -> (Arc<AtomicBool>, Arc<Mutex<Vec<Completion>>>) {
    let closed = Arc::new(AtomicBool::new(false));
    let parked = Arc::new(Mutex::new(Vec::new()));
    let app = ParkingApp {
        closed: Arc::clone(&closed),
        parked: Arc::clone(&parked),
    };

    let (mut client, server) = tokio::io::duplex(1024);
    let handle = tokio::spawn(Connection::new(server, Arc::new(ServerConfig::new(app))).run());

    let request = format!("GET {} HTTP/1.1\r\n\r\n", path);
    client.write_all(request.as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!closed.load(Ordering::SeqCst));

    drop(client);
    handle.await.unwrap().unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !closed.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("close hook never ran");

    (closed, parked)
}

#[tokio::test]
async fn test_close_hook_runs_when_deferred_client_disconnects() {
    let (_, parked) = hang_up_while_pending("/poll").await;

    // Completing after the client left is harmless
    let completion = parked.lock().unwrap().pop().unwrap();
    completion.respond(Response::text(StatusCode::OK, "too late"));
}

#[tokio::test]
async fn test_running_application_is_abandoned_on_disconnect() {
    let (_, parked) = hang_up_while_pending("/sleep").await;

    assert!(parked.lock().unwrap().is_empty());
}
