//! HTTP front end: process control, log queries and live viewer streams
//! (WebSocket and Server-Sent Events).

#[cfg(feature = "serve")]
use crate::config::ServeConfig;
#[cfg(feature = "serve")]
use crate::overseer::Overseer;
#[cfg(feature = "serve")]
use std::sync::Arc;

#[cfg(feature = "serve")]
#[derive(Clone)]
struct AppState {
    overseer: Arc<Overseer>,
    serve: Arc<ServeConfig>,
    shutdown: tokio::sync::watch::Receiver<bool>,
}

/// Build the router. `shutdown` flipping to true ends every live viewer.
#[cfg(feature = "serve")]
pub fn router(
    overseer: Arc<Overseer>,
    serve: ServeConfig,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> axum::Router {
    use axum::routing::{get, post};
    use tower_http::cors::CorsLayer;

    let state = AppState {
        overseer,
        serve: Arc::new(serve),
        shutdown,
    };

    axum::Router::new()
        .route("/api/health", get(health))
        .route("/api/process/status", get(process_status))
        .route("/api/process/start", post(process_start))
        .route("/api/process/stop", post(process_stop))
        .route("/api/process/restart", post(process_restart))
        .route("/api/logs/recent", get(logs_recent))
        .route("/api/logs/search", get(logs_search))
        .route("/api/logs/stats", get(logs_stats))
        .route("/api/logs/stream", get(logs_sse))
        .route("/ws/logs", get(logs_ws))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Serve until `shutdown` flips to true.
#[cfg(feature = "serve")]
pub async fn run(
    overseer: Arc<Overseer>,
    serve: &ServeConfig,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", serve.bind, serve.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("serve listening on {local_addr}");
    if local_addr.ip().is_unspecified() {
        tracing::warn!("listening on all interfaces; the API has no authentication");
    }

    let app = router(overseer, serve.clone(), shutdown.clone());
    let mut shutdown = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            stop_requested(&mut shutdown).await;
            tracing::info!("http server shutting down");
        })
        .await?;
    Ok(())
}

/// Resolves once shutdown was requested (or the sender is gone).
#[cfg(feature = "serve")]
async fn stop_requested(shutdown: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(feature = "serve")]
async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "ok": true,
        "viewers": state.overseer.feed().hub().subscriber_count(),
    }))
}

#[cfg(feature = "serve")]
async fn process_status(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<crate::status::StatusReport> {
    axum::Json(state.overseer.status())
}

#[cfg(feature = "serve")]
async fn process_start(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<crate::status::OperationResult> {
    axum::Json(state.overseer.start().await)
}

#[cfg(feature = "serve")]
async fn process_stop(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<crate::status::OperationResult> {
    axum::Json(state.overseer.stop().await)
}

#[cfg(feature = "serve")]
async fn process_restart(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<crate::status::OperationResult> {
    axum::Json(state.overseer.restart().await)
}

#[cfg(feature = "serve")]
#[derive(Debug, serde::Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

#[cfg(feature = "serve")]
#[derive(Debug, serde::Serialize)]
struct LogsResponse {
    count: usize,
    logs: Vec<crate::record::Envelope>,
}

#[cfg(feature = "serve")]
async fn logs_recent(
    axum::extract::State(state): axum::extract::State<AppState>,
    axum::extract::Query(query): axum::extract::Query<RecentQuery>,
) -> axum::Json<LogsResponse> {
    let limit = query
        .limit
        .unwrap_or(state.serve.backlog)
        .min(state.serve.max_recent);
    let logs = state.overseer.feed().recent(limit);
    axum::Json(LogsResponse {
        count: logs.len(),
        logs,
    })
}

#[cfg(feature = "serve")]
#[derive(Debug, Default, serde::Deserialize)]
struct SearchQuery {
    keyword: Option<String>,
    level: Option<String>,
    category: Option<String>,
    since: Option<String>,
    until: Option<String>,
    limit: Option<usize>,
}

#[cfg(feature = "serve")]
impl SearchQuery {
    fn into_filter(self, max: usize) -> Result<crate::history::SearchFilter, String> {
        use crate::parser::try_parse_timestamp;
        use crate::record::{Category, Level};

        let level = self
            .level
            .map(|l| Level::from_word(&l).ok_or(format!("unknown level `{l}`")))
            .transpose()?;
        let category = self
            .category
            .map(|c| Category::from_name(&c).ok_or(format!("unknown category `{c}`")))
            .transpose()?;
        let since = self
            .since
            .map(|t| try_parse_timestamp(&t).ok_or(format!("invalid timestamp `{t}`")))
            .transpose()?;
        let until = self
            .until
            .map(|t| try_parse_timestamp(&t).ok_or(format!("invalid timestamp `{t}`")))
            .transpose()?;

        let defaults = crate::history::SearchFilter::default();
        Ok(crate::history::SearchFilter {
            keyword: self.keyword.filter(|k| !k.is_empty()),
            level,
            category,
            since,
            until,
            limit: self.limit.unwrap_or(defaults.limit).min(max),
        })
    }
}

#[cfg(feature = "serve")]
async fn logs_search(
    axum::extract::State(state): axum::extract::State<AppState>,
    axum::extract::Query(query): axum::extract::Query<SearchQuery>,
) -> Result<axum::Json<LogsResponse>, (axum::http::StatusCode, String)> {
    let filter = query
        .into_filter(state.serve.max_recent)
        .map_err(|e| (axum::http::StatusCode::BAD_REQUEST, e))?;
    let logs = state.overseer.feed().search(&filter);
    Ok(axum::Json(LogsResponse {
        count: logs.len(),
        logs,
    }))
}

#[cfg(feature = "serve")]
async fn logs_stats(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<crate::feed::FeedStats> {
    axum::Json(state.overseer.feed().stats())
}

#[cfg(feature = "serve")]
fn open_session(state: &AppState) -> crate::viewer::ViewerSession {
    crate::viewer::ViewerSession::open(
        state.overseer.feed(),
        state.serve.backlog,
        std::time::Duration::from_secs(state.serve.heartbeat_secs),
    )
}

#[cfg(feature = "serve")]
async fn logs_ws(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| ws_session(socket, state))
}

/// One WebSocket viewer. Text `ping` from the client is answered `pong`.
#[cfg(feature = "serve")]
async fn ws_session(mut socket: axum::extract::ws::WebSocket, state: AppState) {
    use axum::extract::ws::Message;

    let send_timeout = std::time::Duration::from_secs(state.serve.send_timeout_secs);
    let mut shutdown = state.shutdown.clone();
    let mut session = open_session(&state);

    loop {
        tokio::select! {
            next = session.next() => {
                let Some(message) = next else { break };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode viewer message");
                        continue;
                    }
                };
                match tokio::time::timeout(send_timeout, socket.send(Message::Text(json.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(error = %e, "websocket send failed");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!("websocket send timed out, dropping viewer");
                        break;
                    }
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) if text.as_str() == "ping" => {
                    let pong = socket.send(Message::Text("pong".into()));
                    if !matches!(tokio::time::timeout(send_timeout, pong).await, Ok(Ok(()))) {
                        tracing::debug!("websocket pong failed, dropping viewer");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "websocket receive failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = stop_requested(&mut shutdown) => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }
    session.close();
}

#[cfg(feature = "serve")]
struct SseSink(
    tokio::sync::mpsc::Sender<Result<axum::response::sse::Event, std::convert::Infallible>>,
);

#[cfg(feature = "serve")]
impl crate::viewer::ViewerSink for SseSink {
    type Error = String;

    async fn send(&mut self, message: crate::viewer::ViewerMessage) -> Result<(), String> {
        let event = axum::response::sse::Event::default()
            .event(message.kind())
            .json_data(&message)
            .map_err(|e| e.to_string())?;
        self.0
            .send(Ok(event))
            .await
            .map_err(|_| "event stream closed".to_string())
    }
}

/// One SSE viewer: `event:` names the message kind, `data:` carries JSON.
#[cfg(feature = "serve")]
async fn logs_sse(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::response::sse::Sse<
    impl tokio_stream::Stream<Item = Result<axum::response::sse::Event, std::convert::Infallible>>,
> {
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let send_timeout = std::time::Duration::from_secs(state.serve.send_timeout_secs);
    let mut shutdown = state.shutdown.clone();
    let mut session = open_session(&state);

    tokio::spawn(async move {
        // Notices a dropped response body without waiting for the next send.
        let disconnected = tx.clone();
        let mut sink = SseSink(tx);
        tokio::select! {
            reason = crate::viewer::drive(&mut session, &mut sink, send_timeout) => {
                tracing::debug!(?reason, "sse viewer closed");
            }
            _ = disconnected.closed() => {
                tracing::debug!("sse viewer disconnected");
                session.close();
            }
            _ = stop_requested(&mut shutdown) => session.close(),
        }
    });

    axum::response::sse::Sse::new(tokio_stream::wrappers::ReceiverStream::new(rx))
}

#[cfg(all(test, feature = "serve"))]
mod tests {
    use super::*;
    use crate::config::OverseerConfig;
    use crate::parser::parse_line;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    fn app(dir: &TempDir, script: &str) -> (axum::Router, Arc<Overseer>, tokio::sync::watch::Sender<bool>) {
        let mut config = OverseerConfig::default();
        config.worker.command = "sh".to_string();
        config.worker.args = vec!["-c".to_string(), script.to_string()];
        config.worker.working_dir = dir.path().to_path_buf();
        config.supervisor.startup_grace_ms = 200;
        config.supervisor.stop_timeout_secs = 1;
        config.tail.poll_interval_ms = 20;
        config.serve.max_recent = 5;
        config.serve.backlog = 3;

        let overseer = Overseer::new(&config, None);
        let (tx, rx) = tokio::sync::watch::channel(false);
        (router(Arc::clone(&overseer), config.serve.clone(), rx), overseer, tx)
    }

    async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    async fn post_json(app: &axum::Router, uri: &str) -> serde_json::Value {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn ingest(overseer: &Overseer, line: &str) {
        overseer.feed().ingest(parse_line(line).unwrap());
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempdir().unwrap();
        let (app, _, _) = app(&dir, "exec sleep 30");
        let (status, body) = get_json(&app, "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["viewers"], 0);
    }

    #[tokio::test]
    async fn test_process_lifecycle_over_http() {
        let dir = tempdir().unwrap();
        let (app, _, _) = app(&dir, "exec sleep 30");

        let (_, status) = get_json(&app, "/api/process/status").await;
        assert_eq!(status["is_running"], false);
        assert!(status.get("pid").is_none());

        let started = post_json(&app, "/api/process/start").await;
        assert_eq!(started["success"], true);
        let pid = started["pid"].as_u64().unwrap();

        let (_, status) = get_json(&app, "/api/process/status").await;
        assert_eq!(status["is_running"], true);
        assert_eq!(status["status"], "running");
        assert_eq!(status["pid"].as_u64(), Some(pid));

        let again = post_json(&app, "/api/process/start").await;
        assert_eq!(again["success"], false);

        let restarted = post_json(&app, "/api/process/restart").await;
        assert_eq!(restarted["success"], true);
        assert_ne!(restarted["pid"].as_u64(), Some(pid));

        let stopped = post_json(&app, "/api/process/stop").await;
        assert_eq!(stopped["success"], true);
        let (_, status) = get_json(&app, "/api/process/status").await;
        assert_eq!(status["is_running"], false);

        let stopped = post_json(&app, "/api/process/stop").await;
        assert_eq!(stopped["success"], false);
    }

    #[tokio::test]
    async fn test_recent_is_clamped() {
        let dir = tempdir().unwrap();
        let (app, overseer, _) = app(&dir, "exec sleep 30");
        for i in 0..10 {
            ingest(&overseer, &format!("INFO: record {i}"));
        }

        let (_, body) = get_json(&app, "/api/logs/recent?limit=500").await;
        assert_eq!(body["count"], 5);
        assert_eq!(body["logs"][0]["message"], "record 5");
        assert_eq!(body["logs"][4]["seq"], 10);

        // Default is the viewer backlog size.
        let (_, body) = get_json(&app, "/api/logs/recent").await;
        assert_eq!(body["count"], 3);
    }

    #[tokio::test]
    async fn test_search_and_stats() {
        let dir = tempdir().unwrap();
        let (app, overseer, _) = app(&dir, "exec sleep 30");
        ingest(&overseer, "2024-01-20 10:00:00.000 | INFO | bot:run:1 - User: hello");
        ingest(&overseer, "2024-01-20 10:05:00.000 | ERROR | bot:run:2 - reply failed");
        ingest(&overseer, "2024-01-20 10:10:00.000 | INFO | bot:run:3 - heartbeat ok");

        let (status, body) = get_json(&app, "/api/logs/search?level=error").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["logs"][0]["message"], "reply failed");

        let (_, body) = get_json(&app, "/api/logs/search?category=user_message").await;
        assert_eq!(body["logs"][0]["message"], "User: hello");

        let (_, body) =
            get_json(&app, "/api/logs/search?since=2024-01-20%2010:04:00&keyword=OK").await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["logs"][0]["category"], "heartbeat");

        let (status, _) = get_json(&app, "/api/logs/search?level=loud").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get_json(&app, "/api/logs/search?since=yesterday").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, stats) = get_json(&app, "/api/logs/stats").await;
        assert_eq!(stats["total_count"], 3);
        assert_eq!(stats["level_counts"]["ERROR"], 1);
        assert_eq!(stats["recent_errors"][0]["message"], "reply failed");
        assert_eq!(stats["subscribers"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_sse_stream_greets_then_replays_backlog() {
        use tokio_stream::StreamExt;

        let dir = tempdir().unwrap();
        let (app, overseer, shutdown) = app(&dir, "exec sleep 30");
        ingest(&overseer, "INFO: before join");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/logs/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(overseer.feed().hub().subscriber_count(), 1);

        let mut body = response.into_body().into_data_stream();
        let mut text = String::new();
        while !text.contains("before join") {
            let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), body.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(text.contains("event: connected"));
        assert!(text.contains("event: log"));

        shutdown.send(true).unwrap();
        let end = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while body.next().await.is_some() {}
        })
        .await;
        assert!(end.is_ok());
        assert_eq!(overseer.feed().hub().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_sse_viewer_released_when_client_goes_away() {
        use tokio_stream::StreamExt;

        let dir = tempdir().unwrap();
        let (app, overseer, _shutdown) = app(&dir, "exec sleep 30");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/logs/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let mut body = response.into_body().into_data_stream();
        let greeting = tokio::time::timeout(std::time::Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&greeting).contains("event: connected"));
        assert_eq!(overseer.feed().hub().subscriber_count(), 1);

        // No record is published and the heartbeat is 30s away.
        drop(body);
        let released = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while overseer.feed().hub().subscriber_count() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(released.is_ok(), "viewer still subscribed after disconnect");
    }

    /// Reads one unfragmented server frame, returning its opcode and payload.
    async fn read_frame(stream: &mut tokio::net::TcpStream) -> (u8, Vec<u8>) {
        use tokio::io::AsyncReadExt;

        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await.unwrap();
        let len = match head[1] & 0x7f {
            126 => {
                let mut ext = [0u8; 2];
                stream.read_exact(&mut ext).await.unwrap();
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                stream.read_exact(&mut ext).await.unwrap();
                u64::from_be_bytes(ext) as usize
            }
            n => n as usize,
        };
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        (head[0] & 0x0f, payload)
    }

    #[tokio::test]
    async fn test_websocket_ping_gets_pong() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempdir().unwrap();
        let (app, overseer, _shutdown) = app(&dir, "exec sleep 30");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let handshake = format!(
            "GET /ws/logs HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        stream.write_all(handshake.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        while !response.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).await.unwrap();
            response.push(byte[0]);
        }
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 101"));

        let (opcode, greeting) = read_frame(&mut stream).await;
        assert_eq!(opcode, 0x1);
        assert!(String::from_utf8_lossy(&greeting).contains("connected"));
        assert_eq!(overseer.feed().hub().subscriber_count(), 1);

        // Client frames are masked.
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        let mut frame = vec![0x81, 0x80 | 4];
        frame.extend_from_slice(&mask);
        frame.extend(b"ping".iter().zip(mask.iter().cycle()).map(|(b, m)| b ^ m));
        stream.write_all(&frame).await.unwrap();

        let reply = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                let (opcode, payload) = read_frame(&mut stream).await;
                if opcode == 0x1 && payload == b"pong" {
                    break;
                }
            }
        })
        .await;
        assert!(reply.is_ok(), "no pong within the send timeout");

        drop(stream);
        let released = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while overseer.feed().hub().subscriber_count() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(released.is_ok());
    }
}
