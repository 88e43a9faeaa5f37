//! WebSocket transport for project consoles.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /console?projectId=<id>` on the console
//!    listener. A missing, empty or conflicting `projectId` is rejected with
//!    `400` before the upgrade.
//! 2. With `console.require_auth` enabled, the credential (from the
//!    `Authorization` header, or `?token=<t>` sent as `Bearer <t>`) is
//!    validated against the authorization backend exactly like project HTTP
//!    traffic.
//! 3. The connection is subscribed to the project's console channel before
//!    the upgrade completes, so no line published after the handshake is
//!    missed.
//! 4. Each output line is sent as one text frame. When the channel is closed
//!    (project stopped) the server sends a normal close frame.
//! 5. Text frames from the client are written to the process stdin.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        RawQuery, State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::console::{ConsoleEvent, ConsoleSubscription};
use crate::error::GatewayError;
use crate::path;
use crate::state::AppState;

/// `GET /console?projectId=<id>`: WebSocket upgrade handler.
pub async fn console_upgrade(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let project_id = match path::console_project_id(query.as_deref()) {
        Ok(id) => id,
        Err(e) => return GatewayError::InvalidRequest(e.to_string()).into_response(),
    };

    if state.config.console.require_auth {
        let Some(credential) = console_credential(&headers, query.as_deref()) else {
            return GatewayError::AuthMissingCredential.into_response();
        };
        if let Err(e) = state.auth.authorize(&project_id, &credential).await {
            return e.into_response();
        }
    }

    let subscription = state.console.subscribe(&project_id).await;
    let span = info_span!("console", project_id = %project_id, connection = %Uuid::new_v4());
    ws.on_upgrade(move |socket| handle_console(socket, state, subscription).instrument(span))
}

/// `Authorization` header, or the `token` query parameter as a bearer token.
fn console_credential(headers: &HeaderMap, query: Option<&str>) -> Option<HeaderValue> {
    if let Some(value) = headers.get(AUTHORIZATION).filter(|v| !v.is_empty()) {
        return Some(value.clone());
    }
    let token = path::query_param(query, "token").ok()?;
    HeaderValue::from_str(&format!("Bearer {token}")).ok()
}

async fn handle_console(socket: WebSocket, state: AppState, subscription: ConsoleSubscription) {
    let project_id = subscription.project_id().to_string();
    let (ws_sink, mut ws_stream) = socket.split();
    info!("Console client attached");

    // Task: relay console lines to the WebSocket sink
    let mut relay = tokio::spawn(relay_lines(subscription, ws_sink).in_current_span());

    loop {
        tokio::select! {
            _ = &mut relay => break,
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                match msg {
                    Message::Text(text) => {
                        if let Err(e) = state.supervisor.send_input(&project_id, text.as_str()).await {
                            debug!("Console input dropped: {e}");
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    relay.abort();
    info!("Console client detached");
}

/// Forward every console line as a text frame; send a normal close once the
/// channel is closed.
async fn relay_lines(mut subscription: ConsoleSubscription, mut sink: SplitSink<WebSocket, Message>) {
    while let Some(event) = subscription.recv().await {
        match event {
            ConsoleEvent::Line(line) => {
                if sink.send(Message::Text(line.into())).await.is_err() {
                    return;
                }
            }
            ConsoleEvent::Skipped(n) => debug!(skipped = n, "Client fell behind; oldest lines dropped"),
        }
    }
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "console closed".into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ExitPolicy};
    use crate::routes::console_router;
    use axum::{http::StatusCode, routing::get, Router};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        addr
    }

    async fn start_console(config: Config) -> (AppState, SocketAddr) {
        let state = AppState::new(config).unwrap();
        let addr = serve(console_router(state.clone())).await;
        (state, addr)
    }

    async fn connect(addr: SocketAddr, query: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}/console?{query}"))
            .await
            .unwrap();
        ws
    }

    async fn next_text(ws: &mut Client) -> String {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        msg.to_text().unwrap().to_string()
    }

    async fn expect_normal_close(ws: &mut Client) {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match msg {
            WsMessage::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_two_subscribers_see_every_line_then_close() {
        let (state, addr) = start_console(Config::default()).await;
        let mut a = connect(addr, "projectId=proj3").await;
        let mut b = connect(addr, "projectId=proj3").await;
        assert_eq!(state.console.subscriber_count("proj3").await, Some(2));

        for line in ["l1", "l2", "l3"] {
            state.console.publish("proj3", line).await;
        }
        state.console.close("proj3").await;

        for ws in [&mut a, &mut b] {
            assert_eq!(next_text(ws).await, "l1");
            assert_eq!(next_text(ws).await, "l2");
            assert_eq!(next_text(ws).await, "l3");
            expect_normal_close(ws).await;
        }
    }

    #[tokio::test]
    async fn test_process_output_then_clean_end() {
        let mut config = Config::default();
        config.execution.exit_policy = ExitPolicy::Release;
        let (state, addr) = start_console(config).await;
        let mut ws = connect(addr, "projectId=proj2").await;

        state
            .supervisor
            .start("proj2", "/", "sh", &["-c".into(), "echo ready".into()])
            .await
            .unwrap();

        assert_eq!(next_text(&mut ws).await, "ready");
        expect_normal_close(&mut ws).await;
    }

    #[tokio::test]
    async fn test_text_frames_reach_stdin() {
        let (state, addr) = start_console(Config::default()).await;
        state.supervisor.start("echo", "/", "cat", &[]).await.unwrap();
        let mut ws = connect(addr, "projectId=echo").await;

        ws.send(WsMessage::Text("hello".into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "hello");

        state.supervisor.stop("echo").await;
        expect_normal_close(&mut ws).await;
    }

    #[tokio::test]
    async fn test_bad_query_is_rejected() {
        let (_state, addr) = start_console(Config::default()).await;
        for query in ["", "projectId=", "projectId=a&projectId=b"] {
            let result = connect_async(format!("ws://{addr}/console?{query}")).await;
            assert!(result.is_err(), "{query:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_require_auth() {
        let backend = Router::new().route(
            "/configured-projects/{id}/validate",
            get(|headers: HeaderMap| async move {
                match headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
                    Some("Bearer good") => StatusCode::OK,
                    _ => StatusCode::FORBIDDEN,
                }
            }),
        );
        let backend_addr = serve(backend).await;

        let mut config = Config::default();
        config.console.require_auth = true;
        config.auth.backend_url = format!("http://{backend_addr}");
        let (_state, addr) = start_console(config).await;

        assert!(connect_async(format!("ws://{addr}/console?projectId=p"))
            .await
            .is_err());
        assert!(connect_async(format!("ws://{addr}/console?projectId=p&token=bad"))
            .await
            .is_err());
        let _ws = connect(addr, "projectId=p&token=good").await;
    }

    #[test]
    fn test_console_credential_prefers_header() {
        let mut headers = HeaderMap::new();
        assert!(console_credential(&headers, None).is_none());
        assert_eq!(
            console_credential(&headers, Some("projectId=p&token=abc")).unwrap(),
            "Bearer abc"
        );
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer header"));
        assert_eq!(
            console_credential(&headers, Some("token=abc")).unwrap(),
            "Bearer header"
        );
    }
}
