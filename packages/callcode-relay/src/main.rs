//! Callcode Relay Server
//!
//! Session coordination for two-party calls addressed by a short code:
//!
//! 1. **Call registry**: create a call, get a 6-character code, join/leave by
//!    code. Idle calls are reaped after 24 hours.
//!
//! 2. **Signaling relay**: forward offers, answers and network candidates
//!    between the two participants until they establish a direct media path.
//!    Messages arrive over HTTP or the participant's WebSocket and leave over
//!    the other participant's WebSocket, buffered briefly if it hasn't
//!    attached yet.
//!
//! Media never flows through the relay.

mod api;
mod handler;
mod protocol;
mod registry;
mod relay;
mod state;

use std::time::Duration;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "callcode-relay", version, about = "Call registry and signaling relay")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 3001, env = "PORT")]
    port: u16,

    /// Idle time in seconds after which a call is removed
    #[arg(long, default_value_t = 24 * 3600, env = "CALL_TTL_SECS")]
    call_ttl_secs: i64,

    /// How often to sweep for idle calls, in seconds
    #[arg(long, default_value_t = 3600, env = "REAP_INTERVAL_SECS")]
    reap_interval_secs: u64,

    /// How long a signal waits for its recipient to attach, in seconds
    #[arg(long, default_value_t = 30, env = "SIGNAL_BUFFER_SECS")]
    signal_buffer_secs: i64,

    /// Maximum buffered signals per call
    #[arg(long, default_value_t = 256, env = "MAX_BUFFERED_SIGNALS")]
    max_buffered_signals: usize,

    /// How often to drop undeliverable buffered signals, in seconds
    #[arg(long, default_value_t = 5, env = "PENDING_SWEEP_SECS")]
    pending_sweep_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "LOG_JSON")]
    log_json: bool,
}

impl From<&Args> for RelayConfig {
    fn from(args: &Args) -> Self {
        Self {
            port: args.port,
            call_ttl_secs: args.call_ttl_secs,
            reap_interval_secs: args.reap_interval_secs,
            signal_buffer_secs: args.signal_buffer_secs,
            max_buffered_signals: args.max_buffered_signals,
            pending_sweep_secs: args.pending_sweep_secs,
        }
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "callcode_relay=info,tower_http=info".into());
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = RelayConfig::from(&args);
    let state = RelayState::new(config.clone());

    // Spawn periodic reaper for idle calls
    let reap_state = state.clone();
    let reap_every = Duration::from_secs(config.reap_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reap_every);
        loop {
            interval.tick().await;
            reap_state.reap_expired_calls();
        }
    });

    // Spawn periodic sweep for undeliverable signals
    let sweep_state = state.clone();
    let sweep_every = Duration::from_secs(config.pending_sweep_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            sweep_state.sweep_pending_signals();
        }
    });

    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Callcode relay server starting on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = addr.as_str(), error = %e, "Failed to bind address");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

/// Assemble the HTTP + WebSocket router.
fn build_router(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/api/calls", post(api::create_call))
        .route("/api/calls/:id", get(api::get_call))
        .route("/api/calls/:id/join", post(api::join_call))
        .route("/api/calls/:id/leave", post(api::leave_call))
        .route("/api/signaling/:id/offer", post(api::signal_offer))
        .route("/api/signaling/:id/answer", post(api::signal_answer))
        .route("/api/signaling/:id/ice-candidate", post(api::signal_candidate))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for participant push connections.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "live_calls": state.registry.len(),
        "attached_clients": state.relay.attached_count(),
        "buffered_signals": state.relay.buffered_count(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures::{SinkExt, StreamExt};
    use serde_json::Value;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
    use tower::ServiceExt;

    use crate::protocol::ServerMessage;

    use std::sync::Arc;

    use callcode_core::registry_client::LeaveResult;
    use callcode_core::{
        Error as CoreError, IceCandidate, Negotiator, PeerTransport, Phase, RegistryClient,
        RelayClient, Role, SessionContextStore, SessionDescription, SessionParts, TransportState,
    };

    fn test_state() -> RelayState {
        RelayState::new(RelayConfig::default())
    }

    async fn call_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = build_router(test_state());
        let (status, body) = call_json(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_call_lifecycle_over_http() {
        let app = build_router(test_state());

        let (status, created) = call_json(&app, "POST", "/api/calls", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["status"], "created");
        let call_id = created["callId"].as_str().unwrap().to_string();
        assert_eq!(call_id.len(), 6);

        let (status, joined) = call_json(
            &app,
            "POST",
            &format!("/api/calls/{}/join", call_id),
            Some(json!({"userId": "A", "username": "userA"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(joined["status"], "joined");
        assert_eq!(joined["call"]["status"], "active");

        let (_, joined) = call_json(
            &app,
            "POST",
            &format!("/api/calls/{}/join", call_id.to_lowercase()),
            Some(json!({"userId": "B", "username": "userB"})),
        )
        .await;
        assert_eq!(joined["call"]["participants"].as_array().unwrap().len(), 2);

        let (status, call) = call_json(&app, "GET", &format!("/api/calls/{}", call_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(call["id"], call_id.as_str());

        let (_, left) = call_json(
            &app,
            "POST",
            &format!("/api/calls/{}/leave", call_id),
            Some(json!({"userId": "A"})),
        )
        .await;
        assert_eq!(left["status"], "left");
        assert_eq!(left["call"]["participants"][0]["userId"], "B");

        let (_, left) = call_json(
            &app,
            "POST",
            &format!("/api/calls/{}/leave", call_id),
            Some(json!({"userId": "B"})),
        )
        .await;
        assert_eq!(left["status"], "call-ended");
        assert!(left.get("call").is_none());

        let (status, body) = call_json(&app, "GET", &format!("/api/calls/{}", call_id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Call not found");
    }

    #[tokio::test]
    async fn test_unknown_call_is_404() {
        let app = build_router(test_state());

        let (status, body) = call_json(
            &app,
            "POST",
            "/api/calls/QQQQQQ/join",
            Some(json!({"userId": "A", "username": "userA"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());

        let (status, _) = call_json(
            &app,
            "POST",
            "/api/calls/QQQQQQ/leave",
            Some(json!({"userId": "A"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call_json(
            &app,
            "POST",
            "/api/signaling/QQQQQQ/offer",
            Some(json!({"from": "A", "sdp": "v=0"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_http_ingress_buffers_for_absent_peer() {
        let state = test_state();
        let app = build_router(state.clone());
        let call = state.create_call().unwrap();

        let (status, ack) = call_json(
            &app,
            "POST",
            &format!("/api/signaling/{}/offer", call.id),
            Some(json!({"from": "A", "sdp": {"type": "offer", "sdp": "v=0"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["status"], "offer-received");
        assert_eq!(ack["delivered"], false);

        let (_, ack) = call_json(
            &app,
            "POST",
            &format!("/api/signaling/{}/ice-candidate", call.id),
            Some(json!({"from": "A", "candidate": {"candidate": "candidate:1"}})),
        )
        .await;
        assert_eq!(ack["status"], "ice-candidate-received");
        assert_eq!(state.relay.buffered_count(), 2);
    }

    async fn next_server_message<S>(ws: &mut S) -> ServerMessage
    where
        S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("Connection ended unexpectedly: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_relays_between_participants() {
        let state = test_state();
        let call = state.create_call().unwrap();
        state.join_call(&call.id, "alice", "Alice").unwrap();
        state.join_call(&call.id, "bob", "Bob").unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });
        let url = format!("ws://{}/ws", addr);

        // Alice attaches and sends an offer before Bob is connected.
        let (mut alice, _) = connect_async(&url).await.unwrap();
        alice
            .send(WsMessage::Text(
                json!({"type": "attach", "call_id": call.id, "user_id": "alice"}).to_string(),
            ))
            .await
            .unwrap();
        assert!(matches!(
            next_server_message(&mut alice).await,
            ServerMessage::Attached { delivered: 0, .. }
        ));
        alice
            .send(WsMessage::Text(
                json!({"type": "signal", "kind": "offer", "payload": {"sdp": "offer-1"}}).to_string(),
            ))
            .await
            .unwrap();
        assert!(matches!(
            next_server_message(&mut alice).await,
            ServerMessage::Ack { .. }
        ));

        // Bob attaches late and receives the buffered offer.
        let (mut bob, _) = connect_async(&url).await.unwrap();
        bob.send(WsMessage::Text(
            json!({"type": "attach", "call_id": call.id.to_lowercase(), "user_id": "bob"}).to_string(),
        ))
        .await
        .unwrap();
        assert!(matches!(
            next_server_message(&mut bob).await,
            ServerMessage::Attached { delivered: 1, .. }
        ));
        match next_server_message(&mut bob).await {
            ServerMessage::Signal { message } => {
                assert_eq!(message.from, "alice");
                assert_eq!(message.payload["sdp"], "offer-1");
            }
            other => panic!("Expected Signal, got {:?}", other),
        }

        // Bob answers live; Alice receives it directly.
        bob.send(WsMessage::Text(
            json!({"type": "signal", "kind": "answer", "to": "alice", "payload": {"sdp": "answer-1"}})
                .to_string(),
        ))
        .await
        .unwrap();
        match next_server_message(&mut alice).await {
            ServerMessage::Signal { message } => {
                assert_eq!(message.from, "bob");
                assert_eq!(message.payload["sdp"], "answer-1");
            }
            other => panic!("Expected Signal, got {:?}", other),
        }

        // Ending the call drops both connections.
        state.leave_call(&call.id, "alice").unwrap();
        state.leave_call(&call.id, "bob").unwrap();
        loop {
            match bob.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    }

    // ── End to end with the client core ───────────────────────────────────

    /// Transport that negotiates instantly.
    struct InstantTransport;

    #[async_trait::async_trait]
    impl PeerTransport for InstantTransport {
        async fn create_offer(&self) -> callcode_core::Result<SessionDescription> {
            Ok(SessionDescription::offer("v=0 offer"))
        }
        async fn create_answer(&self) -> callcode_core::Result<SessionDescription> {
            Ok(SessionDescription::answer("v=0 answer"))
        }
        async fn set_local_description(&self, _: SessionDescription) -> callcode_core::Result<()> {
            Ok(())
        }
        async fn set_remote_description(&self, _: SessionDescription) -> callcode_core::Result<()> {
            Ok(())
        }
        async fn add_remote_candidate(&self, _: IceCandidate) -> callcode_core::Result<()> {
            Ok(())
        }
        async fn restart(&self) -> callcode_core::Result<()> {
            Ok(())
        }
        async fn close(&self) -> callcode_core::Result<()> {
            Ok(())
        }
    }

    fn pump(
        negotiator: Arc<Negotiator>,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<callcode_core::SignalingMessage>,
    ) {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                negotiator.handle_signal(message).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_two_clients_negotiate_through_relay() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(test_state());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let registry = RegistryClient::new(format!("http://{}", addr));
        let call_id = registry.create_call().await.unwrap();
        registry.join_call(&call_id, "alice", "Alice").await.unwrap();
        let call = registry.join_call(&call_id, "bob", "Bob").await.unwrap();
        assert_eq!(call.participants.len(), 2);

        let ws_url = format!("ws://{}/ws", addr);

        // Caller offers before the callee has a push connection
        let (alice_relay, alice_rx) = RelayClient::connect(&ws_url, &call_id, "alice").await.unwrap();
        let alice = Arc::new(Negotiator::new(
            &call_id,
            "alice",
            Role::Caller,
            Arc::new(InstantTransport),
            Arc::new(alice_relay),
        ));
        pump(alice.clone(), alice_rx);
        alice.start().await.unwrap();
        alice.start().await.unwrap();

        let (bob_relay, bob_rx) = RelayClient::connect(&ws_url, &call_id, "bob").await.unwrap();
        let bob = Arc::new(Negotiator::new(
            &call_id,
            "bob",
            Role::Callee,
            Arc::new(InstantTransport),
            Arc::new(bob_relay),
        ));
        pump(bob.clone(), bob_rx);

        tokio::time::timeout(Duration::from_secs(5), async {
            while alice.phase() != Phase::Negotiated || bob.phase() != Phase::Negotiated {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        alice.on_transport_state(TransportState::Connected);
        bob.on_transport_state(TransportState::Connected);
        assert_eq!(alice.phase(), Phase::Connected);
        assert_eq!(bob.phase(), Phase::Connected);

        assert!(matches!(
            registry.leave_call(&call_id, "alice").await.unwrap(),
            LeaveResult::Left(_)
        ));
        assert_eq!(
            registry.leave_call(&call_id, "bob").await.unwrap(),
            LeaveResult::CallEnded
        );
        assert_eq!(
            registry.get_call(&call_id).await.unwrap_err(),
            CoreError::CallNotFound(call_id.clone())
        );
    }

    #[tokio::test]
    async fn test_session_cleanup_detaches_from_relay() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = test_state();
        let app = build_router(state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let call = state.create_call().unwrap();
        state.join_call(&call.id, "alice", "Alice").unwrap();

        let (client, signals) = RelayClient::connect(&format!("ws://{}/ws", addr), &call.id, "alice")
            .await
            .unwrap();

        let store = SessionContextStore::new();
        let attachment = store
            .attach(&call.id, || {
                Ok(SessionParts {
                    user_id: "alice".to_string(),
                    role: Role::Caller,
                    transport: Arc::new(InstantTransport),
                    sink: Arc::new(client),
                })
            })
            .unwrap();
        store.spawn_signal_pump(signals).unwrap();

        store.cleanup().await;
        store.cleanup().await;

        // The view keeps its handle; the relay still lets go of the member
        assert_eq!(attachment.negotiator.phase(), Phase::Ended);
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.relay.attached_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(state.get_call(&call.id).is_ok());
    }
}
