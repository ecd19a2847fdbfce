/**
 * Connection State Machine
 *
 * Supervises a single websocket connection. After the auth handshake the
 * supervisor spawns a group of cooperative tasks (receive, auth,
 * incoming, heartbeat, expire, session, fan-in forward, broker drain);
 * the first task to finish ends the connection and the supervisor tears
 * everything down along a single path: mark offline, flush pending push,
 * deregister, close the socket with a specific reason.
 *
 * Outbound traffic is funnelled through one queue owned by the send
 * task; ordinary events are held while the is-authenticated gate is
 * closed, control frames and the close frame go out regardless.
 */

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use chrono::Utc;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;

use crate::auth::cache::{AuthCache, CheckedToken, RequestCache};
use crate::push::stream as push_stream;
use crate::realtime::broker::BrokerBridge;
use crate::realtime::protocol::{
    session_channel, ClientFrame, CloseReason, ServerEvent, SessionAction, SessionEvent,
};
use crate::state::AppState;

/// Capacity of every per-connection queue.
const QUEUE_CAP: usize = 128;
/// Deadline for the client to answer `please_token`.
const AUTH_HANDSHAKE_SECS: u64 = 15;
/// Maximum silence between heartbeats.
const HEARTBEAT_TIMEOUT_SECS: u64 = 60;
/// How many times to prompt a refresh before re-validating.
const REFRESH_PROMPTS: u32 = 3;
/// Wait between refresh prompts.
const REFRESH_PROMPT_SECS: u64 = 40;
/// Wake this long before token expiry.
const EXPIRY_LEAD_SECS: i64 = 120;
/// A client-supplied last-active older than this means the connection
/// effectively went away and came back.
const STALE_ACTIVITY_SECS: f64 = 120.0;

/// One message through the outbound queue.
enum Outbound {
    /// Handshake/control frame, sent regardless of the auth gate.
    Control(ServerEvent),
    /// User event, held until the connection is authenticated.
    Event(ServerEvent),
    /// Close the socket with this reason and stop sending.
    Close(CloseReason),
}

/// State shared between the connection's tasks.
struct ConnShared {
    user_id: i64,
    session_id: i64,
    auth: Mutex<AuthSnapshot>,
    authenticated: watch::Sender<bool>,
    heartbeat: Notify,
    token_updated: Notify,
    close_reason: Mutex<Option<CloseReason>>,
}

#[derive(Clone)]
struct AuthSnapshot {
    token: String,
    expiration: i64,
}

impl ConnShared {
    fn auth_snapshot(&self) -> AuthSnapshot {
        lock(&self.auth).clone()
    }

    fn update_auth(&self, token: &str, checked: &CheckedToken) {
        {
            let mut guard = lock(&self.auth);
            guard.token = token.to_string();
            guard.expiration = checked.expiration;
        }
        self.token_updated.notify_waiters();
        let _ = self.authenticated.send(true);
    }

    /// Record the first close reason and ask the send task to emit the
    /// close frame. Later calls keep the original reason.
    fn request_close(&self, out_tx: &mpsc::Sender<Outbound>, reason: CloseReason) {
        {
            let mut guard = lock(&self.close_reason);
            if guard.is_none() {
                *guard = Some(reason);
            }
        }
        let _ = out_tx.try_send(Outbound::Close(reason));
    }

    fn recorded_reason(&self) -> Option<CloseReason> {
        *lock(&self.close_reason)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `GET /ws` — upgrade and run the connection until it closes.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        run_connection(socket, state).await;
    })
}

async fn run_connection(socket: WebSocket, state: AppState) {
    let (mut sink, stream) = socket.split();

    let (auth_tx, mut auth_rx) = mpsc::channel::<String>(QUEUE_CAP);
    let (incoming_tx, incoming_rx) = mpsc::channel::<ClientFrame>(QUEUE_CAP);
    let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(QUEUE_CAP);
    let (session_tx, session_rx) = mpsc::channel::<SessionEvent>(QUEUE_CAP);
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(QUEUE_CAP);

    let pre_close: Arc<Mutex<Option<CloseReason>>> = Arc::new(Mutex::new(None));

    let mut tasks: JoinSet<()> = JoinSet::new();
    tasks.spawn(receive_loop(
        stream,
        auth_tx,
        incoming_tx,
        Arc::clone(&pre_close),
    ));

    // Initial auth handshake: prompt, wait 15 s for a token, validate.
    if send_event(&mut sink, &ServerEvent::please_token()).await.is_err() {
        tasks.shutdown().await;
        return;
    }
    let first_token =
        match tokio::time::timeout(Duration::from_secs(AUTH_HANDSHAKE_SECS), auth_rx.recv()).await
        {
            Ok(Some(token)) => token,
            Ok(None) => {
                tasks.shutdown().await;
                return;
            }
            Err(_) => {
                close_socket(&mut sink, CloseReason::AuthTimeout).await;
                tasks.shutdown().await;
                return;
            }
        };

    let mut l1 = RequestCache::new();
    let checked = match state.auth_cache.check_token(&mut l1, &first_token).await {
        Ok(checked) => checked,
        Err(e) => {
            tracing::debug!("[WS] Handshake rejected: {e}");
            close_socket(&mut sink, CloseReason::InvalidToken).await;
            tasks.shutdown().await;
            return;
        }
    };
    if send_event(&mut sink, &ServerEvent::success_auth()).await.is_err() {
        tasks.shutdown().await;
        return;
    }

    let (authenticated, auth_gate) = watch::channel(true);
    let shared = Arc::new(ConnShared {
        user_id: checked.user_id,
        session_id: checked.session_id,
        auth: Mutex::new(AuthSnapshot {
            token: first_token,
            expiration: checked.expiration,
        }),
        authenticated,
        heartbeat: Notify::new(),
        token_updated: Notify::new(),
        close_reason: Mutex::new(None),
    });
    tracing::info!(
        user_id = shared.user_id,
        session_id = shared.session_id,
        "[WS] Connection authenticated"
    );

    // The connection is now live: register locally, mark presence, drop
    // any payloads parked for web push.
    let handle = state
        .manager
        .add_connection(shared.user_id, event_tx.clone(), session_tx.clone());
    if let Err(e) = state.presence.mark_online(shared.user_id, shared.session_id).await {
        tracing::warn!(user_id = shared.user_id, "[WS] mark_online failed: {e}");
    }
    {
        let mut conn = state.redis.clone();
        if let Err(e) = push_stream::clear_pending(&mut conn, shared.user_id).await {
            tracing::warn!(user_id = shared.user_id, "[WS] clear_pending failed: {e}");
        }
    }

    // Session-control subscription for this session only; user-wide
    // events arrive through the manager's fan-in registry.
    match BrokerBridge::connect(&state.redis_client).await {
        Ok(mut broker) => {
            let tx = session_tx.clone();
            let subscribed = broker
                .subscribe(
                    &session_channel(shared.session_id),
                    Box::new(move |channel, payload| {
                        match serde_json::from_value::<SessionEvent>(payload) {
                            Ok(event) => {
                                let _ = tx.try_send(event);
                            }
                            Err(e) => {
                                tracing::warn!(channel, "[WS] Bad session event: {e}");
                            }
                        }
                        true
                    }),
                )
                .await;
            match subscribed {
                Ok(()) => {
                    tasks.spawn(async move {
                        broker.start().await;
                    });
                }
                Err(e) => {
                    tracing::warn!(session_id = shared.session_id, "[WS] Subscribe failed: {e}");
                }
            }
        }
        Err(e) => {
            tracing::warn!("[WS] Broker connect failed: {e}");
        }
    }

    tasks.spawn(auth_loop(
        auth_rx,
        Arc::clone(&shared),
        Arc::clone(&state.auth_cache),
        out_tx.clone(),
    ));
    tasks.spawn(incoming_loop(
        incoming_rx,
        Arc::clone(&shared),
        state.clone(),
    ));
    tasks.spawn(heartbeat_loop(Arc::clone(&shared), out_tx.clone()));
    tasks.spawn(expire_loop(
        Arc::clone(&shared),
        Arc::clone(&state.auth_cache),
        out_tx.clone(),
    ));
    tasks.spawn(session_loop(
        session_rx,
        Arc::clone(&shared),
        Arc::clone(&state.auth_cache),
        out_tx.clone(),
    ));
    tasks.spawn(forward_loop(event_rx, out_tx.clone()));

    let send_task = tokio::spawn(send_loop(sink, out_rx, auth_gate));

    // First finished task ends the connection.
    tasks.join_next().await;
    tasks.shutdown().await;

    let reason = shared
        .recorded_reason()
        .or_else(|| *lock(&pre_close))
        .unwrap_or(CloseReason::AbnormalClose);
    let _ = out_tx.try_send(Outbound::Close(reason));
    drop(out_tx);
    if tokio::time::timeout(Duration::from_secs(5), send_task).await.is_err() {
        tracing::debug!("[WS] Send task did not drain in time");
    }

    // Teardown: presence, pending push, registry.
    state.manager.remove_connection(shared.user_id, handle);
    if let Err(e) = state
        .presence
        .mark_offline(shared.user_id, shared.session_id)
        .await
    {
        tracing::warn!(user_id = shared.user_id, "[WS] mark_offline failed: {e}");
    }
    let mut conn = state.redis.clone();
    if let Err(e) = push_stream::flush_pending(&mut conn, shared.user_id).await {
        tracing::warn!(user_id = shared.user_id, "[WS] flush_pending failed: {e}");
    }
    tracing::info!(
        user_id = shared.user_id,
        session_id = shared.session_id,
        reason = reason.as_str(),
        "[WS] Connection closed"
    );
}

/// Read frames and route by `type`: auth tokens to the auth queue,
/// everything else to the incoming queue.
async fn receive_loop(
    mut stream: SplitStream<WebSocket>,
    auth_tx: mpsc::Sender<String>,
    incoming_tx: mpsc::Sender<ClientFrame>,
    pre_close: Arc<Mutex<Option<CloseReason>>>,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(raw)) => {
                let Some(frame) = ClientFrame::parse(raw.as_str()) else {
                    tracing::debug!("[WS] Unparseable frame dropped");
                    continue;
                };
                let delivered = match frame {
                    ClientFrame::Auth { token } => auth_tx.send(token).await.is_ok(),
                    other => incoming_tx.send(other).await.is_ok(),
                };
                if !delivered {
                    return;
                }
            }
            Ok(Message::Close(_)) => {
                *lock(&pre_close) = Some(CloseReason::Normal);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("[WS] Socket read failed: {e}");
                return;
            }
        }
    }
}

/// Validate re-auth tokens arriving after the handshake.
async fn auth_loop(
    mut auth_rx: mpsc::Receiver<String>,
    shared: Arc<ConnShared>,
    cache: Arc<AuthCache>,
    out_tx: mpsc::Sender<Outbound>,
) {
    while let Some(token) = auth_rx.recv().await {
        let mut l1 = RequestCache::new();
        match cache.check_token(&mut l1, &token).await {
            Ok(checked) if checked.session_id == shared.session_id => {
                shared.update_auth(&token, &checked);
                let _ = out_tx
                    .try_send(Outbound::Control(ServerEvent::success_auth()));
            }
            Ok(_) | Err(_) => {
                shared.request_close(&out_tx, CloseReason::InvalidToken);
                return;
            }
        }
    }
}

/// Consume non-auth frames: heartbeats feed the heartbeat event and
/// presence; other frames are the application routing point.
async fn incoming_loop(
    mut incoming_rx: mpsc::Receiver<ClientFrame>,
    shared: Arc<ConnShared>,
    state: AppState,
) {
    while let Some(frame) = incoming_rx.recv().await {
        match frame {
            ClientFrame::Heartbeat { last_active } => {
                shared.heartbeat.notify_one();
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                let stale = last_active
                    .map(|last| now - last > STALE_ACTIVITY_SECS)
                    .unwrap_or(false);
                if stale {
                    // The client was effectively gone; treat the gap as an
                    // offline window so held payloads go out via web push.
                    if let Err(e) = state
                        .presence
                        .mark_offline(shared.user_id, shared.session_id)
                        .await
                    {
                        tracing::warn!(user_id = shared.user_id, "[WS] mark_offline failed: {e}");
                    }
                    let mut conn = state.redis.clone();
                    if let Err(e) = push_stream::flush_pending(&mut conn, shared.user_id).await {
                        tracing::warn!(user_id = shared.user_id, "[WS] flush_pending failed: {e}");
                    }
                } else if let Err(e) = state
                    .presence
                    .mark_online(shared.user_id, shared.session_id)
                    .await
                {
                    tracing::warn!(user_id = shared.user_id, "[WS] mark_online failed: {e}");
                }
            }
            ClientFrame::Other { frame_type, .. } => {
                tracing::debug!(frame_type, "[WS] Unhandled client frame");
            }
            ClientFrame::Auth { .. } => {}
        }
    }
}

/// Close the connection when no heartbeat arrives for 60 s.
async fn heartbeat_loop(shared: Arc<ConnShared>, out_tx: mpsc::Sender<Outbound>) {
    loop {
        let wait = tokio::time::timeout(
            Duration::from_secs(HEARTBEAT_TIMEOUT_SECS),
            shared.heartbeat.notified(),
        );
        if wait.await.is_err() {
            shared.request_close(&out_tx, CloseReason::HeartbeatTimeout);
            return;
        }
    }
}

/// Wake shortly before token expiry, prompt a refresh up to three times,
/// then re-validate against the store and close if that fails.
async fn expire_loop(
    shared: Arc<ConnShared>,
    cache: Arc<AuthCache>,
    out_tx: mpsc::Sender<Outbound>,
) {
    loop {
        let snapshot = shared.auth_snapshot();
        let lead = snapshot.expiration - EXPIRY_LEAD_SECS - Utc::now().timestamp();
        if lead > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(lead as u64)) => {}
                _ = shared.token_updated.notified() => continue,
            }
        }

        let mut refreshed = false;
        for _ in 0..REFRESH_PROMPTS {
            if out_tx
                .send(Outbound::Control(ServerEvent::refresh_recommended()))
                .await
                .is_err()
            {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(REFRESH_PROMPT_SECS)) => {}
                _ = shared.token_updated.notified() => refreshed = true,
            }
            if refreshed {
                break;
            }
        }
        if refreshed {
            continue;
        }

        // No refresh arrived: give the current token one authoritative
        // check, then wait out its remaining lifetime.
        let token = shared.auth_snapshot().token;
        match cache.check_token_uncached(&token).await {
            Ok(_) => {
                let remaining = shared.auth_snapshot().expiration - Utc::now().timestamp();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(remaining.max(0) as u64 + 1)) => {}
                    _ = shared.token_updated.notified() => {}
                }
            }
            Err(e) => {
                tracing::debug!(user_id = shared.user_id, "[WS] Expiry re-validation failed: {e}");
                shared.request_close(&out_tx, CloseReason::InvalidToken);
                return;
            }
        }
    }
}

/// React to session-control events from the bus.
async fn session_loop(
    mut session_rx: mpsc::Receiver<SessionEvent>,
    shared: Arc<ConnShared>,
    cache: Arc<AuthCache>,
    out_tx: mpsc::Sender<Outbound>,
) {
    while let Some(event) = session_rx.recv().await {
        match event.action {
            SessionAction::CheckToken => {
                let token = shared.auth_snapshot().token;
                match cache.check_token_uncached(&token).await {
                    Ok(checked) => shared.update_auth(&token, &checked),
                    Err(_) => {
                        // Re-run the handshake: gate events off, ask the
                        // client for a fresh token, and close unless one
                        // arrives within the handshake window.
                        let _ = shared.authenticated.send(false);
                        let _ = out_tx
                            .try_send(Outbound::Control(ServerEvent::please_token()));
                        tokio::spawn(reauth_deadline(Arc::clone(&shared), out_tx.clone()));
                    }
                }
            }
            SessionAction::SessionLogout => {
                shared.request_close(&out_tx, CloseReason::SessionClosed);
                return;
            }
        }
    }
}

/// Close with `AUTH_TIMEOUT` unless the auth gate reopens within the
/// handshake window. Armed each time a mid-connection re-validation
/// fails, mirroring the deadline of the initial handshake.
async fn reauth_deadline(shared: Arc<ConnShared>, out_tx: mpsc::Sender<Outbound>) {
    let mut gate = shared.authenticated.subscribe();
    let reopened = gate.wait_for(|authed| *authed);
    if tokio::time::timeout(Duration::from_secs(AUTH_HANDSHAKE_SECS), reopened)
        .await
        .is_err()
    {
        shared.request_close(&out_tx, CloseReason::AuthTimeout);
    }
}

/// Copy fanned-in user events into the outbound queue.
async fn forward_loop(mut event_rx: mpsc::Receiver<ServerEvent>, out_tx: mpsc::Sender<Outbound>) {
    while let Some(event) = event_rx.recv().await {
        if out_tx.send(Outbound::Event(event)).await.is_err() {
            return;
        }
    }
}

/// Single owner of the socket sink. Control frames pass through; user
/// events are held in arrival order while the auth gate is closed and
/// flushed when it reopens; `Close` emits the close frame and ends the
/// loop immediately, held events notwithstanding.
async fn send_loop<S>(mut sink: S, mut out_rx: mpsc::Receiver<Outbound>, mut auth_gate: watch::Receiver<bool>)
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let mut held: Vec<ServerEvent> = Vec::new();
    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(outbound) = outbound else { return };
                match outbound {
                    Outbound::Control(event) => {
                        if send_event(&mut sink, &event).await.is_err() {
                            return;
                        }
                    }
                    Outbound::Event(event) => {
                        if *auth_gate.borrow_and_update() {
                            for earlier in held.drain(..) {
                                if send_event(&mut sink, &earlier).await.is_err() {
                                    return;
                                }
                            }
                            if send_event(&mut sink, &event).await.is_err() {
                                return;
                            }
                        } else if held.len() < QUEUE_CAP {
                            held.push(event);
                        } else {
                            tracing::debug!("[WS] Hold buffer full, event dropped");
                        }
                    }
                    Outbound::Close(reason) => {
                        close_socket(&mut sink, reason).await;
                        return;
                    }
                }
            }
            changed = auth_gate.changed(), if !held.is_empty() => {
                if changed.is_err() {
                    // Connection is tearing down; only a Close can follow.
                    held.clear();
                } else if *auth_gate.borrow_and_update() {
                    for event in held.drain(..) {
                        if send_event(&mut sink, &event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn send_event<S>(sink: &mut S, event: &ServerEvent) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let encoded = serde_json::to_string(event).map_err(axum::Error::new)?;
    sink.send(Message::Text(encoded.into())).await
}

async fn close_socket<S>(sink: &mut S, reason: CloseReason)
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let frame = CloseFrame {
        code: reason.code(),
        reason: reason.as_str().into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        tracing::debug!("[WS] Close frame not delivered: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::Sink;
    use pretty_assertions::assert_eq;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Sink that records every frame it is handed.
    #[derive(Clone, Default)]
    struct CaptureSink {
        frames: Arc<Mutex<Vec<Message>>>,
    }

    impl Sink<Message> for CaptureSink {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            lock(&self.frames).push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn test_shared(authenticated: watch::Sender<bool>) -> Arc<ConnShared> {
        Arc::new(ConnShared {
            user_id: 1,
            session_id: 2,
            auth: Mutex::new(AuthSnapshot {
                token: "LV token".to_string(),
                expiration: 0,
            }),
            authenticated,
            heartbeat: Notify::new(),
            token_updated: Notify::new(),
            close_reason: Mutex::new(None),
        })
    }

    #[tokio::test]
    async fn test_close_frame_not_blocked_by_gated_event() {
        let sink = CaptureSink::default();
        let frames = Arc::clone(&sink.frames);
        let (out_tx, out_rx) = mpsc::channel(QUEUE_CAP);
        let (gate_tx, gate_rx) = watch::channel(false);

        let task = tokio::spawn(send_loop(sink, out_rx, gate_rx));
        out_tx
            .send(Outbound::Event(ServerEvent::named("notification", None)))
            .await
            .unwrap();
        out_tx
            .send(Outbound::Close(CloseReason::HeartbeatTimeout))
            .await
            .unwrap();
        task.await.unwrap();
        drop(gate_tx);

        let frames = lock(&frames);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Message::Close(Some(_))));
    }

    #[tokio::test]
    async fn test_held_events_flush_in_order_after_reauth() {
        let sink = CaptureSink::default();
        let frames = Arc::clone(&sink.frames);
        let (out_tx, out_rx) = mpsc::channel(QUEUE_CAP);
        let (gate_tx, gate_rx) = watch::channel(false);

        let task = tokio::spawn(send_loop(sink, out_rx, gate_rx));
        for name in ["first", "second"] {
            out_tx
                .send(Outbound::Event(ServerEvent::named(name, None)))
                .await
                .unwrap();
        }
        gate_tx.send(true).unwrap();
        out_tx
            .send(Outbound::Event(ServerEvent::named("third", None)))
            .await
            .unwrap();
        out_tx
            .send(Outbound::Close(CloseReason::Normal))
            .await
            .unwrap();
        task.await.unwrap();

        let frames = lock(&frames);
        assert_eq!(frames.len(), 4);
        for (frame, name) in frames.iter().zip(["first", "second", "third"]) {
            match frame {
                Message::Text(text) => {
                    let event: ServerEvent = serde_json::from_str(text.as_str()).unwrap();
                    assert_eq!(event.event, name);
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert!(matches!(frames[3], Message::Close(Some(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reauth_deadline_closes_unauthenticated() {
        let (gate_tx, _gate_rx) = watch::channel(false);
        let shared = test_shared(gate_tx);
        let (out_tx, mut out_rx) = mpsc::channel(QUEUE_CAP);

        reauth_deadline(Arc::clone(&shared), out_tx).await;

        assert_eq!(shared.recorded_reason(), Some(CloseReason::AuthTimeout));
        assert!(matches!(
            out_rx.recv().await,
            Some(Outbound::Close(CloseReason::AuthTimeout))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reauth_deadline_cleared_by_fresh_token() {
        let (gate_tx, _gate_rx) = watch::channel(false);
        let shared = test_shared(gate_tx);
        let (out_tx, mut out_rx) = mpsc::channel(QUEUE_CAP);

        let task = tokio::spawn(reauth_deadline(Arc::clone(&shared), out_tx));
        shared.authenticated.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(shared.recorded_reason(), None);
        assert!(out_rx.try_recv().is_err());
    }
}
