//! Direct socket to the scorekeeping server.
//!
//! One driver task owns one physical connection for one match. It dials,
//! sends `subscribe-match`, keeps the link alive with `ping` frames and
//! redials with linear backoff after an abnormal close. Callers talk to it
//! through a [`SocketHandle`]; everything it observes goes out through an
//! [`EventSink`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use rally_proto::{
    frames::MatchActionFrame, ClientFrame, MatchId, MatchPayload, ServerFrame, CLOSE_FORCE_RECONNECT, CLOSE_NORMAL,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::log_throttle::{should_log, ThrottleKind};

const MAX_RECENT_ERRORS: usize = 10;

pub trait WsSocket:
    Stream<Item = Result<Message, tungstenite::Error>> + Sink<Message, Error = tungstenite::Error> + Send + Unpin
{
}

impl<T> WsSocket for T where
    T: Stream<Item = Result<Message, tungstenite::Error>> + Sink<Message, Error = tungstenite::Error> + Send + Unpin
{
}

pub type BoxSocket = Box<dyn WsSocket>;

/// Opens physical websocket connections.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, url: &Url) -> SyncResult<BoxSocket>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteDialer;

#[async_trait]
impl Dialer for TungsteniteDialer {
    async fn dial(&self, url: &Url) -> SyncResult<BoxSocket> {
        let (stream, _) = connect_async(url.as_str()).await?;
        Ok(Box::new(stream))
    }
}

pub type ServerSocket = WebSocketStream<DuplexStream>;

/// In-process dialer: every dial creates a duplex pipe and hands the
/// server end to whoever holds the receiver.
pub struct MemoryDialer {
    accepted: mpsc::UnboundedSender<ServerSocket>,
    fail_next: AtomicU32,
    dials: AtomicU32,
}

impl MemoryDialer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSocket>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            accepted,
            fail_next: AtomicU32::new(0),
            dials: AtomicU32::new(0),
        });
        (dialer, rx)
    }

    /// Makes the next `count` dials fail as if the server were down.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, _url: &Url) -> SyncResult<BoxSocket> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(SyncError::Transport(tungstenite::Error::ConnectionClosed));
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        self.accepted.send(server).map_err(|_| SyncError::Closed)?;
        Ok(Box::new(client))
    }
}

/// Link-level state of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay_ms: u64 },
    Closed,
}

#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// Passive state refresh (`match-data-update`).
    Refresh(Arc<MatchPayload>),
    /// Full state pushed on subscribe (`match-full-data`).
    FullData(Arc<MatchPayload>),
    /// Imperative event such as a timeout starting.
    Action(MatchActionFrame),
}

#[derive(Debug, Clone)]
pub enum SocketEvent {
    State(LinkState),
    Frame(InboundFrame),
}

pub type EventSink = Arc<dyn Fn(SocketEvent) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticError {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SocketDiagnostics {
    pub connection_attempts: u32,
    pub reconnect_attempts: u32,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub last_pong_at: Option<DateTime<Utc>>,
    pub messages_received: u64,
    pub missed_pongs: u32,
    /// Set once the socket was closed on purpose (last subscriber left, or
    /// the server closed normally); cleared when a new attempt starts.
    pub intentionally_closed: bool,
    pub recent_errors: VecDeque<DiagnosticError>,
}

impl SocketDiagnostics {
    pub fn record_error(&mut self, message: impl Into<String>) {
        if self.recent_errors.len() == MAX_RECENT_ERRORS {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(DiagnosticError {
            at: Utc::now(),
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone)]
pub struct SocketSettings {
    pub url: Url,
    pub ping_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub force_reconnect_delay: Duration,
}

impl SocketSettings {
    pub fn from_config(cfg: &SyncConfig) -> SyncResult<Self> {
        Ok(Self {
            url: cfg.resolved_socket_url()?,
            ping_interval: cfg.ping_interval(),
            reconnect_base: cfg.reconnect_base(),
            reconnect_max: cfg.reconnect_max(),
            force_reconnect_delay: cfg.force_reconnect_delay(),
        })
    }
}

#[derive(Debug)]
enum SocketCommand {
    Send(ClientFrame),
    ForceReconnect,
    Close,
}

/// Owner side of a driver task.
pub struct SocketHandle {
    commands: mpsc::UnboundedSender<SocketCommand>,
    task: JoinHandle<()>,
}

impl SocketHandle {
    pub fn send(&self, frame: ClientFrame) -> bool {
        self.commands.send(SocketCommand::Send(frame)).is_ok()
    }

    /// Bounces the connection with the force-reconnect close code.
    pub fn force_reconnect(&self) -> bool {
        self.commands.send(SocketCommand::ForceReconnect).is_ok()
    }

    /// Closes with the normal code; the returned handle resolves once the
    /// physical connection is gone.
    pub fn close(self) -> JoinHandle<()> {
        let _ = self.commands.send(SocketCommand::Close);
        self.task
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawns a driver. A `predecessor` (the retiring driver for the same match)
/// is awaited before the first dial so two sockets never overlap.
pub fn spawn_socket(
    match_id: MatchId,
    settings: SocketSettings,
    dialer: Arc<dyn Dialer>,
    sink: EventSink,
    diagnostics: Arc<Mutex<SocketDiagnostics>>,
    predecessor: Option<JoinHandle<()>>,
) -> SocketHandle {
    let (commands, rx) = mpsc::unbounded_channel();
    let backoff = Backoff::new(settings.reconnect_base, settings.reconnect_max);
    let driver = SocketDriver {
        match_id,
        settings,
        dialer,
        sink,
        diagnostics,
        commands: rx,
        backoff,
    };
    let task = tokio::spawn(async move {
        if let Some(previous) = predecessor {
            let _ = previous.await;
        }
        driver.run().await;
    });
    SocketHandle { commands, task }
}

enum SessionEnd {
    Intentional,
    ServerClosedNormally,
    Forced,
    Dropped(String),
}

enum Pause {
    Elapsed,
    Forced,
    Closed,
}

struct SocketDriver {
    match_id: MatchId,
    settings: SocketSettings,
    dialer: Arc<dyn Dialer>,
    sink: EventSink,
    diagnostics: Arc<Mutex<SocketDiagnostics>>,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
    backoff: Backoff,
}

impl SocketDriver {
    async fn run(mut self) {
        loop {
            self.emit(SocketEvent::State(LinkState::Connecting));
            {
                let mut diag = self.diagnostics.lock();
                diag.connection_attempts += 1;
                diag.intentionally_closed = false;
            }

            let dialer = Arc::clone(&self.dialer);
            let url = self.settings.url.clone();
            let dial = async move { dialer.dial(&url).await };
            tokio::pin!(dial);

            let dialed = loop {
                tokio::select! {
                    result = &mut dial => break Some(result),
                    cmd = self.commands.recv() => match cmd {
                        None | Some(SocketCommand::Close) => break None,
                        Some(SocketCommand::ForceReconnect) => self.backoff.reset(),
                        // subscribe-match goes out as soon as the socket opens
                        Some(SocketCommand::Send(_)) => {}
                    },
                }
            };

            match dialed {
                None => return self.finish(),
                Some(Err(err)) => {
                    // Failures before the socket opens are expected while the server is away.
                    debug!(target = "rally.socket", match_id = %self.match_id, error = %err, "connect attempt failed");
                    self.diagnostics.lock().record_error(format!("connect failed: {err}"));
                }
                Some(Ok(ws)) => {
                    self.backoff.reset();
                    {
                        let mut diag = self.diagnostics.lock();
                        diag.connected_at = Some(Utc::now());
                        diag.reconnect_attempts = 0;
                        diag.missed_pongs = 0;
                    }
                    info!(target = "rally.socket", match_id = %self.match_id, url = %self.settings.url, "socket connected");
                    self.emit(SocketEvent::State(LinkState::Connected));

                    match self.session(ws).await {
                        SessionEnd::Intentional => return self.finish(),
                        SessionEnd::ServerClosedNormally => {
                            info!(target = "rally.socket", match_id = %self.match_id, "server closed socket normally");
                            return self.finish();
                        }
                        SessionEnd::Forced => {
                            debug!(target = "rally.socket", match_id = %self.match_id, "forced reconnect");
                            match self.pause(self.settings.force_reconnect_delay).await {
                                Pause::Closed => return self.finish(),
                                Pause::Elapsed | Pause::Forced => continue,
                            }
                        }
                        SessionEnd::Dropped(reason) => {
                            if should_log(ThrottleKind::SocketError, self.match_id.as_str()) {
                                warn!(target = "rally.socket", match_id = %self.match_id, reason = %reason, "socket dropped");
                            }
                            self.diagnostics.lock().record_error(reason);
                        }
                    }
                }
            }

            let delay = self.backoff.next_delay();
            let attempt = self.backoff.attempts();
            self.diagnostics.lock().reconnect_attempts = attempt;
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            info!(target = "rally.socket", match_id = %self.match_id, attempt, delay_ms, "scheduling reconnect");
            self.emit(SocketEvent::State(LinkState::Reconnecting { attempt, delay_ms }));

            match self.pause(delay).await {
                Pause::Closed => return self.finish(),
                Pause::Forced => {
                    self.backoff.reset();
                    if let Pause::Closed = self.pause(self.settings.force_reconnect_delay).await {
                        return self.finish();
                    }
                }
                Pause::Elapsed => {}
            }
        }
    }

    async fn session(&mut self, mut ws: BoxSocket) -> SessionEnd {
        if let Err(err) = send_frame(&mut ws, &ClientFrame::subscribe(&self.match_id)).await {
            return SessionEnd::Dropped(format!("subscribe failed: {err}"));
        }

        let period = self.settings.ping_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    {
                        let mut diag = self.diagnostics.lock();
                        if awaiting_pong {
                            diag.missed_pongs += 1;
                        }
                        diag.last_ping_at = Some(Utc::now());
                    }
                    awaiting_pong = true;
                    if let Err(err) = send_frame(&mut ws, &ClientFrame::ping_now()).await {
                        return SessionEnd::Dropped(format!("ping failed: {err}"));
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    Some(SocketCommand::Send(frame)) => {
                        if let Err(err) = send_frame(&mut ws, &frame).await {
                            return SessionEnd::Dropped(format!("send failed: {err}"));
                        }
                    }
                    Some(SocketCommand::ForceReconnect) => {
                        close_with(&mut ws, CLOSE_FORCE_RECONNECT, "force reconnect").await;
                        return SessionEnd::Forced;
                    }
                    Some(SocketCommand::Close) | None => {
                        close_with(&mut ws, CLOSE_NORMAL, "unsubscribed").await;
                        return SessionEnd::Intentional;
                    }
                },
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text, &mut awaiting_pong),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => self.handle_text(&text, &mut awaiting_pong),
                        Err(_) => debug!(target = "rally.socket", match_id = %self.match_id, "dropping non-utf8 frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code));
                        return match code {
                            Some(CLOSE_NORMAL) => SessionEnd::ServerClosedNormally,
                            Some(CLOSE_FORCE_RECONNECT) => SessionEnd::Forced,
                            other => SessionEnd::Dropped(format!("closed by server (code {other:?})")),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionEnd::Dropped(err.to_string()),
                    None => return SessionEnd::Dropped("stream ended".to_string()),
                },
            }
        }
    }

    fn handle_text(&self, text: &str, awaiting_pong: &mut bool) {
        {
            let mut diag = self.diagnostics.lock();
            diag.last_message_at = Some(Utc::now());
            diag.messages_received += 1;
        }

        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                let err = SyncError::from(err);
                if should_log(ThrottleKind::SocketError, self.match_id.as_str()) {
                    warn!(target = "rally.socket", match_id = %self.match_id, error = %err, "dropping frame");
                }
                self.diagnostics.lock().record_error(err.to_string());
                return;
            }
        };

        if let Some(id) = frame.match_id() {
            if *id != self.match_id {
                trace!(target = "rally.socket", match_id = %self.match_id, other = %id, "ignoring frame for another match");
                return;
            }
        }

        let inbound = match frame {
            ServerFrame::Pong => {
                *awaiting_pong = false;
                self.diagnostics.lock().last_pong_at = Some(Utc::now());
                return;
            }
            ServerFrame::MatchDataUpdate(data) => InboundFrame::Refresh(Arc::new(data.normalize())),
            ServerFrame::MatchFullData { data, .. } => InboundFrame::FullData(Arc::new(data.normalize())),
            ServerFrame::MatchAction(action) => InboundFrame::Action(action),
            ServerFrame::Other => return,
        };
        self.emit(SocketEvent::Frame(inbound));
    }

    async fn pause(&mut self, duration: Duration) -> Pause {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Pause::Elapsed,
                cmd = self.commands.recv() => match cmd {
                    None | Some(SocketCommand::Close) => return Pause::Closed,
                    Some(SocketCommand::ForceReconnect) => return Pause::Forced,
                    Some(SocketCommand::Send(_)) => {}
                },
            }
        }
    }

    fn emit(&self, event: SocketEvent) {
        (self.sink)(event);
    }

    fn finish(&self) {
        debug!(target = "rally.socket", match_id = %self.match_id, "socket driver finished");
        self.diagnostics.lock().intentionally_closed = true;
        self.emit(SocketEvent::State(LinkState::Closed));
    }
}

async fn send_frame(ws: &mut BoxSocket, frame: &ClientFrame) -> SyncResult<()> {
    let text = serde_json::to_string(frame)?;
    ws.send(Message::Text(text)).await?;
    Ok(())
}

async fn close_with(ws: &mut BoxSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    };
    if let Err(err) = ws.send(Message::Close(Some(frame))).await {
        debug!(target = "rally.socket", error = %err, "close frame not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Harness {
        handle: SocketHandle,
        events: mpsc::UnboundedReceiver<SocketEvent>,
        servers: mpsc::UnboundedReceiver<ServerSocket>,
        dialer: Arc<MemoryDialer>,
        diagnostics: Arc<Mutex<SocketDiagnostics>>,
    }

    fn settings() -> SocketSettings {
        SocketSettings {
            url: Url::parse("ws://127.0.0.1:8080").unwrap(),
            ping_interval: Duration::from_millis(25_000),
            reconnect_base: Duration::from_millis(3_000),
            reconnect_max: Duration::from_millis(10_000),
            force_reconnect_delay: Duration::from_millis(100),
        }
    }

    fn start(match_id: &str) -> Harness {
        let (dialer, servers) = MemoryDialer::new();
        let (tx, events) = mpsc::unbounded_channel();
        let sink: EventSink = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        let diagnostics = Arc::new(Mutex::new(SocketDiagnostics::default()));
        let handle = spawn_socket(
            MatchId::new(match_id),
            settings(),
            dialer.clone(),
            sink,
            diagnostics.clone(),
            None,
        );
        Harness {
            handle,
            events,
            servers,
            dialer,
            diagnostics,
        }
    }

    async fn next_state(events: &mut mpsc::UnboundedReceiver<SocketEvent>) -> LinkState {
        loop {
            match events.recv().await.expect("event stream open") {
                SocketEvent::State(state) => return state,
                SocketEvent::Frame(_) => continue,
            }
        }
    }

    async fn next_client_frame(server: &mut ServerSocket) -> ClientFrame {
        loop {
            match server.next().await.expect("client frame").expect("frame ok") {
                Message::Text(text) => return serde_json::from_str(&text).expect("client frame json"),
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn subscribes_on_open_and_forwards_refreshes() {
        let mut h = start("M1");
        assert_eq!(next_state(&mut h.events).await, LinkState::Connecting);
        let mut server = h.servers.recv().await.unwrap();
        assert_eq!(next_state(&mut h.events).await, LinkState::Connected);
        assert_eq!(next_client_frame(&mut server).await, ClientFrame::subscribe(&MatchId::new("M1")));

        let other = json!({"type": "match-data-update", "matchId": "M2", "sets": []});
        let mine = json!({
            "type": "match-data-update",
            "matchId": "M1",
            "homeTeam": {"name": "Panthers"},
            "sets": [{"index": 1, "homePoints": 2, "awayPoints": 0}],
            "_timestamp": 10
        });
        server.send(Message::Text("{not json".into())).await.unwrap();
        server.send(Message::Text(other.to_string())).await.unwrap();
        server.send(Message::Text(mine.to_string())).await.unwrap();

        match h.events.recv().await.unwrap() {
            SocketEvent::Frame(InboundFrame::Refresh(payload)) => {
                assert_eq!(payload.timestamp, Some(10));
                assert_eq!(payload.periods[0].home_points, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(h.diagnostics.lock().messages_received, 3);
        assert_eq!(h.diagnostics.lock().recent_errors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn action_frames_are_delivered_distinctly() {
        let mut h = start("M1");
        let mut server = h.servers.recv().await.unwrap();
        next_client_frame(&mut server).await;

        let action = json!({
            "type": "match-action",
            "matchId": "M1",
            "action": "timeout",
            "data": {"team": "home", "countdown": 30, "startTimestamp": 5},
            "_timestamp": 6
        });
        server.send(Message::Text(action.to_string())).await.unwrap();
        loop {
            match h.events.recv().await.unwrap() {
                SocketEvent::Frame(InboundFrame::Action(frame)) => {
                    assert_eq!(frame.action, "timeout");
                    break;
                }
                SocketEvent::State(_) => continue,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_then_resets_after_success() {
        let mut h = start("M1");
        assert_eq!(next_state(&mut h.events).await, LinkState::Connecting);
        let server = h.servers.recv().await.unwrap();
        assert_eq!(next_state(&mut h.events).await, LinkState::Connected);

        h.dialer.fail_next(2);
        let dropped_at = Instant::now();
        drop(server);

        let mut delays = Vec::new();
        for _ in 0..3 {
            match next_state(&mut h.events).await {
                LinkState::Reconnecting { attempt, delay_ms } => delays.push((attempt, delay_ms)),
                other => panic!("expected reconnecting, got {other:?}"),
            }
            assert_eq!(next_state(&mut h.events).await, LinkState::Connecting);
        }
        assert_eq!(delays, vec![(1, 3_000), (2, 6_000), (3, 9_000)]);

        let _server = h.servers.recv().await.unwrap();
        assert_eq!(next_state(&mut h.events).await, LinkState::Connected);
        assert!(dropped_at.elapsed() >= Duration::from_millis(18_000));
        assert_eq!(h.diagnostics.lock().reconnect_attempts, 0);
        assert_eq!(h.dialer.dial_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_reconnect_skips_backoff() {
        let mut h = start("M1");
        next_state(&mut h.events).await;
        let mut server = h.servers.recv().await.unwrap();
        assert_eq!(next_state(&mut h.events).await, LinkState::Connected);
        next_client_frame(&mut server).await;

        assert!(h.handle.force_reconnect());
        match server.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), CLOSE_FORCE_RECONNECT),
            other => panic!("expected close frame, got {other:?}"),
        }

        assert_eq!(next_state(&mut h.events).await, LinkState::Connecting);
        let mut server = h.servers.recv().await.unwrap();
        assert_eq!(next_state(&mut h.events).await, LinkState::Connected);
        assert_eq!(next_client_frame(&mut server).await, ClientFrame::subscribe(&MatchId::new("M1")));
    }

    #[tokio::test(start_paused = true)]
    async fn close_uses_normal_code() {
        let mut h = start("M1");
        next_state(&mut h.events).await;
        let mut server = h.servers.recv().await.unwrap();
        next_state(&mut h.events).await;
        next_client_frame(&mut server).await;

        let task = h.handle.close();
        match server.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), CLOSE_NORMAL),
            other => panic!("expected close frame, got {other:?}"),
        }
        task.await.unwrap();
        assert_eq!(next_state(&mut h.events).await, LinkState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_and_counts_missed_pongs() {
        let mut h = start("M1");
        let mut server = h.servers.recv().await.unwrap();
        next_client_frame(&mut server).await;

        assert!(matches!(next_client_frame(&mut server).await, ClientFrame::Ping { .. }));
        assert!(matches!(next_client_frame(&mut server).await, ClientFrame::Ping { .. }));
        assert_eq!(h.diagnostics.lock().missed_pongs, 1);

        server.send(Message::Text(json!({"type": "pong"}).to_string())).await.unwrap();
        assert!(matches!(next_client_frame(&mut server).await, ClientFrame::Ping { .. }));
        let diag = h.diagnostics.lock().clone();
        assert_eq!(diag.missed_pongs, 1);
        assert!(diag.last_pong_at.is_some());
    }
}
