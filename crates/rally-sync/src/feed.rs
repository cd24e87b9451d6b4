//! Hosted change-feed subscription.
//!
//! The feed never carries state: every row notification for a match only
//! triggers a debounced full re-fetch through a [`SnapshotSource`]. Deleting
//! the match row is reported as [`FeedEvent::Deleted`] instead.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rally_proto::feed::{ChangeFilter, ChannelEvent, ChannelMessage, ChannelStatus, PHOENIX_TOPIC};
use rally_proto::{ChangeKind, FeedTable, MatchId, MatchPayload, RowChange, CLOSE_NORMAL};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::debounce::Debouncer;
use crate::error::{SyncError, SyncResult};
use crate::fetch::{HostedClient, SnapshotSource};
use crate::liveness::{Liveness, LivenessToken};
use crate::log_throttle::{should_log, ThrottleKind};
use crate::socket::{BoxSocket, Dialer, TungsteniteDialer};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// What an open channel reports.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    Status(ChannelStatus),
    Change(RowChange),
}

/// Live channel returned by [`FeedTransport::open`]. Dropping it leaves the
/// channel.
pub struct FeedChannel {
    pub signals: mpsc::UnboundedReceiver<FeedSignal>,
    close: mpsc::UnboundedSender<()>,
    task: Option<JoinHandle<()>>,
}

impl FeedChannel {
    pub fn new(
        signals: mpsc::UnboundedReceiver<FeedSignal>,
        close: mpsc::UnboundedSender<()>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { signals, close, task }
    }

    /// Leaves the channel and waits for the underlying socket to go away.
    pub async fn close(mut self) {
        let _ = self.close.send(());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FeedChannel {
    fn drop(&mut self) {
        let _ = self.close.send(());
    }
}

/// Provider of the hosted realtime service.
#[async_trait]
pub trait FeedTransport: Send + Sync + 'static {
    /// Internal row id for an external match id, when the service knows it.
    async fn resolve_row_id(&self, match_id: &MatchId) -> SyncResult<Option<String>>;

    /// Joins `topic` with `filters`. Fails when the service cannot be reached.
    async fn open(&self, topic: String, filters: Vec<ChangeFilter>) -> SyncResult<FeedChannel>;
}

/// Subscription filters for one match. The match row is always watched by
/// external id; child tables only when the internal row id is known.
pub fn feed_filters(match_id: &MatchId, row_id: Option<&str>) -> Vec<ChangeFilter> {
    let mut filters = vec![ChangeFilter::all(FeedTable::Matches, "external_id", match_id.as_str())];
    if let Some(row_id) = row_id {
        filters.extend(
            FeedTable::CHILDREN
                .iter()
                .map(|table| ChangeFilter::all(*table, "match_id", row_id)),
        );
    }
    filters
}

#[derive(Clone)]
pub struct RealtimeSettings {
    pub url: Url,
    pub api_key: Option<String>,
    pub heartbeat: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl RealtimeSettings {
    pub fn from_config(cfg: &SyncConfig) -> SyncResult<Self> {
        let base = cfg.feed_url.as_deref().ok_or(SyncError::NotConfigured("feed_url"))?;
        Ok(Self {
            url: realtime_socket_url(base, cfg.feed_api_key.as_deref())?,
            api_key: cfg.feed_api_key.clone(),
            heartbeat: cfg.feed_heartbeat(),
            reconnect_base: cfg.reconnect_base(),
            reconnect_max: cfg.reconnect_max(),
        })
    }
}

/// `{base}/realtime/v1/websocket?apikey=..&vsn=1.0.0` with a websocket scheme.
pub fn realtime_socket_url(base: &str, api_key: Option<&str>) -> SyncResult<Url> {
    let mut url = Url::parse(base)?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::NotConfigured("feed_url"))?;
    if url.path() == "/" || url.path().is_empty() {
        url.set_path("/realtime/v1/websocket");
    }
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        if let Some(key) = api_key {
            query.append_pair("apikey", key);
        }
        query.append_pair("vsn", "1.0.0");
    }
    Ok(url)
}

/// Phoenix-channel client for the hosted realtime service.
pub struct RealtimeFeed {
    settings: RealtimeSettings,
    dialer: Arc<dyn Dialer>,
    rest: Option<HostedClient>,
}

impl RealtimeFeed {
    pub fn new(settings: RealtimeSettings, dialer: Arc<dyn Dialer>, rest: Option<HostedClient>) -> Self {
        Self { settings, dialer, rest }
    }

    pub fn from_config(cfg: &SyncConfig) -> SyncResult<Self> {
        Ok(Self::new(
            RealtimeSettings::from_config(cfg)?,
            Arc::new(TungsteniteDialer),
            HostedClient::from_config(cfg),
        ))
    }
}

#[async_trait]
impl FeedTransport for RealtimeFeed {
    async fn resolve_row_id(&self, match_id: &MatchId) -> SyncResult<Option<String>> {
        match &self.rest {
            Some(rest) => Ok(rest.resolve_row_id(match_id).await?),
            None => Ok(None),
        }
    }

    async fn open(&self, topic: String, filters: Vec<ChangeFilter>) -> SyncResult<FeedChannel> {
        let ws = self.dialer.dial(&self.settings.url).await?;
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let (close, close_rx) = mpsc::unbounded_channel();
        let driver = ChannelDriver {
            topic,
            filters,
            settings: self.settings.clone(),
            dialer: Arc::clone(&self.dialer),
            signals: signals_tx,
            close: close_rx,
            backoff: Backoff::new(self.settings.reconnect_base, self.settings.reconnect_max),
            next_ref: 0,
        };
        let task = tokio::spawn(driver.run(ws));
        Ok(FeedChannel::new(signals, close, Some(task)))
    }
}

enum ChannelEnd {
    Left,
    Dropped(String),
}

struct ChannelDriver {
    topic: String,
    filters: Vec<ChangeFilter>,
    settings: RealtimeSettings,
    dialer: Arc<dyn Dialer>,
    signals: mpsc::UnboundedSender<FeedSignal>,
    close: mpsc::UnboundedReceiver<()>,
    backoff: Backoff,
    next_ref: u64,
}

impl ChannelDriver {
    async fn run(mut self, first: BoxSocket) {
        let mut socket = Some(first);
        loop {
            if let Some(ws) = socket.take() {
                self.backoff.reset();
                match self.session(ws).await {
                    ChannelEnd::Left => return,
                    ChannelEnd::Dropped(reason) => {
                        if should_log(ThrottleKind::FeedChannel, &self.topic) {
                            warn!(target = "rally.feed", topic = %self.topic, reason = %reason, "feed socket dropped");
                        }
                        self.signal(FeedSignal::Status(ChannelStatus::ChannelError(reason)));
                    }
                }
            }

            let delay = self.backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.close.recv() => return,
            }

            let dialer = Arc::clone(&self.dialer);
            let url = self.settings.url.clone();
            tokio::select! {
                result = async move { dialer.dial(&url).await } => match result {
                    Ok(ws) => socket = Some(ws),
                    Err(err) => {
                        debug!(target = "rally.feed", topic = %self.topic, error = %err, "feed redial failed");
                    }
                },
                _ = self.close.recv() => return,
            }
        }
    }

    fn reference(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    fn signal(&self, signal: FeedSignal) {
        let _ = self.signals.send(signal);
    }

    async fn session(&mut self, mut ws: BoxSocket) -> ChannelEnd {
        let join_ref = self.reference();
        let join = ChannelMessage::join(
            &self.topic,
            &self.filters,
            self.settings.api_key.as_deref(),
            join_ref.clone(),
        );
        if let Err(err) = send_message(&mut ws, &join).await {
            return ChannelEnd::Dropped(format!("join failed: {err}"));
        }

        let period = self.settings.heartbeat;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let join_deadline = tokio::time::sleep(JOIN_TIMEOUT);
        tokio::pin!(join_deadline);
        let mut subscribed = false;
        let mut timed_out = false;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let beat = ChannelMessage::heartbeat(self.reference());
                    if let Err(err) = send_message(&mut ws, &beat).await {
                        return ChannelEnd::Dropped(format!("heartbeat failed: {err}"));
                    }
                }
                _ = &mut join_deadline, if !subscribed && !timed_out => {
                    timed_out = true;
                    self.signal(FeedSignal::Status(ChannelStatus::TimedOut));
                }
                _ = self.close.recv() => {
                    let reference = self.reference();
                    let leave = ChannelMessage::leave(&self.topic, reference);
                    let _ = send_message(&mut ws, &leave).await;
                    let frame = CloseFrame { code: CloseCode::from(CLOSE_NORMAL), reason: "teardown".into() };
                    if let Err(err) = ws.send(Message::Close(Some(frame))).await {
                        debug!(target = "rally.feed", error = %err, "close frame not delivered");
                    }
                    return ChannelEnd::Left;
                }
                msg = ws.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
                        Some(Ok(Message::Close(_))) => return ChannelEnd::Dropped("closed by service".to_string()),
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => return ChannelEnd::Dropped(err.to_string()),
                        None => return ChannelEnd::Dropped("stream ended".to_string()),
                    };
                    let message = match serde_json::from_str::<ChannelMessage>(&text) {
                        Ok(message) => message,
                        Err(err) => {
                            if should_log(ThrottleKind::FeedChannel, &self.topic) {
                                warn!(target = "rally.feed", topic = %self.topic, error = %err, "dropping malformed feed message");
                            }
                            continue;
                        }
                    };
                    if message.topic != self.topic {
                        if message.topic != PHOENIX_TOPIC {
                            trace!(target = "rally.feed", topic = %message.topic, "ignoring message for another topic");
                        }
                        continue;
                    }
                    let is_join_reply = message.reference.as_deref() == Some(join_ref.as_str());
                    match message.classify() {
                        ChannelEvent::Change(change) => self.signal(FeedSignal::Change(change)),
                        ChannelEvent::Reply { ok: true, .. } | ChannelEvent::Status(ChannelStatus::Subscribed)
                            if is_join_reply || message.event == "system" =>
                        {
                            if !subscribed {
                                subscribed = true;
                                self.signal(FeedSignal::Status(ChannelStatus::Subscribed));
                            }
                        }
                        ChannelEvent::Reply { ok: false, message: reason } if is_join_reply => {
                            self.signal(FeedSignal::Status(ChannelStatus::ChannelError(
                                reason.unwrap_or_else(|| "join refused".to_string()),
                            )));
                        }
                        ChannelEvent::Status(ChannelStatus::Closed) => {
                            return ChannelEnd::Dropped("channel closed by service".to_string());
                        }
                        ChannelEvent::Status(status) => self.signal(FeedSignal::Status(status)),
                        ChannelEvent::Malformed(reason) => {
                            if should_log(ThrottleKind::FeedChannel, &self.topic) {
                                warn!(target = "rally.feed", topic = %self.topic, reason = %reason, "dropping malformed change");
                            }
                        }
                        ChannelEvent::Reply { .. } | ChannelEvent::Ignored => {}
                    }
                }
            }
        }
    }
}

async fn send_message(ws: &mut BoxSocket, message: &ChannelMessage) -> SyncResult<()> {
    let text = serde_json::to_string(message)?;
    ws.send(Message::Text(text)).await?;
    Ok(())
}

/// Observable events of one feed subscription.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Connecting,
    /// Provider-reported channel status. Only `Subscribed` means connected;
    /// the others are transient and informational.
    Channel(ChannelStatus),
    Data(Arc<MatchPayload>),
    Deleted,
    /// The channel could not be opened at all.
    Failed(String),
}

pub type FeedSink = Arc<dyn Fn(FeedEvent) + Send + Sync>;

/// Subscribes matches through a [`FeedTransport`] and turns row changes
/// into full snapshots.
#[derive(Clone)]
pub struct ChangeFeedClient {
    transport: Arc<dyn FeedTransport>,
    source: Arc<dyn SnapshotSource>,
    debounce: Duration,
}

impl ChangeFeedClient {
    pub fn new(transport: Arc<dyn FeedTransport>, source: Arc<dyn SnapshotSource>, debounce: Duration) -> Self {
        Self {
            transport,
            source,
            debounce,
        }
    }

    pub fn subscribe(&self, match_id: MatchId, sink: impl Fn(FeedEvent) + Send + Sync + 'static) -> FeedSubscription {
        let liveness = Liveness::new();
        let token = liveness.token();
        let sink: FeedSink = Arc::new(sink);
        let refetch = Refetcher::new(
            match_id.clone(),
            Arc::clone(&self.source),
            Arc::clone(&sink),
            token.clone(),
            self.debounce,
        );
        let task = tokio::spawn(run_subscription(
            match_id.clone(),
            Arc::clone(&self.transport),
            sink,
            token,
            refetch,
        ));
        FeedSubscription {
            match_id,
            liveness,
            task: parking_lot::Mutex::new(Some(task)),
            torn_down: AtomicBool::new(false),
        }
    }
}

async fn run_subscription(
    match_id: MatchId,
    transport: Arc<dyn FeedTransport>,
    sink: FeedSink,
    token: LivenessToken,
    refetch: Refetcher,
) {
    let emit = |event: FeedEvent| {
        if token.is_live() {
            sink(event);
        }
    };
    emit(FeedEvent::Connecting);

    let row_id = match transport.resolve_row_id(&match_id).await {
        Ok(row_id) => row_id,
        Err(err) => {
            if should_log(ThrottleKind::FeedChannel, match_id.as_str()) {
                warn!(target = "rally.feed", match_id = %match_id, error = %err, "row id lookup failed");
            }
            None
        }
    };
    if row_id.is_none() {
        warn!(target = "rally.feed", match_id = %match_id, "no internal row id; watching the match row only");
    }

    let topic = format!("realtime:match-{}-{}", match_id, uuid::Uuid::new_v4().simple());
    let mut channel = match transport.open(topic, feed_filters(&match_id, row_id.as_deref())).await {
        Ok(channel) => channel,
        Err(err) => {
            warn!(target = "rally.feed", match_id = %match_id, error = %err, "could not open feed channel");
            emit(FeedEvent::Failed(err.to_string()));
            return;
        }
    };

    while let Some(signal) = channel.signals.recv().await {
        if !token.is_live() {
            break;
        }
        match signal {
            FeedSignal::Status(ChannelStatus::Subscribed) => {
                info!(target = "rally.feed", match_id = %match_id, "feed subscribed");
                emit(FeedEvent::Channel(ChannelStatus::Subscribed));
                refetch.request();
            }
            FeedSignal::Status(status) => {
                if should_log(ThrottleKind::FeedChannel, match_id.as_str()) {
                    warn!(target = "rally.feed", match_id = %match_id, status = status.as_str(), "feed channel status");
                }
                emit(FeedEvent::Channel(status));
            }
            FeedSignal::Change(change) => {
                debug!(
                    target = "rally.feed",
                    match_id = %match_id,
                    table = ?change.table,
                    kind = ?change.kind,
                    "row change"
                );
                if change.kind == ChangeKind::Delete && change.table == Some(FeedTable::Matches) {
                    refetch.cancel();
                    emit(FeedEvent::Deleted);
                } else {
                    refetch.request();
                }
            }
        }
    }

    channel.close().await;
    emit(FeedEvent::Channel(ChannelStatus::Closed));
}

/// Debounced full re-fetch. Results are delivered only if no newer fetch
/// has already been delivered.
struct Refetcher {
    debouncer: Debouncer<MatchId, ()>,
    match_id: MatchId,
}

impl Refetcher {
    fn new(
        match_id: MatchId,
        source: Arc<dyn SnapshotSource>,
        sink: FeedSink,
        token: LivenessToken,
        window: Duration,
    ) -> Self {
        let issued = Arc::new(AtomicU64::new(0));
        let delivered = Arc::new(AtomicU64::new(0));
        let debouncer = Debouncer::new(window, move |match_id: MatchId, ()| {
            let seq = issued.fetch_add(1, Ordering::SeqCst) + 1;
            let source = Arc::clone(&source);
            let sink = Arc::clone(&sink);
            let token = token.clone();
            let delivered = Arc::clone(&delivered);
            tokio::spawn(async move {
                match source.fetch(&match_id).await {
                    Ok(payload) => {
                        let newest = delivered.fetch_max(seq, Ordering::SeqCst) < seq;
                        if newest && token.is_live() {
                            sink(FeedEvent::Data(Arc::new(payload)));
                        }
                    }
                    Err(err) => {
                        if should_log(ThrottleKind::FeedChannel, match_id.as_str()) {
                            warn!(target = "rally.feed", match_id = %match_id, error = %err, "refetch failed");
                        }
                    }
                }
            });
        });
        Self { debouncer, match_id }
    }

    fn request(&self) {
        self.debouncer.push(self.match_id.clone(), ());
    }

    fn cancel(&self) {
        self.debouncer.cancel(&self.match_id);
    }
}

/// Handle to one feed subscription.
pub struct FeedSubscription {
    match_id: MatchId,
    liveness: Liveness,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl FeedSubscription {
    pub fn match_id(&self) -> &MatchId {
        &self.match_id
    }

    /// Stops delivery and leaves the channel. Safe to call more than once.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.liveness.retire();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        debug!(target = "rally.feed", match_id = %self.match_id, "feed subscription torn down");
    }

    pub fn is_active(&self) -> bool {
        !self.torn_down.load(Ordering::SeqCst)
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Transport driven by hand: every `open` hands a signal sender to whoever
/// holds the receiver returned by [`ManualFeed::new`].
pub struct ManualFeed {
    row_id: parking_lot::Mutex<Option<String>>,
    reachable: AtomicBool,
    opened: mpsc::UnboundedSender<ManualChannel>,
}

/// Test-side end of a channel opened on a [`ManualFeed`].
pub struct ManualChannel {
    pub topic: String,
    pub filters: Vec<ChangeFilter>,
    pub signals: mpsc::UnboundedSender<FeedSignal>,
    pub closed: mpsc::UnboundedReceiver<()>,
}

impl ManualFeed {
    pub fn new(row_id: Option<&str>) -> (Arc<Self>, mpsc::UnboundedReceiver<ManualChannel>) {
        let (opened, rx) = mpsc::unbounded_channel();
        let feed = Arc::new(Self {
            row_id: parking_lot::Mutex::new(row_id.map(str::to_string)),
            reachable: AtomicBool::new(true),
            opened,
        });
        (feed, rx)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl FeedTransport for ManualFeed {
    async fn resolve_row_id(&self, _match_id: &MatchId) -> SyncResult<Option<String>> {
        Ok(self.row_id.lock().clone())
    }

    async fn open(&self, topic: String, filters: Vec<ChangeFilter>) -> SyncResult<FeedChannel> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::NotConfigured("feed_url"));
        }
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let (close, closed) = mpsc::unbounded_channel();
        self.opened
            .send(ManualChannel {
                topic,
                filters,
                signals: signals_tx,
                closed,
            })
            .map_err(|_| SyncError::Closed)?;
        Ok(FeedChannel::new(signals, close, None))
    }
}
