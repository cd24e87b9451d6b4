//! Per-match transport selection.
//!
//! A [`LiveConnection`] owns exactly one active transport: the hosted change
//! feed or the direct socket. In `Auto` mode the feed is tried first and the
//! socket takes over (status `fallback`) when the feed is unavailable.
//! Every callback checks a liveness token, so events from a transport that
//! is being torn down never reach the observer.

use parking_lot::Mutex;
use rally_proto::{LiveStateSnapshot, MatchActionFrame, MatchId, MatchPayload};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{StoreError, SyncResult};
use crate::feed::{ChangeFeedClient, FeedEvent, FeedSubscription, RealtimeFeed};
use crate::fetch::FallbackSnapshotSource;
use crate::liveness::{Liveness, LivenessToken};
use crate::log_throttle::{should_log, ThrottleKind};
use crate::reconcile::{reconcile, ClientPerspectiveState, Viewpoint};
use crate::registry::{ConnectionRegistry, Subscription};
use crate::socket::{InboundFrame, LinkState, SocketEvent, SocketSettings, TungsteniteDialer};
use rally_proto::feed::ChannelStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Change feed first, direct socket as fallback.
    #[default]
    Auto,
    FeedOnly,
    SocketOnly,
}

impl ConnectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionMode::Auto => "auto",
            ConnectionMode::FeedOnly => "feed_only",
            ConnectionMode::SocketOnly => "socket_only",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ConnectionMode::Auto),
            "feed" | "feed_only" | "feed-only" => Ok(ConnectionMode::FeedOnly),
            "socket" | "socket_only" | "socket-only" => Ok(ConnectionMode::SocketOnly),
            other => Err(format!("unknown connection mode `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
    /// Connected through the socket after the feed was unavailable.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveTransport {
    Feed,
    Socket,
}

/// One reconciled delivery.
#[derive(Debug, Clone)]
pub struct MatchUpdate {
    pub source: ActiveTransport,
    pub payload: Arc<MatchPayload>,
    pub snapshot: LiveStateSnapshot,
    pub view: ClientPerspectiveState,
}

/// Receives everything a [`LiveConnection`] observes.
pub trait MatchObserver: Send + Sync + 'static {
    fn on_update(&self, update: MatchUpdate);

    /// Imperative event from the socket, such as a timeout starting.
    fn on_action(&self, _action: MatchActionFrame) {}

    /// The match record was deleted remotely.
    fn on_deleted(&self) {}

    fn on_status(&self, _status: ConnectionStatus) {}
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Preferences {
    #[serde(default)]
    preferred_connection: ConnectionMode,
}

/// Persists the preferred connection mode as a small JSON file.
#[derive(Debug, Clone)]
pub struct PreferenceStore {
    path: PathBuf,
}

impl PreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored mode, or `Auto` when the file is missing or unreadable.
    pub fn load(&self) -> ConnectionMode {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(_) => return ConnectionMode::Auto,
        };
        match serde_json::from_slice::<Preferences>(&raw) {
            Ok(prefs) => prefs.preferred_connection,
            Err(err) => {
                warn!(target = "rally.orchestrator", path = %self.path.display(), error = %err, "ignoring unreadable preferences");
                ConnectionMode::Auto
            }
        }
    }

    pub fn save(&self, mode: ConnectionMode) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::from)?;
        }
        let body = serde_json::to_vec_pretty(&Preferences {
            preferred_connection: mode,
        })?;
        std::fs::write(&self.path, body).map_err(StoreError::from)?;
        Ok(())
    }
}

/// Builds [`LiveConnection`]s over a shared registry and feed client.
#[derive(Clone)]
pub struct Orchestrator {
    registry: ConnectionRegistry,
    feed: Option<ChangeFeedClient>,
    preferences: Option<PreferenceStore>,
}

impl Orchestrator {
    pub fn new(registry: ConnectionRegistry, feed: Option<ChangeFeedClient>) -> Self {
        Self {
            registry,
            feed,
            preferences: None,
        }
    }

    pub fn with_preferences(mut self, preferences: PreferenceStore) -> Self {
        self.preferences = Some(preferences);
        self
    }

    /// Real socket and feed transports; the feed is left out when it is not
    /// configured.
    pub fn from_config(cfg: &SyncConfig) -> SyncResult<Self> {
        let registry = ConnectionRegistry::new(SocketSettings::from_config(cfg)?, Arc::new(TungsteniteDialer));
        let feed = if cfg.feed_configured() {
            Some(ChangeFeedClient::new(
                Arc::new(RealtimeFeed::from_config(cfg)?),
                Arc::new(FallbackSnapshotSource::from_config(cfg)),
                cfg.feed_debounce(),
            ))
        } else {
            None
        };
        Ok(Self::new(registry, feed).with_preferences(PreferenceStore::new(cfg.preferences_path())))
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn feed_available(&self) -> bool {
        self.feed.is_some()
    }

    pub fn preferred_mode(&self) -> ConnectionMode {
        self.preferences
            .as_ref()
            .map(PreferenceStore::load)
            .unwrap_or_default()
    }

    pub fn connect(
        &self,
        match_id: MatchId,
        mode: ConnectionMode,
        viewpoint: Viewpoint,
        observer: Arc<dyn MatchObserver>,
    ) -> LiveConnection {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let inner = Arc::new(LiveInner {
            match_id,
            viewpoint,
            registry: self.registry.clone(),
            feed: self.feed.clone(),
            preferences: self.preferences.clone(),
            observer,
            liveness: Liveness::new(),
            mode: Mutex::new(mode),
            active: Mutex::new(Active::Idle),
            status,
        });
        info!(target = "rally.orchestrator", match_id = %inner.match_id, mode = %mode, "connecting");
        inner.start(mode);
        LiveConnection { inner }
    }
}

enum Active {
    Idle,
    Socket(Subscription),
    Feed(FeedSubscription),
}

impl Active {
    fn transport(&self) -> Option<ActiveTransport> {
        match self {
            Active::Idle => None,
            Active::Socket(_) => Some(ActiveTransport::Socket),
            Active::Feed(_) => Some(ActiveTransport::Feed),
        }
    }

    fn release(self) {
        match self {
            Active::Idle => {}
            Active::Socket(sub) => sub.unsubscribe(),
            Active::Feed(sub) => sub.teardown(),
        }
    }
}

struct LiveInner {
    match_id: MatchId,
    viewpoint: Viewpoint,
    registry: ConnectionRegistry,
    feed: Option<ChangeFeedClient>,
    preferences: Option<PreferenceStore>,
    observer: Arc<dyn MatchObserver>,
    liveness: Liveness,
    mode: Mutex<ConnectionMode>,
    active: Mutex<Active>,
    status: watch::Sender<ConnectionStatus>,
}

impl LiveInner {
    fn start(self: &Arc<Self>, mode: ConnectionMode) {
        let token = self.liveness.token();
        match (mode, self.feed.as_ref()) {
            (ConnectionMode::SocketOnly, _) => self.start_socket(token, false),
            (ConnectionMode::FeedOnly, Some(feed)) => self.start_feed(feed, token, false),
            (ConnectionMode::FeedOnly, None) => {
                warn!(target = "rally.orchestrator", match_id = %self.match_id, "change feed is not configured");
                self.publish(ConnectionStatus::Error);
            }
            (ConnectionMode::Auto, Some(feed)) => self.start_feed(feed, token, true),
            (ConnectionMode::Auto, None) => {
                debug!(target = "rally.orchestrator", match_id = %self.match_id, "no change feed; using socket");
                self.start_socket(token, true);
            }
        }
    }

    fn install(&self, next: Active) {
        let previous = std::mem::replace(&mut *self.active.lock(), next);
        previous.release();
    }

    fn start_socket(self: &Arc<Self>, token: LivenessToken, fallback: bool) {
        self.publish(ConnectionStatus::Connecting);
        let weak = Arc::downgrade(self);
        let guard = token.clone();
        let sub = self.registry.acquire(self.match_id.clone(), move |event| {
            if !guard.is_live() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.on_socket_event(event, fallback);
            }
        });
        if token.is_live() {
            self.install(Active::Socket(sub));
        } else {
            sub.unsubscribe();
        }
    }

    fn on_socket_event(&self, event: &SocketEvent, fallback: bool) {
        match event {
            SocketEvent::State(LinkState::Connecting) => self.publish(ConnectionStatus::Connecting),
            SocketEvent::State(LinkState::Connected) => self.publish(if fallback {
                ConnectionStatus::Fallback
            } else {
                ConnectionStatus::Connected
            }),
            SocketEvent::State(LinkState::Reconnecting { .. } | LinkState::Closed) => {
                self.publish(ConnectionStatus::Disconnected)
            }
            SocketEvent::Frame(InboundFrame::Refresh(payload) | InboundFrame::FullData(payload)) => {
                self.deliver(ActiveTransport::Socket, Arc::clone(payload))
            }
            SocketEvent::Frame(InboundFrame::Action(action)) => self.observer.on_action(action.clone()),
        }
    }

    fn start_feed(self: &Arc<Self>, feed: &ChangeFeedClient, token: LivenessToken, auto: bool) {
        self.publish(ConnectionStatus::Connecting);
        let weak: Weak<LiveInner> = Arc::downgrade(self);
        let guard = token.clone();
        let sub = feed.subscribe(self.match_id.clone(), move |event| {
            if !guard.is_live() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.on_feed_event(event, &guard, auto);
            }
        });
        if token.is_live() {
            self.install(Active::Feed(sub));
        } else {
            sub.teardown();
        }
    }

    fn on_feed_event(self: &Arc<Self>, event: FeedEvent, token: &LivenessToken, auto: bool) {
        match event {
            FeedEvent::Connecting => self.publish(ConnectionStatus::Connecting),
            FeedEvent::Channel(ChannelStatus::Subscribed) => self.publish(ConnectionStatus::Connected),
            FeedEvent::Channel(ChannelStatus::Closed) => self.publish(ConnectionStatus::Disconnected),
            FeedEvent::Channel(other) => {
                if should_log(ThrottleKind::FeedChannel, self.match_id.as_str()) {
                    info!(target = "rally.orchestrator", match_id = %self.match_id, status = other.as_str(), "feed channel hiccup");
                }
            }
            FeedEvent::Data(payload) => self.deliver(ActiveTransport::Feed, payload),
            FeedEvent::Deleted => {
                info!(target = "rally.orchestrator", match_id = %self.match_id, "match deleted");
                self.observer.on_deleted();
            }
            FeedEvent::Failed(reason) if auto => {
                warn!(target = "rally.orchestrator", match_id = %self.match_id, error = %reason, "feed unavailable; falling back to socket");
                self.start_socket(token.clone(), true);
            }
            FeedEvent::Failed(reason) => {
                warn!(target = "rally.orchestrator", match_id = %self.match_id, error = %reason, "feed unavailable");
                self.publish(ConnectionStatus::Error);
            }
        }
    }

    fn deliver(&self, source: ActiveTransport, payload: Arc<MatchPayload>) {
        let snapshot = LiveStateSnapshot::from_payload(self.match_id.clone(), &payload);
        let view = reconcile(&snapshot, self.viewpoint);
        self.observer.on_update(MatchUpdate {
            source,
            payload,
            snapshot,
            view,
        });
    }

    fn publish(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            debug!(target = "rally.orchestrator", match_id = %self.match_id, status = ?status, "status changed");
            self.observer.on_status(status);
        }
    }

    /// Invalidates every callback of the current transport and drops it.
    fn stop(&self) {
        self.liveness.retire();
        self.install(Active::Idle);
    }
}

/// Handle for one match connection. Dropping it closes the connection.
pub struct LiveConnection {
    inner: Arc<LiveInner>,
}

impl LiveConnection {
    pub fn match_id(&self) -> &MatchId {
        &self.inner.match_id
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn active_transport(&self) -> Option<ActiveTransport> {
        self.inner.active.lock().transport()
    }

    pub fn mode(&self) -> ConnectionMode {
        *self.inner.mode.lock()
    }

    /// Bounces the active transport without changing the mode. An active
    /// socket, fallback included, is bounced in place with the
    /// force-reconnect close code.
    pub fn reconnect(&self) {
        let mode = self.mode();
        info!(target = "rally.orchestrator", match_id = %self.inner.match_id, mode = %mode, "reconnect requested");
        if self.active_transport() == Some(ActiveTransport::Socket) {
            self.inner.registry.force_reconnect(&self.inner.match_id);
            return;
        }
        self.inner.stop();
        self.inner.start(mode);
    }

    /// Persists `mode` and reconnects through it when it differs.
    pub fn set_mode(&self, mode: ConnectionMode) -> SyncResult<()> {
        if let Some(prefs) = &self.inner.preferences {
            prefs.save(mode)?;
        }
        let previous = std::mem::replace(&mut *self.inner.mode.lock(), mode);
        if previous != mode {
            info!(target = "rally.orchestrator", match_id = %self.inner.match_id, from = %previous, to = %mode, "switching mode");
            self.inner.stop();
            self.inner.start(mode);
        }
        Ok(())
    }

    /// Tears down the active transport. Safe to call more than once.
    pub fn close(&self) {
        self.inner.stop();
        self.inner.publish(ConnectionStatus::Disconnected);
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_cli_spellings() {
        assert_eq!("auto".parse::<ConnectionMode>().unwrap(), ConnectionMode::Auto);
        assert_eq!("feed".parse::<ConnectionMode>().unwrap(), ConnectionMode::FeedOnly);
        assert_eq!("socket-only".parse::<ConnectionMode>().unwrap(), ConnectionMode::SocketOnly);
        assert!("carrier-pigeon".parse::<ConnectionMode>().is_err());
    }

    #[test]
    fn preferences_round_trip_and_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferenceStore::new(dir.path().join("nested/preferences.json"));
        assert_eq!(store.load(), ConnectionMode::Auto);

        store.save(ConnectionMode::SocketOnly).unwrap();
        assert_eq!(store.load(), ConnectionMode::SocketOnly);
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"preferred_connection\": \"socket_only\""));

        std::fs::write(store.path(), b"{not json").unwrap();
        assert_eq!(store.load(), ConnectionMode::Auto);
    }
}
