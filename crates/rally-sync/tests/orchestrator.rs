//! Transport selection end to end over in-memory socket and feed transports.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rally_proto::feed::{ChangeKind, ChannelStatus, FeedTable};
use rally_proto::{MatchActionFrame, MatchId, MatchPayload, RowChange, CLOSE_FORCE_RECONNECT};
use rally_sync::feed::{FeedSignal, ManualChannel, ManualFeed};
use rally_sync::socket::{MemoryDialer, ServerSocket, SocketSettings};
use rally_sync::{
    ActiveTransport, ChangeFeedClient, ConnectionMode, ConnectionRegistry, ConnectionStatus, MatchObserver,
    MatchUpdate, Orchestrator, PreferenceStore, SnapshotSource, SyncResult, Viewpoint,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

#[derive(Debug)]
enum Seen {
    Status(ConnectionStatus),
    Update(ActiveTransport, u32, u32),
    Action(String),
    Deleted,
}

struct Recorder(mpsc::UnboundedSender<Seen>);

impl MatchObserver for Recorder {
    fn on_update(&self, update: MatchUpdate) {
        let _ = self.0.send(Seen::Update(
            update.source,
            update.view.primary.tally.points,
            update.view.secondary.tally.points,
        ));
    }

    fn on_action(&self, action: MatchActionFrame) {
        let _ = self.0.send(Seen::Action(action.action));
    }

    fn on_deleted(&self) {
        let _ = self.0.send(Seen::Deleted);
    }

    fn on_status(&self, status: ConnectionStatus) {
        let _ = self.0.send(Seen::Status(status));
    }
}

struct StaticSource;

#[async_trait]
impl SnapshotSource for StaticSource {
    async fn fetch(&self, match_id: &MatchId) -> SyncResult<MatchPayload> {
        Ok(MatchPayload {
            match_id: Some(match_id.clone()),
            ..MatchPayload::default()
        })
    }
}

struct Rig {
    orchestrator: Orchestrator,
    feed: Arc<ManualFeed>,
    channels: mpsc::UnboundedReceiver<ManualChannel>,
    servers: mpsc::UnboundedReceiver<ServerSocket>,
    dialer: Arc<MemoryDialer>,
}

fn rig() -> Rig {
    let settings = SocketSettings {
        url: Url::parse("ws://127.0.0.1:8080").unwrap(),
        ping_interval: Duration::from_secs(25),
        reconnect_base: Duration::from_secs(3),
        reconnect_max: Duration::from_secs(10),
        force_reconnect_delay: Duration::from_millis(100),
    };
    let (dialer, servers) = MemoryDialer::new();
    let registry = ConnectionRegistry::new(settings, dialer.clone());
    let (feed, channels) = ManualFeed::new(Some("row-1"));
    let client = ChangeFeedClient::new(feed.clone(), Arc::new(StaticSource), Duration::from_millis(150));
    Rig {
        orchestrator: Orchestrator::new(registry, Some(client)),
        feed,
        channels,
        servers,
        dialer,
    }
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder(tx)), rx)
}

async fn wait_status(rx: &mut mpsc::UnboundedReceiver<Seen>, want: ConnectionStatus) -> Vec<ConnectionStatus> {
    let mut seen = Vec::new();
    loop {
        if let Seen::Status(status) = rx.recv().await.unwrap() {
            seen.push(status);
            if status == want {
                return seen;
            }
        }
    }
}

async fn next_update(rx: &mut mpsc::UnboundedReceiver<Seen>) -> (ActiveTransport, u32, u32) {
    loop {
        if let Seen::Update(source, a, b) = rx.recv().await.unwrap() {
            return (source, a, b);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn auto_prefers_the_feed() {
    let mut rig = rig();
    let (observer, mut seen) = recorder();
    let live = rig
        .orchestrator
        .connect(MatchId::new("M1"), ConnectionMode::Auto, Viewpoint::HomeAway, observer);

    let channel = rig.channels.recv().await.unwrap();
    assert!(channel.topic.starts_with("realtime:match-M1-"));
    channel
        .signals
        .send(FeedSignal::Status(ChannelStatus::Subscribed))
        .unwrap();
    wait_status(&mut seen, ConnectionStatus::Connected).await;
    assert_eq!(live.active_transport(), Some(ActiveTransport::Feed));
    assert_eq!(next_update(&mut seen).await.0, ActiveTransport::Feed);
    assert_eq!(rig.dialer.dial_count(), 0);

    // Transient provider errors are only logged.
    channel
        .signals
        .send(FeedSignal::Status(ChannelStatus::ChannelError("blip".into())))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(live.status(), ConnectionStatus::Connected);

    channel
        .signals
        .send(FeedSignal::Change(RowChange {
            kind: ChangeKind::Delete,
            table: Some(FeedTable::Matches),
            new: json!({}),
            old: json!({"external_id": "M1"}),
        }))
        .unwrap();
    loop {
        if let Seen::Deleted = seen.recv().await.unwrap() {
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn auto_falls_back_to_the_socket() {
    let mut rig = rig();
    rig.feed.set_reachable(false);
    let (observer, mut seen) = recorder();
    let live = rig
        .orchestrator
        .connect(MatchId::new("M1"), ConnectionMode::Auto, Viewpoint::LeftRight, observer);

    wait_status(&mut seen, ConnectionStatus::Fallback).await;
    assert_eq!(live.active_transport(), Some(ActiveTransport::Socket));

    let mut server = rig.servers.recv().await.unwrap();
    server
        .send(Message::Text(
            json!({
                "type": "match-data-update",
                "matchId": "M1",
                "sets": [{"index": 1, "homePoints": 10, "awayPoints": 8}]
            })
            .to_string(),
        ))
        .await
        .unwrap();
    let (source, _, _) = next_update(&mut seen).await;
    assert_eq!(source, ActiveTransport::Socket);

    server
        .send(Message::Text(
            json!({
                "type": "match-action",
                "matchId": "M1",
                "action": "timeout",
                "data": {"team": "home", "countdown": 30, "startTimestamp": 1}
            })
            .to_string(),
        ))
        .await
        .unwrap();
    loop {
        if let Seen::Action(name) = seen.recv().await.unwrap() {
            assert_eq!(name, "timeout");
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn forced_reconnect_never_reports_error() {
    let mut rig = rig();
    let (observer, mut seen) = recorder();
    let live = rig
        .orchestrator
        .connect(MatchId::new("M1"), ConnectionMode::SocketOnly, Viewpoint::HomeAway, observer);
    wait_status(&mut seen, ConnectionStatus::Connected).await;
    let mut first = rig.servers.recv().await.unwrap();

    live.reconnect();
    loop {
        match first.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), CLOSE_FORCE_RECONNECT);
                break;
            }
            Some(Ok(_)) => continue,
            other => panic!("expected force-reconnect close, got {other:?}"),
        }
    }
    let statuses = wait_status(&mut seen, ConnectionStatus::Connected).await;
    assert_eq!(statuses, [ConnectionStatus::Connecting, ConnectionStatus::Connected]);
    assert!(rig.servers.recv().await.is_some());
    assert_eq!(rig.dialer.dial_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn fallback_reconnect_bounces_the_socket_in_place() {
    let mut rig = rig();
    rig.feed.set_reachable(false);
    let (observer, mut seen) = recorder();
    let live = rig
        .orchestrator
        .connect(MatchId::new("M1"), ConnectionMode::Auto, Viewpoint::HomeAway, observer);
    wait_status(&mut seen, ConnectionStatus::Fallback).await;
    let mut first = rig.servers.recv().await.unwrap();

    live.reconnect();
    loop {
        match first.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), CLOSE_FORCE_RECONNECT);
                break;
            }
            Some(Ok(_)) => continue,
            other => panic!("expected force-reconnect close, got {other:?}"),
        }
    }
    let statuses = wait_status(&mut seen, ConnectionStatus::Fallback).await;
    assert_eq!(statuses, [ConnectionStatus::Connecting, ConnectionStatus::Fallback]);
    assert_eq!(live.mode(), ConnectionMode::Auto);
    assert_eq!(live.active_transport(), Some(ActiveTransport::Socket));
    assert!(rig.servers.recv().await.is_some());
    assert_eq!(rig.dialer.dial_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn mode_switch_persists_and_swaps_transport() {
    let mut rig = rig();
    let dir = tempfile::tempdir().unwrap();
    let prefs = PreferenceStore::new(dir.path().join("preferences.json"));
    let orchestrator = rig.orchestrator.clone().with_preferences(prefs.clone());
    assert_eq!(orchestrator.preferred_mode(), ConnectionMode::Auto);

    let (observer, mut seen) = recorder();
    let live = orchestrator.connect(MatchId::new("M7"), ConnectionMode::FeedOnly, Viewpoint::HomeAway, observer);
    let mut channel = rig.channels.recv().await.unwrap();
    channel
        .signals
        .send(FeedSignal::Status(ChannelStatus::Subscribed))
        .unwrap();
    wait_status(&mut seen, ConnectionStatus::Connected).await;

    live.set_mode(ConnectionMode::SocketOnly).unwrap();
    assert_eq!(prefs.load(), ConnectionMode::SocketOnly);
    assert_eq!(orchestrator.preferred_mode(), ConnectionMode::SocketOnly);
    wait_status(&mut seen, ConnectionStatus::Connected).await;
    assert_eq!(live.active_transport(), Some(ActiveTransport::Socket));
    assert!(channel.closed.recv().await.is_some());

    live.close();
    live.close();
    assert_eq!(live.status(), ConnectionStatus::Disconnected);
    assert_eq!(live.active_transport(), None);
    rig.orchestrator.registry().settle().await;
    assert_eq!(rig.orchestrator.registry().open_socket_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn feed_only_without_feed_is_an_error() {
    let (dialer, _servers) = MemoryDialer::new();
    let settings = SocketSettings {
        url: Url::parse("ws://127.0.0.1:8080").unwrap(),
        ping_interval: Duration::from_secs(25),
        reconnect_base: Duration::from_secs(3),
        reconnect_max: Duration::from_secs(10),
        force_reconnect_delay: Duration::from_millis(100),
    };
    let orchestrator = Orchestrator::new(ConnectionRegistry::new(settings, dialer.clone()), None);
    let (observer, _seen) = recorder();
    let live = orchestrator.connect(MatchId::new("M1"), ConnectionMode::FeedOnly, Viewpoint::HomeAway, observer);
    assert_eq!(live.status(), ConnectionStatus::Error);
    assert_eq!(live.active_transport(), None);
    assert_eq!(dialer.dial_count(), 0);
}
