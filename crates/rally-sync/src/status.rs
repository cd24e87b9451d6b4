//! Aggregate indicator and the diagnostics report behind it.

use rally_proto::MatchId;
use serde::Serialize;

use crate::error::SyncResult;
use crate::orchestrator::{ActiveTransport, ConnectionMode, ConnectionStatus, LiveConnection};
use crate::queue::{JobCounts, QueueStatus, SyncQueue};
use crate::registry::{ConnectionDiagnostics, ConnectionRegistry};

/// The single persistent indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Indicator {
    Connected,
    Syncing,
    AwaitingMatch,
    Error,
}

impl Indicator {
    pub fn as_str(self) -> &'static str {
        match self {
            Indicator::Connected => "connected",
            Indicator::Syncing => "syncing",
            Indicator::AwaitingMatch => "awaiting-match",
            Indicator::Error => "error",
        }
    }
}

/// Errored jobs win over everything; without a match there is nothing to
/// be connected to.
pub fn indicator(connection: ConnectionStatus, queue: QueueStatus, has_match: bool) -> Indicator {
    if queue == QueueStatus::Error {
        return Indicator::Error;
    }
    if !has_match {
        return Indicator::AwaitingMatch;
    }
    match connection {
        ConnectionStatus::Error | ConnectionStatus::Disconnected => Indicator::Error,
        ConnectionStatus::Connecting => Indicator::Syncing,
        ConnectionStatus::Connected | ConnectionStatus::Fallback => match queue {
            QueueStatus::Synced => Indicator::Connected,
            QueueStatus::Syncing | QueueStatus::Offline | QueueStatus::Error => Indicator::Syncing,
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub match_id: MatchId,
    pub mode: ConnectionMode,
    pub status: ConnectionStatus,
    pub transport: Option<ActiveTransport>,
    pub socket: Option<ConnectionDiagnostics>,
}

/// Everything the expandable status panel shows.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub indicator: Indicator,
    pub queue: QueueStatus,
    pub jobs: JobCounts,
    pub connection: Option<ConnectionReport>,
    pub sockets: Vec<ConnectionDiagnostics>,
}

pub async fn report(
    connection: Option<&LiveConnection>,
    queue: &SyncQueue,
    registry: Option<&ConnectionRegistry>,
) -> SyncResult<StatusReport> {
    let jobs = queue.counts().await?;
    let queue_status = if jobs.error > 0 { QueueStatus::Error } else { queue.status() };
    let connection = connection.map(|live| ConnectionReport {
        match_id: live.match_id().clone(),
        mode: live.mode(),
        status: live.status(),
        transport: live.active_transport(),
        socket: registry.and_then(|r| r.diagnostics(live.match_id())),
    });
    let indicator = indicator(
        connection
            .as_ref()
            .map_or(ConnectionStatus::Disconnected, |c| c.status),
        queue_status,
        connection.is_some(),
    );
    Ok(StatusReport {
        indicator,
        queue: queue_status,
        jobs,
        connection,
        sockets: registry.map(ConnectionRegistry::all_diagnostics).unwrap_or_default(),
    })
}
