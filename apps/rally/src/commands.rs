use anyhow::{bail, Context};
use rally_proto::{MatchActionFrame, MatchId, NewJob};
use rally_sync::queue::{QueueSettings, QueueStatus, RemoteWriter};
use rally_sync::{
    status, ConnectionStatus, HostedClient, JobStore, MatchObserver, MatchUpdate, Orchestrator, PeriodClose,
    RestWriter, SequentialSync, ServerApi, SqliteJobStore, SyncConfig, SyncQueue,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::cli::{ClosePeriodArgs, EnqueueArgs, PinArgs, QueueCommand, WatchArgs};

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn parse_json(raw: &str, what: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{what} is not valid JSON"))
}

async fn open_queue(cfg: &SyncConfig) -> anyhow::Result<SyncQueue> {
    let path = cfg.job_store_path();
    let store = SqliteJobStore::open(&path)
        .await
        .with_context(|| format!("opening job store at {}", path.display()))?;
    let writer = HostedClient::from_config(cfg).map(|client| Arc::new(RestWriter::new(client)) as Arc<dyn RemoteWriter>);
    if writer.is_none() {
        warn!("hosted service not configured; jobs will only accumulate locally");
    }
    Ok(SyncQueue::new(Arc::new(store), writer, QueueSettings::from_config(cfg)))
}

/// Prints every delivery as one JSON line.
struct PrintObserver {
    deleted: Arc<Notify>,
}

impl MatchObserver for PrintObserver {
    fn on_update(&self, update: MatchUpdate) {
        let line = json!({
            "kind": "update",
            "source": update.source,
            "timestamp": update.payload.timestamp,
            "view": update.view,
        });
        println!("{line}");
    }

    fn on_action(&self, action: MatchActionFrame) {
        println!("{}", json!({"kind": "action", "action": action}));
    }

    fn on_deleted(&self) {
        println!("{}", json!({"kind": "deleted"}));
        self.deleted.notify_one();
    }

    fn on_status(&self, status: ConnectionStatus) {
        println!("{}", json!({"kind": "status", "status": status}));
    }
}

pub async fn watch(cfg: &SyncConfig, args: WatchArgs) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(cfg)?;
    let mode = args.mode.unwrap_or_else(|| orchestrator.preferred_mode());
    let deleted = Arc::new(Notify::new());
    let observer = Arc::new(PrintObserver {
        deleted: Arc::clone(&deleted),
    });
    let live = orchestrator.connect(MatchId::new(args.match_id), mode, args.view.viewpoint(), observer);
    if args.remember {
        live.set_mode(mode)?;
    }

    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = deleted.notified() => info!(match_id = %live.match_id(), "match deleted; stopping"),
    }
    live.close();
    orchestrator.registry().settle().await;
    Ok(())
}

pub async fn queue(cfg: &SyncConfig, command: QueueCommand) -> anyhow::Result<()> {
    let queue = open_queue(cfg).await?;
    match command {
        QueueCommand::Status => print_json(&status::report(None, &queue, None).await?),
        QueueCommand::List { status } => {
            for job in queue.store().list(status).await? {
                print_json(&job)?;
            }
            Ok(())
        }
        QueueCommand::Retry => {
            let reset = queue.retry_all().await?;
            print_json(&json!({"reset": reset, "jobs": queue.counts().await?, "status": queue.status()}))
        }
        QueueCommand::Drain { once } => {
            if queue.writer().is_none() {
                bail!("hosted service is not configured; set RALLY_FEED_REST_URL");
            }
            if once {
                let report = queue.drain_once().await?;
                return print_json(&json!({"report": report, "jobs": queue.counts().await?, "status": queue.status()}));
            }
            let mut status = queue.watch_status();
            let _worker = queue.spawn_worker();
            tokio::select! {
                res = tokio::signal::ctrl_c() => res?,
                res = status.wait_for(|s| matches!(s, QueueStatus::Synced | QueueStatus::Error)) => {
                    res.context("queue worker stopped")?;
                }
            }
            print_json(&json!({"jobs": queue.counts().await?, "status": queue.status()}))
        }
    }
}

pub async fn enqueue(cfg: &SyncConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let queue = open_queue(cfg).await?;
    let payload = parse_json(&args.payload, "payload")?;
    let job = queue.enqueue(NewJob::new(args.resource, args.action, payload)).await?;
    print_json(&job)
}

pub async fn close_period(cfg: &SyncConfig, args: ClosePeriodArgs) -> anyhow::Result<()> {
    let close = PeriodClose {
        last_point: args.last_point.as_deref().map(|raw| parse_json(raw, "last point")).transpose()?,
        period: parse_json(&args.period, "period")?,
        match_update: args.match_update.as_deref().map(|raw| parse_json(raw, "match update")).transpose()?,
    };
    let queue = open_queue(cfg).await?;
    let sync = SequentialSync::for_queue(&queue, cfg.step_timeout());

    let mut progress = sync.watch_progress();
    let printer = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let line = progress
                .borrow_and_update()
                .iter()
                .map(|step| match &step.detail {
                    Some(detail) => format!("{:?}={:?} ({detail})", step.id, step.state),
                    None => format!("{:?}={:?}", step.id, step.state),
                })
                .collect::<Vec<_>>()
                .join(" ");
            eprintln!("{line}");
        }
    });

    let result = sync.sync_period_end(close).await?;
    drop(sync);
    let _ = printer.await;
    print_json(&result)?;
    if !result.success {
        bail!("period close failed; see the error above");
    }
    if result.has_warning {
        warn!("some steps stayed queued; they will sync once the remote is reachable");
    }
    Ok(())
}

pub async fn pin(cfg: &SyncConfig, args: PinArgs) -> anyhow::Result<()> {
    let api = ServerApi::from_config(cfg);
    let result = api.validate_pin(&args.pin, args.kind.into()).await?;
    print_json(&result)?;
    if !result.success {
        bail!(result.error.unwrap_or_else(|| "pin rejected".to_string()));
    }
    Ok(())
}

pub async fn matches(cfg: &SyncConfig) -> anyhow::Result<()> {
    let listing = ServerApi::from_config(cfg).list_matches().await?;
    print_json(&listing)
}
