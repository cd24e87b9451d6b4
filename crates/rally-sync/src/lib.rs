//! Realtime synchronization for live match scoring.
//!
//! Reads arrive over two transports: a direct socket to the scorekeeping
//! server ([`registry`], [`socket`]) and a hosted change feed ([`feed`]). The
//! [`orchestrator`] picks one per match and feeds each delivery through
//! [`reconcile`] into the caller's viewpoint. Writes go through the durable
//! [`queue`], or through [`sequential`] when the caller must wait on them.

pub mod backoff;
pub mod config;
pub mod debounce;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod liveness;
pub mod log_throttle;
pub mod orchestrator;
pub mod queue;
pub mod reconcile;
pub mod registry;
pub mod sequential;
pub mod socket;
pub mod status;

pub use config::SyncConfig;
pub use error::{RemoteError, StoreError, SyncError, SyncResult};
pub use feed::{ChangeFeedClient, FeedEvent, FeedSubscription, RealtimeFeed};
pub use fetch::{FallbackSnapshotSource, HostedClient, PinKind, ServerApi, SnapshotSource};
pub use orchestrator::{
    ActiveTransport, ConnectionMode, ConnectionStatus, LiveConnection, MatchObserver, MatchUpdate, Orchestrator,
    PreferenceStore,
};
pub use queue::{JobStore, QueueStatus, RemoteWriter, RestWriter, SqliteJobStore, SyncQueue};
pub use reconcile::{reconcile, ClientPerspectiveState, Viewpoint};
pub use registry::{ConnectionRegistry, Subscription};
pub use sequential::{PeriodClose, PipelineResult, SequentialSync, StepOutcome};
pub use status::{indicator, Indicator, StatusReport};
