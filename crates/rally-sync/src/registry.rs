//! Reference-counted socket multiplexing.
//!
//! Every match has at most one physical socket no matter how many views
//! subscribe to it. The first `acquire` opens it, later ones join it, and
//! releasing the last subscriber closes it with the normal close code and
//! drops the entry. Events from a driver are tagged with the generation of
//! the entry that spawned it, so a driver that is still winding down after
//! its entry was removed can never reach the next entry's subscribers.

use parking_lot::Mutex;
use rally_proto::{ClientFrame, MatchId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::socket::{spawn_socket, Dialer, EventSink, LinkState, SocketDiagnostics, SocketEvent, SocketHandle, SocketSettings};

pub type SubscriberCallback = Arc<dyn Fn(&SocketEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolStatus {
    Created,
    Joined(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Released {
    Emptied,
    Remaining(usize),
    Unknown,
}

/// Subscriber sets keyed by match.
#[derive(Debug)]
pub struct SubscriberPool<C> {
    entries: HashMap<MatchId, Vec<(u64, C)>>,
    next_id: u64,
}

impl<C> Default for SubscriberPool<C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<C: Clone> SubscriberPool<C> {
    pub fn add(&mut self, match_id: &MatchId, callback: C) -> (u64, PoolStatus) {
        self.next_id += 1;
        let id = self.next_id;
        let subscribers = self.entries.entry(match_id.clone()).or_default();
        subscribers.push((id, callback));
        let status = if subscribers.len() == 1 {
            PoolStatus::Created
        } else {
            PoolStatus::Joined(subscribers.len())
        };
        (id, status)
    }

    pub fn remove(&mut self, match_id: &MatchId, id: u64) -> Released {
        let Some(subscribers) = self.entries.get_mut(match_id) else {
            return Released::Unknown;
        };
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        if subscribers.len() == before {
            return Released::Unknown;
        }
        if subscribers.is_empty() {
            self.entries.remove(match_id);
            Released::Emptied
        } else {
            Released::Remaining(subscribers.len())
        }
    }

    pub fn subscribers(&self, match_id: &MatchId) -> Vec<C> {
        self.entries
            .get(match_id)
            .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, match_id: &MatchId) -> usize {
        self.entries.get(match_id).map(Vec::len).unwrap_or(0)
    }

    pub fn match_count(&self) -> usize {
        self.entries.len()
    }
}

struct Connection {
    generation: u64,
    handle: SocketHandle,
    diagnostics: Arc<Mutex<SocketDiagnostics>>,
    last_state: LinkState,
}

/// A released connection whose driver is still closing.
struct Retiring {
    task: JoinHandle<()>,
    diagnostics: Arc<Mutex<SocketDiagnostics>>,
}

#[derive(Default)]
struct RegistryState {
    pool: SubscriberPool<SubscriberCallback>,
    connections: HashMap<MatchId, Connection>,
    retiring: HashMap<MatchId, Retiring>,
    next_generation: u64,
}

struct RegistryInner {
    dialer: Arc<dyn Dialer>,
    settings: SocketSettings,
    state: Mutex<RegistryState>,
}

/// Per-match view for the diagnostics panel.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionDiagnostics {
    pub match_id: MatchId,
    pub state: LinkState,
    pub subscribers: usize,
    #[serde(flatten)]
    pub socket: SocketDiagnostics,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(settings: SocketSettings, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                dialer,
                settings,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Registers `on_update` for `match_id`, opening the socket if this is
    /// the first subscriber.
    pub fn acquire(&self, match_id: MatchId, on_update: impl Fn(&SocketEvent) + Send + Sync + 'static) -> Subscription {
        let callback: SubscriberCallback = Arc::new(on_update);
        let (id, replay) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.retiring.retain(|_, retiring| !retiring.task.is_finished());

            let (id, status) = state.pool.add(&match_id, Arc::clone(&callback));
            let replay = match status {
                PoolStatus::Created => {
                    state.next_generation += 1;
                    let generation = state.next_generation;
                    let predecessor = state.retiring.remove(&match_id).map(|retiring| retiring.task);
                    let diagnostics = Arc::new(Mutex::new(SocketDiagnostics::default()));
                    let handle = self.spawn_driver(&match_id, generation, Arc::clone(&diagnostics), predecessor);
                    info!(target = "rally.registry", match_id = %match_id, generation, "opening match connection");
                    state.connections.insert(
                        match_id.clone(),
                        Connection {
                            generation,
                            handle,
                            diagnostics,
                            last_state: LinkState::Connecting,
                        },
                    );
                    None
                }
                PoolStatus::Joined(count) => {
                    debug!(target = "rally.registry", match_id = %match_id, subscribers = count, "joining match connection");
                    state.connections.get(&match_id).map(|conn| {
                        if conn.last_state == LinkState::Connected {
                            // Ask for a fresh full state for the newcomer.
                            conn.handle.send(ClientFrame::subscribe(&match_id));
                        }
                        conn.last_state
                    })
                }
            };
            (id, replay)
        };

        if let Some(state) = replay {
            callback(&SocketEvent::State(state));
        }
        Subscription {
            registry: Arc::downgrade(&self.inner),
            match_id,
            id,
            released: AtomicBool::new(false),
        }
    }

    /// Bounces the socket for `match_id` without touching its subscribers.
    pub fn force_reconnect(&self, match_id: &MatchId) -> bool {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let Some(conn) = state.connections.get_mut(match_id) else {
            return false;
        };
        info!(target = "rally.registry", match_id = %match_id, "forcing reconnect");
        if conn.handle.force_reconnect() {
            return true;
        }

        // The driver already stopped after a normal close from the server.
        state.next_generation += 1;
        conn.generation = state.next_generation;
        conn.last_state = LinkState::Connecting;
        conn.handle = self.spawn_driver(match_id, conn.generation, Arc::clone(&conn.diagnostics), None);
        true
    }

    fn spawn_driver(
        &self,
        match_id: &MatchId,
        generation: u64,
        diagnostics: Arc<Mutex<SocketDiagnostics>>,
        predecessor: Option<JoinHandle<()>>,
    ) -> SocketHandle {
        spawn_socket(
            match_id.clone(),
            self.inner.settings.clone(),
            Arc::clone(&self.inner.dialer),
            event_sink(Arc::downgrade(&self.inner), match_id.clone(), generation),
            diagnostics,
            predecessor,
        )
    }

    pub fn open_socket_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    pub fn has_entry(&self, match_id: &MatchId) -> bool {
        self.inner.state.lock().connections.contains_key(match_id)
    }

    pub fn subscriber_count(&self, match_id: &MatchId) -> usize {
        self.inner.state.lock().pool.count(match_id)
    }

    pub fn link_state(&self, match_id: &MatchId) -> Option<LinkState> {
        self.inner.state.lock().connections.get(match_id).map(|c| c.last_state)
    }

    /// Live connections first; a released one stays visible until it is
    /// settled or replaced.
    pub fn diagnostics(&self, match_id: &MatchId) -> Option<ConnectionDiagnostics> {
        let state = self.inner.state.lock();
        if let Some(conn) = state.connections.get(match_id) {
            return Some(ConnectionDiagnostics {
                match_id: match_id.clone(),
                state: conn.last_state,
                subscribers: state.pool.count(match_id),
                socket: conn.diagnostics.lock().clone(),
            });
        }
        let retiring = state.retiring.get(match_id)?;
        let socket = retiring.diagnostics.lock().clone();
        Some(ConnectionDiagnostics {
            match_id: match_id.clone(),
            state: LinkState::Closed,
            subscribers: 0,
            socket,
        })
    }

    pub fn all_diagnostics(&self) -> Vec<ConnectionDiagnostics> {
        let ids: Vec<MatchId> = {
            let state = self.inner.state.lock();
            let mut ids: Vec<MatchId> = state.connections.keys().chain(state.retiring.keys()).cloned().collect();
            ids.sort();
            ids.dedup();
            ids
        };
        ids.iter().filter_map(|id| self.diagnostics(id)).collect()
    }

    /// Waits until every released socket has finished closing.
    pub async fn settle(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut state = self.inner.state.lock();
            state.retiring.drain().map(|(_, retiring)| retiring.task).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl RegistryInner {
    fn release(&self, match_id: &MatchId, id: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.pool.remove(match_id, id) {
            Released::Emptied => {
                if let Some(conn) = state.connections.remove(match_id) {
                    info!(target = "rally.registry", match_id = %match_id, generation = conn.generation, "last subscriber left, closing");
                    conn.diagnostics.lock().intentionally_closed = true;
                    let task = conn.handle.close();
                    state.retiring.insert(
                        match_id.clone(),
                        Retiring {
                            task,
                            diagnostics: conn.diagnostics,
                        },
                    );
                }
            }
            Released::Remaining(count) => {
                debug!(target = "rally.registry", match_id = %match_id, subscribers = count, "subscriber left");
            }
            Released::Unknown => {}
        }
    }
}

fn event_sink(registry: Weak<RegistryInner>, match_id: MatchId, generation: u64) -> EventSink {
    Arc::new(move |event: SocketEvent| {
        let Some(inner) = registry.upgrade() else {
            return;
        };
        let callbacks = {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            match state.connections.get_mut(&match_id) {
                Some(conn) if conn.generation == generation => {
                    if let SocketEvent::State(link) = &event {
                        conn.last_state = *link;
                    }
                    state.pool.subscribers(&match_id)
                }
                _ => {
                    debug!(target = "rally.registry", match_id = %match_id, generation, "dropping event from retired connection");
                    return;
                }
            }
        };
        for callback in callbacks {
            callback(&event);
        }
    })
}

/// Handle returned by [`ConnectionRegistry::acquire`]. Unsubscribes on drop;
/// [`Subscription::unsubscribe`] may be called any number of times.
pub struct Subscription {
    registry: Weak<RegistryInner>,
    match_id: MatchId,
    id: u64,
    released: AtomicBool,
}

impl Subscription {
    pub fn match_id(&self) -> &MatchId {
        &self.match_id
    }

    pub fn is_active(&self) -> bool {
        !self.released.load(Ordering::SeqCst)
    }

    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.registry.upgrade() {
            inner.release(&self.match_id, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
