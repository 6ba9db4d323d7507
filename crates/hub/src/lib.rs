//! Dashlite hub: subscription bookkeeping and event fan-out.
//!
//! Every connection owns a bounded outbound queue. The hub never awaits on a
//! connection: a full queue disconnects that subscriber instead of stalling
//! the store's mutation path.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashlite_core::{AccessFilter, ChangeEvent, EventType, Identity, ResourceKind};
use dashlite_store::{ChangeListener, Store};
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod protocol;

pub use protocol::{ClientMessage, ServerMessage};

pub type ConnId = Uuid;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum events per initial replay frame.
    pub batch_size: usize,
    /// Outbound queue length per connection.
    pub queue_capacity: usize,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            queue_capacity: 1024,
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One subscription filter; `namespace: None` means every namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
}

impl SubKey {
    pub fn new(kind: ResourceKind, namespace: Option<String>) -> Self {
        Self { kind, namespace: namespace.filter(|ns| !ns.is_empty()) }
    }

    fn matches(&self, ev: &ChangeEvent) -> bool {
        self.kind == ev.resource_kind && self.namespace.as_deref().map_or(true, |ns| ns == ev.resource.scope())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),
    #[error("connection {0} is not open")]
    NotOpen(ConnId),
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("outbound queue of {0} overflowed")]
    Overflow(ConnId),
}

/// Receiving side of a registered connection.
pub struct Connection {
    pub id: ConnId,
    pub outbound: mpsc::Receiver<ServerMessage>,
    /// Cancelled when the hub tears the connection down.
    pub cancel: CancellationToken,
}

struct Conn {
    state: ConnState,
    identity: Identity,
    subs: HashSet<SubKey>,
    tx: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
    last_ping: Instant,
    awaiting_pong: Option<Instant>,
}

enum Push {
    Sent,
    Overflow,
    Gone,
}

impl Conn {
    fn push(&self, msg: ServerMessage) -> Push {
        match self.tx.try_send(msg) {
            Ok(()) => Push::Sent,
            Err(TrySendError::Full(_)) => Push::Overflow,
            Err(TrySendError::Closed(_)) => Push::Gone,
        }
    }

    fn wants(&self, ev: &ChangeEvent, access: &dyn AccessFilter) -> bool {
        self.state == ConnState::Open
            && self.subs.iter().any(|s| s.matches(ev))
            && access.is_allowed(&self.identity, ev.resource.scope())
    }
}

pub struct Hub {
    store: Arc<Store>,
    access: Arc<dyn AccessFilter>,
    cfg: HubConfig,
    conns: Mutex<HashMap<ConnId, Conn>>,
}

/// Store listener holding the hub weakly so the two can be dropped together.
struct HubListener(Weak<Hub>);

impl ChangeListener for HubListener {
    fn on_changes(&self, events: &[ChangeEvent]) {
        if let Some(hub) = self.0.upgrade() {
            hub.publish(events);
        }
    }
}

impl Hub {
    /// Creates the hub and registers it with `store`.
    pub fn new(store: Arc<Store>, access: Arc<dyn AccessFilter>, cfg: HubConfig) -> Arc<Self> {
        let hub = Arc::new(Self { store: Arc::clone(&store), access, cfg, conns: Mutex::new(HashMap::new()) });
        store.add_listener(Arc::new(HubListener(Arc::downgrade(&hub))));
        hub
    }

    pub fn config(&self) -> &HubConfig {
        &self.cfg
    }

    /// Registers a connection in `Connecting` state.
    pub fn connect(&self, identity: Identity) -> Connection {
        let id = Uuid::new_v4();
        let (tx, outbound) = mpsc::channel(self.cfg.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let conn = Conn {
            state: ConnState::Connecting,
            identity,
            subs: HashSet::new(),
            tx,
            cancel: cancel.clone(),
            last_ping: Instant::now(),
            awaiting_pong: None,
        };
        let mut conns = self.lock();
        conns.insert(id, conn);
        gauge!("hub_connections", conns.len() as f64);
        debug!(conn = %id, "hub: connection registered");
        Connection { id, outbound, cancel }
    }

    /// `Connecting → Open`; an open connection starts with no subscriptions.
    pub fn open(&self, id: ConnId) -> Result<(), HubError> {
        let mut conns = self.lock();
        let conn = conns.get_mut(&id).ok_or(HubError::UnknownConnection(id))?;
        match conn.state {
            ConnState::Connecting => {
                conn.state = ConnState::Open;
                conn.subs.clear();
                conn.last_ping = Instant::now();
                info!(conn = %id, user = %conn.identity.username, "hub: connection open");
                Ok(())
            }
            ConnState::Open => Ok(()),
            _ => Err(HubError::NotOpen(id)),
        }
    }

    /// Tears a connection down: subscriptions are dropped and the outbound
    /// queue closed in one step with respect to fan-out.
    pub fn close(&self, id: ConnId) {
        let mut conns = self.lock();
        if let Some(conn) = conns.get_mut(&id) {
            conn.state = ConnState::Closing;
        }
        Self::teardown(&mut conns, id, "closed");
    }

    pub fn state(&self, id: ConnId) -> ConnState {
        self.lock().get(&id).map_or(ConnState::Closed, |c| c.state)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    pub fn subscriptions(&self, id: ConnId) -> Vec<SubKey> {
        let conns = self.lock();
        let set: BTreeSet<SubKey> = conns.get(&id).map(|c| c.subs.iter().cloned().collect()).unwrap_or_default();
        set.into_iter().collect()
    }

    /// Registers `(kind, namespace)` and replays every matching resource as
    /// INITIAL events before any later live event can reach the connection.
    ///
    /// Re-subscribing with the same filter replaces the subscription and
    /// replays again. Returns the number of replayed resources.
    pub fn subscribe(&self, id: ConnId, kind: ResourceKind, namespace: Option<String>) -> Result<usize, HubError> {
        let key = SubKey::new(kind, namespace);
        // The store lock is held for the whole replay so no mutation can slip
        // between the snapshot and the registration.
        self.store.read_consistent(|view| {
            let mut conns = self.lock();
            let conn = conns.get_mut(&id).ok_or(HubError::UnknownConnection(id))?;
            if conn.state != ConnState::Open {
                return Err(HubError::NotOpen(id));
            }

            let candidates = view.matching(kind, key.namespace.as_deref());
            let scopes: Vec<String> = candidates
                .iter()
                .map(|r| r.scope().to_string())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let allowed: HashSet<String> = self.access.allowed_namespaces(&conn.identity, &scopes).into_iter().collect();
            let initial: Vec<ChangeEvent> = candidates
                .into_iter()
                .filter(|r| allowed.contains(r.scope()))
                .map(|r| ChangeEvent::new(EventType::Initial, r.clone()))
                .collect();
            let count = initial.len();

            conn.subs.insert(key.clone());

            let mut frames = vec![ServerMessage::Subscribed { resource_kind: kind, namespace: key.namespace.clone() }];
            let batch = self.cfg.batch_size.max(1);
            let mut rest = initial;
            while !rest.is_empty() {
                let tail = rest.split_off(rest.len().min(batch));
                frames.push(ServerMessage::InitialBatch {
                    resource_kind: kind,
                    namespace: key.namespace.clone(),
                    events: rest,
                });
                rest = tail;
            }
            frames.push(ServerMessage::InitialStateComplete { resource_kind: kind, namespace: key.namespace.clone(), count });

            for frame in frames {
                match conn.push(frame) {
                    Push::Sent => {}
                    Push::Overflow | Push::Gone => {
                        counter!("hub_overflow_disconnects_total", 1u64);
                        Self::teardown(&mut conns, id, "overflow during replay");
                        return Err(HubError::Overflow(id));
                    }
                }
            }
            info!(conn = %id, kind = %kind, ns = ?key.namespace, count, "hub: subscribed");
            Ok(count)
        })
    }

    /// Stops delivery for `(kind, namespace)`. Unknown filters are a no-op;
    /// returns whether a subscription was removed.
    pub fn unsubscribe(&self, id: ConnId, kind: ResourceKind, namespace: Option<String>) -> Result<bool, HubError> {
        let key = SubKey::new(kind, namespace);
        let mut conns = self.lock();
        let conn = conns.get_mut(&id).ok_or(HubError::UnknownConnection(id))?;
        let removed = conn.subs.remove(&key);
        let ack = ServerMessage::Unsubscribed { resource_kind: kind, namespace: key.namespace.clone() };
        if let Push::Overflow = conn.push(ack) {
            counter!("hub_overflow_disconnects_total", 1u64);
            Self::teardown(&mut conns, id, "overflow");
            return Err(HubError::Overflow(id));
        }
        if removed {
            debug!(conn = %id, kind = %kind, ns = ?key.namespace, "hub: unsubscribed");
        }
        Ok(removed)
    }

    /// Handles one inbound text frame. Protocol errors are answered with an
    /// `error` frame and returned.
    pub fn handle_text(&self, id: ConnId, text: &str) -> Result<(), HubError> {
        let result = match ClientMessage::parse(text) {
            Ok(msg) => self.handle(id, msg),
            Err(e) => Err(HubError::Malformed(e.to_string())),
        };
        if let Err(e @ (HubError::Malformed(_) | HubError::UnknownKind(_) | HubError::NotOpen(_))) = &result {
            debug!(conn = %id, error = %e, "hub: rejected client message");
            self.send(id, ServerMessage::Error { message: e.to_string() });
        }
        result
    }

    pub fn handle(&self, id: ConnId, msg: ClientMessage) -> Result<(), HubError> {
        self.touch(id);
        match msg {
            ClientMessage::Subscribe { resource_kind, namespace } => {
                let kind = parse_kind(&resource_kind)?;
                self.subscribe(id, kind, namespace).map(|_| ())
            }
            ClientMessage::Unsubscribe { resource_kind, namespace } => {
                let kind = parse_kind(&resource_kind)?;
                self.unsubscribe(id, kind, namespace).map(|_| ())
            }
            ClientMessage::Ping => {
                self.send(id, ServerMessage::Pong);
                Ok(())
            }
            ClientMessage::Pong => Ok(()),
        }
    }

    /// Records liveness for `id` (any inbound frame counts as a pong).
    pub fn touch(&self, id: ConnId) {
        if let Some(conn) = self.lock().get_mut(&id) {
            conn.awaiting_pong = None;
        }
    }

    /// Fans `events` out to every open connection with a matching
    /// subscription the identity may see. Each event reaches a connection at
    /// most once even when several of its filters match.
    pub fn publish(&self, events: &[ChangeEvent]) {
        let mut conns = self.lock();
        let mut dead: Vec<(ConnId, &'static str)> = Vec::new();
        for (id, conn) in conns.iter() {
            for ev in events {
                if !conn.wants(ev, self.access.as_ref()) {
                    continue;
                }
                match conn.push(ServerMessage::Event { event: ev.clone() }) {
                    Push::Sent => {
                        counter!("hub_events_sent_total", 1u64);
                    }
                    Push::Overflow => {
                        counter!("hub_overflow_disconnects_total", 1u64);
                        dead.push((*id, "outbound queue overflow"));
                        break;
                    }
                    Push::Gone => {
                        dead.push((*id, "receiver dropped"));
                        break;
                    }
                }
            }
        }
        for (id, reason) in dead {
            Self::teardown(&mut conns, id, reason);
        }
    }

    /// Sends pings and reaps connections that left one unanswered for longer
    /// than `ping_timeout`. Runs until `shutdown` is cancelled.
    pub fn spawn_keepalive(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let tick = hub.cfg.ping_interval.min(hub.cfg.ping_timeout).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => hub.keepalive_pass(),
                }
            }
            debug!("hub: keepalive stopped");
        })
    }

    fn keepalive_pass(&self) {
        let now = Instant::now();
        let mut conns = self.lock();
        let mut dead = Vec::new();
        for (id, conn) in conns.iter_mut() {
            if conn.state != ConnState::Open {
                continue;
            }
            match conn.awaiting_pong {
                Some(sent) if now.duration_since(sent) >= self.cfg.ping_timeout => dead.push((*id, "ping timeout")),
                Some(_) => {}
                None if now.duration_since(conn.last_ping) >= self.cfg.ping_interval => match conn.push(ServerMessage::Ping) {
                    Push::Sent => {
                        conn.last_ping = now;
                        conn.awaiting_pong = Some(now);
                    }
                    Push::Overflow => dead.push((*id, "outbound queue overflow")),
                    Push::Gone => dead.push((*id, "receiver dropped")),
                },
                None => {}
            }
        }
        for (id, reason) in dead {
            Self::teardown(&mut conns, id, reason);
        }
    }

    /// Closes every connection.
    pub fn shutdown(&self) {
        let mut conns = self.lock();
        let ids: Vec<ConnId> = conns.keys().copied().collect();
        for id in ids {
            Self::teardown(&mut conns, id, "shutdown");
        }
    }

    fn send(&self, id: ConnId, msg: ServerMessage) {
        let mut conns = self.lock();
        let overflow = match conns.get(&id) {
            Some(conn) => matches!(conn.push(msg), Push::Overflow),
            None => false,
        };
        if overflow {
            counter!("hub_overflow_disconnects_total", 1u64);
            Self::teardown(&mut conns, id, "outbound queue overflow");
        }
    }

    fn teardown(conns: &mut HashMap<ConnId, Conn>, id: ConnId, reason: &str) {
        if let Some(mut conn) = conns.remove(&id) {
            conn.state = ConnState::Closed;
            conn.subs.clear();
            conn.cancel.cancel();
            if reason == "closed" {
                info!(conn = %id, "hub: connection closed");
            } else {
                warn!(conn = %id, reason, "hub: connection dropped");
            }
        }
        gauge!("hub_connections", conns.len() as f64);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnId, Conn>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_kind(raw: &str) -> Result<ResourceKind, HubError> {
    raw.parse().map_err(|_| HubError::UnknownKind(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_namespace_filter_means_all() {
        assert_eq!(SubKey::new(ResourceKind::Pod, Some(String::new())).namespace, None);
        assert_eq!(SubKey::new(ResourceKind::Pod, Some("ns".into())).namespace.as_deref(), Some("ns"));
    }

    #[test]
    fn kind_parsing_reports_raw_value() {
        assert_eq!(parse_kind("pods"), Ok(ResourceKind::Pod));
        assert_eq!(parse_kind("Service"), Err(HubError::UnknownKind("Service".into())));
    }
}
