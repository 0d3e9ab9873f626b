//! Broker core
//!
//! Owns the session registry, the subscription index, and everything that
//! must mutate together. The routing state sits behind one mutex: any
//! operation spanning the registry, the index, and a session's queues runs
//! as a single critical section, which is what keeps the index and the
//! per-session subscription maps in lockstep. Nothing suspends while the
//! lock is held; queue writes are non-blocking sends.
//!
//! Connection workers stay outside this crate. They call
//! [`Broker::register_client`], feed inbound packets through
//! [`Broker::dispatch`], drain the outbound receiver, and call
//! [`Broker::unregister_client`] on the way out.

mod dispatch;
mod publish;
mod sys_topics;

pub use dispatch::DispatchError;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::acl::{AuthError, Authorizer};
use crate::config::Config;
use crate::persistence::{
    unix_secs_to_system_time, LoadedData, PersistenceHandle, PersistenceOp, StoredSession,
};
use crate::protocol::{Connect, Packet, Publish, SubscriptionOptions};
use crate::retained::RetainedStore;
use crate::schedule::QueueRunner;
use crate::session::{
    ConnectedClient, Session, SessionId, SessionStats, WorkerHandle,
};
use crate::stats::Stats;
use crate::topic::TopicTrie;

/// Knobs the core consumes, extracted from [`Config`]
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Grace window when Connect carried no Session-Expiry-Interval
    pub session_expiry_default: Duration,
    /// Per-session outbound packet queue bound
    pub queue_bound: usize,
    /// Per-session backlog bound
    pub backlog_bound: usize,
    /// `$SYS` publish interval
    pub sys_interval: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            session_expiry_default: Duration::from_secs(300),
            queue_bound: 1000,
            backlog_bound: 1000,
            sys_interval: Duration::from_secs(15),
        }
    }
}

impl From<&Config> for BrokerOptions {
    fn from(config: &Config) -> Self {
        Self {
            session_expiry_default: config.session.expiry_default,
            queue_bound: config.session.queue_bound,
            backlog_bound: config.session.backlog_bound,
            sys_interval: config.sys.interval,
        }
    }
}

/// Why a Connect was rejected
#[derive(Debug)]
pub enum ConnectError {
    /// Empty client identifier
    MissingClientId,
    /// Receive-Maximum of zero is a protocol error
    ReceiveMaximumZero,
    /// Credentials refused by the authorizer
    Refused(AuthError),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingClientId => write!(f, "client identifier must not be empty"),
            Self::ReceiveMaximumZero => write!(f, "Receive-Maximum must not be zero"),
            Self::Refused(e) => write!(f, "connection refused: {}", e),
        }
    }
}

impl std::error::Error for ConnectError {}

impl From<AuthError> for ConnectError {
    fn from(e: AuthError) -> Self {
        ConnectError::Refused(e)
    }
}

/// What a successful register hands back to the connection worker
#[derive(Debug)]
pub struct Registration {
    /// Monotonic connection id, quoted back on unregister
    pub client_uid: u64,
    /// True when a prior session was resumed
    pub session_present: bool,
    /// The session's outbound queue; the connection writer drains this
    pub outbound: mpsc::Receiver<Packet>,
}

/// Everything that mutates together under the routing lock
pub(crate) struct CoreState {
    pub(crate) sessions: AHashMap<SessionId, Session>,
    /// filter -> (session -> options); mirrors each session's own map
    pub(crate) subscriptions: TopicTrie<AHashMap<SessionId, SubscriptionOptions>>,
    /// Last issued broker-wide packet id
    pub(crate) next_packet_id: u16,
}

/// Advance the packet id counter: 1..=65535, wrapping, never 0
pub(crate) fn alloc_packet_id(counter: &mut u16) -> u16 {
    *counter = if *counter == u16::MAX { 1 } else { *counter + 1 };
    *counter
}

impl CoreState {
    fn new() -> Self {
        Self {
            sessions: AHashMap::new(),
            subscriptions: TopicTrie::new(),
            next_packet_id: 0,
        }
    }

    pub(crate) fn next_packet_id(&mut self) -> u16 {
        alloc_packet_id(&mut self.next_packet_id)
    }

    /// Drop every index entry belonging to a session already removed from
    /// (or never inserted into) the registry.
    pub(crate) fn remove_session_filters(&mut self, session: &Session) {
        for filter in session.subscriptions.keys() {
            let now_empty = self
                .subscriptions
                .get_mut(filter)
                .map(|subscribers| {
                    subscribers.remove(&session.id);
                    subscribers.is_empty()
                })
                .unwrap_or(false);
            if now_empty {
                self.subscriptions.remove(filter);
            }
        }
    }
}

/// The MQTT broker core
pub struct Broker {
    pub(crate) state: Mutex<CoreState>,
    pub(crate) retained: RetainedStore,
    pub(crate) authorizer: Authorizer,
    pub(crate) persist: PersistenceHandle,
    pub(crate) stats: Stats,
    /// Detached-session expiry timers
    expiry: QueueRunner<SessionId>,
    next_client_uid: AtomicU64,
    pub(crate) options: BrokerOptions,
    started_at: Instant,
}

impl Broker {
    pub fn new(options: BrokerOptions, authorizer: Authorizer, persist: PersistenceHandle) -> Self {
        Self {
            state: Mutex::new(CoreState::new()),
            retained: RetainedStore::new(persist.clone()),
            authorizer,
            persist,
            stats: Stats::new(),
            expiry: QueueRunner::new(),
            next_client_uid: AtomicU64::new(1),
            options,
            started_at: Instant::now(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Seconds since the broker was constructed
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Sessions in the registry, attached or detached
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Sessions with a live connection
    pub fn connected_count(&self) -> usize {
        self.state
            .lock()
            .sessions
            .values()
            .filter(|s| s.is_connected())
            .count()
    }

    /// Active subscriptions across all sessions
    pub fn subscription_count(&self) -> usize {
        self.state
            .lock()
            .sessions
            .values()
            .map(|s| s.subscriptions.len())
            .sum()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// Queue and flight counters for one session
    pub fn session_stats(&self, session_id: &str) -> Option<SessionStats> {
        self.state
            .lock()
            .sessions
            .get(session_id)
            .map(SessionStats::from)
    }

    /// Spawn the long-lived core tasks: session expiry, retained-message
    /// expiry, and the `$SYS` publisher. Each stops when `shutdown` fires.
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) {
        let broker = self.clone();
        let drain = self.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            broker
                .expiry
                .run(move |session_id| drain.expire(session_id), rx)
                .await;
        });

        let broker = self.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            broker.retained.run_expiry(rx).await;
        });

        sys_topics::spawn(self.clone(), self.options.sys_interval, shutdown.subscribe());
    }

    /// Attach a connection to a session, creating or resuming it.
    ///
    /// Runs the takeover protocol: a prior connection under the same id is
    /// evicted and its worker signaled, without waiting for it to exit.
    /// With `clean_start = false` the prior session's subscriptions and
    /// QoS state carry over; the will, queues, and flight window are
    /// always replaced by the new connection's.
    pub fn register_client(
        &self,
        connect: Connect,
        worker: WorkerHandle,
    ) -> Result<Registration, ConnectError> {
        if connect.client_id.is_empty() {
            return Err(ConnectError::MissingClientId);
        }
        if connect.properties.receive_maximum == Some(0) {
            return Err(ConnectError::ReceiveMaximumZero);
        }
        let acl = self
            .authorizer
            .authenticate(connect.username.as_deref(), connect.password.as_ref())?;

        let session_id: SessionId = Arc::from(connect.client_id.as_str());
        let client_uid = self.next_client_uid.fetch_add(1, Ordering::Relaxed);
        let clean_start = connect.clean_start;
        let (outbound_tx, outbound_rx) = mpsc::channel(self.options.queue_bound);
        let client = ConnectedClient::new(connect, client_uid, worker, outbound_tx);

        let (session_present, evicted, snapshot) = {
            let mut state = self.state.lock();
            let mut fresh = Session::new(session_id.clone(), acl, client);

            let (session_present, evicted) = match state.sessions.remove(&session_id) {
                Some(mut prior) if !clean_start => {
                    let evicted = prior.client.take();
                    fresh.subscriptions = prior.subscriptions;
                    fresh.qos_pending = prior.qos_pending;
                    (true, evicted)
                }
                Some(mut prior) => {
                    let evicted = prior.client.take();
                    state.remove_session_filters(&prior);
                    (false, evicted)
                }
                None => (false, None),
            };

            let snapshot = StoredSession::from(&fresh);
            state.sessions.insert(session_id.clone(), fresh);
            (session_present, evicted, snapshot)
        };

        if let Some(previous) = evicted {
            debug!(session = %session_id, "session taken over, signaling previous worker");
            previous.worker.notify_taken_over();
            self.stats.connections_current.dec();
        }

        self.persist
            .store(PersistenceOp::SetSession { session: snapshot });
        self.stats.connections_total.inc();
        self.stats.connections_current.inc();
        debug!(session = %session_id, uid = client_uid, resumed = session_present, "client registered");

        Ok(Registration {
            client_uid,
            session_present,
            outbound: outbound_rx,
        })
    }

    /// Detach a connection from its session.
    ///
    /// No-op when `client_uid` does not match the attached connection (the
    /// worker was taken over and a successor is already installed). The
    /// grace window comes from the Disconnect override when one was seen,
    /// else the Connect's Session-Expiry-Interval, else the configured
    /// default; zero means no grace. The expiry drain re-checks, so the
    /// timer is armed for now and re-armed to the real deadline if the
    /// session still holds QoS>0 subscriptions.
    pub fn unregister_client(&self, session_id: &str, client_uid: u64) {
        let snapshot = {
            let mut state = self.state.lock();
            let Some(session) = state.sessions.get_mut(session_id) else {
                return;
            };
            let detached = match session.client.take() {
                Some(client) if client.uid == client_uid => client,
                other => {
                    session.client = other;
                    return;
                }
            };

            let grace = detached
                .expiry_override
                .or(detached.connect.properties.session_expiry_interval)
                .map(u64::from)
                .map(Duration::from_secs)
                .unwrap_or(self.options.session_expiry_default);
            session.expires_at = Some(SystemTime::now() + grace);
            StoredSession::from(&*session)
        };

        self.persist
            .store(PersistenceOp::SetSession { session: snapshot });
        self.stats.connections_current.dec();
        debug!(session = %session_id, uid = client_uid, "client detached");
        self.expiry.enqueue(SystemTime::now(), Arc::from(session_id));
    }

    /// Expiry drain: reap the session unless it is back in use or its grace
    /// window still protects QoS>0 state. Reaping removes the session from
    /// the registry and the index, deletes it from storage, and publishes
    /// its will.
    pub(crate) fn expire(&self, session_id: SessionId) {
        let will = {
            let mut state = self.state.lock();
            let Some(session) = state.sessions.get(&session_id) else {
                return;
            };
            if session.is_connected() {
                debug!(session = %session_id, "expiry fired for a connected session");
                return;
            }
            if let Some(expires_at) = session.expires_at {
                if session.has_qos_subscriptions() && expires_at > SystemTime::now() {
                    self.expiry.enqueue(expires_at, session_id.clone());
                    return;
                }
            }

            let Some(session) = state.sessions.remove(&session_id) else {
                return;
            };
            state.remove_session_filters(&session);
            info!(session = %session_id, "session expired");
            session.will
        };

        self.persist.store(PersistenceOp::DeleteSession {
            session_id: session_id.to_string(),
        });

        if let Some(will) = will {
            debug!(session = %session_id, topic = %will.topic, "publishing will");
            let publish = Publish {
                dup: false,
                qos: will.qos,
                retain: will.retain,
                topic: Arc::from(will.topic.as_str()),
                packet_id: None,
                payload: will.payload,
                properties: will.properties,
            };
            self.broadcast(None, publish);
        }
    }

    /// Startup rehydration from the persistence layer. Every restored
    /// session comes back detached and gets an expiry check queued, so
    /// sessions that outlived their grace window while the broker was down
    /// are reaped on the spot.
    pub fn restore(&self, data: LoadedData) {
        self.retained.restore(data.retained);

        let mut restored: Vec<SessionId> = Vec::with_capacity(data.sessions.len());
        {
            let mut state = self.state.lock();
            for stored in data.sessions {
                let session_id: SessionId = Arc::from(stored.session_id.as_str());
                let mut session = Session {
                    id: session_id.clone(),
                    acl: Vec::new(),
                    client: None,
                    in_flight_tokens: i32::from(stored.receive_maximum),
                    receive_maximum: stored.receive_maximum,
                    backlog: VecDeque::new(),
                    qos_pending: AHashMap::new(),
                    subscriptions: AHashMap::new(),
                    expires_at: stored.expires_at_secs.map(unix_secs_to_system_time),
                    will: stored.will.map(|w| w.into_will()),
                };
                for entry in stored.subscriptions {
                    let opts = entry.options();
                    session.subscriptions.insert(entry.filter.clone(), opts);
                    state
                        .subscriptions
                        .entry(&entry.filter, AHashMap::new)
                        .insert(session_id.clone(), opts);
                }
                for (packet_id, publish) in stored.qos_pending {
                    session.qos_pending.insert(packet_id, publish.into_publish());
                }
                state.sessions.insert(session_id.clone(), session);
                restored.push(session_id);
            }
        }

        info!(count = restored.len(), "sessions restored");
        let now = SystemTime::now();
        for session_id in restored {
            self.expiry.enqueue(now, session_id);
        }
    }
}
