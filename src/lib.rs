//! NimbusMQ - embeddable MQTT v5 broker core
//!
//! The routing heart of an MQTT v5 broker: session registry, subscription
//! index, retained-message store, QoS 0/1/2 state machines, topic aliasing,
//! and the expiry scheduling that ties them together. Transports, the wire
//! codec, and per-connection I/O live in the embedding application and talk
//! to the core through [`Broker::register_client`], [`Broker::dispatch`],
//! [`Broker::unregister_client`], and each session's outbound packet queue.

pub mod acl;
pub mod broker;
pub mod config;
pub mod persistence;
pub mod protocol;
pub mod retained;
pub mod schedule;
pub mod session;
pub mod stats;
pub mod topic;

pub use acl::{AclRule, Authorizer};
pub use broker::{Broker, BrokerOptions, ConnectError, DispatchError, Registration};
pub use config::Config;
pub use persistence::{
    FjallBackend, MemoryBackend, PersistenceHandle, PersistenceManager, StorageBackend,
};
pub use protocol::{Packet, Publish, QoS};
pub use retained::RetainedStore;
pub use schedule::QueueRunner;
pub use session::{SessionId, SessionSignal, SessionStats, WorkerHandle};
pub use stats::Stats;
pub use topic::TopicTrie;
