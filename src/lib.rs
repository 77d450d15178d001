#![doc = include_str!("../README.md")]

pub mod config;
mod core;
pub mod error;
pub mod metrics;
pub mod network;
pub mod notify;
mod quorum;
pub mod raft;
mod raft_types;
mod replication;
pub mod storage;
pub mod testing;

pub use async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::SnapshotPolicy;
pub use crate::core::LeaderPhase;
pub use crate::core::State;
pub use crate::error::ClientError;
pub use crate::error::ConfigError;
pub use crate::error::RaftError;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::notify::Notification;
pub use crate::raft::Raft;
pub use crate::raft_types::LogId;
pub use crate::raft_types::SnapshotSegmentId;
pub use crate::storage::RaftStorage;

/// A Raft node's ID.
///
/// Address resolution (mapping an ID onto one or more transport addresses)
/// is the concern of the `RaftNetwork` implementation; the core identifies
/// peers by logical identity only.
pub type NodeId = u64;

/// A trait defining application specific data.
///
/// The intention of this trait is that applications which are using this crate will be able to
/// use their own concrete data types throughout their application without having to serialize and
/// deserialize their data as it goes through Raft. Instead, applications can present their data
/// models as-is to Raft, Raft will present it to the application's `RaftStorage` impl when ready,
/// and the application may then deal with the data directly in the storage engine without having
/// to do a preliminary deserialization.
pub trait AppData: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific response data.
///
/// The intention of this trait is that applications which are using this crate will be able to
/// use their own concrete data types for returning response data from the storage layer when an
/// entry is applied to the state machine as part of a client request (this is not used during
/// replication). This allows applications to seamlessly return application specific data from
/// their storage layer, up through Raft, and back into their application for returning
/// data to clients.
pub trait AppDataResponse: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}
