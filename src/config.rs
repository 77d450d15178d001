//! Raft runtime configuration.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT: u64 = 50;
/// Default base election timeout, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT: u64 = 200;
/// Default fraction of the election timeout during which a follower that has
/// heard from a live leader refuses to grant votes.
pub const DEFAULT_ELECTION_TIMEOUT_THRESHOLD: f64 = 0.8;
/// Default upper bound of the random jitter applied to the election timeout.
pub const DEFAULT_MAX_TIMEOUT_JITTER: f64 = 0.5;
/// Default period at which a node in the persist-error terminal state re-emits
/// its failure notification, in milliseconds.
pub const DEFAULT_PERSIST_ERROR_NOTIFY_TIMEOUT: u64 = 1000;
/// Default maximum number of entries per AppendEntries payload.
pub const DEFAULT_MAX_APPEND_ENTRIES: u64 = 300;
/// Default threshold of applied entries since the last snapshot which will
/// trigger a new compaction.
pub const DEFAULT_LOGS_SINCE_LAST: u64 = 5000;
/// Default snapshot chunk size, in bytes.
pub const DEFAULT_SNAPSHOT_CHUNK_SIZE: u64 = 1024 * 1024 * 3;
/// Default size of the per-peer transport connection pool.
pub const DEFAULT_COMM_POOL_SIZE: usize = 8;
/// Default client-side RPC timeout, in milliseconds.
pub const DEFAULT_COMM_CLIENT_TIMEOUT: u64 = 1000;
/// Default server-side connection timeout, in milliseconds.
pub const DEFAULT_COMM_SERVER_TIMEOUT: u64 = 10_000;

/// Log compaction and snapshot policy.
///
/// This governs when periodic snapshots will be taken, and also governs the conditions which
/// would cause a leader to send an `InstallSnapshot` RPC to a follower based on replication lag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// A snapshot will be generated once the log has grown the specified number of logs since
    /// the last snapshot.
    LogsSinceLast(u64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST)
    }
}

/// The runtime configuration for a Raft node.
///
/// When building the Raft configuration for your application, remember this inequality from the
/// Raft spec: `broadcastTime ≪ electionTimeout ≪ MTBF`. Keep the election timeout high enough
/// that network latency will not cause spurious elections, but not so high that a real leader
/// crash causes prolonged downtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    ///
    /// This does not influence the protocol in any way, but is useful for observability.
    pub cluster_name: String,
    /// The interval, in milliseconds, at which leaders send heartbeats to followers.
    ///
    /// This value is also used as the timeout for AppendEntries RPCs.
    pub heartbeat_timeout: u64,
    /// The base election timeout, in milliseconds.
    ///
    /// The effective timeout is drawn uniformly from
    /// `[election_timeout, election_timeout · (1 + max_timeout_jitter)]`.
    pub election_timeout: u64,
    /// The fraction of the election timeout during which a follower that has heard from a live
    /// leader refuses to grant votes, keeping an established leader in place.
    pub election_timeout_threshold: f64,
    /// The upper bound of the random jitter applied to the election timeout, in `[0, 1)`.
    pub max_timeout_jitter: f64,
    /// The period, in milliseconds, at which a node stuck in the persist-error terminal state
    /// re-emits its failure notification.
    pub persist_error_notify_timeout: u64,
    /// The maximum number of entries per AppendEntries payload.
    ///
    /// Setting this value too low will primarily impact the speed at which slow nodes, nodes
    /// which have been offline, or nodes which are new to the cluster, are brought up-to-speed.
    pub max_append_entries: u64,
    /// The snapshot policy to use for this node.
    pub snapshot_policy: SnapshotPolicy,
    /// The maximum snapshot chunk size allowed when transmitting snapshots, in bytes.
    pub max_snapshot_chunk_size: u64,
    /// The number of pooled connections to hold per peer.
    ///
    /// Consumed by `RaftNetwork` implementations; the core does not interpret it.
    pub comm_pool_size: usize,
    /// The client-side RPC timeout, in milliseconds, for vote and snapshot RPCs.
    pub comm_client_timeout: u64,
    /// The server-side connection timeout, in milliseconds.
    ///
    /// Consumed by transport implementations; the core does not interpret it.
    pub comm_server_timeout: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    pub fn build(cluster_name: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name: cluster_name.into(),
            heartbeat_timeout: None,
            election_timeout: None,
            election_timeout_threshold: None,
            max_timeout_jitter: None,
            persist_error_notify_timeout: None,
            max_append_entries: None,
            snapshot_policy: None,
            max_snapshot_chunk_size: None,
            comm_pool_size: None,
            comm_client_timeout: None,
            comm_server_timeout: None,
        }
    }

    /// Generate a new election timeout, in milliseconds, drawn uniformly from
    /// `[election_timeout, election_timeout · (1 + max_timeout_jitter)]`.
    pub fn new_rand_election_timeout(&self) -> u64 {
        let span = (self.election_timeout as f64 * self.max_timeout_jitter) as u64;
        self.election_timeout + thread_rng().gen_range(0..=span)
    }

    /// The window, in milliseconds, during which a follower that has heard from a live leader
    /// refuses to unseat it by granting votes.
    pub fn leader_lease_timeout(&self) -> u64 {
        (self.election_timeout as f64 * self.election_timeout_threshold) as u64
    }
}

/// A configuration builder which ensures that the runtime config is valid.
///
/// For the election timeout and heartbeat interval, §5.6 of the Raft spec is worth a read when
/// choosing values.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigBuilder {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The interval at which leaders will send heartbeats to followers, in milliseconds.
    pub heartbeat_timeout: Option<u64>,
    /// The base election timeout, in milliseconds.
    pub election_timeout: Option<u64>,
    /// The fraction of the election timeout during which a known leader is considered live.
    pub election_timeout_threshold: Option<f64>,
    /// The upper bound of the random election timeout jitter.
    pub max_timeout_jitter: Option<f64>,
    /// The persist-error re-notification period, in milliseconds.
    pub persist_error_notify_timeout: Option<u64>,
    /// The maximum number of entries per AppendEntries payload.
    pub max_append_entries: Option<u64>,
    /// The snapshot policy.
    pub snapshot_policy: Option<SnapshotPolicy>,
    /// The maximum snapshot chunk size, in bytes.
    pub max_snapshot_chunk_size: Option<u64>,
    /// The number of pooled connections to hold per peer.
    pub comm_pool_size: Option<usize>,
    /// The client-side RPC timeout, in milliseconds.
    pub comm_client_timeout: Option<u64>,
    /// The server-side connection timeout, in milliseconds.
    pub comm_server_timeout: Option<u64>,
}

impl ConfigBuilder {
    /// Set the desired value for `heartbeat_timeout`.
    pub fn heartbeat_timeout(mut self, val: u64) -> Self {
        self.heartbeat_timeout = Some(val);
        self
    }

    /// Set the desired value for `election_timeout`.
    pub fn election_timeout(mut self, val: u64) -> Self {
        self.election_timeout = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_threshold`.
    pub fn election_timeout_threshold(mut self, val: f64) -> Self {
        self.election_timeout_threshold = Some(val);
        self
    }

    /// Set the desired value for `max_timeout_jitter`.
    pub fn max_timeout_jitter(mut self, val: f64) -> Self {
        self.max_timeout_jitter = Some(val);
        self
    }

    /// Set the desired value for `persist_error_notify_timeout`.
    pub fn persist_error_notify_timeout(mut self, val: u64) -> Self {
        self.persist_error_notify_timeout = Some(val);
        self
    }

    /// Set the desired value for `max_append_entries`.
    pub fn max_append_entries(mut self, val: u64) -> Self {
        self.max_append_entries = Some(val);
        self
    }

    /// Set the desired value for `snapshot_policy`.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the desired value for `max_snapshot_chunk_size`.
    pub fn max_snapshot_chunk_size(mut self, val: u64) -> Self {
        self.max_snapshot_chunk_size = Some(val);
        self
    }

    /// Set the desired value for `comm_pool_size`.
    pub fn comm_pool_size(mut self, val: usize) -> Self {
        self.comm_pool_size = Some(val);
        self
    }

    /// Set the desired value for `comm_client_timeout`.
    pub fn comm_client_timeout(mut self, val: u64) -> Self {
        self.comm_client_timeout = Some(val);
        self
    }

    /// Set the desired value for `comm_server_timeout`.
    pub fn comm_server_timeout(mut self, val: u64) -> Self {
        self.comm_server_timeout = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config` instance if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let heartbeat_timeout = self.heartbeat_timeout.unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT);
        let election_timeout = self.election_timeout.unwrap_or(DEFAULT_ELECTION_TIMEOUT);
        if election_timeout <= heartbeat_timeout {
            return Err(ConfigError::ElectionTimeoutTooSmall);
        }
        let election_timeout_threshold = self
            .election_timeout_threshold
            .unwrap_or(DEFAULT_ELECTION_TIMEOUT_THRESHOLD);
        if election_timeout_threshold <= 0.0 || election_timeout_threshold > 1.0 {
            return Err(ConfigError::InvalidElectionTimeoutThreshold);
        }
        let max_timeout_jitter = self.max_timeout_jitter.unwrap_or(DEFAULT_MAX_TIMEOUT_JITTER);
        if !(0.0..1.0).contains(&max_timeout_jitter) {
            return Err(ConfigError::InvalidTimeoutJitter);
        }
        let persist_error_notify_timeout = self
            .persist_error_notify_timeout
            .unwrap_or(DEFAULT_PERSIST_ERROR_NOTIFY_TIMEOUT);
        let max_append_entries = self.max_append_entries.unwrap_or(DEFAULT_MAX_APPEND_ENTRIES);
        if max_append_entries == 0 {
            return Err(ConfigError::MaxAppendEntriesTooSmall);
        }
        let snapshot_policy = self.snapshot_policy.unwrap_or_default();
        let max_snapshot_chunk_size = self
            .max_snapshot_chunk_size
            .unwrap_or(DEFAULT_SNAPSHOT_CHUNK_SIZE);
        if max_snapshot_chunk_size == 0 {
            return Err(ConfigError::SnapshotChunkSizeTooSmall);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            heartbeat_timeout,
            election_timeout,
            election_timeout_threshold,
            max_timeout_jitter,
            persist_error_notify_timeout,
            max_append_entries,
            snapshot_policy,
            max_snapshot_chunk_size,
            comm_pool_size: self.comm_pool_size.unwrap_or(DEFAULT_COMM_POOL_SIZE),
            comm_client_timeout: self.comm_client_timeout.unwrap_or(DEFAULT_COMM_CLIENT_TIMEOUT),
            comm_server_timeout: self.comm_server_timeout.unwrap_or(DEFAULT_COMM_SERVER_TIMEOUT),
        })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("cluster0").validate().unwrap();

        assert_eq!(cfg.heartbeat_timeout, DEFAULT_HEARTBEAT_TIMEOUT);
        assert_eq!(cfg.election_timeout, DEFAULT_ELECTION_TIMEOUT);
        assert_eq!(cfg.max_append_entries, DEFAULT_MAX_APPEND_ENTRIES);
        assert_eq!(cfg.max_snapshot_chunk_size, DEFAULT_SNAPSHOT_CHUNK_SIZE);
        assert_eq!(cfg.snapshot_policy, SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST));
        assert_eq!(cfg.comm_pool_size, DEFAULT_COMM_POOL_SIZE);
    }

    #[test]
    fn test_config_with_specified_values() {
        let cfg = Config::build("cluster0")
            .heartbeat_timeout(10)
            .election_timeout(100)
            .election_timeout_threshold(0.5)
            .max_timeout_jitter(0.25)
            .persist_error_notify_timeout(50)
            .max_append_entries(16)
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(10_000))
            .max_snapshot_chunk_size(200)
            .comm_pool_size(2)
            .comm_client_timeout(300)
            .comm_server_timeout(400)
            .validate()
            .unwrap();

        assert_eq!(cfg.heartbeat_timeout, 10);
        assert_eq!(cfg.election_timeout, 100);
        assert_eq!(cfg.election_timeout_threshold, 0.5);
        assert_eq!(cfg.max_timeout_jitter, 0.25);
        assert_eq!(cfg.persist_error_notify_timeout, 50);
        assert_eq!(cfg.max_append_entries, 16);
        assert_eq!(cfg.snapshot_policy, SnapshotPolicy::LogsSinceLast(10_000));
        assert_eq!(cfg.max_snapshot_chunk_size, 200);
        assert_eq!(cfg.comm_pool_size, 2);
        assert_eq!(cfg.comm_client_timeout, 300);
        assert_eq!(cfg.comm_server_timeout, 400);
    }

    #[test]
    fn test_invalid_election_timeout_produces_expected_error() {
        let res = Config::build("cluster0").election_timeout(50).heartbeat_timeout(100).validate();
        assert_eq!(res.unwrap_err(), ConfigError::ElectionTimeoutTooSmall);
    }

    #[test]
    fn test_invalid_jitter_produces_expected_error() {
        let res = Config::build("cluster0").max_timeout_jitter(1.0).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidTimeoutJitter);
    }

    #[test]
    fn test_rand_election_timeout_lies_within_configured_band() {
        let cfg = Config::build("cluster0")
            .election_timeout(100)
            .max_timeout_jitter(0.5)
            .validate()
            .unwrap();
        for _ in 0..1000 {
            let t = cfg.new_rand_election_timeout();
            assert!((100..=150).contains(&t), "timeout {} out of [100, 150]", t);
        }
    }

    #[test]
    fn test_rand_election_timeout_with_zero_jitter() {
        let cfg = Config::build("cluster0")
            .election_timeout(100)
            .max_timeout_jitter(0.0)
            .validate()
            .unwrap();
        assert_eq!(cfg.new_rand_election_timeout(), 100);
    }
}
