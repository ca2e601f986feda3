//! Restoration configuration.
//!
//! Configuration is surfaced as CLI flags by the outer sidecar binary and
//! deserialized from its config file; both paths funnel through the same
//! validation. All config structs validate at construction time via
//! fallible builders, and post-deserialization validation is available via
//! the `validate()` method.

// The schemars `JsonSchema` derive macro internally uses `.unwrap()` in its
// `json_schema!` and `json_internal!` expansions. Allow `disallowed_methods`
// at the module level since config types are declarative structs with minimal
// procedural code.
#![allow(clippy::disallowed_methods)]

use std::{collections::BTreeMap, path::PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use url::Url;

use crate::snapshots::{SnapList, Snapshot};

/// Configuration validation error.
///
/// Returned when a configuration value is outside its valid range or
/// violates a cross-field constraint.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

/// History retention mode for the embedded etcd's own auto-compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AutoCompactionMode {
    /// Duration-based retention (`auto_compaction_retention` is a duration).
    Periodic,
    /// Revision-count retention (`auto_compaction_retention` is a number).
    Revision,
}

impl std::fmt::Display for AutoCompactionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Periodic => f.write_str("periodic"),
            Self::Revision => f.write_str("revision"),
        }
    }
}

/// Restoration configuration.
///
/// # Validation Rules
///
/// - `initial_cluster` must parse as a `name=url,...` map
/// - every `initial_advertise_peer_urls` entry must parse as a URL
/// - `max_fetchers`, `max_call_send_msg_size`, `embedded_etcd_quota_bytes`
///   must be positive
/// - `auto_compaction_retention` must parse as a duration in `periodic`
///   mode and as a revision count in `revision` mode
///
/// # Example
///
/// ```no_run
/// # use etcdwarden_types::config::RestorationConfig;
/// let config = RestorationConfig::builder()
///     .max_fetchers(12)
///     .embedded_etcd_quota_bytes(2 * 1024 * 1024 * 1024)
///     .build()
///     .expect("valid restoration config");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RestorationConfig {
    /// Initial cluster configuration for the transient etcd, in
    /// `name=url[,name=url...]` form.
    #[serde(default = "default_initial_cluster")]
    pub initial_cluster: String,
    /// Initial cluster token for the transient etcd.
    #[serde(default = "default_initial_cluster_token")]
    pub initial_cluster_token: String,
    /// Output data directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Scratch directory for persisting fetched snapshots during restore.
    #[serde(default = "default_temp_snapshots_dir")]
    pub temp_snapshots_dir: PathBuf,
    /// This member's peer URLs, advertised to the rest of the cluster.
    #[serde(default = "default_initial_advertise_peer_urls")]
    pub initial_advertise_peer_urls: Vec<String>,
    /// Human-readable member name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Skip the bbolt integrity check during base restoration. Required
    /// when the base snapshot was copied from a live data directory rather
    /// than produced by the snapshot API.
    #[serde(default)]
    pub skip_hash_check: bool,
    /// Maximum number of delta snapshots fetched in parallel.
    #[serde(default = "default_max_fetchers")]
    pub max_fetchers: usize,
    /// Maximum size of a client request message sent to the transient etcd.
    #[serde(default = "default_max_call_send_msg_size")]
    pub max_call_send_msg_size: usize,
    /// Maximum client request size the transient etcd will accept.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    /// Maximum number of operations permitted in one transaction.
    #[serde(default = "default_max_txn_ops")]
    pub max_txn_ops: usize,
    /// Backend quota for the transient etcd.
    #[serde(default = "default_embedded_etcd_quota_bytes")]
    pub embedded_etcd_quota_bytes: i64,
    /// Auto-compaction mode plumbed into the transient etcd.
    #[serde(default = "default_auto_compaction_mode")]
    pub auto_compaction_mode: AutoCompactionMode,
    /// Auto-compaction retention: a duration in `periodic` mode, a revision
    /// count in `revision` mode.
    #[serde(default = "default_auto_compaction_retention")]
    pub auto_compaction_retention: String,
}

#[bon::bon]
impl RestorationConfig {
    /// Creates a new restoration configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any rule in the struct-level
    /// documentation is violated.
    #[builder]
    pub fn new(
        #[builder(default = default_initial_cluster())] initial_cluster: String,
        #[builder(default = default_initial_cluster_token())] initial_cluster_token: String,
        #[builder(default = default_data_dir())] data_dir: PathBuf,
        #[builder(default = default_temp_snapshots_dir())] temp_snapshots_dir: PathBuf,
        #[builder(default = default_initial_advertise_peer_urls())]
        initial_advertise_peer_urls: Vec<String>,
        #[builder(default = default_name())] name: String,
        #[builder(default = false)] skip_hash_check: bool,
        #[builder(default = default_max_fetchers())] max_fetchers: usize,
        #[builder(default = default_max_call_send_msg_size())] max_call_send_msg_size: usize,
        #[builder(default = default_max_request_bytes())] max_request_bytes: usize,
        #[builder(default = default_max_txn_ops())] max_txn_ops: usize,
        #[builder(default = default_embedded_etcd_quota_bytes())] embedded_etcd_quota_bytes: i64,
        #[builder(default = default_auto_compaction_mode())]
        auto_compaction_mode: AutoCompactionMode,
        #[builder(default = default_auto_compaction_retention())] auto_compaction_retention: String,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            initial_cluster,
            initial_cluster_token,
            data_dir,
            temp_snapshots_dir,
            initial_advertise_peer_urls,
            name,
            skip_hash_check,
            max_fetchers,
            max_call_send_msg_size,
            max_request_bytes,
            max_txn_ops,
            embedded_etcd_quota_bytes,
            auto_compaction_mode,
            auto_compaction_retention,
        };
        config.validate()?;
        Ok(config)
    }
}

impl RestorationConfig {
    /// Validates the configuration values.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_initial_cluster(&self.initial_cluster)?;
        self.peer_urls()?;
        if self.max_call_send_msg_size == 0 {
            return Err(ConfigError::Validation {
                message: "max_call_send_msg_size must be greater than zero".to_string(),
            });
        }
        if self.max_fetchers == 0 {
            return Err(ConfigError::Validation {
                message: "max_fetchers must be greater than zero".to_string(),
            });
        }
        if self.embedded_etcd_quota_bytes <= 0 {
            return Err(ConfigError::Validation {
                message: format!(
                    "embedded_etcd_quota_bytes must be greater than zero, got {}",
                    self.embedded_etcd_quota_bytes
                ),
            });
        }
        match self.auto_compaction_mode {
            AutoCompactionMode::Periodic => {
                humantime::parse_duration(&self.auto_compaction_retention).map_err(|e| {
                    ConfigError::Validation {
                        message: format!(
                            "auto_compaction_retention {:?} is not a duration: {e}",
                            self.auto_compaction_retention
                        ),
                    }
                })?;
            },
            AutoCompactionMode::Revision => {
                self.auto_compaction_retention.parse::<i64>().map_err(|e| {
                    ConfigError::Validation {
                        message: format!(
                            "auto_compaction_retention {:?} is not a revision count: {e}",
                            self.auto_compaction_retention
                        ),
                    }
                })?;
            },
        }
        Ok(())
    }

    /// Parses `initial_advertise_peer_urls` into URLs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first unparsable URL.
    pub fn peer_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.initial_advertise_peer_urls
            .iter()
            .map(|raw| {
                Url::parse(raw).map_err(|e| ConfigError::Validation {
                    message: format!("failed parsing peer url {raw:?}: {e}"),
                })
            })
            .collect()
    }
}

impl Default for RestorationConfig {
    fn default() -> Self {
        Self {
            initial_cluster: default_initial_cluster(),
            initial_cluster_token: default_initial_cluster_token(),
            data_dir: default_data_dir(),
            temp_snapshots_dir: default_temp_snapshots_dir(),
            initial_advertise_peer_urls: default_initial_advertise_peer_urls(),
            name: default_name(),
            skip_hash_check: false,
            max_fetchers: default_max_fetchers(),
            max_call_send_msg_size: default_max_call_send_msg_size(),
            max_request_bytes: default_max_request_bytes(),
            max_txn_ops: default_max_txn_ops(),
            embedded_etcd_quota_bytes: default_embedded_etcd_quota_bytes(),
            auto_compaction_mode: default_auto_compaction_mode(),
            auto_compaction_retention: default_auto_compaction_retention(),
        }
    }
}

/// Parses an `initial_cluster` string (`name=url[,name=url...]`) into a
/// member-name → URLs map.
///
/// A member name may appear more than once; its URLs accumulate.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] on an empty map, a missing `=`, or
/// an unparsable URL.
pub fn parse_initial_cluster(raw: &str) -> Result<BTreeMap<String, Vec<Url>>, ConfigError> {
    let mut members: BTreeMap<String, Vec<Url>> = BTreeMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (member, url) = entry.split_once('=').ok_or_else(|| ConfigError::Validation {
            message: format!("initial_cluster entry {entry:?} is not of the form name=url"),
        })?;
        let url = Url::parse(url).map_err(|e| ConfigError::Validation {
            message: format!("failed creating url map for cluster entry {entry:?}: {e}"),
        })?;
        members.entry(member.to_string()).or_default().push(url);
    }
    if members.is_empty() {
        return Err(ConfigError::Validation {
            message: "initial_cluster must name at least one member".to_string(),
        });
    }
    Ok(members)
}

/// Everything one restore invocation needs, immutable for its lifetime.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Validated restoration configuration.
    pub config: RestorationConfig,
    /// The base full snapshot; `None` restores from deltas alone.
    pub base_snapshot: Option<Snapshot>,
    /// Ordered chain of delta snapshots to replay over the base.
    pub delta_snap_list: SnapList,
    /// Member-name → peer URLs map parsed from `initial_cluster`.
    pub cluster_urls: BTreeMap<String, Vec<Url>>,
    /// This member's advertised peer URLs.
    pub peer_urls: Vec<Url>,
    /// Actual size of the cluster the data dir will rejoin.
    pub original_cluster_size: usize,
}

impl RestoreOptions {
    /// Builds restore options, validating the config and the delta chain.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] when the config is invalid or
    /// the delta chain is not contiguous over the base snapshot.
    pub fn new(
        config: RestorationConfig,
        base_snapshot: Option<Snapshot>,
        delta_snap_list: SnapList,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let cluster_urls = parse_initial_cluster(&config.initial_cluster)?;
        let peer_urls = config.peer_urls()?;
        if let Some(base) = &base_snapshot {
            crate::snapshots::verify_snapshot_chain(base, &delta_snap_list).map_err(|e| {
                ConfigError::Validation { message: format!("delta snapshot chain: {e}") }
            })?;
        }
        Ok(Self {
            config,
            base_snapshot,
            delta_snap_list,
            cluster_urls,
            peer_urls,
            original_cluster_size: 1,
        })
    }

    /// Records the actual size of the cluster the restored member rejoins.
    #[must_use]
    pub fn with_original_cluster_size(mut self, size: usize) -> Self {
        self.original_cluster_size = size;
        self
    }
}

fn default_initial_cluster() -> String {
    format!("{}=http://localhost:2380", default_name())
}

fn default_initial_cluster_token() -> String {
    "etcd-cluster".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(format!("{}.etcd", default_name()))
}

fn default_temp_snapshots_dir() -> PathBuf {
    PathBuf::from(format!("{}.restoration.tmp", default_name()))
}

fn default_initial_advertise_peer_urls() -> Vec<String> {
    vec!["http://localhost:2380".to_string()]
}

fn default_name() -> String {
    "default".to_string()
}

fn default_max_fetchers() -> usize {
    6
}

fn default_max_call_send_msg_size() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

fn default_max_request_bytes() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

fn default_max_txn_ops() -> usize {
    10 * 1024
}

fn default_embedded_etcd_quota_bytes() -> i64 {
    8 * 1024 * 1024 * 1024 // 8 GiB
}

fn default_auto_compaction_mode() -> AutoCompactionMode {
    AutoCompactionMode::Periodic
}

fn default_auto_compaction_retention() -> String {
    "30m".to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use crate::snapshots::SnapshotKind;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RestorationConfig::builder().build().expect("defaults should be valid");
        assert_eq!(config.name, "default");
        assert_eq!(config.initial_cluster, "default=http://localhost:2380");
        assert_eq!(config.data_dir, PathBuf::from("default.etcd"));
        assert_eq!(config.temp_snapshots_dir, PathBuf::from("default.restoration.tmp"));
        assert_eq!(config.max_fetchers, 6);
        assert_eq!(config.max_call_send_msg_size, 10 * 1024 * 1024);
        assert_eq!(config.max_request_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_txn_ops, 10 * 1024);
        assert_eq!(config.embedded_etcd_quota_bytes, 8 * 1024 * 1024 * 1024);
        assert_eq!(config.auto_compaction_mode, AutoCompactionMode::Periodic);
        assert_eq!(config.auto_compaction_retention, "30m");
        assert!(!config.skip_hash_check);
    }

    #[test]
    fn test_builder_with_custom_values() {
        let config = RestorationConfig::builder()
            .name("member-0".to_string())
            .initial_cluster("member-0=http://10.0.0.1:2380".to_string())
            .initial_advertise_peer_urls(vec!["http://10.0.0.1:2380".to_string()])
            .max_fetchers(2)
            .embedded_etcd_quota_bytes(64 * 1024 * 1024)
            .skip_hash_check(true)
            .build()
            .expect("valid custom config");
        assert_eq!(config.max_fetchers, 2);
        assert_eq!(config.embedded_etcd_quota_bytes, 64 * 1024 * 1024);
        assert!(config.skip_hash_check);
    }

    #[test]
    fn test_zero_max_fetchers_rejected() {
        let err = RestorationConfig::builder().max_fetchers(0).build().unwrap_err();
        assert!(err.to_string().contains("max_fetchers"));
    }

    #[test]
    fn test_zero_send_msg_size_rejected() {
        let err = RestorationConfig::builder().max_call_send_msg_size(0).build().unwrap_err();
        assert!(err.to_string().contains("max_call_send_msg_size"));
    }

    #[test]
    fn test_nonpositive_quota_rejected() {
        let err = RestorationConfig::builder().embedded_etcd_quota_bytes(0).build().unwrap_err();
        assert!(err.to_string().contains("embedded_etcd_quota_bytes"));
    }

    #[test]
    fn test_bad_initial_cluster_rejected() {
        let err = RestorationConfig::builder()
            .initial_cluster("not-a-url-map".to_string())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("name=url"));
    }

    #[test]
    fn test_bad_peer_url_rejected() {
        let err = RestorationConfig::builder()
            .initial_advertise_peer_urls(vec!["://nope".to_string()])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("peer url"));
    }

    #[test]
    fn test_retention_must_match_mode() {
        let err = RestorationConfig::builder()
            .auto_compaction_mode(AutoCompactionMode::Periodic)
            .auto_compaction_retention("not-a-duration".to_string())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duration"));

        let err = RestorationConfig::builder()
            .auto_compaction_mode(AutoCompactionMode::Revision)
            .auto_compaction_retention("30m".to_string())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("revision count"));

        RestorationConfig::builder()
            .auto_compaction_mode(AutoCompactionMode::Revision)
            .auto_compaction_retention("10000".to_string())
            .build()
            .expect("numeric retention is valid in revision mode");
    }

    #[test]
    fn test_parse_initial_cluster_multi_member() {
        let urls = parse_initial_cluster(
            "etcd-0=http://etcd-0:2380,etcd-1=http://etcd-1:2380,etcd-0=http://etcd-0:2381",
        )
        .expect("valid map");
        assert_eq!(urls.len(), 2);
        assert_eq!(urls["etcd-0"].len(), 2);
        assert_eq!(urls["etcd-1"].len(), 1);
    }

    #[test]
    fn test_deserialize_empty_object_yields_defaults() {
        let config: RestorationConfig = serde_json::from_str("{}").expect("deserialize");
        config.validate().expect("defaults valid");
        assert_eq!(config, RestorationConfig::default());
    }

    #[test]
    fn test_auto_compaction_mode_wire_form() {
        let config: RestorationConfig =
            serde_json::from_str(r#"{ "auto_compaction_mode": "revision", "auto_compaction_retention": "5000" }"#)
                .expect("deserialize");
        assert_eq!(config.auto_compaction_mode, AutoCompactionMode::Revision);
    }

    #[test]
    fn test_restore_options_parse_urls_and_chain() {
        let base = Snapshot::new(SnapshotKind::Full, 0, 5, "");
        let deltas =
            vec![Snapshot::new(SnapshotKind::Delta, 6, 9, ""), Snapshot::new(SnapshotKind::Delta, 10, 12, "")];
        let opts = RestoreOptions::new(RestorationConfig::default(), Some(base), deltas)
            .expect("valid options");
        assert_eq!(opts.peer_urls.len(), 1);
        assert_eq!(opts.cluster_urls["default"][0].as_str(), "http://localhost:2380/");
    }

    #[test]
    fn test_restore_options_reject_broken_chain() {
        let base = Snapshot::new(SnapshotKind::Full, 0, 5, "");
        let deltas =
            vec![Snapshot::new(SnapshotKind::Delta, 6, 9, ""), Snapshot::new(SnapshotKind::Delta, 12, 14, "")];
        let err = RestoreOptions::new(RestorationConfig::default(), Some(base), deltas).unwrap_err();
        assert!(err.to_string().contains("chain"));
    }
}
